pub mod cookies;
pub mod health;
pub mod metrics;
pub mod session;
pub mod ticket;

pub use health::health_check;
pub use session::{current_session, logout, refresh};
pub use ticket::{consume_ticket, issue_ticket};
