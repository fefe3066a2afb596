pub mod session;
pub mod ticket;

pub use session::{LogoutRequest, RefreshRequest};
pub use ticket::{CallbackRequest, TicketRequest, TicketResponse};
