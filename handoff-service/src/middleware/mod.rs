pub mod guard;
pub mod identity;

pub use guard::{client_ip, client_ip_from, request_guard_middleware, RequestGuard};
pub use identity::{AuthUser, IdentitySource};
