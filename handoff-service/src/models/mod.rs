//! Credential and session models shared by the services and handlers.

mod role;
mod session;
mod ticket;
mod token;

pub use role::Role;
pub use session::Session;
pub use ticket::{IssuedTicket, TicketClaims};
pub use token::{TokenClaims, TokenPair, TokenType};
