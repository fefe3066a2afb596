//! Services layer for handoff-service.
//!
//! Tickets, tokens and sessions on top of the replay, idempotency and
//! rate-limit stores, all sharing one [`KeyValueStore`] backend.

pub mod clock;
pub mod error;
pub mod idempotency;
mod nonce;
mod rate_limiter;
mod session;
mod session_store;
mod signing;
pub mod store;
mod sweeper;
mod ticket;
mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::AuthError;
pub use idempotency::{BeginOutcome, CachedResponse, IdempotencyStore, RequestFingerprint};
pub use nonce::NonceStore;
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use session::SessionService;
pub use session_store::SessionStore;
pub use store::{KeyValueStore, MemoryStore, RedisStore};
pub use sweeper::{Sweeper, SweeperHandle};
pub use ticket::TicketService;
pub use token::TokenService;
