use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Role;

/// Signed payload of an SSO handoff ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClaims {
    /// Subject (usually the user's email)
    pub sub: String,
    pub role: Role,
    /// Audience: the application allowed to consume the ticket
    pub aud: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Single-use value, URL-safe base64
    pub nonce: String,
}

/// Result of ticket issuance.
#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}
