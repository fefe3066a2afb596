//! Server-side session backing refresh tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Role;

/// A live login. Revoking it is the only way to invalidate the tokens bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subject_id: String,
    pub email: String,
    pub role: Role,
    pub created_utc: DateTime<Utc>,
}
