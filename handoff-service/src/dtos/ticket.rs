use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::Role;

/// Body of `POST /sso/ticket`.
#[derive(Debug, Deserialize, Validate)]
pub struct TicketRequest {
    /// Application the ticket is for
    #[validate(length(min = 1, max = 128))]
    pub aud: String,
    #[validate(email)]
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CallbackRequest {
    #[validate(length(min = 1, max = 4096))]
    pub token: String,
}
