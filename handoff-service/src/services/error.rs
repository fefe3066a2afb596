use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Malformed credential")]
    Malformed,

    #[error("Invalid ticket")]
    InvalidSignature,

    #[error("Invalid audience")]
    InvalidAudience,

    #[error("Credential expired")]
    Expired,

    #[error("Replay detected")]
    ReplayDetected,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid token type")]
    InvalidTokenType,

    #[error("Session expired")]
    SessionExpired,

    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Missing idempotency key")]
    MissingIdempotencyKey,

    #[error("Idempotency key reused for a different request")]
    IdempotencyConflict,

    #[error("Idempotency key is already being processed")]
    IdempotencyInProgress,

    #[error("Too many attempts, retry in {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable code, safe to log and to compare in tests.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Malformed => "malformed",
            AuthError::InvalidSignature => "invalid_ticket",
            AuthError::InvalidAudience => "invalid_audience",
            AuthError::Expired => "expired",
            AuthError::ReplayDetected => "replay",
            AuthError::InvalidToken => "invalid_token",
            AuthError::InvalidTokenType => "invalid_token_type",
            AuthError::SessionExpired => "session_expired",
            AuthError::MissingCredentials => "missing_credentials",
            AuthError::MissingIdempotencyKey => "missing_idempotency_key",
            AuthError::IdempotencyConflict => "idempotency_conflict",
            AuthError::IdempotencyInProgress => "idempotency_key_in_use",
            AuthError::RateLimited { .. } => "rate_limited",
            AuthError::Configuration(_) => "configuration_error",
            AuthError::Store(_) => "store_error",
        }
    }

    /// Credential failures that must look identical from the outside.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidSignature
                | AuthError::InvalidAudience
                | AuthError::Expired
                | AuthError::ReplayDetected
                | AuthError::InvalidToken
                | AuthError::InvalidTokenType
                | AuthError::MissingCredentials
        )
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::MissingAlgorithm => AuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidAudience => AuthError::InvalidAudience,
            _ => AuthError::Malformed,
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        if err.is_credential_failure() {
            // One body for every credential failure: no oracle on which check failed.
            return AppError::Unauthorized(anyhow::anyhow!("InvalidToken"));
        }
        match err {
            AuthError::Malformed => AppError::BadRequest(anyhow::anyhow!("malformed")),
            AuthError::SessionExpired => AppError::Unauthorized(anyhow::anyhow!("SessionExpired")),
            AuthError::MissingIdempotencyKey => {
                AppError::BadRequest(anyhow::anyhow!("missing_idempotency_key"))
            }
            AuthError::IdempotencyConflict => {
                AppError::Conflict(anyhow::anyhow!("idempotency_key_conflict"))
            }
            AuthError::IdempotencyInProgress => {
                AppError::Conflict(anyhow::anyhow!("idempotency_key_in_use"))
            }
            AuthError::RateLimited {
                retry_after_seconds,
            } => AppError::TooManyRequests(
                format!(
                    "Too many attempts. Please try again in {}.",
                    humanize_seconds(retry_after_seconds)
                ),
                Some(retry_after_seconds),
            ),
            AuthError::Configuration(msg) => AppError::ConfigError(anyhow::anyhow!(msg)),
            AuthError::Store(e) => AppError::InternalError(e),
            // Covered by is_credential_failure above.
            other => AppError::Unauthorized(anyhow::anyhow!("{}", other)),
        }
    }
}

fn humanize_seconds(seconds: u64) -> String {
    match seconds {
        0..=1 => "1 second".to_string(),
        2..=59 => format!("{} seconds", seconds),
        60..=119 => "1 minute".to_string(),
        _ => format!("{} minutes", seconds.div_ceil(60)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::{http::StatusCode, response::IntoResponse};

    fn status_of(err: AuthError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn test_http_taxonomy() {
        assert_eq!(status_of(AuthError::InvalidSignature), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AuthError::ReplayDetected), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AuthError::SessionExpired), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AuthError::InvalidToken), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(AuthError::Malformed), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(AuthError::IdempotencyConflict), StatusCode::CONFLICT);
        assert_eq!(
            status_of(AuthError::RateLimited {
                retry_after_seconds: 30
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(AuthError::Configuration("missing secret".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_humanize_seconds() {
        assert_eq!(humanize_seconds(1), "1 second");
        assert_eq!(humanize_seconds(45), "45 seconds");
        assert_eq!(humanize_seconds(1800), "30 minutes");
        assert_eq!(humanize_seconds(61), "1 minute");
    }
}
