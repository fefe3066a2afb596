use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Duration;
use metrics::counter;
use rand::RngCore;
use std::sync::Arc;

use super::clock::Clock;
use super::error::AuthError;
use super::nonce::NonceStore;
use super::signing::{self, SigningKeys};
use crate::config::TicketConfig;
use crate::models::{IssuedTicket, Role, TicketClaims};

const NONCE_BYTES: usize = 32;

/// Short-lived, audience-bound, single-use SSO handoff tickets.
#[derive(Clone)]
pub struct TicketService {
    keys: Option<SigningKeys>,
    key_id: String,
    default_ttl_seconds: i64,
    nonces: NonceStore,
    clock: Arc<dyn Clock>,
}

impl TicketService {
    pub fn new(config: &TicketConfig, nonces: NonceStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: SigningKeys::from_optional(
                config.signing_secret.as_ref(),
                Some(config.key_id.clone()),
            ),
            key_id: config.key_id.clone(),
            default_ttl_seconds: config.ttl_seconds,
            nonces,
            clock,
        }
    }

    /// Issues a ticket for `audience`. `ttl_seconds` falls back to the
    /// configured lifetime.
    pub fn issue(
        &self,
        subject: &str,
        role: Role,
        audience: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<IssuedTicket, AuthError> {
        let keys = signing::require(&self.keys, "TICKET_SIGNING_SECRET")?;
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let now = self.clock.now();
        let expires_at = now + Duration::seconds(ttl);

        let claims = TicketClaims {
            sub: subject.to_string(),
            role,
            aud: audience.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            nonce: generate_nonce(),
        };

        let token = keys.sign(&claims)?;

        tracing::info!(subject = %subject, role = %role, audience = %audience, "SSO ticket issued");

        Ok(IssuedTicket {
            token,
            expires_at,
            expires_in: ttl,
        })
    }

    /// Verifies and consumes a ticket. Succeeds at most once per ticket.
    pub async fn verify(
        &self,
        token: &str,
        expected_audience: &str,
    ) -> Result<TicketClaims, AuthError> {
        let result = self.verify_inner(token, expected_audience).await;

        let outcome = match &result {
            Ok(_) => "valid",
            Err(e) => e.reason(),
        };
        counter!("ticket_verifications_total", "outcome" => outcome).increment(1);

        match &result {
            Err(AuthError::ReplayDetected) => {
                tracing::warn!(
                    security_event = "ticket_replay",
                    audience = %expected_audience,
                    "SSO ticket replay rejected"
                );
            }
            Err(e) => tracing::debug!(reason = e.reason(), "SSO ticket rejected"),
            Ok(claims) => {
                tracing::info!(subject = %claims.sub, audience = %claims.aud, "SSO ticket accepted")
            }
        }

        result
    }

    async fn verify_inner(
        &self,
        token: &str,
        expected_audience: &str,
    ) -> Result<TicketClaims, AuthError> {
        let keys = signing::require(&self.keys, "TICKET_SIGNING_SECRET")?;
        let claims: TicketClaims = keys.verify(token)?;

        if claims.aud != expected_audience {
            return Err(AuthError::InvalidAudience);
        }

        let now = self.clock.now();
        if now.timestamp() > claims.exp {
            return Err(AuthError::Expired);
        }

        // Keep the nonce at least until the ticket could no longer pass the expiry check.
        let remaining = (claims.exp - now.timestamp()).max(0) as u64 + 1;
        let fresh = self
            .nonces
            .check_and_record(&self.key_id, &claims.nonce, std::time::Duration::from_secs(remaining))
            .await?;

        if !fresh {
            return Err(AuthError::ReplayDetected);
        }

        Ok(claims)
    }
}

fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
