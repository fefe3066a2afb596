use metrics::counter;
use std::time::Duration;

use super::error::AuthError;
use super::session_store::SessionStore;
use super::token::TokenService;
use crate::models::{Role, TokenPair};

/// Session lifecycle on top of the token service: login establishes a
/// session, refresh renews it, logout revokes it.
#[derive(Clone)]
pub struct SessionService {
    tokens: TokenService,
    sessions: SessionStore,
    rotate_refresh_tokens: bool,
}

impl SessionService {
    pub fn new(tokens: TokenService, sessions: SessionStore, rotate_refresh_tokens: bool) -> Self {
        Self {
            tokens,
            sessions,
            rotate_refresh_tokens,
        }
    }

    pub async fn establish(
        &self,
        subject_id: &str,
        email: &str,
        role: Role,
    ) -> Result<TokenPair, AuthError> {
        let session = self
            .sessions
            .create(subject_id, email, role, self.session_ttl())
            .await?;

        let access_token =
            self.tokens
                .generate_access_token(subject_id, email, role, &session.session_id)?;
        let refresh_token =
            self.tokens
                .generate_refresh_token(subject_id, email, role, &session.session_id)?;

        tracing::info!(subject_id = %subject_id, session_id = %session.session_id, "Session established");

        Ok(self.pair(access_token, refresh_token, session.session_id))
    }

    /// Exchanges a refresh token for a new access token, and a new refresh
    /// token when rotation is on. The session must still be live.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let result = self.refresh_inner(refresh_token).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.reason(),
        };
        counter!("token_refresh_total", "outcome" => outcome).increment(1);
        result
    }

    async fn refresh_inner(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.tokens.verify_refresh_token(refresh_token)?;

        let session = match self.sessions.get(&claims.sid).await? {
            Some(session) => session,
            None => {
                tracing::debug!(session_id = %claims.sid, "Refresh against a revoked or lapsed session");
                return Err(AuthError::SessionExpired);
            }
        };

        if session.subject_id != claims.sub {
            tracing::warn!(session_id = %claims.sid, "Refresh token subject does not own the session");
            return Err(AuthError::InvalidToken);
        }

        if !self.sessions.touch(&session.session_id, self.session_ttl()).await? {
            return Err(AuthError::SessionExpired);
        }

        let access_token = self.tokens.generate_access_token(
            &session.subject_id,
            &session.email,
            session.role,
            &session.session_id,
        )?;

        let refresh_token = if self.rotate_refresh_tokens {
            self.tokens.generate_refresh_token(
                &session.subject_id,
                &session.email,
                session.role,
                &session.session_id,
            )?
        } else {
            refresh_token.to_string()
        };

        Ok(self.pair(access_token, refresh_token, session.session_id))
    }

    /// Revokes the session behind a refresh or access token. Tokens that no
    /// longer verify leave nothing to revoke and are not an error.
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        let claims = self
            .tokens
            .verify_refresh_token(token)
            .or_else(|_| self.tokens.verify_access_token(token));

        match claims {
            Ok(claims) => {
                self.sessions.revoke(&claims.sid).await?;
                tracing::info!(subject_id = %claims.sub, session_id = %claims.sid, "Session revoked");
            }
            Err(AuthError::Configuration(msg)) => return Err(AuthError::Configuration(msg)),
            Err(e) => tracing::debug!(reason = e.reason(), "Logout with unusable token"),
        }

        Ok(())
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.tokens.refresh_token_expiry_seconds().max(1) as u64)
    }

    fn pair(&self, access_token: String, refresh_token: String, session_id: String) -> TokenPair {
        TokenPair {
            access_token,
            refresh_token,
            expires_in: self.tokens.access_token_expiry_seconds(),
            refresh_expires_in: self.tokens.refresh_token_expiry_seconds(),
            session_id,
        }
    }
}
