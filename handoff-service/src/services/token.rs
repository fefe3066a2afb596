use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use super::clock::Clock;
use super::error::AuthError;
use super::signing::{self, SigningKeys};
use crate::config::TokenConfig;
use crate::models::{Role, TokenClaims, TokenType};

/// Access and refresh tokens. Both are stateless HS256 tokens; the refresh
/// token's `sid` ties it to a server-side session that carries revocation.
#[derive(Clone)]
pub struct TokenService {
    keys: Option<SigningKeys>,
    clock: Arc<dyn Clock>,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

impl TokenService {
    pub fn new(config: &TokenConfig, clock: Arc<dyn Clock>) -> Self {
        let keys = SigningKeys::from_optional(config.signing_secret.as_ref(), None);
        if keys.is_some() {
            tracing::info!("Token service initialized with HS256 key");
        }

        Self {
            keys,
            clock,
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
        }
    }

    pub fn generate_access_token(
        &self,
        subject_id: &str,
        email: &str,
        role: Role,
        session_id: &str,
    ) -> Result<String, AuthError> {
        self.generate(
            subject_id,
            email,
            role,
            session_id,
            TokenType::Access,
            Duration::minutes(self.access_token_expiry_minutes),
        )
    }

    pub fn generate_refresh_token(
        &self,
        subject_id: &str,
        email: &str,
        role: Role,
        session_id: &str,
    ) -> Result<String, AuthError> {
        self.generate(
            subject_id,
            email,
            role,
            session_id,
            TokenType::Refresh,
            Duration::days(self.refresh_token_expiry_days),
        )
    }

    pub fn verify_access_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.verify(token, TokenType::Access)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        self.verify(token, TokenType::Refresh)
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn refresh_token_expiry_seconds(&self) -> i64 {
        self.refresh_token_expiry_days * 86_400
    }

    fn generate(
        &self,
        subject_id: &str,
        email: &str,
        role: Role,
        session_id: &str,
        typ: TokenType,
        lifetime: Duration,
    ) -> Result<String, AuthError> {
        let keys = signing::require(&self.keys, "TOKEN_SIGNING_SECRET")?;
        let now = self.clock.now();

        let claims = TokenClaims {
            sub: subject_id.to_string(),
            email: email.to_string(),
            role,
            sid: session_id.to_string(),
            typ,
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        keys.sign(&claims)
    }

    fn verify(&self, token: &str, expected: TokenType) -> Result<TokenClaims, AuthError> {
        let keys = signing::require(&self.keys, "TOKEN_SIGNING_SECRET")?;

        let claims: TokenClaims = keys.verify(token).map_err(|e| {
            tracing::debug!(error = %e, "Token failed to decode");
            AuthError::InvalidToken
        })?;

        if self.clock.now().timestamp() > claims.exp {
            return Err(AuthError::Expired);
        }

        if claims.typ != expected {
            tracing::debug!(expected = ?expected, actual = ?claims.typ, "Token type mismatch");
            return Err(AuthError::InvalidTokenType);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use secrecy::SecretString;

    fn config(secret: Option<&str>) -> TokenConfig {
        TokenConfig {
            signing_secret: secret.map(|s| SecretString::new(s.to_string())),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            rotate_refresh_tokens: true,
        }
    }

    fn service() -> (TokenService, ManualClock) {
        let clock = ManualClock::default();
        (
            TokenService::new(&config(Some("token-secret")), Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_access_token_round_trip() {
        let (tokens, _) = service();
        let token = tokens
            .generate_access_token("user-1", "a@x.com", Role::Provider, "sess-1")
            .unwrap();

        let claims = tokens.verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email, "a@x.com");
        assert_eq!(claims.role, Role::Provider);
        assert_eq!(claims.sid, "sess-1");
        assert_eq!(claims.typ, TokenType::Access);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn test_type_confusion_rejected() {
        let (tokens, _) = service();
        let refresh = tokens
            .generate_refresh_token("user-1", "a@x.com", Role::Tenant, "sess-1")
            .unwrap();
        let access = tokens
            .generate_access_token("user-1", "a@x.com", Role::Tenant, "sess-1")
            .unwrap();

        assert!(matches!(
            tokens.verify_access_token(&refresh),
            Err(AuthError::InvalidTokenType)
        ));
        assert!(matches!(
            tokens.verify_refresh_token(&access),
            Err(AuthError::InvalidTokenType)
        ));
        assert!(tokens.verify_refresh_token(&refresh).is_ok());
    }

    #[test]
    fn test_access_token_rejected_after_expiry() {
        let (tokens, clock) = service();
        let token = tokens
            .generate_access_token("user-1", "a@x.com", Role::Vendor, "sess-1")
            .unwrap();

        clock.advance(Duration::minutes(15));
        assert!(tokens.verify_access_token(&token).is_ok());

        clock.advance(Duration::seconds(1));
        assert!(matches!(
            tokens.verify_access_token(&token),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn test_refresh_token_lives_seven_days() {
        let (tokens, clock) = service();
        let token = tokens
            .generate_refresh_token("user-1", "a@x.com", Role::Vendor, "sess-1")
            .unwrap();
        clock.advance(Duration::days(7) - Duration::seconds(1));
        assert!(tokens.verify_refresh_token(&token).is_ok());
        clock.advance(Duration::seconds(2));
        assert!(tokens.verify_refresh_token(&token).is_err());
    }

    #[test]
    fn test_foreign_secret_and_garbage_rejected() {
        let (tokens, _) = service();
        let other = TokenService::new(&config(Some("other")), Arc::new(ManualClock::default()));
        let token = other
            .generate_access_token("user-1", "a@x.com", Role::Tenant, "sess-1")
            .unwrap();

        assert!(matches!(
            tokens.verify_access_token(&token),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            tokens.verify_access_token("not-a-token"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_missing_secret_is_configuration_error() {
        let tokens = TokenService::new(&config(None), Arc::new(ManualClock::default()));
        let err = tokens
            .generate_access_token("user-1", "a@x.com", Role::Tenant, "sess-1")
            .unwrap_err();
        assert_eq!(err.reason(), "configuration_error");
    }
}
