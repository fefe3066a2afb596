//! HS256 keys shared by the ticket and token services.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};

use super::error::AuthError;

#[derive(Clone)]
pub struct SigningKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    key_id: Option<String>,
}

impl SigningKeys {
    pub fn from_secret(secret: &SecretString, key_id: Option<String>) -> Self {
        let bytes = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(bytes),
            decoding_key: DecodingKey::from_secret(bytes),
            key_id,
        }
    }

    /// Keys for an optional secret; a missing one yields `None` so the
    /// failure surfaces per request as a configuration error.
    pub fn from_optional(secret: Option<&SecretString>, key_id: Option<String>) -> Option<Self> {
        secret.map(|s| Self::from_secret(s, key_id))
    }

    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = self.key_id.clone();
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| AuthError::Configuration(format!("Failed to sign payload: {}", e)))
    }

    /// Checks the signature only. Expiry and audience are judged by the
    /// caller against its injected clock.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<T>(token, &self.decoding_key, &validation).map(|data| data.claims)
    }
}

pub fn require<'a>(keys: &'a Option<SigningKeys>, name: &str) -> Result<&'a SigningKeys, AuthError> {
    keys.as_ref()
        .ok_or_else(|| AuthError::Configuration(format!("{} is not configured", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        value: String,
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = SigningKeys::from_secret(&SecretString::new("k".into()), Some("sso".into()));
        let token = keys.sign(&Payload { value: "x".into() }).unwrap();
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("sso"));
        assert_eq!(keys.verify::<Payload>(&token).unwrap().value, "x");
    }

    #[test]
    fn test_other_secret_fails_signature() {
        let a = SigningKeys::from_secret(&SecretString::new("a".into()), None);
        let b = SigningKeys::from_secret(&SecretString::new("b".into()), None);
        let token = a.sign(&Payload { value: "x".into() }).unwrap();
        let err = b.verify::<Payload>(&token).unwrap_err();
        assert!(matches!(
            err.kind(),
            jsonwebtoken::errors::ErrorKind::InvalidSignature
        ));
    }

    #[test]
    fn test_missing_keys_are_configuration_error() {
        let result = require(&None, "TOKEN_SIGNING_SECRET");
        assert!(matches!(result, Err(AuthError::Configuration(_))));
        if let Err(err) = result {
            assert_eq!(err.reason(), "configuration_error");
        }
    }
}
