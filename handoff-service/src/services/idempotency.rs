//! At-most-once execution of mutating requests keyed by `Idempotency-Key`.
//!
//! A key moves through two states in the store:
//!
//! - `pending`: written atomically by [`IdempotencyStore::begin`] before the
//!   handler runs. Short TTL, so a crashed request frees the key.
//! - `completed`: written by [`IdempotencyStore::commit`] with the response
//!   to replay for the configured retention.
//!
//! Any later request under the same key must match the original method,
//! path, body hash and scope, otherwise it is a conflict.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::clock::Clock;
use super::store::KeyValueStore;

/// Attempts at claiming a key whose record vanished between our insert and read.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Response captured from the handler, replayed byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn body_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Bodies are arbitrary bytes; the record itself is JSON.
mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// What makes two requests "the same" for an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFingerprint {
    pub method: String,
    pub path: String,
    pub body_hash: String,
    pub scope_id: String,
}

impl RequestFingerprint {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        body_hash: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body_hash: body_hash.into(),
            scope_id: scope_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
enum IdempotencyRecord {
    Pending {
        fingerprint: RequestFingerprint,
        reservation_id: String,
        reserved_at: DateTime<Utc>,
    },
    Completed {
        fingerprint: RequestFingerprint,
        response: CachedResponse,
        created_at: DateTime<Utc>,
        ttl_seconds: u64,
    },
}

impl IdempotencyRecord {
    fn fingerprint(&self) -> &RequestFingerprint {
        match self {
            IdempotencyRecord::Pending { fingerprint, .. }
            | IdempotencyRecord::Completed { fingerprint, .. } => fingerprint,
        }
    }
}

/// Exclusive claim on a key, returned by `begin` and consumed by `commit` or `release`.
#[derive(Debug)]
pub struct Reservation {
    key: String,
    fingerprint: RequestFingerprint,
    pending_raw: String,
}

#[derive(Debug)]
pub enum BeginOutcome {
    /// No usable record: run the handler, then `commit` or `release`.
    New(Reservation),
    /// Same request already completed: return this response unchanged.
    Replay(CachedResponse),
    /// Key reused for a different request.
    Conflict,
    /// Same request is still executing elsewhere.
    InProgress,
}

impl BeginOutcome {
    fn label(&self) -> &'static str {
        match self {
            BeginOutcome::New(_) => "new",
            BeginOutcome::Replay(_) => "replay",
            BeginOutcome::Conflict => "conflict",
            BeginOutcome::InProgress => "in_progress",
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    reservation_ttl: Duration,
}

fn record_key(key: &str) -> String {
    format!("idem:{}", key)
}

impl IdempotencyStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        reservation_ttl: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            reservation_ttl,
        }
    }

    pub async fn begin(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<BeginOutcome, anyhow::Error> {
        let outcome = self.claim(key, fingerprint).await?;
        counter!("idempotency_outcomes_total", "outcome" => outcome.label()).increment(1);
        if matches!(outcome, BeginOutcome::Conflict) {
            tracing::info!(
                idempotency_key = %key,
                method = %fingerprint.method,
                path = %fingerprint.path,
                "Idempotency key reused for a different request"
            );
        }
        Ok(outcome)
    }

    async fn claim(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
    ) -> Result<BeginOutcome, anyhow::Error> {
        let store_key = record_key(key);
        let pending = IdempotencyRecord::Pending {
            fingerprint: fingerprint.clone(),
            reservation_id: Uuid::new_v4().to_string(),
            reserved_at: self.clock.now(),
        };
        let pending_raw = serde_json::to_string(&pending)?;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            if self
                .store
                .insert_if_absent(&store_key, &pending_raw, self.reservation_ttl)
                .await?
            {
                return Ok(BeginOutcome::New(Reservation {
                    key: key.to_string(),
                    fingerprint: fingerprint.clone(),
                    pending_raw,
                }));
            }

            let Some(raw) = self.store.get(&store_key).await? else {
                // Expired or released between the two calls; try to claim again.
                continue;
            };

            let existing: IdempotencyRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(idempotency_key = %key, error = %e, "Unreadable idempotency record");
                    return Ok(BeginOutcome::Conflict);
                }
            };

            if existing.fingerprint() != fingerprint {
                return Ok(BeginOutcome::Conflict);
            }

            return Ok(match existing {
                IdempotencyRecord::Pending { .. } => BeginOutcome::InProgress,
                IdempotencyRecord::Completed { response, .. } => BeginOutcome::Replay(response),
            });
        }

        Ok(BeginOutcome::InProgress)
    }

    /// Stores the handler's response for replay during `ttl`.
    pub async fn commit(
        &self,
        reservation: Reservation,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), anyhow::Error> {
        let store_key = record_key(&reservation.key);
        let completed = IdempotencyRecord::Completed {
            fingerprint: reservation.fingerprint,
            response,
            created_at: self.clock.now(),
            ttl_seconds: ttl.as_secs(),
        };
        let completed_raw = serde_json::to_string(&completed)?;

        if self
            .store
            .compare_and_swap(&store_key, &reservation.pending_raw, &completed_raw, ttl)
            .await?
        {
            return Ok(());
        }

        // Our reservation lapsed while the handler ran. Upsert unless another
        // request has claimed the key since.
        if !self
            .store
            .insert_if_absent(&store_key, &completed_raw, ttl)
            .await?
        {
            tracing::warn!(
                idempotency_key = %reservation.key,
                "Reservation lost before commit; response not cached"
            );
        }
        Ok(())
    }

    /// Gives the key back without caching anything, so a retry executes fully.
    pub async fn release(&self, reservation: Reservation) -> Result<(), anyhow::Error> {
        let store_key = record_key(&reservation.key);
        self.store
            .compare_and_delete(&store_key, &reservation.pending_raw)
            .await?;
        Ok(())
    }
}
