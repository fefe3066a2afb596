use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::store::KeyValueStore;
use crate::models::{Role, Session};

/// Server-side session records. A session that is absent here has been
/// revoked or has lapsed, and every refresh bound to it fails.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn create(
        &self,
        subject_id: &str,
        email: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<Session, anyhow::Error> {
        let session = Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            email: email.to_string(),
            role,
            created_utc: self.clock.now(),
        };

        let raw = serde_json::to_string(&session)?;
        self.store.set(&session_key(&session.session_id), &raw, ttl).await?;

        tracing::debug!(session_id = %session.session_id, "Session created");
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, anyhow::Error> {
        match self.store.get(&session_key(session_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Extends a live session. Returns false when the session is gone.
    pub async fn touch(&self, session_id: &str, ttl: Duration) -> Result<bool, anyhow::Error> {
        let key = session_key(session_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(false);
        };
        // CAS so a concurrent revoke is never undone by the extension.
        self.store.compare_and_swap(&key, &raw, &raw, ttl).await
    }

    pub async fn revoke(&self, session_id: &str) -> Result<(), anyhow::Error> {
        self.store.delete(&session_key(session_id)).await?;
        tracing::debug!(session_id = %session_id, "Session revoked");
        Ok(())
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}
