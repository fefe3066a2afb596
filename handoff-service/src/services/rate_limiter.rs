use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::error::AuthError;
use super::store::KeyValueStore;
use crate::config::{RateLimitConfig, RateLimitPolicy};

/// Store contention retries before a check gives up.
const MAX_UPDATE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    Deny { retry_after_seconds: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RateLimitEntry {
    count: u32,
    window_start: DateTime<Utc>,
    lockout_until: Option<DateTime<Utc>>,
}

impl RateLimitEntry {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
            lockout_until: None,
        }
    }
}

/// Fixed-window attempt counter with lockout, one window per
/// `(category, identity)`.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policies: Arc<HashMap<String, RateLimitPolicy>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            clock,
            policies: Arc::new(config.categories.clone()),
        }
    }

    pub fn policy(&self, category: &str) -> Result<RateLimitPolicy, AuthError> {
        self.policies.get(category).copied().ok_or_else(|| {
            AuthError::Configuration(format!("Unknown rate limit category: {}", category))
        })
    }

    pub async fn check(&self, identity: &str, category: &str) -> Result<RateLimitDecision, AuthError> {
        let policy = self.policy(category)?;
        let key = entry_key(category, identity);

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let now = self.clock.now();
            let current_raw = self.store.get(&key).await?;
            let current = current_raw
                .as_deref()
                .and_then(|raw| serde_json::from_str::<RateLimitEntry>(raw).ok());

            let (next, decision) = step(current, &policy, now);

            let Some(next) = next else {
                self.record_denial(category, decision);
                return Ok(decision);
            };

            let raw = serde_json::to_string(&next).map_err(anyhow::Error::from)?;
            let ttl = entry_ttl(&next, &policy, now);
            let written = match current_raw {
                Some(old) => self.store.compare_and_swap(&key, &old, &raw, ttl).await?,
                None => self.store.insert_if_absent(&key, &raw, ttl).await?,
            };

            if written {
                if next.lockout_until.is_some() && matches!(decision, RateLimitDecision::Deny { .. }) {
                    tracing::warn!(
                        security_event = "rate_limit_lockout",
                        category = %category,
                        identity = %identity,
                        lockout_seconds = policy.lockout_seconds,
                        "Attempt limit exceeded, identity locked out"
                    );
                }
                self.record_denial(category, decision);
                return Ok(decision);
            }
        }

        Err(AuthError::Store(anyhow::anyhow!(
            "Rate limit entry {} too contended to update",
            key
        )))
    }

    /// Clears the window, used after a verified successful authentication.
    pub async fn reset(&self, identity: &str, category: &str) -> Result<(), AuthError> {
        self.policy(category)?;
        self.store.delete(&entry_key(category, identity)).await?;
        Ok(())
    }

    fn record_denial(&self, category: &str, decision: RateLimitDecision) {
        if matches!(decision, RateLimitDecision::Deny { .. }) {
            counter!("rate_limit_denials_total", "category" => category.to_string()).increment(1);
        }
    }
}

fn entry_key(category: &str, identity: &str) -> String {
    format!("rl:{}:{}", category, identity)
}

/// Applies one attempt. `None` means the entry is left untouched.
fn step(
    current: Option<RateLimitEntry>,
    policy: &RateLimitPolicy,
    now: DateTime<Utc>,
) -> (Option<RateLimitEntry>, RateLimitDecision) {
    let Some(mut entry) = current else {
        return (Some(RateLimitEntry::fresh(now)), RateLimitDecision::Allow);
    };

    if let Some(until) = entry.lockout_until {
        if now < until {
            return (
                None,
                RateLimitDecision::Deny {
                    retry_after_seconds: ceil_seconds(until - now),
                },
            );
        }
        return (Some(RateLimitEntry::fresh(now)), RateLimitDecision::Allow);
    }

    let window_end = entry.window_start + chrono::Duration::seconds(policy.window_seconds as i64);
    if now >= window_end {
        return (Some(RateLimitEntry::fresh(now)), RateLimitDecision::Allow);
    }

    entry.count += 1;
    if entry.count > policy.max_attempts {
        entry.lockout_until = Some(now + chrono::Duration::seconds(policy.lockout_seconds as i64));
        return (
            Some(entry),
            RateLimitDecision::Deny {
                retry_after_seconds: policy.lockout_seconds.max(1),
            },
        );
    }

    (Some(entry), RateLimitDecision::Allow)
}

/// Entry lives until the later of window end and lockout end.
fn entry_ttl(entry: &RateLimitEntry, policy: &RateLimitPolicy, now: DateTime<Utc>) -> Duration {
    let window_end = entry.window_start + chrono::Duration::seconds(policy.window_seconds as i64);
    let until = entry
        .lockout_until
        .map_or(window_end, |lockout| lockout.max(window_end));
    Duration::from_secs(ceil_seconds(until - now).max(1))
}

fn ceil_seconds(delta: chrono::Duration) -> u64 {
    let millis = delta.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}
