use secrecy::SecretString;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::net::IpAddr;
use std::time::Duration;

use crate::middleware::identity::IdentitySource;
use crate::models::Role;

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreConfig,
    pub ticket: TicketConfig,
    pub token: TokenConfig,
    pub cookies: CookieConfig,
    pub identity_sources: Vec<IdentitySource>,
    pub idempotency: IdempotencyConfig,
    pub rate_limit: RateLimitConfig,
    pub sweep_interval_seconds: u64,
    pub allowed_origins: Vec<String>,
    /// Peers whose `X-Forwarded-For` is believed. Empty means the socket
    /// address is always the client.
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TicketConfig {
    pub signing_secret: Option<SecretString>,
    /// Identity of the signing key; scopes recorded nonces.
    pub key_id: String,
    pub ttl_seconds: i64,
    /// Audience name of this application, checked on the callback.
    pub audience: String,
    pub login_url: String,
    pub redirect_paths: HashMap<Role, String>,
}

impl TicketConfig {
    pub fn redirect_path(&self, role: Role) -> String {
        self.redirect_paths
            .get(&role)
            .cloned()
            .unwrap_or_else(|| format!("/{}/dashboard", role))
    }
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub signing_secret: Option<SecretString>,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub rotate_refresh_tokens: bool,
}

#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub access_name: String,
    pub refresh_name: String,
    pub secure: bool,
    pub domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl_seconds: u64,
    pub reservation_seconds: u64,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_seconds)
    }
}

/// Attempt budget for one rate-limit category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window_seconds: u64,
    pub lockout_seconds: u64,
}

pub const CATEGORY_AUTH: &str = "auth";
pub const CATEGORY_AUTH_TICKET: &str = "auth-ticket";
pub const CATEGORY_AUTH_REFRESH: &str = "auth-refresh";
pub const CATEGORY_API: &str = "api";

/// Category name, env prefix, default attempts/window/lockout.
const RATE_LIMIT_DEFAULTS: [(&str, &str, u32, u64, u64); 4] = [
    (CATEGORY_AUTH, "RATE_LIMIT_AUTH", 5, 900, 1800),
    (CATEGORY_AUTH_TICKET, "RATE_LIMIT_AUTH_TICKET", 10, 60, 300),
    (CATEGORY_AUTH_REFRESH, "RATE_LIMIT_AUTH_REFRESH", 30, 60, 300),
    (CATEGORY_API, "RATE_LIMIT_API", 120, 60, 60),
];

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub categories: HashMap<String, RateLimitPolicy>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let categories = RATE_LIMIT_DEFAULTS
            .iter()
            .map(|(name, _, attempts, window, lockout)| {
                (
                    name.to_string(),
                    RateLimitPolicy {
                        max_attempts: *attempts,
                        window_seconds: *window,
                        lockout_seconds: *lockout,
                    },
                )
            })
            .collect();
        Self { categories }
    }
}

impl HandoffConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_str = lookup("ENVIRONMENT").unwrap_or_else(|| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let get = |key: &str, default: Option<&str>| get_env(&lookup, key, default, is_prod);
        let get_with_default = |key: &str, default: &str| {
            lookup(key).unwrap_or_else(|| default.to_string())
        };

        let store = StoreConfig {
            backend: get_with_default("STORE_BACKEND", "memory")
                .parse()
                .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            redis_url: lookup("REDIS_URL"),
        };

        let mut redirect_paths = HashMap::new();
        for role in Role::ALL {
            let key = format!("TICKET_REDIRECT_{}", role.as_str().to_uppercase());
            if let Some(path) = lookup(&key) {
                redirect_paths.insert(role, path);
            }
        }

        let ticket = TicketConfig {
            signing_secret: secret(&lookup, "TICKET_SIGNING_SECRET", is_prod)?,
            key_id: get_with_default("TICKET_KEY_ID", "sso"),
            ttl_seconds: parse_num(&get_with_default("TICKET_TTL_SECONDS", "120"), "TICKET_TTL_SECONDS")?,
            audience: get("TICKET_AUDIENCE", Some("tenant-app"))?,
            login_url: get("TICKET_LOGIN_URL", Some("/login"))?,
            redirect_paths,
        };

        let token = TokenConfig {
            signing_secret: secret(&lookup, "TOKEN_SIGNING_SECRET", is_prod)?,
            access_token_expiry_minutes: parse_num(
                &get_with_default("ACCESS_TOKEN_TTL_MINUTES", "15"),
                "ACCESS_TOKEN_TTL_MINUTES",
            )?,
            refresh_token_expiry_days: parse_num(
                &get_with_default("REFRESH_TOKEN_TTL_DAYS", "7"),
                "REFRESH_TOKEN_TTL_DAYS",
            )?,
            rotate_refresh_tokens: get_with_default("REFRESH_ROTATION", "true")
                .parse()
                .unwrap_or(true),
        };

        let cookies = CookieConfig {
            access_name: get_with_default("ACCESS_COOKIE_NAME", "access_token"),
            refresh_name: get_with_default("REFRESH_COOKIE_NAME", "refresh_token"),
            secure: get_with_default("COOKIE_SECURE", if is_prod { "true" } else { "false" })
                .parse()
                .unwrap_or(is_prod),
            domain: lookup("COOKIE_DOMAIN"),
        };

        let identity_sources = get_with_default(
            "IDENTITY_SOURCES",
            "bearer,cookie:access_token,cookie:session_token",
        )
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<IdentitySource>, String>>()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let idempotency = IdempotencyConfig {
            ttl_seconds: parse_num(
                &get_with_default("IDEMPOTENCY_TTL_SECONDS", "86400"),
                "IDEMPOTENCY_TTL_SECONDS",
            )?,
            reservation_seconds: parse_num(
                &get_with_default("IDEMPOTENCY_RESERVATION_SECONDS", "60"),
                "IDEMPOTENCY_RESERVATION_SECONDS",
            )?,
        };

        let mut rate_limit = RateLimitConfig::default();
        for (name, prefix, _, _, _) in RATE_LIMIT_DEFAULTS {
            if let Some(policy) = rate_limit.categories.get_mut(name) {
                if let Some(v) = lookup(&format!("{}_ATTEMPTS", prefix)) {
                    policy.max_attempts = v.parse().unwrap_or(policy.max_attempts);
                }
                if let Some(v) = lookup(&format!("{}_WINDOW_SECONDS", prefix)) {
                    policy.window_seconds = v.parse().unwrap_or(policy.window_seconds);
                }
                if let Some(v) = lookup(&format!("{}_LOCKOUT_SECONDS", prefix)) {
                    policy.lockout_seconds = v.parse().unwrap_or(policy.lockout_seconds);
                }
            }
        }

        let config = HandoffConfig {
            common,
            environment: environment.clone(),
            service_name: get_with_default("SERVICE_NAME", "handoff-service"),
            service_version: get_with_default("SERVICE_VERSION", env!("CARGO_PKG_VERSION")),
            log_level: get_with_default("LOG_LEVEL", "info"),
            otlp_endpoint: lookup("OTLP_ENDPOINT").filter(|s| !s.is_empty()),
            store,
            ticket,
            token,
            cookies,
            identity_sources,
            idempotency,
            rate_limit,
            sweep_interval_seconds: parse_num(
                &get_with_default("SWEEP_INTERVAL_SECONDS", "300"),
                "SWEEP_INTERVAL_SECONDS",
            )?,
            allowed_origins: get("ALLOWED_ORIGINS", Some("http://localhost:3000"))?
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            trusted_proxies: lookup("TRUSTED_PROXIES")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|e| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "TRUSTED_PROXIES entry '{}' is not an IP address: {}",
                            s,
                            e
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.ticket.ttl_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TICKET_TTL_SECONDS must be positive"
            )));
        }

        if self.token.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ACCESS_TOKEN_TTL_MINUTES must be positive"
            )));
        }

        if self.token.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REFRESH_TOKEN_TTL_DAYS must be positive"
            )));
        }

        if self.idempotency.reservation_seconds == 0 || self.idempotency.ttl_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IDEMPOTENCY_TTL_SECONDS and IDEMPOTENCY_RESERVATION_SECONDS must be positive"
            )));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SWEEP_INTERVAL_SECONDS must be positive"
            )));
        }

        for (name, policy) in &self.rate_limit.categories {
            if policy.max_attempts == 0 || policy.window_seconds == 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Rate limit category '{}' needs positive attempts and window",
                    name
                )));
            }
        }

        if self.identity_sources.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IDENTITY_SOURCES must name at least one source"
            )));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REDIS_URL is required when STORE_BACKEND=redis"
            )));
        }

        if self.environment == Environment::Prod {
            if self.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.store.backend == StoreBackend::Memory {
                tracing::warn!("In-memory store in production: replay and idempotency state is per-process");
            }
        }

        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

fn get_env<F>(lookup: &F, key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => Ok(val),
        None => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

/// Signing secrets: required in production, optional in dev where a missing
/// secret surfaces as a configuration error on first use.
fn secret<F>(lookup: &F, key: &str, is_prod: bool) -> Result<Option<SecretString>, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|s| !s.is_empty()) {
        Some(val) => Ok(Some(SecretString::new(val))),
        None if is_prod => Err(AppError::ConfigError(anyhow::anyhow!(
            "{} is required in production but not set",
            key
        ))),
        None => {
            tracing::error!(key = %key, "Signing secret not configured; dependent endpoints will fail");
            Ok(None)
        }
    }
}

fn parse_num<T>(value: &str, key: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("{} is not a valid number: {}", key, e))
    })
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            _ => Err(format!("Invalid store backend: {}", s)),
        }
    }
}
