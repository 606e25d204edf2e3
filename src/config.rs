//! Configuration management
//!
//! All options come from the environment (optionally seeded by a `.env`
//! file loaded in `main`). Duration-valued options accept humantime
//! strings such as `300s` or `5m`.

use std::fmt;
use std::time::Duration;

use figment::{providers::Env, Figment};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// Environment variables recognized by [`Config::load`].
const ENV_KEYS: &[&str] = &[
    "zitadel_domain",
    "service_account_token",
    "redis_addr",
    "redis_password",
    "redis_db",
    "cache_ttl",
    "port",
    "request_timeout",
    "retry_max",
    "cb_interval",
    "cb_timeout",
    "cb_max_requests",
    "project_id",
    "project_grant_id",
];

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the Zitadel instance
    pub zitadel_domain: String,
    /// Static service-account bearer token for upstream calls
    #[serde(deserialize_with = "string_even_if_numeric")]
    pub service_account_token: String,
    /// Redis address (`host:port`); empty selects the in-process backend
    pub redis_addr: String,
    /// Redis password (empty for none)
    #[serde(deserialize_with = "string_even_if_numeric")]
    pub redis_password: String,
    /// Redis logical database index
    pub redis_db: u32,
    /// Default TTL for cached role snapshots
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Port the HTTP server listens on
    pub port: u16,
    /// Per-request timeout for upstream calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum retry attempts per upstream HTTP call
    pub retry_max: u32,
    /// Rolling interval over which breaker counters are evaluated
    #[serde(with = "humantime_serde")]
    pub cb_interval: Duration,
    /// How long the breaker stays open before allowing probes
    #[serde(with = "humantime_serde")]
    pub cb_timeout: Duration,
    /// Maximum probe requests admitted while the breaker is half-open
    pub cb_max_requests: u32,
    /// Zitadel project the managed roles belong to
    #[serde(deserialize_with = "string_even_if_numeric")]
    pub project_id: String,
    /// Optional project grant id used when creating user grants
    #[serde(deserialize_with = "string_even_if_numeric")]
    pub project_grant_id: String,
}

/// Zitadel ids and secrets are opaque strings, but all-digit values reach
/// us as numbers from the env provider.
fn string_even_if_numeric<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<String, D::Error> {
    struct AnyString;

    impl serde::de::Visitor<'_> for AnyString {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a string or number")
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: serde::de::Error>(self, v: f64) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }
    }

    de.deserialize_any(AnyString)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zitadel_domain: "http://localhost:8080".to_string(),
            service_account_token: String::new(),
            redis_addr: "localhost:6379".to_string(),
            redis_password: String::new(),
            redis_db: 0,
            cache_ttl: Duration::from_secs(300),
            port: 3000,
            request_timeout: Duration::from_secs(8),
            retry_max: 3,
            cb_interval: Duration::from_secs(60),
            cb_timeout: Duration::from_secs(30),
            cb_max_requests: 5,
            project_id: String::new(),
            project_grant_id: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Figment::new()
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Connection URL for the Redis backend
    #[must_use]
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}/{}", self.redis_addr, self.redis_db)
        } else {
            format!("redis://:{}@{}/{}", self.redis_password, self.redis_addr, self.redis_db)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.request_timeout, Duration::from_secs(8));
        assert_eq!(cfg.retry_max, 3);
        assert_eq!(cfg.cb_interval, Duration::from_secs(60));
        assert_eq!(cfg.cb_timeout, Duration::from_secs(30));
        assert_eq!(cfg.cb_max_requests, 5);
    }

    #[test]
    fn redis_url_without_password() {
        let cfg = Config {
            redis_addr: "cache.internal:6379".into(),
            redis_db: 2,
            ..Config::default()
        };
        assert_eq!(cfg.redis_url(), "redis://cache.internal:6379/2");
    }

    #[test]
    fn redis_url_with_password() {
        let cfg = Config {
            redis_password: "s3cret".into(),
            ..Config::default()
        };
        assert_eq!(cfg.redis_url(), "redis://:s3cret@localhost:6379/0");
    }

    #[test]
    fn env_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CACHE_TTL", "30s");
            jail.set_env("PORT", "8088");
            jail.set_env("ZITADEL_DOMAIN", "https://idp.example.com");
            let cfg = Config::load().expect("load");
            assert_eq!(cfg.cache_ttl, Duration::from_secs(30));
            assert_eq!(cfg.port, 8088);
            assert_eq!(cfg.zitadel_domain, "https://idp.example.com");
            // Untouched options keep their defaults.
            assert_eq!(cfg.retry_max, 3);
            Ok(())
        });
    }

    #[test]
    fn all_digit_ids_stay_strings() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("PROJECT_ID", "318538862092088566");
            jail.set_env("SERVICE_ACCOUNT_TOKEN", "123456");
            let cfg = Config::load().expect("load");
            assert_eq!(cfg.project_id, "318538862092088566");
            assert_eq!(cfg.service_account_token, "123456");
            Ok(())
        });
    }
}
