// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use tracing::warn;

use crate::transfer::DigestAlgorithm;

/// Shared secret used when `CURIO_TRANSFER_SECRET` is unset. Fine for
/// development; any real deployment must override it.
pub const INSECURE_DEFAULT_SECRET: &str = "curio-insecure-transfer-secret";

/// Minimum collector sleep between cleaning passes.
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Curio engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL.
    pub database_url: String,
    /// Sleep between collector passes (clamped to at least one second).
    pub cleanup_interval: Duration,
    /// Maximum expired artifacts fetched per collector batch.
    pub cleanup_batch_size: i64,
    /// Digest algorithm for transfer checksums.
    pub digest_algorithm: DigestAlgorithm,
    /// Shared secret mixed into transfer checksums.
    pub transfer_secret: String,
    /// TTL in seconds applied when a caller asks for `DEFAULT`.
    pub default_ttl: Option<i64>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CURIO_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CURIO_CLEANUP_INTERVAL_SECS`: seconds between collector passes
    ///   (default: 300, minimum: 1)
    /// - `CURIO_CLEANUP_BATCH_SIZE`: expired artifacts per fetch (default: 100)
    /// - `CURIO_DIGEST_ALGORITHM`: `sha-256` or `sha-512` (default: sha-256)
    /// - `CURIO_TRANSFER_SECRET`: shared export secret (default: insecure)
    /// - `CURIO_DEFAULT_TTL_SECS`: TTL for `DEFAULT` requests (default: 86400)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CURIO_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CURIO_DATABASE_URL"))?;

        let interval_secs: u64 = std::env::var("CURIO_CLEANUP_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CURIO_CLEANUP_INTERVAL_SECS", "must be a positive integer")
            })?;
        let cleanup_interval =
            Duration::from_secs(interval_secs).max(MIN_CLEANUP_INTERVAL);

        let cleanup_batch_size: i64 = std::env::var("CURIO_CLEANUP_BATCH_SIZE")
            .unwrap_or_else(|_| "100".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CURIO_CLEANUP_BATCH_SIZE", "must be a positive integer")
            })?;
        if cleanup_batch_size < 1 {
            return Err(ConfigError::Invalid(
                "CURIO_CLEANUP_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let digest_algorithm = match std::env::var("CURIO_DIGEST_ALGORITHM") {
            Ok(name) => DigestAlgorithm::parse(&name).ok_or(ConfigError::Invalid(
                "CURIO_DIGEST_ALGORITHM",
                "must be 'sha-256' or 'sha-512'",
            ))?,
            Err(_) => DigestAlgorithm::default(),
        };

        let transfer_secret = match std::env::var("CURIO_TRANSFER_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                warn!("CURIO_TRANSFER_SECRET is unset, using the insecure default");
                INSECURE_DEFAULT_SECRET.to_string()
            }
        };

        let default_ttl: i64 = std::env::var("CURIO_DEFAULT_TTL_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CURIO_DEFAULT_TTL_SECS", "must be a non-negative integer")
            })?;
        if default_ttl < 0 {
            return Err(ConfigError::Invalid(
                "CURIO_DEFAULT_TTL_SECS",
                "must be a non-negative integer",
            ));
        }

        Ok(Self {
            database_url,
            cleanup_interval,
            cleanup_batch_size,
            digest_algorithm,
            transfer_secret,
            default_ttl: Some(default_ttl),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_optional(guard: &mut EnvGuard) {
        guard.remove("CURIO_CLEANUP_INTERVAL_SECS");
        guard.remove("CURIO_CLEANUP_BATCH_SIZE");
        guard.remove("CURIO_DIGEST_ALGORITHM");
        guard.remove("CURIO_TRANSFER_SECRET");
        guard.remove("CURIO_DEFAULT_TTL_SECS");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CURIO_DATABASE_URL", "postgres://localhost/curio");
        clear_optional(&mut guard);

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/curio");
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.cleanup_batch_size, 100);
        assert_eq!(config.digest_algorithm, DigestAlgorithm::Sha256);
        assert_eq!(config.transfer_secret, INSECURE_DEFAULT_SECRET);
        assert_eq!(config.default_ttl, Some(86400));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CURIO_DATABASE_URL");

        let result = Config::from_env();
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::Missing("CURIO_DATABASE_URL")
        ));
    }

    #[test]
    fn test_config_interval_clamped_to_minimum() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CURIO_DATABASE_URL", "sqlite:curio.db");
        clear_optional(&mut guard);
        guard.set("CURIO_CLEANUP_INTERVAL_SECS", "0");

        let config = Config::from_env().unwrap();
        assert_eq!(config.cleanup_interval, MIN_CLEANUP_INTERVAL);
    }

    #[test]
    fn test_config_invalid_interval() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CURIO_DATABASE_URL", "sqlite:curio.db");
        clear_optional(&mut guard);
        guard.set("CURIO_CLEANUP_INTERVAL_SECS", "soon");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("CURIO_CLEANUP_INTERVAL_SECS", _)
        ));
    }

    #[test]
    fn test_config_digest_algorithm() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CURIO_DATABASE_URL", "sqlite:curio.db");
        clear_optional(&mut guard);
        guard.set("CURIO_DIGEST_ALGORITHM", "sha-512");

        let config = Config::from_env().unwrap();
        assert_eq!(config.digest_algorithm, DigestAlgorithm::Sha512);

        guard.set("CURIO_DIGEST_ALGORITHM", "md5");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("CURIO_DIGEST_ALGORITHM", _)
        ));
    }

    #[test]
    fn test_config_custom_secret() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CURIO_DATABASE_URL", "sqlite:curio.db");
        clear_optional(&mut guard);
        guard.set("CURIO_TRANSFER_SECRET", "deployment-secret");

        let config = Config::from_env().unwrap();
        assert_eq!(config.transfer_secret, "deployment-secret");
    }

    #[test]
    fn test_config_negative_batch_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CURIO_DATABASE_URL", "sqlite:curio.db");
        clear_optional(&mut guard);
        guard.set("CURIO_CLEANUP_BATCH_SIZE", "-10");

        assert!(Config::from_env().is_err());
    }
}
