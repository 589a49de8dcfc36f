//! Application configuration loaded from environment variables.

use saga_engine::command::DEFAULT_MAX_COMMIT_ATTEMPTS;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `SAGA_TEMPLATES_PATH`: JSON file with the saga template catalog
/// - `SAGA_MAX_COMMIT_ATTEMPTS`: commit attempts per command (default: `3`)
/// - `DATABASE_URL`: PostgreSQL connection string; the in-memory log is used when unset
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub templates_path: Option<String>,
    pub max_commit_attempts: u32,
    pub database_url: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            templates_path: lookup("SAGA_TEMPLATES_PATH").filter(|p| !p.is_empty()),
            max_commit_attempts: lookup("SAGA_MAX_COMMIT_ATTEMPTS")
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_commit_attempts),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            templates_path: None,
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            database_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_commit_attempts, 3);
        assert!(config.templates_path.is_none());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_reads_saga_settings() {
        let config = from_pairs(&[
            ("PORT", "4100"),
            ("SAGA_TEMPLATES_PATH", "/etc/sagas.json"),
            ("SAGA_MAX_COMMIT_ATTEMPTS", "5"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
        ]);
        assert_eq!(config.port, 4100);
        assert_eq!(config.templates_path.as_deref(), Some("/etc/sagas.json"));
        assert_eq!(config.max_commit_attempts, 5);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/sagas")
        );
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = from_pairs(&[
            ("PORT", "not-a-port"),
            ("SAGA_MAX_COMMIT_ATTEMPTS", "0"),
            ("DATABASE_URL", ""),
        ]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_commit_attempts, 3);
        assert!(config.database_url.is_none());
    }
}
