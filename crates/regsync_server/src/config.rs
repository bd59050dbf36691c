use std::env;
use std::path::PathBuf;

use regsync_core::history::DEFAULT_SNAPSHOT_INTERVAL;
use thiserror::Error;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// SQLite revision log path (default: ./regsync.db)
    pub database_path: PathBuf,
    /// Revisions between forced snapshots (default: 20)
    pub snapshot_interval: u64,
    /// Per-channel broadcast buffer (default: 1024)
    pub broadcast_capacity: usize,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid PORT environment variable")]
    InvalidPort,

    #[error("Invalid SNAPSHOT_INTERVAL environment variable (must be a positive integer)")]
    InvalidSnapshotInterval,

    #[error("Invalid BROADCAST_CAPACITY environment variable (must be a positive integer)")]
    InvalidBroadcastCapacity,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = lookup("PORT")
            .unwrap_or_else(|| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path =
            PathBuf::from(lookup("DATABASE_PATH").unwrap_or_else(|| "./regsync.db".to_string()));

        let snapshot_interval = match lookup("SNAPSHOT_INTERVAL") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|s| *s >= 1)
                .ok_or(ConfigError::InvalidSnapshotInterval)?,
            None => DEFAULT_SNAPSHOT_INTERVAL,
        };

        let broadcast_capacity = match lookup("BROADCAST_CAPACITY") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|c| *c >= 1)
                .ok_or(ConfigError::InvalidBroadcastCapacity)?,
            None => 1024,
        };

        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Config {
            host,
            port,
            database_path,
            snapshot_interval,
            broadcast_capacity,
            cors_origins,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.server_addr(), "0.0.0.0:3030");
        assert_eq!(config.database_path, PathBuf::from("./regsync.db"));
        assert_eq!(config.snapshot_interval, 20);
        assert_eq!(config.broadcast_capacity, 1024);
        assert_eq!(config.cors_origins, vec!["http://localhost:5173"]);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "8080"),
            ("SNAPSHOT_INTERVAL", "5"),
            ("CORS_ORIGINS", "https://a.example, https://b.example,"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.snapshot_interval, 5);
        assert_eq!(
            config.cors_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config(&[("PORT", "http")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            config(&[("SNAPSHOT_INTERVAL", "0")]),
            Err(ConfigError::InvalidSnapshotInterval)
        ));
        assert!(matches!(
            config(&[("BROADCAST_CAPACITY", "-1")]),
            Err(ConfigError::InvalidBroadcastCapacity)
        ));
    }
}
