//! Configuration management for the zfsync service
//!
//! Settings are resolved from three layers:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub ssh: SshConfig,
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Allowed CORS origins (empty = same-host defaults)
    pub cors_origins: Vec<String>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path
    pub path: PathBuf,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Token signing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT signing key. When empty a random key is generated at startup
    /// and tokens do not survive a restart.
    pub secret_key: String,
    /// Access-token TTL in minutes
    pub token_expire_minutes: i64,
}

/// Remote command execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Directory holding connection-multiplexing control sockets
    pub control_dir: PathBuf,
    /// Seconds an idle master connection is kept alive
    pub control_persist_secs: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Optional directory for rolling log files; stderr-only when unset
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            ssh: SshConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8420,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/zfsync/zfsync.db"),
            max_connections: 16,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            token_expire_minutes: 480,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            control_dir: PathBuf::from("/var/lib/zfsync/cm"),
            control_persist_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(config_path) = Self::find_config_file() {
            match Self::load_from_file(&config_path) {
                Ok(file_config) => config = file_config,
                Err(e) => tracing::warn!("Ignoring config file {:?}: {}", config_path, e),
            }
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("ZFSYNC_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("/etc/zfsync/config.toml")),
            Some(PathBuf::from("./zfsync.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("ZFSYNC_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("ZFSYNC_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(origins) = std::env::var("ZFSYNC_CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(path) = std::env::var("ZFSYNC_DB") {
            self.database.path = PathBuf::from(path);
        }

        if let Ok(key) = std::env::var("ZFSYNC_SECRET_KEY") {
            self.auth.secret_key = key;
        }
        if let Ok(minutes) = std::env::var("ZFSYNC_TOKEN_EXPIRE") {
            if let Ok(minutes) = minutes.parse() {
                self.auth.token_expire_minutes = minutes;
            }
        }

        if let Ok(dir) = std::env::var("ZFSYNC_SSH_CONTROL_DIR") {
            self.ssh.control_dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("ZFSYNC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(dir) = std::env::var("ZFSYNC_LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
    }

    /// Default CORS origins when none are configured
    pub fn cors_origins(&self) -> Vec<String> {
        if self.server.cors_origins.is_empty() {
            vec![
                format!("http://localhost:{}", self.server.port),
                format!("http://127.0.0.1:{}", self.server.port),
            ]
        } else {
            self.server.cors_origins.clone()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Port cannot be 0".to_string()));
        }

        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "Database path cannot be empty".to_string(),
            ));
        }

        if self.auth.token_expire_minutes <= 0 {
            return Err(ConfigError::Validation(
                "Token TTL must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8420);
        assert_eq!(config.database.path, PathBuf::from("/var/lib/zfsync/zfsync.db"));
        assert_eq!(config.auth.token_expire_minutes, 480);
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = AppConfig::default();
        invalid.server.port = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = AppConfig::default();
        invalid.auth.token_expire_minutes = 0;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_default_cors_origins() {
        let config = AppConfig::default();
        let origins = config.cors_origins();
        assert!(origins.contains(&"http://localhost:8420".to_string()));

        let mut config = AppConfig::default();
        config.server.cors_origins = vec!["https://ops.example.com".to_string()];
        assert_eq!(config.cors_origins(), vec!["https://ops.example.com"]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zfsync.toml");
        std::fs::write(
            &path,
            r#"
[server]
host = "127.0.0.1"
port = 9000
cors_origins = []

[database]
path = "/tmp/test.db"
max_connections = 4

[auth]
secret_key = "s"
token_expire_minutes = 60

[ssh]
control_dir = "/tmp/cm"
control_persist_secs = 30

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.log_dir.is_none());
    }
}
