//! Server configuration
//!
//! Configuration is loaded from environment variables (after `dotenvy` has
//! pulled in a `.env` file, if present), optionally overridden by a YAML
//! file passed on the command line. Priority: YAML > ENV vars > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default listen port.
const DEFAULT_PORT: u16 = 8081;

/// Default AWS region for Polly and the upstream model service.
const DEFAULT_AWS_REGION: &str = "us-east-1";

/// Default conversation log path, relative to the working directory.
const DEFAULT_LOG_PATH: &str = "conversation.log";

/// Default upstream speech-to-speech model identifier.
const DEFAULT_MODEL_ID: &str = "amazon.nova-sonic-v1:0";

/// Default bound on upstream stream establishment, in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    FileParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
///
/// Contains everything needed to run the relay server: listen address,
/// AWS region for speech synthesis, the conversation log location, and the
/// upstream model stream endpoint.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// AWS region used for Polly and reported to the upstream service
    pub aws_region: String,

    /// Path of the human-readable conversation log
    pub conversation_log_path: PathBuf,

    /// Upstream model stream WebSocket URL. Sessions that need the upstream
    /// stream fail per-message when unset; TTS-only usage works without it.
    pub upstream_url: Option<String>,

    /// Model identifier requested from the upstream service
    pub model_id: String,

    /// Bound on upstream stream establishment
    pub upstream_connect_timeout_secs: u64,

    /// Allowed CORS origins; empty means allow any origin
    pub cors_allowed_origins: Vec<String>,
}

/// YAML file form of the configuration. Every field is optional; unset
/// fields keep their env/default value.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    aws_region: Option<String>,
    conversation_log_path: Option<PathBuf>,
    upstream_url: Option<String>,
    model_id: Option<String>,
    upstream_connect_timeout_secs: Option<u64>,
    cors_allowed_origins: Option<Vec<String>>,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid(format!("PORT must be a number, got {raw:?}")))?,
            Err(_) => DEFAULT_PORT,
        };

        let timeout_secs = match std::env::var("UPSTREAM_CONNECT_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                ConfigError::Invalid(format!(
                    "UPSTREAM_CONNECT_TIMEOUT_SECS must be a number, got {raw:?}"
                ))
            })?,
            Err(_) => DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            aws_region: std::env::var("AWS_DEFAULT_REGION")
                .unwrap_or_else(|_| DEFAULT_AWS_REGION.to_string()),
            conversation_log_path: std::env::var("CONVERSATION_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_PATH)),
            upstream_url: std::env::var("UPSTREAM_URL").ok(),
            model_id: std::env::var("MODEL_ID").unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string()),
            upstream_connect_timeout_secs: timeout_secs,
            cors_allowed_origins,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, with environment variables
    /// filling any field the file leaves unset.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = serde_yaml::from_str(&contents)?;

        let mut config = Self::from_env()?;
        if let Some(host) = file.host {
            config.host = host;
        }
        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(region) = file.aws_region {
            config.aws_region = region;
        }
        if let Some(log_path) = file.conversation_log_path {
            config.conversation_log_path = log_path;
        }
        if let Some(url) = file.upstream_url {
            config.upstream_url = Some(url);
        }
        if let Some(model_id) = file.model_id {
            config.model_id = model_id;
        }
        if let Some(secs) = file.upstream_connect_timeout_secs {
            config.upstream_connect_timeout_secs = secs;
        }
        if let Some(origins) = file.cors_allowed_origins {
            config.cors_allowed_origins = origins;
        }

        config.validate()?;
        Ok(config)
    }

    /// Socket address string suitable for binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Upstream connect timeout as a [`Duration`].
    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be nonzero".to_string()));
        }
        if self.aws_region.is_empty() {
            return Err(ConfigError::Invalid(
                "aws_region must not be empty".to_string(),
            ));
        }
        if self.model_id.is_empty() {
            return Err(ConfigError::Invalid(
                "model_id must not be empty".to_string(),
            ));
        }
        if self.upstream_connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "upstream_connect_timeout_secs must be nonzero".to_string(),
            ));
        }
        if let Some(url) = &self.upstream_url
            && !(url.starts_with("ws://") || url.starts_with("wss://"))
        {
            return Err(ConfigError::Invalid(format!(
                "upstream_url must be a ws:// or wss:// URL, got {url:?}"
            )));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            aws_region: DEFAULT_AWS_REGION.to_string(),
            conversation_log_path: PathBuf::from(DEFAULT_LOG_PATH),
            upstream_url: None,
            model_id: DEFAULT_MODEL_ID.to_string(),
            upstream_connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "0.0.0.0:8081");
        assert_eq!(config.model_id, "amazon.nova-sonic-v1:0");
        assert_eq!(
            config.upstream_connect_timeout(),
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_upstream_scheme() {
        let config = ServerConfig {
            upstream_url: Some("http://example.com".to_string()),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_accepts_wss_upstream() {
        let config = ServerConfig {
            upstream_url: Some("wss://bedrock.example.com/stream".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("Should create temp file");
        writeln!(
            file,
            "host: \"127.0.0.1\"\nport: 9090\nupstream_url: \"ws://localhost:7000/stream\""
        )
        .expect("Should write config");

        let config = ServerConfig::from_file(file.path()).expect("Should load");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9090);
        assert_eq!(
            config.upstream_url.as_deref(),
            Some("ws://localhost:7000/stream")
        );
    }

    #[test]
    fn test_from_file_rejects_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("Should create temp file");
        writeln!(file, "port: [not a number]").expect("Should write config");
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(ConfigError::FileParse(_))
        ));
    }

    #[test]
    fn test_from_file_missing_file_errors() {
        assert!(matches!(
            ServerConfig::from_file(Path::new("/nonexistent/config.yaml")),
            Err(ConfigError::FileRead { .. })
        ));
    }
}
