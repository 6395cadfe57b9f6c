//! Server and client configuration.
//!
//! Both load with priority: env vars > config file > defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// API key entry in the server config file
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiKeyEntry {
    pub key: String,
    /// Who the key belongs to, for logs
    #[serde(default)]
    pub name: Option<String>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Directory for server state
    pub data_dir: PathBuf,
    /// SQLite database path (default: `<data_dir>/docsync.db`)
    pub database_path: Option<PathBuf>,
    /// Externally reachable base URL, used in relay credentials
    pub public_url: Option<String>,
    /// Lifetime of issued credentials
    pub credential_ttl_secs: u64,
    /// Accepted API keys. Empty means the API is open.
    pub api_keys: Vec<ApiKeyEntry>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docsync-server"),
            database_path: None,
            public_url: None,
            credential_ttl_secs: 600,
            api_keys: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `DOCSYNC_CONFIG`, the given path, or the
    /// default location, then apply environment overrides.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = std::env::var("DOCSYNC_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or(config_path)
            .unwrap_or_else(Self::default_config_path);

        let mut config: Self = read_yaml(&path)?.unwrap_or_default();

        if let Some(port) = std::env::var("DOCSYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            config.port = port;
        }
        if let Ok(dir) = std::env::var("DOCSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(db_path) = std::env::var("DOCSYNC_DATABASE_PATH") {
            config.database_path = Some(PathBuf::from(db_path));
        }
        if let Ok(url) = std::env::var("DOCSYNC_PUBLIC_URL") {
            config.public_url = Some(url);
        }
        if let Some(ttl) = std::env::var("DOCSYNC_CREDENTIAL_TTL_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
        {
            config.credential_ttl_secs = ttl;
        }

        Ok(config)
    }

    /// Default config file path: ~/.config/docsync-server/config.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docsync-server")
            .join("config.yaml")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("docsync.db"))
    }

    pub fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }

    pub fn credential_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.credential_ttl_secs)
    }
}

/// Client configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sync server URL
    pub server_url: String,
    /// API key sent as a bearer token
    pub api_key: Option<String>,
    /// Directory for local replicas
    pub data_dir: PathBuf,
    /// Display name shown to other editors
    pub client_name: Option<String>,
    /// Seconds between automatic snapshot pushes
    pub autosave_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            api_key: None,
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docsync"),
            client_name: None,
            autosave_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or_else(Self::default_config_path);
        let mut config: Self = read_yaml(&path)?.unwrap_or_default();

        if let Ok(url) = std::env::var("DOCSYNC_SERVER_URL") {
            config.server_url = url;
        }
        if let Ok(key) = std::env::var("DOCSYNC_API_KEY") {
            config.api_key = Some(key);
        }
        if let Ok(dir) = std::env::var("DOCSYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Default config file path: ~/.config/docsync/config.yaml
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docsync")
            .join("config.yaml")
    }
}

/// Reads a YAML config file. A missing file is not an error.
fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    e
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.credential_ttl_secs, 600);
        assert!(config.api_keys.is_empty());
        assert!(config.database_path().ends_with("docsync.db"));
        assert_eq!(config.public_url(), "http://localhost:8080");
    }

    #[test]
    fn test_server_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "port: 9000").unwrap();
        writeln!(file, "public_url: https://sync.example.com").unwrap();
        writeln!(file, "api_keys:").unwrap();
        writeln!(file, "  - key: secret").unwrap();
        writeln!(file, "    name: laptop").unwrap();

        let config = ServerConfig::load(Some(config_path)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.public_url(), "https://sync.example.com");
        assert_eq!(
            config.api_keys,
            vec![ApiKeyEntry {
                key: "secret".to_string(),
                name: Some("laptop".to_string()),
            }]
        );
    }

    #[test]
    fn test_client_load_no_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = ClientConfig::load(Some(config_path)).unwrap();
        assert_eq!(config.autosave_secs, 30);
        assert!(config.client_name.is_none());
    }

    #[test]
    fn test_client_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: http://fromfile:8080").unwrap();
        writeln!(file, "client_name: Ada").unwrap();

        std::env::set_var("DOCSYNC_SERVER_URL", "http://fromenv:8080");

        let config = ClientConfig::load(Some(config_path)).unwrap();
        assert_eq!(config.server_url, "http://fromenv:8080");
        assert_eq!(config.client_name.as_deref(), Some("Ada"));

        std::env::remove_var("DOCSYNC_SERVER_URL");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let err = ClientConfig::load(Some(config_path)).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
