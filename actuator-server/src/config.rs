//! Server configuration.
//!
//! Sources are evaluated in order: `.env` (via `dotenvy`), the file named by
//! `ACTUATOR_CONFIG_PATH` (TOML, or JSON when the extension is `.json`), the
//! inline `ACTUATOR_CONFIG_JSON` document, then built-in defaults. Plain
//! environment variables for host, port and database URL are applied on
//! top, and CLI flags override everything.

use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use actuator_core::execution::ExecutionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "ACTUATOR_CONFIG_PATH";
pub const CONFIG_JSON_ENV: &str = "ACTUATOR_CONFIG_JSON";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// In-memory stores are used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            run_migrations: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    /// Platforms served by the dry-run adapter.
    pub platforms: Vec<String>,
    pub execution: ExecutionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            platforms: vec!["dry-run".to_string()],
            execution: ExecutionConfig::default(),
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigLoadError> {
        let raw = format!("{}:{}", self.server.host, self.server.port);
        raw.parse()
            .map_err(|_| ConfigLoadError::InvalidBindAddress(raw))
    }
}

/// Where the base document came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    EnvPath(PathBuf),
    EnvInline,
    Defaults,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub source: ConfigSource,
    pub env_file_loaded: bool,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read .env file")]
    EnvFile(#[from] dotenvy::Error),
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON configuration from {origin}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid {name} value '{value}'")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid bind address {0}")]
    InvalidBindAddress(String),
}

/// Snapshot of the environment variables the loader reads.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub database_url: Option<String>,
    pub platforms: Option<String>,
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty(CONFIG_PATH_ENV).map(PathBuf::from),
            config_json: non_empty(CONFIG_JSON_ENV),
            host: non_empty("SERVER_HOST"),
            port: non_empty("SERVER_PORT"),
            database_url: non_empty("DATABASE_URL"),
            platforms: non_empty("ACTUATOR_PLATFORMS"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    env_file: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Takes precedence over `ACTUATOR_CONFIG_PATH`.
    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let loaded = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        let env_file_loaded = loaded.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            other => Err(other),
        })?;

        let mut env_config = EnvConfig::gather();
        if let Some(path) = &self.config_path {
            env_config.config_path = Some(path.clone());
        }
        let mut load = Self::compose(env_config)?;
        load.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Builds the configuration from an environment snapshot without
    /// touching the process environment.
    pub fn compose(env_config: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (mut config, source) = if let Some(path) = env_config.config_path.clone() {
            (read_file(&path)?, ConfigSource::EnvPath(path))
        } else if let Some(raw) = env_config.config_json.as_deref() {
            let config = serde_json::from_str(raw).map_err(|source| ConfigLoadError::Json {
                origin: CONFIG_JSON_ENV.to_string(),
                source,
            })?;
            (config, ConfigSource::EnvInline)
        } else {
            (Config::default(), ConfigSource::Defaults)
        };

        if let Some(host) = env_config.host {
            config.server.host = host;
        }
        if let Some(port) = env_config.port {
            config.server.port = port.parse().map_err(|_| ConfigLoadError::InvalidEnv {
                name: "SERVER_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(url) = env_config.database_url {
            config.database.url = Some(url);
        }
        if let Some(platforms) = env_config.platforms {
            config.platforms = platforms
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(ConfigLoad {
            config,
            source,
            env_file_loaded: false,
        })
    }
}

fn read_file(path: &Path) -> Result<Config, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&contents).map_err(|source| ConfigLoadError::Json {
            origin: path.display().to_string(),
            source,
        })
    } else {
        toml::from_str(&contents).map_err(|source| ConfigLoadError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_apply_without_any_source() {
        let load = ConfigLoader::compose(EnvConfig::default()).unwrap();
        assert_eq!(load.source, ConfigSource::Defaults);
        assert_eq!(load.config.server.port, 8080);
        assert_eq!(load.config.platforms, vec!["dry-run".to_string()]);
        assert!(load.config.database.url.is_none());
    }

    #[test]
    fn toml_file_wins_over_inline_json() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
platforms = ["slack", "x"]

[server]
port = 9000

[execution.retry]
max_attempts = 7
"#
        )
        .unwrap();

        let env = EnvConfig {
            config_path: Some(file.path().to_path_buf()),
            config_json: Some(r#"{"server": {"port": 1}}"#.into()),
            ..EnvConfig::default()
        };
        let load = ConfigLoader::compose(env).unwrap();
        assert!(matches!(load.source, ConfigSource::EnvPath(_)));
        assert_eq!(load.config.server.port, 9000);
        assert_eq!(load.config.execution.retry.max_attempts, 7);
        assert_eq!(load.config.execution.retry.min_delay_ms, 100);
        assert_eq!(load.config.platforms, vec!["slack", "x"]);
    }

    #[test]
    fn inline_json_then_env_overrides() {
        let env = EnvConfig {
            config_json: Some(r#"{"execution": {"circuit": {"failure_threshold": 5}}}"#.into()),
            port: Some("7000".into()),
            database_url: Some("postgres://localhost/actuator".into()),
            platforms: Some("slack, linkedin ,".into()),
            ..EnvConfig::default()
        };
        let load = ConfigLoader::compose(env).unwrap();
        assert_eq!(load.source, ConfigSource::EnvInline);
        assert_eq!(load.config.execution.circuit.failure_threshold, 5);
        assert_eq!(load.config.server.port, 7000);
        assert_eq!(
            load.config.database.url.as_deref(),
            Some("postgres://localhost/actuator")
        );
        assert_eq!(load.config.platforms, vec!["slack", "linkedin"]);
    }

    #[test]
    fn invalid_port_is_rejected() {
        let env = EnvConfig {
            port: Some("eighty".into()),
            ..EnvConfig::default()
        };
        assert!(matches!(
            ConfigLoader::compose(env),
            Err(ConfigLoadError::InvalidEnv { name: "SERVER_PORT", .. })
        ));
    }

    #[test]
    fn json_file_is_detected_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"server": {{"host": "127.0.0.1", "port": 3000}}}}"#).unwrap();
        let env = EnvConfig {
            config_path: Some(file.path().to_path_buf()),
            ..EnvConfig::default()
        };
        let config = ConfigLoader::compose(env).unwrap().config;
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:3000");
    }
}
