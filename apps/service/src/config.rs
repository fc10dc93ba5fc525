use std::{env, fmt, fs, io, path, time::Duration};

use logger::LogConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which set of tables an instance works against.
///
/// `Testing` prefixes every schema object with `testing_` so a test run can
/// share a backend with production without touching its tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    #[default]
    Production,
    Testing,
}

impl Namespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Namespace::Production => "",
            Namespace::Testing => "testing_",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Production => write!(f, "production"),
            Namespace::Testing => write!(f, "testing"),
        }
    }
}

/// Whether schema and seed statements run against the backend or are only
/// rendered and handed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Live,
    DryRun,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Live => write!(f, "live"),
            ExecutionMode::DryRun => write!(f, "dry_run"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub namespace: Namespace,
    pub execution: ExecutionMode,
}

/// Backend connection parameters.
///
/// With `host` set the service talks to a remote libSQL server at
/// `http://host:port` authenticated by `auth_token`; otherwise `name` is the
/// path of a local database file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: Option<String>,
    pub port: u16,
    pub auth_token: Option<String>,
    pub name: String,
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 8080,
            auth_token: None,
            name: "uppe-metrics.db".into(),
            pool_size: 4,
        }
    }
}

impl DatabaseConfig {
    pub fn remote_url(&self) -> Option<String> {
        self.host.as_ref().map(|host| format!("http://{}:{}", host, self.port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroMQ {
    pub bind: String,
    pub port: u16,
    /// How long a producer waits for an acknowledgement before resending
    pub ack_timeout_ms: u64,
}

impl Default for ZeroMQ {
    fn default() -> Self {
        Self { bind: "*".into(), port: 5555, ack_timeout_ms: 30_000 }
    }
}

impl ZeroMQ {
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.bind, self.port)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Batching and retry knobs of the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Flush once this many events are buffered
    pub batch_size: usize,
    /// Flush a non-empty buffer at least this often
    pub flush_interval_ms: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub retry_multiplier: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
            retry_initial_ms: 250,
            retry_max_ms: 30_000,
            retry_multiplier: 2.0,
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("pipeline.batch_size must be greater than 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.flush_interval_ms must be greater than 0".into(),
            ));
        }
        if self.retry_initial_ms == 0 || self.retry_max_ms < self.retry_initial_ms {
            return Err(ConfigError::Invalid(
                "pipeline.retry_initial_ms must be positive and not exceed retry_max_ms".into(),
            ));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(ConfigError::Invalid("pipeline.retry_multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Base URL the reference targets are built from
    pub base_url: String,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self { base_url: "http://localhost:8000".into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub mode: ModeConfig,
    pub zeromq: ZeroMQ,
    pub pipeline: PipelineConfig,
    pub logging: LogConfig,
    pub seed: SeedConfig,
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/uppe/ingest.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("uppe/ingest.toml"))
}

fn env_override<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Some(value) = env::var(name).ok().and_then(|raw| raw.parse().ok()) {
        *slot = value;
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        match self.database.remote_url() {
            Some(url) => write_1(f, "Remote", &url)?,
            None => write_1(f, "File", &self.database.name)?,
        }
        let token = if self.database.auth_token.is_some() { "<set>" } else { "<none>" };
        write_1(f, "Auth Token", &token)?;
        write_1(f, "Pool Size", &self.database.pool_size)?;
        write_title_1(f, "Mode")?;
        write_1(f, "Namespace", &self.mode.namespace)?;
        write_1(f, "Execution", &self.mode.execution)?;
        write_title_1(f, "ZeroMQ")?;
        write_1(f, "Bind Address", &self.zeromq.bind)?;
        write_1(f, "Port", &self.zeromq.port)?;
        write_1(f, "Ack Timeout (ms)", &self.zeromq.ack_timeout_ms)?;
        write_title_1(f, "Pipeline")?;
        write_1(f, "Batch Size", &self.pipeline.batch_size)?;
        write_1(f, "Flush Interval (ms)", &self.pipeline.flush_interval_ms)?;
        write_1(
            f,
            "Retry (ms)",
            &format!("{}..{} x{}", self.pipeline.retry_initial_ms, self.pipeline.retry_max_ms, self.pipeline.retry_multiplier),
        )?;
        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/uppe/ingest.toml
    ///  or the specified path if one does not exist
    ///
    /// ```rust,no_run
    /// let cfg = uppe_ingest::config::Config::from_config(None::<&std::path::Path>)?;
    /// println!("{}", cfg);
    /// # Ok::<(), uppe_ingest::config::ConfigError>(())
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let mut config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            Self::from_toml(&raw_string)?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Environment variables take precedence over the file
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("UPPE_DB_HOST") {
            self.database.host = Some(host).filter(|h| !h.is_empty());
        }
        if let Ok(token) = env::var("UPPE_DB_AUTH_TOKEN") {
            self.database.auth_token = Some(token);
        }
        env_override("UPPE_DB_PORT", &mut self.database.port);
        env_override("UPPE_DB_NAME", &mut self.database.name);
        env_override("UPPE_BIND", &mut self.zeromq.bind);
        env_override("UPPE_PORT", &mut self.zeromq.port);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.pool_size == 0 {
            return Err(ConfigError::Invalid("database.pool_size must be greater than 0".into()));
        }
        if self.database.host.is_none() && self.database.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database.name is required when no host is configured".into(),
            ));
        }
        self.pipeline.validate()
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }
}
