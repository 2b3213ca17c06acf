//! Layered configuration: defaults, then the TOML file, then `PARLEY__*`
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use parley_protocol::TransformerKind;
use serde::{Deserialize, Serialize};

use crate::ask::{DEFAULT_PENDING_TTL_SECS, RunMode};
use crate::transport::{DEFAULT_DELIMITER, DEFAULT_DISPATCH_QUEUE, DEFAULT_MAX_FRAME};

pub const APP_NAME: &str = "parley";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub http: HttpConfig,
    pub console: ConsoleConfig,
    pub pipe: PipeConfig,
    pub ask: AskConfig,
    pub settings: SettingsConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address the API server binds to.
    pub bind: String,
    /// Content type used when a request sends no `Accept` header.
    pub default_content_type: String,
    /// Buffered body chunks per response before senders wait.
    pub live_buffer: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            default_content_type: "text/plain".to_string(),
            live_buffer: crate::sink::DEFAULT_BODY_BUFFER,
        }
    }
}

impl HttpConfig {
    /// Fallback transformer for requests without an `Accept` header.
    pub fn default_transformer(&self) -> TransformerKind {
        TransformerKind::from_content_type(&self.default_content_type)
            .unwrap_or(TransformerKind::Text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub color: bool,
    pub prompt: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            color: true,
            prompt: "> ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub delimiter: String,
    pub read_buffer: usize,
    /// Largest inbound message in bytes; longer ones drop the connection.
    pub max_frame: usize,
    /// Inbound messages queued per connection before reading pauses.
    pub dispatch_queue: usize,
    /// Channel name connections are registered under.
    pub channel: String,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER.to_string(),
            read_buffer: 4096,
            max_frame: DEFAULT_MAX_FRAME,
            dispatch_queue: DEFAULT_DISPATCH_QUEUE,
            channel: "pipe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AskConfig {
    /// Questions allowed per chain. Unbounded when unset.
    pub max_turns: Option<usize>,
    pub run_mode: RunMode,
    /// Seconds a deferred question waits for its answer.
    pub pending_ttl: u64,
}

impl Default for AskConfig {
    fn default() -> Self {
        Self {
            max_turns: None,
            run_mode: RunMode::default(),
            pending_ttl: DEFAULT_PENDING_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Settings file. Defaults to `settings.json` in the data directory.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Remote decision service. The keyword classifier is used when unset.
    pub url: Option<String>,
    /// Request timeout in seconds.
    pub timeout: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    /// Where settings are persisted for `config`.
    pub fn settings_file(&self, config: &AppConfig) -> Result<PathBuf> {
        match config.settings.path.as_deref() {
            Some(path) => expand_str_path(path),
            None => Ok(self.data_dir.join("settings.json")),
        }
    }
}

/// Load the configuration, writing a default file first when none exists.
pub fn load_or_init(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }
    load(&paths.config_file)
}

/// Load the configuration without touching disk.
pub fn load(config_file: &Path) -> Result<AppConfig> {
    let defaults = AppConfig::default();
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", defaults.logging.level)?
        .set_default("http.bind", defaults.http.bind)?
        .set_default("http.default_content_type", defaults.http.default_content_type)?
        .set_default("http.live_buffer", defaults.http.live_buffer as i64)?
        .set_default("console.color", defaults.console.color)?
        .set_default("console.prompt", defaults.console.prompt)?
        .set_default("pipe.delimiter", defaults.pipe.delimiter)?
        .set_default("pipe.read_buffer", defaults.pipe.read_buffer as i64)?
        .set_default("pipe.max_frame", defaults.pipe.max_frame as i64)?
        .set_default("pipe.dispatch_queue", defaults.pipe.dispatch_queue as i64)?
        .set_default("pipe.channel", defaults.pipe.channel)?
        .set_default("ask.run_mode", "console")?
        .set_default("ask.pending_ttl", defaults.ask.pending_ttl as i64)?
        .set_default("classifier.timeout", defaults.classifier.timeout as i64)?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref path) = config.settings.path {
        let expanded = expand_str_path(path)?;
        config.settings.path = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parley").join("config.toml");

        write_default_config(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# Configuration for parley"));

        let config = load(&path).unwrap();
        assert_eq!(config.http.bind, "127.0.0.1:8787");
        assert_eq!(config.console.prompt, "> ");
        assert_eq!(config.pipe.delimiter, "\n");
        assert_eq!(config.ask.run_mode, RunMode::Console);
        assert_eq!(config.ask.max_turns, None);
        assert_eq!(config.ask.pending_ttl, DEFAULT_PENDING_TTL_SECS);
        assert_eq!(config.pipe.max_frame, DEFAULT_MAX_FRAME);
    }

    #[test]
    fn test_file_values_override_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[http]\ndefault_content_type = \"application/json\"\n\n[ask]\nmax_turns = 5\nrun_mode = \"web\"\npending_ttl = 60\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.http.default_transformer(), TransformerKind::Json);
        assert_eq!(config.ask.max_turns, Some(5));
        assert_eq!(config.ask.run_mode, RunMode::Web);
        assert_eq!(config.ask.pending_ttl, 60);
        assert_eq!(config.console.prompt, "> ");
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "PARLEY");
    }
}
