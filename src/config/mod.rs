//! Configuration loaded from a TOML file and overridden by CLI flags

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::constants::*;

/// Environment variable consulted when the file carries no API password
pub const PASSWORD_ENV: &str = "IPTV_TUNER_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Top-level configuration, passed by reference to each component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub inspector: InspectorConfig,
    #[serde(default)]
    pub remote_log: RemoteLogConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// IPTV server (Dispatcharr) address and API credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub address: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistConfig {
    /// Direct (non-proxied) playlist; derived from the server address when unset
    pub baseline_url: Option<String>,
    /// Proxied playlist; derived from the server address when unset
    pub proxied_url: Option<String>,
    #[serde(default = "default_target_group")]
    pub target_group: String,
    #[serde(default = "default_start_channel")]
    pub start_channel: String,
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
    #[serde(default = "default_true")]
    pub run_baseline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    #[serde(default = "default_tune_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_playback_ms")]
    pub min_playback_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorConfig {
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
}

/// SSH target whose container log is tailed in debug mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLogConfig {
    pub host: Option<String>,
    pub username: Option<String>,
    pub identity_file: Option<PathBuf>,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_ssh_path")]
    pub ssh_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_results_file")]
    pub results_file: PathBuf,
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,
    #[serde(default = "default_thumbnail_dir")]
    pub thumbnail_dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

fn default_server_address() -> String { "192.168.0.150:9191".to_string() }
fn default_target_group() -> String { "Nederland".to_string() }
fn default_start_channel() -> String { "NPO1".to_string() }
fn default_channel_count() -> usize { 10 }
fn default_true() -> bool { true }
fn default_tune_timeout_secs() -> u64 { DEFAULT_TUNE_TIMEOUT_SECS }
fn default_min_playback_ms() -> u64 { DEFAULT_MIN_PLAYBACK_MS }
fn default_user_agent() -> String { DEFAULT_USER_AGENT.to_string() }
fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_ffprobe_path() -> String { "ffprobe".to_string() }
fn default_probe_timeout_secs() -> u64 { DEFAULT_PROBE_TIMEOUT_SECS }
fn default_container() -> String { "dispatcharr".to_string() }
fn default_ssh_path() -> String { "ssh".to_string() }
fn default_results_file() -> PathBuf { PathBuf::from("tuning_results.csv") }
fn default_report_file() -> PathBuf { PathBuf::from("tuning_report.html") }
fn default_thumbnail_dir() -> PathBuf { PathBuf::from("thumbnails") }
fn default_log_file() -> PathBuf { PathBuf::from("log.txt") }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            username: None,
            password: None,
        }
    }
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            baseline_url: None,
            proxied_url: None,
            target_group: default_target_group(),
            start_channel: default_start_channel(),
            channel_count: default_channel_count(),
            run_baseline: true,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_tune_timeout_secs(),
            min_playback_ms: default_min_playback_ms(),
            user_agent: default_user_agent(),
            ffmpeg_path: default_ffmpeg_path(),
        }
    }
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for RemoteLogConfig {
    fn default() -> Self {
        Self {
            host: None,
            username: None,
            identity_file: None,
            container: default_container(),
            ssh_path: default_ssh_path(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_file: default_results_file(),
            report_file: default_report_file(),
            thumbnail_dir: default_thumbnail_dir(),
            log_file: default_log_file(),
        }
    }
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Password from the file, falling back to the environment
    pub fn password(&self) -> Option<String> {
        self.password
            .clone()
            .or_else(|| std::env::var(PASSWORD_ENV).ok())
            .filter(|p| !p.is_empty())
    }
}

impl TuningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_playback(&self) -> Duration {
        Duration::from_millis(self.min_playback_ms)
    }
}

impl InspectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Loads the file when it exists; otherwise starts from defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuration loaded from: {}", path.display());
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn baseline_playlist_url(&self) -> String {
        self.playlist
            .baseline_url
            .clone()
            .unwrap_or_else(|| format!("{}/output/m3u?direct=true", self.server.base_url()))
    }

    pub fn proxied_playlist_url(&self) -> String {
        self.playlist
            .proxied_url
            .clone()
            .unwrap_or_else(|| format!("{}/output/m3u", self.server.base_url()))
    }

    /// Checks the fields every run depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });

        if self.server.address.trim().is_empty() {
            return invalid("server.address must not be empty".into());
        }
        if let Err(e) = url::Url::parse(&self.server.base_url()) {
            return invalid(format!("server.address '{}' is not a valid host: {e}", self.server.address));
        }
        for (field, value) in [
            ("playlist.baseline_url", &self.playlist.baseline_url),
            ("playlist.proxied_url", &self.playlist.proxied_url),
        ] {
            if let Some(value) = value {
                let is_url = value.starts_with("http://") || value.starts_with("https://");
                if is_url && url::Url::parse(value).is_err() {
                    return invalid(format!("{field} '{value}' is not a valid URL"));
                }
            }
        }
        if self.playlist.target_group.trim().is_empty() {
            return invalid("playlist.target_group must not be empty".into());
        }
        if self.playlist.start_channel.trim().is_empty() {
            return invalid("playlist.start_channel must not be empty".into());
        }
        if self.playlist.channel_count == 0 {
            return invalid("playlist.channel_count must be at least 1".into());
        }
        if self.tuning.timeout_secs == 0 {
            return invalid("tuning.timeout_secs must be greater than 0".into());
        }
        if self.tuning.user_agent.trim().is_empty() {
            return invalid("tuning.user_agent must not be empty".into());
        }
        if self.inspector.timeout_secs == 0 {
            return invalid("inspector.timeout_secs must be greater than 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.playlist.target_group, "Nederland");
        assert_eq!(config.tuning.timeout_secs, DEFAULT_TUNE_TIMEOUT_SECS);
        assert!(config.playlist.run_baseline);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            address = "10.0.0.5:9191"

            [playlist]
            target_group = "News"
            channel_count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.playlist.start_channel, "NPO1");
        assert_eq!(config.playlist.channel_count, 3);
        assert_eq!(
            config.baseline_playlist_url(),
            "http://10.0.0.5:9191/output/m3u?direct=true"
        );
        assert_eq!(config.proxied_playlist_url(), "http://10.0.0.5:9191/output/m3u");
    }

    #[test]
    fn explicit_playlist_urls_win() {
        let mut config = Config::default();
        config.playlist.proxied_url = Some("channels.m3u".into());
        assert_eq!(config.proxied_playlist_url(), "channels.m3u");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.playlist.channel_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = Config::default();
        config.tuning.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.playlist.baseline_url = Some("http://bad host/".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.output.results_file, PathBuf::from("tuning_results.csv"));
    }
}
