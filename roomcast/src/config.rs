//! Application configuration.
//!
//! Dev mode (a `.env` file or `ROOMCAST_DEV_MODE`) reads everything from
//! environment variables; otherwise the YAML file at
//! `~/.roomcast/config.yaml` (or `$ROOMCAST_CONFIG`) is merged over the
//! defaults.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::audio::device::SampleFormat;
use crate::audio::source::SourceParams;
use crate::encoder::Format;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Configuration error: {0}")]
    Invalid(String),
}

/// YAML config file structure; every field is optional and falls back to a
/// default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigYaml {
    pub sources: Option<Vec<SourceYaml>>,
    pub slimproto_port: Option<u16>,
    pub http_port: Option<u16>,
    pub discovery_port: Option<u16>,
    pub format: Option<String>,
    pub gain: Option<u8>,
    pub max_connections: Option<usize>,
    pub total_channels: Option<u16>,
    pub logical_channels: Option<u16>,
    pub sample_format: Option<String>,
    pub bits_per_value: Option<u16>,
    pub frames_per_chunk: Option<usize>,
    pub periods: Option<usize>,
    pub ring_capacity: Option<usize>,
    pub file_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceYaml {
    pub device: Option<String>,
    pub rate: u32,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// One capture source per entry; all share the channel layout.
    pub sources: Vec<SourceParams>,
    pub slimproto_port: u16,
    pub http_port: u16,
    pub discovery_port: u16,
    pub format: Format,
    pub gain: Option<u8>,
    pub max_connections: usize,
    /// Meaningful bits within each physical sample.
    pub bits_per_value: u16,
    /// When set, streams are written to files in this directory instead of
    /// being served to clients.
    pub file_output: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let dev_mode = std::env::var("ROOMCAST_DEV_MODE").is_ok() || dotenvy::dotenv().is_ok();
        if dev_mode {
            info!("Dev mode activated - loading configuration from the environment");
        }

        let yaml = match Self::config_path() {
            Some(path) if path.exists() => {
                info!("Loading configuration from {}", path.display());
                serde_yaml::from_str(&std::fs::read_to_string(&path)?)?
            }
            _ => {
                info!("No configuration file found - using defaults");
                ConfigYaml::default()
            }
        };

        Self::from_yaml(yaml)
    }

    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ROOMCAST_CONFIG") {
            return Some(PathBuf::from(path));
        }
        let local = PathBuf::from("roomcast.yaml");
        if local.exists() {
            return Some(local);
        }
        dirs::home_dir().map(|home| home.join(".roomcast").join("config.yaml"))
    }

    pub fn from_yaml(yaml: ConfigYaml) -> Result<Self, ConfigError> {
        let sample_format = match &yaml.sample_format {
            Some(s) => SampleFormat::from_str(s)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            None => SampleFormat::S32Le,
        };
        let format = match &yaml.format {
            Some(s) => s
                .parse::<Format>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            None => Format::Flac,
        };

        let total_channels = yaml.total_channels.unwrap_or(3);
        let logical_channels = yaml.logical_channels.unwrap_or(2);
        let frames_per_chunk = yaml.frames_per_chunk.unwrap_or(1024);
        let periods = yaml.periods.unwrap_or(8);
        let ring_capacity = yaml.ring_capacity.unwrap_or(128);

        let source_entries = yaml.sources.unwrap_or_else(|| {
            vec![SourceYaml {
                device: None,
                rate: 44100,
            }]
        });
        if source_entries.is_empty() {
            return Err(ConfigError::Invalid("at least one source is required".into()));
        }

        let sources: Vec<SourceParams> = source_entries
            .into_iter()
            .map(|entry| SourceParams {
                device_name: entry.device.unwrap_or_else(|| "default".to_string()),
                total_channels,
                logical_channels,
                format: sample_format,
                sampling_rate: entry.rate,
                frames_per_chunk,
                periods,
                ring_capacity,
            })
            .collect();

        for params in &sources {
            params
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        let bits_per_value = yaml
            .bits_per_value
            .unwrap_or_else(|| match sample_format {
                SampleFormat::S16Le => 16,
                SampleFormat::S32Le => 24,
            });
        if bits_per_value > sample_format.bits_per_sample() {
            return Err(ConfigError::Invalid(format!(
                "bits_per_value {} exceeds the physical sample width {}",
                bits_per_value,
                sample_format.bits_per_sample()
            )));
        }

        Ok(Self {
            sources,
            slimproto_port: yaml.slimproto_port.unwrap_or(3483),
            http_port: yaml.http_port.unwrap_or(9000),
            discovery_port: yaml.discovery_port.unwrap_or(3483),
            format,
            gain: yaml.gain,
            max_connections: yaml.max_connections.unwrap_or(16),
            bits_per_value,
            file_output: yaml.file_output,
        })
    }
}
