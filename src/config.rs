use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::StreamType;

/// Top-level configuration, loaded from `config/relay.*` and `RTSP_RELAY__*`
/// environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub rtsp: RtspConfig,

    #[serde(default)]
    pub server: RtspServerConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub transcoder: TranscoderConfig,

    #[serde(default)]
    pub distributor: DistributorConfig,

    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_bind_address")]
    pub metrics_bind_address: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rtsp: RtspConfig::default(),
            server: RtspServerConfig::default(),
            processor: ProcessorConfig::default(),
            transcoder: TranscoderConfig::default(),
            distributor: DistributorConfig::default(),
            enable_metrics: false,
            metrics_bind_address: default_metrics_bind_address(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load("config/relay")
    }

    /// Layer an optional config file under environment overrides.
    pub fn load(file: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("RTSP_RELAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("transcoder.outputs")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Upstream RTSP source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RtspConfig {
    #[serde(default = "default_rtsp_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_transport")]
    pub transport: String,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl RtspConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: default_rtsp_url(),
            username: None,
            password: None,
            transport: default_transport(),
            buffer_size: default_buffer_size(),
            retry_interval_ms: default_retry_interval_ms(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RtspServerConfig {
    #[serde(default = "default_server_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for RtspServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_server_bind_address(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

/// Per-packet transform hooks. All hooks currently pass packets through.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Target size as `WIDTHxHEIGHT`.
    #[serde(default)]
    pub scale: Option<String>,

    #[serde(default)]
    pub watermark: Option<String>,

    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscoderConfig {
    #[serde(default = "default_outputs")]
    pub outputs: Vec<StreamType>,

    #[serde(default)]
    pub hls: HlsConfig,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            outputs: default_outputs(),
            hls: HlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HlsConfig {
    #[serde(default = "default_hls_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_target_duration_secs")]
    pub target_duration_secs: u32,

    /// Number of segments listed in the playlist.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_hls_dir(),
            target_duration_secs: default_target_duration_secs(),
            window_size: default_window_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistributorConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Chunks buffered per HTTP client before it starts losing data.
    #[serde(default = "default_client_buffer")]
    pub client_buffer: usize,
}

impl DistributorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            client_buffer: default_client_buffer(),
        }
    }
}

fn default_rtsp_url() -> String {
    "rtsp://127.0.0.1:8554/stream".to_string()
}

fn default_transport() -> String {
    "udp".to_string()
}

fn default_buffer_size() -> usize {
    65536
}

fn default_retry_interval_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_user_agent() -> String {
    crate::client::DEFAULT_USER_AGENT.to_string()
}

fn default_server_bind_address() -> String {
    "0.0.0.0:8554".to_string()
}

fn default_session_timeout_secs() -> u64 {
    60
}

fn default_outputs() -> Vec<StreamType> {
    vec![StreamType::Flv, StreamType::Hls, StreamType::Webrtc]
}

fn default_hls_dir() -> PathBuf {
    PathBuf::from("hls")
}

fn default_target_duration_secs() -> u32 {
    2
}

fn default_window_size() -> usize {
    5
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_client_buffer() -> usize {
    256
}

fn default_metrics_bind_address() -> String {
    "0.0.0.0:9090".to_string()
}
