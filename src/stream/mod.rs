//! Pipeline stages and the capability traits that connect them.
//!
//! ```text
//! RtspStream ──▶ [StreamProcessor] ──▶ StreamTranscoder ──▶ TranscodedStream(flv|hls|webrtc)
//!  (UDP RTP)        (optional)           (fan-out task)          │
//!                                                                ▼
//!                                                          Distributor (HTTP)
//! ```
//!
//! Stages hand packets downstream through bounded channels obtained from
//! [`PacketSource::take_packets`]; nothing downcasts a `dyn` stage.

pub mod ingest;
pub mod processor;
pub mod transcoder;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};
use crate::rtp::RtpInfo;

pub use ingest::RtspStream;
pub use processor::StreamProcessor;
pub use transcoder::{StreamTranscoder, TranscodedStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Rtsp,
    Flv,
    Hls,
    Webrtc,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Rtsp => "rtsp",
            StreamType::Flv => "flv",
            StreamType::Hls => "hls",
            StreamType::Webrtc => "webrtc",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rtsp" => Ok(StreamType::Rtsp),
            "flv" => Ok(StreamType::Flv),
            "hls" => Ok(StreamType::Hls),
            "webrtc" => Ok(StreamType::Webrtc),
            _ => Err(RelayError::UnsupportedStreamType(s.to_string())),
        }
    }
}

/// Snapshot of a stream's state. Always handed out by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub url: String,
    pub stream_type: StreamType,
    pub video_codec: String,
    pub audio_codec: String,
    pub resolution: String,
    pub framerate: f64,
    /// kbit/s
    pub bitrate: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub client_count: usize,
}

impl StreamInfo {
    pub fn new(url: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            url: url.into(),
            stream_type,
            video_codec: crate::protocol::sdp::DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: crate::protocol::sdp::DEFAULT_AUDIO_CODEC.to_string(),
            resolution: format!(
                "{}x{}",
                crate::protocol::sdp::DEFAULT_WIDTH,
                crate::protocol::sdp::DEFAULT_HEIGHT
            ),
            framerate: crate::protocol::sdp::DEFAULT_FRAMERATE,
            bitrate: crate::protocol::sdp::DEFAULT_BITRATE_KBPS,
            started_at: None,
            last_active: None,
            client_count: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Some(Utc::now());
    }
}

/// Start/stop surface shared by every long-lived component.
///
/// Both calls are idempotent: starting a running component or stopping a
/// stopped one returns `Ok(())` without side effects. After `stop` returns,
/// every task the component spawned has exited.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

/// A stage that describes a media stream.
pub trait Streamer: Lifecycle {
    fn stream_info(&self) -> StreamInfo;
}

/// A stage whose output packets can be consumed by the next stage.
pub trait PacketSource: Send + Sync {
    /// Hand over the receiving end of the output channel. Returns `None` when
    /// not running or when a consumer already took it for this run.
    fn take_packets(&self) -> Option<mpsc::Receiver<RtpInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_type_parses_and_displays() {
        for t in [StreamType::Rtsp, StreamType::Flv, StreamType::Hls, StreamType::Webrtc] {
            assert_eq!(t.to_string().parse::<StreamType>().unwrap(), t);
        }
        assert_eq!("FLV".parse::<StreamType>().unwrap(), StreamType::Flv);
        assert!(matches!(
            "dash".parse::<StreamType>(),
            Err(RelayError::UnsupportedStreamType(_))
        ));
    }

    #[test]
    fn stream_info_serializes_type_lowercase() {
        let info = StreamInfo::new("rtsp://cam/live", StreamType::Webrtc);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["stream_type"], "webrtc");
        assert_eq!(json["resolution"], "1920x1080");
    }
}
