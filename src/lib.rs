//! RTSP ingest and HTTP re-streaming.
//!
//! Pulls an upstream RTSP/RTP stream and republishes it as FLV, HLS and a
//! WebRTC passthrough over HTTP. The RTSP codec, client and a standalone
//! session-per-connection server are usable on their own.

pub mod client;
pub mod config;
pub mod distributor;
pub mod error;
pub mod flv;
pub mod hls;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod rtp;
pub mod server;
pub mod stream;

pub use client::Client;
pub use config::RelayConfig;
pub use distributor::Distributor;
pub use error::{RelayError, Result};
pub use pipeline::PipelineManager;
pub use rtp::RtpInfo;
pub use server::{DefaultHandler, Handler, Server};
pub use stream::{Lifecycle, PacketSource, StreamInfo, StreamType, Streamer};
