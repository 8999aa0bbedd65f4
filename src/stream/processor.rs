use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{Lifecycle, PacketSource, StreamInfo, Streamer};
use crate::config::ProcessorConfig;
use crate::error::{RelayError, Result};
use crate::rtp::{PacketSender, RtpInfo, PACKET_CHANNEL_CAPACITY};

/// A per-packet transform. Implementations that decode and re-encode video
/// plug in here.
pub trait PacketHook: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, packet: RtpInfo) -> RtpInfo;
}

/// Resize to a target resolution. Pass-through: no H.264 decoder is wired in.
pub struct ScaleHook {
    pub width: u32,
    pub height: u32,
}

impl PacketHook for ScaleHook {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn apply(&self, packet: RtpInfo) -> RtpInfo {
        trace!(width = self.width, height = self.height, seq = packet.sequence_number, "scale (passthrough)");
        packet
    }
}

pub struct WatermarkHook {
    pub text: String,
}

impl PacketHook for WatermarkHook {
    fn name(&self) -> &'static str {
        "watermark"
    }

    fn apply(&self, packet: RtpInfo) -> RtpInfo {
        trace!(text = %self.text, seq = packet.sequence_number, "watermark (passthrough)");
        packet
    }
}

pub struct FilterHook {
    pub expression: String,
}

impl PacketHook for FilterHook {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn apply(&self, packet: RtpInfo) -> RtpInfo {
        trace!(expression = %self.expression, seq = packet.sequence_number, "filter (passthrough)");
        packet
    }
}

/// Parse `WIDTHxHEIGHT`.
fn parse_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once(|c| c == 'x' || c == 'X')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Build the hook chain in fixed order: scale, watermark, filter.
pub fn hooks_from_config(config: &ProcessorConfig) -> Result<Vec<Box<dyn PacketHook>>> {
    let mut hooks: Vec<Box<dyn PacketHook>> = Vec::new();
    if let Some(size) = &config.scale {
        let (width, height) = parse_size(size)
            .ok_or_else(|| RelayError::Config(format!("invalid scale size {:?}", size)))?;
        hooks.push(Box::new(ScaleHook { width, height }));
    }
    if let Some(text) = &config.watermark {
        hooks.push(Box::new(WatermarkHook { text: text.clone() }));
    }
    if let Some(expression) = &config.filter {
        hooks.push(Box::new(FilterHook {
            expression: expression.clone(),
        }));
    }
    Ok(hooks)
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Optional stage between ingest and transcoding that runs every packet
/// through the hook chain.
pub struct StreamProcessor {
    source: Arc<dyn PacketSource>,
    hooks: Arc<Vec<Box<dyn PacketHook>>>,
    info: Arc<Mutex<StreamInfo>>,
    packets: Mutex<Option<mpsc::Receiver<RtpInfo>>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    running: AtomicBool,
}

impl StreamProcessor {
    pub fn new(source: Arc<dyn PacketSource>, hooks: Vec<Box<dyn PacketHook>>, info: StreamInfo) -> Self {
        Self {
            source,
            hooks: Arc::new(hooks),
            info: Arc::new(Mutex::new(info)),
            packets: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn hook_names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }
}

async fn process(
    mut input: mpsc::Receiver<RtpInfo>,
    output: PacketSender,
    hooks: Arc<Vec<Box<dyn PacketHook>>>,
    info: Arc<Mutex<StreamInfo>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = input.recv() => {
                let Some(packet) = packet else { break };
                let packet = hooks.iter().fold(packet, |p, hook| hook.apply(p));
                info.lock().touch();
                output.push(packet);
            }
        }
    }
    debug!("processor task exited");
}

#[async_trait]
impl Lifecycle for StreamProcessor {
    async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if state.is_some() {
            return Ok(());
        }
        let input = self.source.take_packets().ok_or(RelayError::NoPacketSource)?;
        let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(process(
            input,
            PacketSender::new(tx, "processor"),
            self.hooks.clone(),
            self.info.clone(),
            cancel.clone(),
        ));

        *self.packets.lock() = Some(rx);
        self.info.lock().started_at = Some(Utc::now());
        self.running.store(true, Ordering::SeqCst);
        *state = Some(Running { cancel, task });
        info!(hooks = ?self.hook_names(), "stream processor started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        let Some(running) = state.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);
        running.cancel.cancel();
        let _ = running.task.await;
        self.packets.lock().take();
        info!("stream processor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Streamer for StreamProcessor {
    fn stream_info(&self) -> StreamInfo {
        self.info.lock().clone()
    }
}

impl PacketSource for StreamProcessor {
    fn take_packets(&self) -> Option<mpsc::Receiver<RtpInfo>> {
        self.packets.lock().take()
    }
}
