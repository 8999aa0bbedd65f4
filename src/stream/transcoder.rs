use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Lifecycle, PacketSource, StreamInfo, StreamType, Streamer};
use crate::config::TranscoderConfig;
use crate::error::{RelayError, Result};
use crate::flv::{self, FlvEncoder};
use crate::hls::{HlsSegmenter, PLAYLIST_NAME};
use crate::metrics::MetricsCollector;
use crate::rtp::RtpInfo;

/// One output format of the transcoder, with its own subscribers and
/// client count.
pub struct TranscodedStream {
    stream_type: StreamType,
    info: Mutex<StreamInfo>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Bytes>>>,
    next_subscriber: AtomicU64,
    running: AtomicBool,
}

impl TranscodedStream {
    pub fn new(stream_type: StreamType, url: impl Into<String>) -> Self {
        Self {
            stream_type,
            info: Mutex::new(StreamInfo::new(url, stream_type)),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn client_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Register a client. FLV clients get the file header queued first.
    /// The client count drops again when the returned subscription is dropped.
    pub fn subscribe(self: &Arc<Self>, buffer: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        if self.stream_type == StreamType::Flv {
            let _ = tx.try_send(flv::stream_header());
        }

        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        self.set_client_count(count);
        debug!(stream_type = %self.stream_type, id, count, "client subscribed");

        Subscription {
            id,
            stream: self.clone(),
            inner: ReceiverStream::new(rx),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.remove(&id);
            subscribers.len()
        };
        self.set_client_count(count);
        debug!(stream_type = %self.stream_type, id, count, "client left");
    }

    fn set_client_count(&self, count: usize) {
        self.info.lock().client_count = count;
        MetricsCollector::update_client_count(self.stream_type.as_str(), count);
    }

    /// Hand a chunk to every subscriber without waiting. Slow clients lose
    /// the chunk; disconnected ones are removed.
    pub fn publish(&self, chunk: Bytes) {
        if !self.is_running() {
            return;
        }
        let count = {
            let mut subscribers = self.subscribers.lock();
            let before = subscribers.len();
            subscribers.retain(|id, tx| match tx.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    trace!(id, "client buffer full, dropping chunk");
                    MetricsCollector::record_packet_dropped("distributor");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            });
            (before != subscribers.len()).then_some(subscribers.len())
        };
        if let Some(count) = count {
            self.set_client_count(count);
        }
        self.info.lock().touch();
    }

    fn touch(&self) {
        self.info.lock().touch();
    }

    fn inherit(&self, source: &StreamInfo) {
        let mut info = self.info.lock();
        info.video_codec = source.video_codec.clone();
        info.audio_codec = source.audio_codec.clone();
        info.resolution = source.resolution.clone();
        info.framerate = source.framerate;
        info.bitrate = source.bitrate;
    }
}

#[async_trait]
impl Lifecycle for TranscodedStream {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.info.lock().started_at = Some(Utc::now());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the senders ends every client's body.
        self.subscribers.lock().clear();
        self.set_client_count(0);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Streamer for TranscodedStream {
    fn stream_info(&self) -> StreamInfo {
        self.info.lock().clone()
    }
}

/// A client's view of a [`TranscodedStream`]. Ends when the stream stops.
pub struct Subscription {
    id: u64,
    stream: Arc<TranscodedStream>,
    inner: ReceiverStream<Bytes>,
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stream.unsubscribe(self.id);
    }
}

struct Encoders {
    flv: Option<(FlvEncoder, Arc<TranscodedStream>)>,
    hls: Option<(HlsSegmenter, Arc<TranscodedStream>)>,
    webrtc: Option<Arc<TranscodedStream>>,
}

impl Encoders {
    async fn dispatch(&mut self, packet: &RtpInfo) {
        if let Some((encoder, stream)) = self.flv.as_mut() {
            stream.publish(encoder.encode(packet));
        }
        if let Some((segmenter, stream)) = self.hls.as_mut() {
            match segmenter.write_packet(packet).await {
                Ok(()) => stream.touch(),
                Err(e) => warn!(seq = packet.sequence_number, "hls write failed: {}", e),
            }
        }
        // A peer-connection muxer would packetize here; clients get raw payloads.
        if let Some(stream) = &self.webrtc {
            stream.publish(packet.payload.clone());
        }
    }

    async fn finish(&mut self) {
        if let Some((segmenter, _)) = self.hls.as_mut() {
            if let Err(e) = segmenter.finish().await {
                warn!("failed to close final hls segment: {}", e);
            }
        }
    }
}

async fn fan_out(mut input: mpsc::Receiver<RtpInfo>, mut encoders: Encoders, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            packet = input.recv() => {
                let Some(packet) = packet else { break };
                encoders.dispatch(&packet).await;
            }
        }
    }
    encoders.finish().await;
    debug!("transcoder fan-out exited");
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Reads one packet channel and feeds every configured output format.
pub struct StreamTranscoder {
    source: Arc<dyn PacketSource>,
    config: TranscoderConfig,
    streams: Vec<Arc<TranscodedStream>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    running: AtomicBool,
}

impl StreamTranscoder {
    pub fn new(source: Arc<dyn PacketSource>, config: TranscoderConfig, url: &str) -> Self {
        let mut streams: Vec<Arc<TranscodedStream>> = Vec::new();
        for &stream_type in &config.outputs {
            if stream_type == StreamType::Rtsp {
                warn!("rtsp is not a transcoder output, ignoring");
                continue;
            }
            if streams.iter().any(|s| s.stream_type() == stream_type) {
                continue;
            }
            streams.push(Arc::new(TranscodedStream::new(stream_type, url)));
        }
        Self {
            source,
            config,
            streams,
            lifecycle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn streams(&self) -> &[Arc<TranscodedStream>] {
        &self.streams
    }

    pub fn stream(&self, stream_type: StreamType) -> Option<Arc<TranscodedStream>> {
        self.streams.iter().find(|s| s.stream_type() == stream_type).cloned()
    }

    /// Copy codec details learned upstream onto every output.
    pub fn inherit_info(&self, source: &StreamInfo) {
        for stream in &self.streams {
            stream.inherit(source);
        }
    }

    /// Where each output can be fetched, relative to `base_url`
    /// (e.g. `http://host:8080`).
    pub fn output_urls(&self, base_url: &str) -> HashMap<StreamType, String> {
        let base = base_url.trim_end_matches('/');
        self.streams
            .iter()
            .filter_map(|s| {
                let path = match s.stream_type() {
                    StreamType::Flv => "/stream/flv".to_string(),
                    StreamType::Hls => format!("/hls/{}", PLAYLIST_NAME),
                    StreamType::Webrtc => "/webrtc/".to_string(),
                    StreamType::Rtsp => return None,
                };
                Some((s.stream_type(), format!("{}{}", base, path)))
            })
            .collect()
    }

    async fn stop_streams(&self) {
        for stream in &self.streams {
            let _ = stream.stop().await;
        }
    }
}

#[async_trait]
impl Lifecycle for StreamTranscoder {
    async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let hls = self.stream(StreamType::Hls);
        if hls.is_some() {
            tokio::fs::create_dir_all(&self.config.hls.output_dir).await?;
        }
        let input = self.source.take_packets().ok_or(RelayError::NoPacketSource)?;

        for stream in &self.streams {
            if let Err(e) = stream.start().await {
                self.stop_streams().await;
                return Err(e);
            }
        }

        let encoders = Encoders {
            flv: self.stream(StreamType::Flv).map(|s| (FlvEncoder::new(), s)),
            hls: hls.map(|s| (HlsSegmenter::new(&self.config.hls), s)),
            webrtc: self.stream(StreamType::Webrtc),
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fan_out(input, encoders, cancel.clone()));

        self.running.store(true, Ordering::SeqCst);
        *state = Some(Running { cancel, task });
        info!(
            outputs = ?self.streams.iter().map(|s| s.stream_type()).collect::<Vec<_>>(),
            "stream transcoder started"
        );
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
        self.stop_streams().await;
        info!("stream transcoder stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
