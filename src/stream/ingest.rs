use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Lifecycle, PacketSource, StreamInfo, StreamType, Streamer};
use crate::client::Client;
use crate::config::RtspConfig;
use crate::error::{RelayError, Result};
use crate::metrics::MetricsCollector;
use crate::protocol::sdp::resolve_control;
use crate::protocol::{Method, Response, SessionDescription, TransportSpec};
use crate::rtp::{packet_channel, PacketSender, RtcpHeader, RtpInfo};

pub const RTP_PORT_RANGE_START: u16 = 8000;
pub const RTP_PORT_RANGE_END: u16 = 9000;

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Bind an adjacent (RTP, RTCP) UDP socket pair, probing even ports upward
/// from `start`. The first pair where both binds succeed wins.
pub async fn allocate_port_pair(start: u16, end: u16) -> Result<(UdpSocket, UdpSocket)> {
    for rtp_port in (start..end).step_by(2) {
        let Some(rtcp_port) = rtp_port.checked_add(1) else {
            break;
        };
        let rtp = match UdpSocket::bind(("0.0.0.0", rtp_port)).await {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        match UdpSocket::bind(("0.0.0.0", rtcp_port)).await {
            Ok(rtcp) => {
                trace!(rtp_port, rtcp_port, "allocated client port pair");
                return Ok((rtp, rtcp));
            }
            Err(_) => continue,
        }
    }
    Err(RelayError::NoAvailablePorts { start, end })
}

fn ensure_success(method: Method, response: &Response) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(RelayError::Handshake {
            method: method.to_string(),
            status: response.status_code,
            reason: response.status_text.clone(),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    client: Arc<tokio::sync::Mutex<Client>>,
    desynced: Arc<AtomicBool>,
}

/// Pulls an upstream RTSP source over UDP and emits parsed RTP packets.
///
/// `start` runs OPTIONS → DESCRIBE → SETUP → PLAY and spawns one reader task
/// per socket. A failed `start` leaves nothing open behind it.
pub struct RtspStream {
    config: RtspConfig,
    port_range: (u16, u16),
    info: Arc<Mutex<StreamInfo>>,
    ports: Mutex<Option<(u16, u16)>>,
    packets: Mutex<Option<mpsc::Receiver<RtpInfo>>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    running: AtomicBool,
}

impl RtspStream {
    pub fn new(config: RtspConfig) -> Self {
        Self::with_port_range(config, RTP_PORT_RANGE_START, RTP_PORT_RANGE_END)
    }

    pub fn with_port_range(config: RtspConfig, start: u16, end: u16) -> Self {
        let info = StreamInfo::new(config.url.clone(), StreamType::Rtsp);
        Self {
            config,
            port_range: (start, end),
            info: Arc::new(Mutex::new(info)),
            ports: Mutex::new(None),
            packets: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Local (RTP, RTCP) ports while running.
    pub fn local_ports(&self) -> Option<(u16, u16)> {
        *self.ports.lock()
    }

    async fn connect(&self) -> Result<(Client, SessionDescription, String)> {
        let mut client = Client::connect(&self.config.url).await?;
        client.set_user_agent(&self.config.user_agent);
        if let Some(user) = &self.config.username {
            client.set_credentials(user, self.config.password.as_deref().unwrap_or_default());
        }

        let response = client.options().await?;
        ensure_success(Method::Options, &response)?;

        let response = client.describe().await?;
        ensure_success(Method::Describe, &response)?;

        let base = response
            .header
            .get("Content-Base")
            .or_else(|| response.header.get("Content-Location"))
            .map(str::to_string)
            .unwrap_or_else(|| client.url().to_string());
        let sdp = SessionDescription::parse(&response.body_text());
        Ok((client, sdp, base))
    }

    /// OPTIONS + DESCRIBE with up to `max_retries` further attempts.
    async fn connect_with_retry(&self) -> Result<(Client, SessionDescription, String)> {
        let mut attempt = 0;
        loop {
            match self.connect().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        url = %self.config.url,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "RTSP handshake failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn apply_description(&self, sdp: &SessionDescription) {
        let mut info = self.info.lock();
        info.video_codec = sdp.video_codec.clone();
        info.audio_codec = sdp.audio_codec.clone();
        info.resolution = sdp.resolution();
        info.framerate = sdp.framerate;
        info.bitrate = sdp.bitrate_kbps;
    }

    /// Allocate sockets, SETUP and PLAY. Consumes the client on failure.
    async fn pull(
        &self,
        mut client: Client,
        sdp: &SessionDescription,
        base: &str,
    ) -> Result<(Client, UdpSocket, UdpSocket)> {
        let (rtp, rtcp) = allocate_port_pair(self.port_range.0, self.port_range.1).await?;
        let rtp_port = rtp.local_addr()?.port();
        let rtcp_port = rtcp.local_addr()?.port();

        let setup_uri = match &sdp.video_control {
            Some(control) => resolve_control(base, control),
            None => client.url().to_string(),
        };
        let transport = TransportSpec::udp(rtp_port, rtcp_port).to_string();

        let result = async {
            let response = client.setup(&setup_uri, &transport).await?;
            ensure_success(Method::Setup, &response)?;
            if let Some(reply) = response.header.get("Transport") {
                let reply = TransportSpec::parse(reply);
                debug!(server_port = ?reply.server_port, "SETUP accepted");
            }

            let response = client.play(None).await?;
            ensure_success(Method::Play, &response)
        }
        .await;

        if let Err(e) = result {
            if client.session_id().is_some() {
                let _ = tokio::time::timeout(TEARDOWN_TIMEOUT, client.teardown()).await;
            }
            return Err(e);
        }

        *self.ports.lock() = Some((rtp_port, rtcp_port));
        info!(url = %self.config.url, setup_uri, rtp_port, rtcp_port, "RTSP stream playing");
        Ok((client, rtp, rtcp))
    }
}

async fn read_rtp(
    socket: UdpSocket,
    buffer_size: usize,
    tx: PacketSender,
    info: Arc<Mutex<StreamInfo>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    MetricsCollector::record_packet_received(len);
                    let Some(packet) = RtpInfo::parse(&buf[..len]) else {
                        trace!(%from, len, "discarding non-RTP datagram");
                        continue;
                    };
                    info.lock().touch();
                    tx.push(packet);
                }
                Err(e) => {
                    debug!(error = %e, "RTP socket read error");
                    continue;
                }
            }
        }
    }
    debug!("RTP reader exited");
}

async fn read_rtcp(socket: UdpSocket, cancel: CancellationToken) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    MetricsCollector::record_rtcp_received();
                    match RtcpHeader::parse(&buf[..len]) {
                        Some(h) => trace!(%from, packet_type = h.packet_type, len, "RTCP received"),
                        None => trace!(%from, len, "discarding malformed RTCP"),
                    }
                }
                Err(e) => {
                    debug!(error = %e, "RTCP socket read error");
                    continue;
                }
            }
        }
    }
    debug!("RTCP reader exited");
}

/// GET_PARAMETER at half the session timeout so the upstream keeps the
/// session alive.
///
/// A request that is cancelled, times out or fails leaves an unread response
/// on the control connection. `desynced` is raised and keepalives end.
async fn keepalive(
    client: Arc<tokio::sync::Mutex<Client>>,
    period: Duration,
    desynced: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut client = client.lock().await;
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = tokio::time::timeout(KEEPALIVE_TIMEOUT, client.get_parameter("")) => Some(result),
                };
                match outcome {
                    Some(Ok(Ok(response))) if response.is_success() => trace!("RTSP keepalive ok"),
                    Some(Ok(Ok(response))) => {
                        warn!(status = response.status_code, "RTSP keepalive rejected")
                    }
                    Some(Ok(Err(e))) => {
                        warn!(error = %e, "RTSP keepalive failed");
                        desynced.store(true, Ordering::SeqCst);
                        break;
                    }
                    Some(Err(_)) => {
                        warn!("RTSP keepalive timed out");
                        desynced.store(true, Ordering::SeqCst);
                        break;
                    }
                    None => {
                        desynced.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }
    debug!("keepalive exited");
}

#[async_trait]
impl Lifecycle for RtspStream {
    async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if state.is_some() {
            return Ok(());
        }
        if !self.config.transport.eq_ignore_ascii_case("udp") {
            return Err(RelayError::UnsupportedTransport(self.config.transport.clone()));
        }

        let (client, sdp, base) = self.connect_with_retry().await?;
        self.apply_description(&sdp);
        let (client, rtp, rtcp) = self.pull(client, &sdp, &base).await?;

        let period = client
            .session_timeout()
            .map(|t| Duration::from_secs((t / 2).max(1)))
            .unwrap_or(Duration::from_secs(DEFAULT_KEEPALIVE_SECS));
        let client = Arc::new(tokio::sync::Mutex::new(client));
        let desynced = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (tx, rx) = packet_channel();

        let tasks = vec![
            tokio::spawn(read_rtp(
                rtp,
                self.config.buffer_size,
                tx,
                self.info.clone(),
                cancel.clone(),
            )),
            tokio::spawn(read_rtcp(rtcp, cancel.clone())),
            tokio::spawn(keepalive(
                client.clone(),
                period,
                desynced.clone(),
                cancel.clone(),
            )),
        ];

        *self.packets.lock() = Some(rx);
        {
            let mut info = self.info.lock();
            info.started_at = Some(Utc::now());
            info.touch();
        }
        self.running.store(true, Ordering::SeqCst);
        *state = Some(Running {
            cancel,
            tasks,
            client,
            desynced,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        let Some(running) = state.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);

        running.cancel.cancel();
        for task in running.tasks {
            let _ = task.await;
        }

        if running.desynced.load(Ordering::SeqCst) {
            debug!("control connection out of step, skipping TEARDOWN");
        } else {
            let mut client = running.client.lock().await;
            match tokio::time::timeout(TEARDOWN_TIMEOUT, client.teardown()).await {
                Ok(Ok(response)) if response.is_success() => debug!("TEARDOWN acknowledged"),
                Ok(Ok(response)) => warn!(status = response.status_code, "TEARDOWN rejected"),
                Ok(Err(e)) => warn!(error = %e, "TEARDOWN failed"),
                Err(_) => warn!("TEARDOWN timed out"),
            }
        }
        if let Ok(client) = Arc::try_unwrap(running.client) {
            let _ = client.into_inner().close().await;
        }

        self.packets.lock().take();
        self.ports.lock().take();
        info!(url = %self.config.url, "RTSP stream stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Streamer for RtspStream {
    fn stream_info(&self) -> StreamInfo {
        self.info.lock().clone()
    }
}

impl PacketSource for RtspStream {
    fn take_packets(&self) -> Option<mpsc::Receiver<RtpInfo>> {
        self.packets.lock().take()
    }
}
