//! Session-per-connection RTSP server.

pub mod handler;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RtspServerConfig;
use crate::error::{RelayError, Result};
use crate::metrics::MetricsCollector;
use crate::protocol::{read_request, Method, Request, Response};
use crate::stream::Lifecycle;

pub use handler::{dispatch, DefaultHandler, Handler};
pub use session::{Session, SessionId, SessionRegistry};

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// RTSP server with one session per TCP connection.
///
/// A connection ends when the peer closes it, sends a malformed request, the
/// server stops, or no request arrives within `session_timeout_secs`. Its
/// session is removed in every case.
pub struct Server {
    config: RtspServerConfig,
    handler: Arc<dyn Handler>,
    sessions: Arc<SessionRegistry>,
    local_addr: Mutex<Option<SocketAddr>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl Server {
    pub fn new(config: RtspServerConfig, handler: Arc<dyn Handler>) -> Self {
        Self {
            config,
            handler,
            sessions: Arc::new(SessionRegistry::new()),
            local_addr: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_default_handler(config: RtspServerConfig) -> Self {
        Self::new(config, Arc::new(DefaultHandler))
    }

    /// Bound address while running; useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Copies of all live sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.snapshot()
    }
}

#[async_trait]
impl Lifecycle for Server {
    async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let idle_timeout = Duration::from_secs(self.config.session_timeout_secs.max(1));

        let task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            self.sessions.clone(),
            idle_timeout,
            cancel.clone(),
        ));

        *self.local_addr.lock() = Some(addr);
        *state = Some(Running { cancel, task });
        info!(addr = %addr, "RTSP server listening");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        let Some(running) = state.take() else {
            return Ok(());
        };
        running.cancel.cancel();
        let _ = running.task.await;
        self.local_addr.lock().take();
        info!("RTSP server stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.local_addr.lock().is_some()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    sessions: Arc<SessionRegistry>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        handler.clone(),
                        sessions.clone(),
                        idle_timeout,
                        cancel.clone(),
                    ));
                }
                Err(e) => warn!("accept failed: {}", e),
            },
        }
    }
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    sessions: Arc<SessionRegistry>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(peer = %peer, "dropping connection: {}", e);
            return;
        }
    };
    let session = Session::new(peer, local_addr, idle_timeout.as_secs());
    let id = session.id;
    sessions.insert(session);

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(idle_timeout, read_request(&mut reader)) => match read {
                Ok(Ok(request)) => request,
                Ok(Err(RelayError::ConnectionClosed)) => break,
                Ok(Err(e)) => {
                    debug!(session_id = %id, "ending connection: {}", e);
                    break;
                }
                Err(_) => {
                    debug!(session_id = %id, "session timed out");
                    break;
                }
            },
        };

        let response = handle_request(handler.as_ref(), &sessions, &id, &request).await;
        if let Err(e) = write_half.write_all(&response.serialize()).await {
            debug!(session_id = %id, "write failed: {}", e);
            break;
        }
    }

    sessions.remove(&id);
}

async fn handle_request(
    handler: &dyn Handler,
    sessions: &SessionRegistry,
    id: &SessionId,
    request: &Request,
) -> Response {
    MetricsCollector::record_rtsp_request(request.method.as_str());
    let Some(session) = sessions.touch(id, request.cseq()) else {
        return Response::session_not_found();
    };
    debug!(session_id = %id, method = %request.method, cseq = session.cseq, "request");

    let mut response = match dispatch(handler, request, &session).await {
        Ok(response) => response,
        Err(e) => {
            warn!(session_id = %id, method = %request.method, "handler failed: {}", e);
            Response::internal_error()
        }
    };

    if request.method == Method::Setup && response.is_success() {
        if let Some(transport) = response
            .header
            .get("Transport")
            .or_else(|| request.header.get("Transport"))
        {
            sessions.set_transport(id, transport);
        }
    }

    response.header.set("CSeq", session.cseq.to_string());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn local_config() -> RtspServerConfig {
        RtspServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            session_timeout_secs: 60,
        }
    }

    async fn roundtrip(stream: &mut TcpStream, raw: &str) -> String {
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn echoes_cseq_and_tracks_sessions() {
        let server = Server::with_default_handler(local_config());
        server.start().await.unwrap();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(&mut conn, "OPTIONS * RTSP/1.0\r\nCSeq: 41\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(reply.contains("CSeq: 41\r\n"));
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(server.sessions()[0].cseq, 41);

        let reply = roundtrip(&mut conn, "FLUSH * RTSP/1.0\r\nCSeq: 42\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 405 Method Not Allowed\r\n"));
        assert!(reply.contains("CSeq: 42\r\n"));

        let reply = roundtrip(
            &mut conn,
            "SETUP rtsp://h/live/track1 RTSP/1.0\r\nCSeq: 43\r\nTransport: RTP/AVP;unicast;client_port=9000-9001\r\n\r\n",
        )
        .await;
        assert!(reply.contains("server_port=6970-6971"));
        let transport = server.sessions()[0].transport.clone().unwrap();
        assert!(transport.contains("client_port=9000-9001"));

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn malformed_request_closes_connection() {
        let server = Server::with_default_handler(local_config());
        server.start().await.unwrap();
        let mut conn = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

        conn.write_all(b"GARBAGE\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

        server.stop().await.unwrap();
    }

    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        async fn describe(&self, _req: &Request, _session: &Session) -> Result<Response> {
            Err(RelayError::Handler("boom".into()))
        }
    }

    #[tokio::test]
    async fn handler_error_becomes_500_and_connection_survives() {
        let server = Server::new(local_config(), Arc::new(Failing));
        server.start().await.unwrap();
        let mut conn = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

        let reply = roundtrip(&mut conn, "DESCRIBE rtsp://h/live RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 500 Internal Server Error\r\n"));
        assert!(reply.contains("CSeq: 2\r\n"));

        let reply = roundtrip(&mut conn, "OPTIONS * RTSP/1.0\r\nCSeq: 3\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn idle_connection_is_closed_and_session_removed() {
        let server = Server::with_default_handler(RtspServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            session_timeout_secs: 1,
        });
        server.start().await.unwrap();
        let mut conn = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

        let reply = roundtrip(&mut conn, "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
        assert!(reply.starts_with("RTSP/1.0 200 OK\r\n"));
        assert_eq!(server.sessions()[0].timeout_secs, 1);

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(3), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.sessions().is_empty());

        server.stop().await.unwrap();
    }
}
