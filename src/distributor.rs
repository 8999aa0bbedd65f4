//! HTTP delivery of transcoded streams.
//!
//! | Route | Response |
//! |---|---|
//! | `GET /stream/flv` | `video/x-flv`, chunked, one tag per chunk |
//! | `GET /stream/hls` | `302` to `/hls/playlist.m3u8` |
//! | `GET /stream/webrtc`, `GET /webrtc/` | JSON availability stub |
//! | `GET /hls/{file}` | playlist or segment from the HLS directory |
//! | `GET /status` | JSON snapshot of every registered stream |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::DistributorConfig;
use crate::error::Result;
use crate::hls::PLAYLIST_NAME;
use crate::stream::{Lifecycle, StreamInfo, StreamType, Streamer, TranscodedStream};

type StreamRegistry = DashMap<StreamType, Arc<TranscodedStream>>;

#[derive(Clone)]
struct AppState {
    streams: Arc<StreamRegistry>,
    hls_dir: PathBuf,
    client_buffer: usize,
    listen_address: String,
    running: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub listen_address: String,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Serialize)]
struct WebrtcStub {
    stream_type: StreamType,
    available: bool,
    client_count: usize,
    message: &'static str,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

pub struct Distributor {
    config: DistributorConfig,
    state: AppState,
    local_addr: Mutex<Option<SocketAddr>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl Distributor {
    pub fn new(config: DistributorConfig, hls_dir: impl Into<PathBuf>) -> Self {
        let state = AppState {
            streams: Arc::new(DashMap::new()),
            hls_dir: hls_dir.into(),
            client_buffer: config.client_buffer,
            listen_address: config.listen_address.clone(),
            running: Arc::new(AtomicBool::new(false)),
        };
        Self {
            config,
            state,
            local_addr: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Make a stream reachable under its type's routes. Re-registering a
    /// type replaces the previous stream.
    pub fn register_stream(&self, stream: Arc<TranscodedStream>) {
        debug!(stream_type = %stream.stream_type(), "stream registered");
        self.state.streams.insert(stream.stream_type(), stream);
    }

    pub fn streams(&self) -> Vec<StreamInfo> {
        stream_infos(&self.state.streams)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/stream/:kind", get(stream_handler))
            .route("/hls/:file", get(hls_handler))
            .route("/webrtc/", get(webrtc_handler))
            .route("/status", get(status_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    async fn stop_streams(&self) {
        let streams: Vec<_> = self.state.streams.iter().map(|s| s.value().clone()).collect();
        for stream in streams {
            if let Err(e) = stream.stop().await {
                warn!(stream_type = %stream.stream_type(), "failed to stop stream: {}", e);
            }
        }
    }
}

fn stream_infos(streams: &StreamRegistry) -> Vec<StreamInfo> {
    let mut infos: Vec<_> = streams.iter().map(|s| s.value().stream_info()).collect();
    infos.sort_by_key(|i| i.stream_type.as_str());
    infos
}

#[async_trait]
impl Lifecycle for Distributor {
    async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = self.router();

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        });

        self.state.running.store(true, Ordering::SeqCst);
        *self.local_addr.lock() = Some(addr);
        *state = Some(Running { cancel, task });
        info!(addr = %addr, "distributor listening");
        Ok(())
    }

    /// Cancel, end every client stream, then give the server
    /// `shutdown_timeout` to drain.
    async fn stop(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        let Some(mut running) = state.take() else {
            return Ok(());
        };
        self.state.running.store(false, Ordering::SeqCst);
        running.cancel.cancel();
        self.stop_streams().await;

        match tokio::time::timeout(self.config.shutdown_timeout(), &mut running.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("distributor server error: {}", e),
            Ok(Err(e)) => warn!("distributor task failed: {}", e),
            Err(_) => {
                warn!("distributor shutdown timed out, aborting");
                running.task.abort();
            }
        }
        self.local_addr.lock().take();
        info!("distributor stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }
}

async fn stream_handler(State(state): State<AppState>, Path(kind): Path<String>) -> Response {
    let Ok(stream_type) = kind.parse::<StreamType>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(stream) = state.streams.get(&stream_type).map(|s| s.value().clone()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match stream_type {
        StreamType::Flv => {
            let subscription = stream.subscribe(state.client_buffer);
            let body = Body::from_stream(subscription.map(Ok::<_, Infallible>));
            (
                [
                    (header::CONTENT_TYPE, "video/x-flv"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response()
        }
        StreamType::Hls => (
            StatusCode::FOUND,
            [(header::LOCATION, format!("/hls/{}", PLAYLIST_NAME))],
        )
            .into_response(),
        StreamType::Webrtc => webrtc_stub(&stream).into_response(),
        StreamType::Rtsp => StatusCode::NOT_FOUND.into_response(),
    }
}

fn webrtc_stub(stream: &TranscodedStream) -> Json<WebrtcStub> {
    Json(WebrtcStub {
        stream_type: StreamType::Webrtc,
        available: stream.is_running(),
        client_count: stream.client_count(),
        message: "WebRTC signaling not available; payload passthrough only",
    })
}

async fn webrtc_handler(State(state): State<AppState>) -> Response {
    match state.streams.get(&StreamType::Webrtc) {
        Some(stream) => webrtc_stub(stream.value()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn hls_content_type(file: &str) -> Option<&'static str> {
    if file.contains(|c| c == '/' || c == '\\') || file.contains("..") {
        return None;
    }
    match file.rsplit_once('.') {
        Some((stem, "m3u8")) if !stem.is_empty() => Some("application/vnd.apple.mpegurl"),
        Some((stem, "ts")) if !stem.is_empty() => Some("video/MP2T"),
        _ => None,
    }
}

async fn hls_handler(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let Some(content_type) = hls_content_type(&file) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match tokio::fs::read(state.hls_dir.join(&file)).await {
        Ok(data) => (
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            data,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(file = %file, "failed to read hls file: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusReport> {
    Json(StatusReport {
        running: state.running.load(Ordering::SeqCst),
        listen_address: state.listen_address.clone(),
        streams: stream_infos(&state.streams),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn started(stream_type: StreamType) -> Arc<TranscodedStream> {
        let stream = Arc::new(TranscodedStream::new(stream_type, "rtsp://cam/live"));
        stream.start().await.unwrap();
        stream
    }

    async fn get(router: Router, uri: &str) -> Response {
        router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn hls_names_are_checked() {
        assert_eq!(hls_content_type("playlist.m3u8"), Some("application/vnd.apple.mpegurl"));
        assert_eq!(hls_content_type("segment_3.ts"), Some("video/MP2T"));
        assert_eq!(hls_content_type("segment_3.mp4"), None);
        assert_eq!(hls_content_type("..ts"), None);
        assert_eq!(hls_content_type(".ts"), None);
        assert_eq!(hls_content_type("a\\b.ts"), None);
    }

    #[tokio::test]
    async fn serves_hls_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PLAYLIST_NAME), "#EXTM3U\n").unwrap();
        let distributor = Distributor::new(DistributorConfig::default(), dir.path());
        distributor.register_stream(started(StreamType::Hls).await);

        let resp = get(distributor.router(), "/hls/playlist.m3u8").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/vnd.apple.mpegurl");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"#EXTM3U\n"));

        let resp = get(distributor.router(), "/hls/segment_9.ts").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = get(distributor.router(), "/hls/notes.txt").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = get(distributor.router(), "/stream/hls").await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[header::LOCATION], "/hls/playlist.m3u8");
    }

    #[tokio::test]
    async fn unknown_or_unregistered_streams_are_not_found() {
        let distributor = Distributor::new(DistributorConfig::default(), "hls");
        distributor.register_stream(started(StreamType::Flv).await);

        assert_eq!(get(distributor.router(), "/stream/dash").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(distributor.router(), "/stream/rtsp").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(distributor.router(), "/stream/webrtc").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(get(distributor.router(), "/webrtc/").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn flv_client_counts_while_connected() {
        let distributor = Distributor::new(DistributorConfig::default(), "hls");
        let flv = started(StreamType::Flv).await;
        distributor.register_stream(flv.clone());

        let resp = get(distributor.router(), "/stream/flv").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/x-flv");
        assert_eq!(flv.client_count(), 1);

        let mut body = resp.into_body();
        let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(first, crate::flv::stream_header());

        drop(body);
        assert_eq!(flv.client_count(), 0);
    }

    #[tokio::test]
    async fn status_and_webrtc_stub_are_json() {
        let distributor = Distributor::new(DistributorConfig::default(), "hls");
        distributor.register_stream(started(StreamType::Webrtc).await);
        distributor.register_stream(started(StreamType::Flv).await);

        let resp = get(distributor.router(), "/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["streams"].as_array().unwrap().len(), 2);
        assert_eq!(json["streams"][0]["stream_type"], "flv");

        for uri in ["/stream/webrtc", "/webrtc/"] {
            let resp = get(distributor.router(), uri).await;
            assert_eq!(resp.status(), StatusCode::OK);
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["stream_type"], "webrtc");
            assert_eq!(json["available"], true);
        }
    }

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let config = DistributorConfig {
            listen_address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let distributor = Distributor::new(config, "hls");
        let flv = started(StreamType::Flv).await;
        distributor.register_stream(flv.clone());

        distributor.start().await.unwrap();
        distributor.start().await.unwrap();
        assert!(distributor.is_running());
        assert!(distributor.local_addr().is_some());

        distributor.stop().await.unwrap();
        distributor.stop().await.unwrap();
        assert!(!distributor.is_running());
        assert!(!flv.is_running());
    }
}
