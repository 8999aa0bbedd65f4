use std::sync::Arc;
use std::time::Duration;

use rtsp_relay::config::{RelayConfig, RtspConfig, RtspServerConfig};
use rtsp_relay::protocol::{Header, Method, SessionDescription, TransportSpec};
use rtsp_relay::rtp::{packet_channel, RtpInfo, PACKET_CHANNEL_CAPACITY};
use rtsp_relay::stream::RtspStream;
use rtsp_relay::{Client, Lifecycle, PipelineManager, RelayError, Server, StreamType, Streamer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

async fn upstream() -> Server {
    let server = Server::with_default_handler(RtspServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        session_timeout_secs: 60,
    });
    server.start().await.unwrap();
    server
}

fn stream_url(server: &Server) -> String {
    format!("rtsp://{}/live", server.local_addr().unwrap())
}

fn rtp_packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x80, ((marker as u8) << 7) | 96];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&ts.to_be_bytes());
    packet.extend_from_slice(&0x1234_5678u32.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

#[tokio::test]
async fn test_client_server_handshake() {
    let server = upstream().await;
    let mut client = Client::connect(&stream_url(&server)).await.unwrap();

    let response = client.options().await.unwrap();
    assert!(response.header.get("Public").unwrap().contains("DESCRIBE"));

    let response = client.describe().await.unwrap();
    let sdp = SessionDescription::parse(&response.body_text());
    assert_eq!(sdp.video_codec, "H264");
    assert_eq!(sdp.video_control.as_deref(), Some("track1"));

    let transport = TransportSpec::udp(8000, 8001).to_string();
    let response = client
        .setup(&format!("{}/track1", stream_url(&server)), &transport)
        .await
        .unwrap();
    assert!(response.is_success());
    let session_id = client.session_id().unwrap().to_string();
    assert_eq!(client.session_timeout(), Some(60));

    let sessions = server.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id.to_string(), session_id);
    assert!(sessions[0].transport.as_deref().unwrap().contains("client_port=8000-8001"));

    assert!(client.play(None).await.unwrap().is_success());
    assert!(client.teardown().await.unwrap().is_success());
    assert!(client.session_id().is_none());

    client.close().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_cseq_monotonic_and_echoed() {
    let server = upstream().await;
    let mut client = Client::connect(&stream_url(&server)).await.unwrap();

    let initial = client.cseq();
    for n in 0..5 {
        let expected = client.cseq();
        let response = client.get_parameter("").await.unwrap();
        assert_eq!(response.cseq(), Some(expected));
        assert_eq!(client.cseq(), initial + n + 1);
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_method_dispatch_completeness() {
    let server = upstream().await;
    let url = stream_url(&server);
    let mut client = Client::connect(&url).await.unwrap();

    for method in Method::ALL {
        let response = client
            .send_request(method.clone(), &url, Header::new(), Vec::new())
            .await
            .unwrap();
        assert!(response.is_success(), "{} -> {}", method, response.status_code);
    }

    let response = client
        .send_request(Method::from("FLUSH"), &url, Header::new(), Vec::new())
        .await
        .unwrap();
    assert_eq!(response.status_code, 405);

    server.stop().await.unwrap();
}

#[test]
fn test_rtp_header_parse() {
    let packet = rtp_packet(5, 1000, true, &[0xAA; 10]);
    let info = RtpInfo::parse(&packet).unwrap();
    assert!(info.marker);
    assert_eq!(info.payload_type, 96);
    assert_eq!(info.sequence_number, 5);
    assert_eq!(info.timestamp, 1000);
    assert_eq!(info.payload.len(), 10);
}

#[tokio::test]
async fn test_backpressure_never_blocks() {
    let (tx, _rx) = packet_channel();
    let packet = RtpInfo::parse(&rtp_packet(1, 0, false, b"x")).unwrap();

    let producer = tokio::spawn(async move {
        (0..PACKET_CHANNEL_CAPACITY * 3)
            .filter(|_| tx.push(packet.clone()))
            .count()
    });
    let accepted = tokio::time::timeout(Duration::from_secs(5), producer)
        .await
        .expect("producer blocked")
        .unwrap();
    assert_eq!(accepted, PACKET_CHANNEL_CAPACITY);
}

#[tokio::test]
async fn test_ingest_start_stop_idempotent() {
    let server = upstream().await;
    let ingest = RtspStream::with_port_range(RtspConfig::new(&stream_url(&server)), 32000, 33000);

    ingest.start().await.unwrap();
    ingest.start().await.unwrap();
    assert!(ingest.is_running());
    assert!(ingest.local_ports().is_some());
    assert!(ingest.stream_info().started_at.is_some());

    ingest.stop().await.unwrap();
    ingest.stop().await.unwrap();
    assert!(!ingest.is_running());
    assert!(ingest.local_ports().is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_ingest_reports_handshake_failure() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = conn.read(&mut buf).await;
        conn.write_all(b"RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        let _ = conn.read(&mut buf).await;
    });

    let mut config = RtspConfig::new(&format!("rtsp://{}/live", addr));
    config.max_retries = 0;
    let ingest = RtspStream::new(config);

    match ingest.start().await {
        Err(RelayError::Handshake { method, status, .. }) => {
            assert_eq!(method, "OPTIONS");
            assert_eq!(status, 401);
        }
        other => panic!("expected handshake error, got {:?}", other.map(|_| ())),
    }
    assert!(!ingest.is_running());
}

#[tokio::test]
async fn test_pipeline_unwinds_on_transcoder_failure() {
    let server = upstream().await;
    let blocker = tempfile::NamedTempFile::new().unwrap();

    let mut config = RelayConfig::default();
    config.rtsp = RtspConfig::new(&stream_url(&server));
    config.transcoder.hls.output_dir = blocker.path().join("hls");
    config.distributor.listen_address = "127.0.0.1:0".to_string();

    let ingest = Arc::new(RtspStream::with_port_range(config.rtsp.clone(), 34000, 35000));
    let pipeline = PipelineManager::with_ingest(&config, ingest.clone()).unwrap();

    assert!(pipeline.start().await.is_err());
    assert!(!pipeline.is_running());
    assert!(!ingest.is_running());
    assert!(ingest.local_ports().is_none());
    assert!(!pipeline.distributor().is_running());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_relay_end_to_end_flv() {
    let server = upstream().await;
    let hls_dir = tempfile::tempdir().unwrap();

    let mut config = RelayConfig::default();
    config.rtsp = RtspConfig::new(&stream_url(&server));
    config.transcoder.outputs = vec![StreamType::Flv, StreamType::Hls];
    config.transcoder.hls.output_dir = hls_dir.path().to_path_buf();
    config.distributor.listen_address = "127.0.0.1:0".to_string();

    let ingest = Arc::new(RtspStream::with_port_range(config.rtsp.clone(), 36000, 37000));
    let pipeline = PipelineManager::with_ingest(&config, ingest.clone()).unwrap();
    pipeline.start().await.unwrap();
    pipeline.start().await.unwrap();

    let http_addr = pipeline.distributor().local_addr().unwrap();
    let urls = pipeline.output_urls();
    assert_eq!(urls[&StreamType::Flv], format!("http://{}/stream/flv", http_addr));

    let mut http = TcpStream::connect(http_addr).await.unwrap();
    http.write_all(b"GET /stream/flv HTTP/1.1\r\nHost: relay\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !received.windows(3).any(|w| w == b"FLV") {
        let n = tokio::time::timeout(Duration::from_secs(5), http.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        received.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&received).to_lowercase();
    assert!(head.starts_with("http/1.1 200 ok"));
    assert!(head.contains("content-type: video/x-flv"));
    assert!(head.contains("transfer-encoding: chunked"));

    let (rtp_port, _) = ingest.local_ports().unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = rtp_packet(1, 90_000, true, b"relayed-nal");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !received.windows(11).any(|w| w == b"relayed-nal") {
        assert!(tokio::time::Instant::now() < deadline, "payload never relayed");
        sender.send_to(&packet, ("127.0.0.1", rtp_port)).await.unwrap();
        if let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(200), http.read(&mut buf)).await {
            received.extend_from_slice(&buf[..n]);
        }
    }

    let flv = pipeline.transcoder().stream(StreamType::Flv).unwrap();
    assert_eq!(flv.stream_info().client_count, 1);

    pipeline.stop().await.unwrap();
    pipeline.stop().await.unwrap();
    assert!(!ingest.is_running());
    assert!(!flv.is_running());

    server.stop().await.unwrap();
}
