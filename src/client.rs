use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::Url;

use crate::error::{RelayError, Result};
use crate::protocol::{read_response, Header, Method, Request, Response};

pub const DEFAULT_RTSP_PORT: u16 = 554;
pub const DEFAULT_USER_AGENT: &str = concat!("rtsp-relay/", env!("CARGO_PKG_VERSION"));

/// Split an `rtsp://` URL into the `host:port` to dial, the URL with any
/// userinfo removed, and the userinfo credentials.
pub fn parse_rtsp_url(raw: &str) -> Result<(String, String, Option<(String, String)>)> {
    let mut url = Url::parse(raw).map_err(|_| RelayError::InvalidUrl(raw.to_string()))?;
    if url.scheme() != "rtsp" {
        return Err(RelayError::InvalidUrl(raw.to_string()));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RelayError::InvalidUrl(raw.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);

    let credentials = if url.username().is_empty() {
        None
    } else {
        Some((
            url.username().to_string(),
            url.password().unwrap_or_default().to_string(),
        ))
    };
    // Credentials travel in the Authorization header, never in the request URI.
    let _ = url.set_username("");
    let _ = url.set_password(None);

    Ok((format!("{}:{}", host, port), url.to_string(), credentials))
}

/// Stateful RTSP client over one connection.
///
/// Requests are strictly sequential: each call writes one request and reads
/// exactly one response before returning. `CSeq` starts at 1 and advances
/// once per sent request whatever the outcome. The `Session` id returned by
/// the server is attached to every following request until TEARDOWN succeeds.
pub struct Client<S = TcpStream> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    url: String,
    cseq: u32,
    session: Option<String>,
    session_timeout: Option<u64>,
    user_agent: String,
    authorization: Option<String>,
}

impl Client<TcpStream> {
    /// Dial the host named by `url` (`rtsp://[user:pass@]host[:port]/path`).
    pub async fn connect(url: &str) -> Result<Self> {
        let (addr, clean_url, credentials) = parse_rtsp_url(url)?;
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, url = %clean_url, "RTSP connection established");

        let mut client = Client::from_stream(stream, &clean_url);
        if let Some((user, pass)) = credentials {
            client.set_credentials(&user, &pass);
        }
        Ok(client)
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Wrap an already-connected stream.
    pub fn from_stream(stream: S, url: &str) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            url: url.to_string(),
            cseq: 1,
            session: None,
            session_timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            authorization: None,
        }
    }

    pub fn set_user_agent(&mut self, user_agent: &str) {
        self.user_agent = user_agent.to_string();
    }

    /// Use HTTP Basic credentials on every following request.
    pub fn set_credentials(&mut self, username: &str, password: &str) {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        self.authorization = Some(format!("Basic {}", token));
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sequence number the next request will carry.
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// `timeout=` advertised alongside the session id, in seconds.
    pub fn session_timeout(&self) -> Option<u64> {
        self.session_timeout
    }

    /// Send one request and wait for its response.
    pub async fn send_request(
        &mut self,
        method: Method,
        uri: &str,
        headers: Header,
        body: Vec<u8>,
    ) -> Result<Response> {
        let cseq = self.cseq;
        self.cseq = self.cseq.wrapping_add(1);

        let mut required = Header::new();
        required.set("CSeq", cseq.to_string());
        required.set("User-Agent", self.user_agent.as_str());
        if let Some(auth) = &self.authorization {
            required.set("Authorization", auth.as_str());
        }

        // Required fields lead on the wire and win over caller values.
        let mut request = Request::new(method, uri);
        request.header.extend(required.clone());
        request.header.extend(headers);
        request.header.extend(required);
        if let Some(session) = &self.session {
            request.header.set("Session", session.as_str());
        }
        request.body = body;

        trace!(method = %request.method, uri, cseq, "sending RTSP request");
        self.writer.write_all(&request.serialize()).await?;
        self.writer.flush().await?;

        let response = read_response(&mut self.reader).await?;
        debug!(
            method = %request.method,
            cseq,
            status = response.status_code,
            "RTSP response"
        );

        if let Some(value) = response.header.get("Session") {
            let mut parts = value.split(';').map(str::trim);
            if let Some(id) = parts.next().filter(|id| !id.is_empty()) {
                self.session = Some(id.to_string());
            }
            for param in parts {
                if let Some(t) = param.strip_prefix("timeout=") {
                    self.session_timeout = t.parse().ok();
                }
            }
        }

        Ok(response)
    }

    async fn simple(&mut self, method: Method, uri: Option<&str>) -> Result<Response> {
        let uri = uri.map(str::to_string).unwrap_or_else(|| self.url.clone());
        self.send_request(method, &uri, Header::new(), Vec::new()).await
    }

    pub async fn options(&mut self) -> Result<Response> {
        self.simple(Method::Options, None).await
    }

    pub async fn describe(&mut self) -> Result<Response> {
        let mut headers = Header::new();
        headers.set("Accept", "application/sdp");
        let url = self.url.clone();
        self.send_request(Method::Describe, &url, headers, Vec::new()).await
    }

    /// SETUP `uri` with the given `Transport` header value.
    pub async fn setup(&mut self, uri: &str, transport: &str) -> Result<Response> {
        let mut headers = Header::new();
        headers.set("Transport", transport);
        self.send_request(Method::Setup, uri, headers, Vec::new()).await
    }

    pub async fn play(&mut self, range: Option<&str>) -> Result<Response> {
        let mut headers = Header::new();
        headers.set("Range", range.unwrap_or("npt=0.000-"));
        let url = self.url.clone();
        self.send_request(Method::Play, &url, headers, Vec::new()).await
    }

    pub async fn pause(&mut self) -> Result<Response> {
        self.simple(Method::Pause, None).await
    }

    pub async fn teardown(&mut self) -> Result<Response> {
        let response = self.simple(Method::Teardown, None).await?;
        if response.is_success() {
            self.session = None;
            self.session_timeout = None;
        }
        Ok(response)
    }

    pub async fn announce(&mut self, sdp: &str) -> Result<Response> {
        let mut headers = Header::new();
        headers.set("Content-Type", "application/sdp");
        let url = self.url.clone();
        self.send_request(Method::Announce, &url, headers, sdp.as_bytes().to_vec())
            .await
    }

    pub async fn record(&mut self) -> Result<Response> {
        let mut headers = Header::new();
        headers.set("Range", "npt=0.000-");
        let url = self.url.clone();
        self.send_request(Method::Record, &url, headers, Vec::new()).await
    }

    /// GET_PARAMETER; an empty `params` acts as a session keep-alive.
    pub async fn get_parameter(&mut self, params: &str) -> Result<Response> {
        let mut headers = Header::new();
        if !params.is_empty() {
            headers.set("Content-Type", "text/parameters");
        }
        let url = self.url.clone();
        self.send_request(Method::GetParameter, &url, headers, params.as_bytes().to_vec())
            .await
    }

    pub async fn set_parameter(&mut self, params: &str) -> Result<Response> {
        let mut headers = Header::new();
        headers.set("Content-Type", "text/parameters");
        let url = self.url.clone();
        self.send_request(Method::SetParameter, &url, headers, params.as_bytes().to_vec())
            .await
    }

    /// Flush and shut down the write side of the connection.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
