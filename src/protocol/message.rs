use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::header::Header;
use crate::error::{RelayError, Result};

pub const RTSP_VERSION: &str = "RTSP/1.0";

/// Upper bound on a single start or header line; protects the reader from
/// a peer that never sends a newline.
const MAX_LINE_LEN: usize = 8 * 1024;

/// Upper bound on a `Content-Length` body.
const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

/// RTSP request method. Methods outside RFC 2326 are kept verbatim in
/// [`Method::Extension`] so they survive a parse/serialize round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    Announce,
    Record,
    GetParameter,
    SetParameter,
    Redirect,
    Extension(String),
}

impl Method {
    /// Every method defined by RFC 2326.
    pub const ALL: [Method; 11] = [
        Method::Options,
        Method::Describe,
        Method::Setup,
        Method::Play,
        Method::Pause,
        Method::Teardown,
        Method::Announce,
        Method::Record,
        Method::GetParameter,
        Method::SetParameter,
        Method::Redirect,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::Announce => "ANNOUNCE",
            Method::Record => "RECORD",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Redirect => "REDIRECT",
            Method::Extension(m) => m,
        }
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        Method::ALL
            .iter()
            .find(|m| m.as_str() == s)
            .cloned()
            .unwrap_or_else(|| Method::Extension(s.to_string()))
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Method::from(s))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub header: Header,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: RTSP_VERSION.to_string(),
            header: Header::new(),
            body: Vec::new(),
        }
    }

    /// Numeric `CSeq`, if present and well-formed.
    pub fn cseq(&self) -> Option<u32> {
        self.header.get("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// Session id from the `Session` header with any `;timeout=` suffix removed.
    pub fn session_id(&self) -> Option<&str> {
        self.header
            .get("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
    }

    pub fn serialize(&self) -> Vec<u8> {
        let start = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        serialize_message(start, &self.header, &self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub status_code: u16,
    pub status_text: String,
    pub header: Header,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status_code: u16, status_text: impl Into<String>) -> Self {
        Self {
            version: RTSP_VERSION.to_string(),
            status_code,
            status_text: status_text.into(),
            header: Header::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn session_not_found() -> Self {
        Self::new(454, "Session Not Found")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(405, "Method Not Allowed")
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    /// Builder-style header setter.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.header.set(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.header.set("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header.get("CSeq").and_then(|v| v.trim().parse().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let start = format!("{} {} {}\r\n", self.version, self.status_code, self.status_text);
        serialize_message(start, &self.header, &self.body)
    }
}

fn serialize_message(start: String, header: &Header, body: &[u8]) -> Vec<u8> {
    let mut out = start.into_bytes();
    for (key, value) in header.iter() {
        if key == "Content-Length" {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// Read one line, stripping the trailing `\r\n` or bare `\n`.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n >= MAX_LINE_LEN {
        return Err(RelayError::MalformedHeader("line too long".to_string()));
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Read the start line, skipping blank keep-alive lines between messages.
async fn read_start_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_line(reader).await? {
            None => return Err(RelayError::ConnectionClosed),
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return Ok(line),
        }
    }
}

/// Read header lines up to the blank separator. Continuation lines that
/// start with a space or tab are folded into the previous value.
async fn read_header<R>(reader: &mut R) -> Result<Header>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = Header::new();
    let mut last: Option<(String, String)> = None;

    loop {
        let line = match read_line(reader).await? {
            Some(line) => line,
            None => return Err(RelayError::ConnectionClosed),
        };
        if line.is_empty() {
            break;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            match last.as_mut() {
                Some((_, value)) => {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(RelayError::MalformedHeader(line)),
            }
        }

        if let Some((key, value)) = last.take() {
            header.add(&key, value);
        }

        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| RelayError::MalformedHeader(line.clone()))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(RelayError::MalformedHeader(line));
        }
        last = Some((key.to_string(), value.trim().to_string()));
    }

    if let Some((key, value)) = last {
        header.add(&key, value);
    }
    Ok(header)
}

/// Read exactly `Content-Length` bytes when the header is a positive integer.
async fn read_body<R>(reader: &mut R, header: &Header) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let len = match header
        .get("Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        Some(len) if len > 0 => len,
        _ => return Ok(Vec::new()),
    };
    if len > MAX_BODY_LEN {
        return Err(RelayError::MalformedHeader(format!(
            "Content-Length {} exceeds limit",
            len
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RelayError::ConnectionClosed
        } else {
            RelayError::Io(e)
        }
    })?;
    Ok(body)
}

/// Parse one RTSP request from a buffered byte stream.
pub async fn read_request<R>(reader: &mut R) -> Result<Request>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_start_line(reader).await?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(RelayError::MalformedStartLine(line));
    }

    let method = Method::from(parts[0]);
    let uri = parts[1].to_string();
    let version = parts[2].to_string();

    let header = read_header(reader).await?;
    let body = read_body(reader, &header).await?;

    Ok(Request {
        method,
        uri,
        version,
        header,
        body,
    })
}

/// Parse one RTSP response from a buffered byte stream.
pub async fn read_response<R>(reader: &mut R) -> Result<Response>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_start_line(reader).await?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(RelayError::MalformedStartLine(line));
    }

    let version = parts[0].to_string();
    let status_code = parts[1]
        .parse::<u16>()
        .map_err(|_| RelayError::InvalidStatusCode(parts[1].to_string()))?;
    let status_text = parts[2..].join(" ");

    let header = read_header(reader).await?;
    let body = read_body(reader, &header).await?;

    Ok(Response {
        version,
        status_code,
        status_text,
        header,
        body,
    })
}
