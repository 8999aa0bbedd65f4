//! RTSP/1.0 message codec (RFC 2326).
//!
//! RTSP messages follow HTTP/1.1 framing with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/stream RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! [`read_request`]/[`read_response`] parse one message from any
//! `AsyncBufRead`; `serialize` on [`Request`]/[`Response`] produces wire bytes.

pub mod header;
pub mod message;
pub mod sdp;
pub mod transport;

pub use header::Header;
pub use message::{read_request, read_response, Method, Request, Response, RTSP_VERSION};
pub use sdp::SessionDescription;
pub use transport::TransportSpec;
