use async_trait::async_trait;

use super::session::Session;
use crate::error::Result;
use crate::protocol::sdp::default_sdp;
use crate::protocol::{Method, Request, Response, TransportSpec};

/// Nominal server ports advertised by the canned SETUP answer.
pub const DEFAULT_SERVER_PORTS: (u16, u16) = (6970, 6971);

/// Comma-separated method list for `Public` and `Allow`.
pub fn public_methods() -> String {
    Method::ALL.iter().map(Method::as_str).collect::<Vec<_>>().join(", ")
}

/// Per-verb request handling. Every method has a protocol-correct canned
/// answer, so implementors override only the verbs they care about.
///
/// An `Err` is turned into `500 Internal Server Error` by the server; it never
/// closes the connection.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn options(&self, _req: &Request, _session: &Session) -> Result<Response> {
        Ok(Response::ok().with_header("Public", public_methods()))
    }

    async fn describe(&self, req: &Request, session: &Session) -> Result<Response> {
        let host = session.local_addr.ip().to_string();
        let base = if req.uri.ends_with('/') {
            req.uri.clone()
        } else {
            format!("{}/", req.uri)
        };
        Ok(Response::ok()
            .with_header("Content-Base", base)
            .with_body("application/sdp", default_sdp(&host)))
    }

    async fn setup(&self, req: &Request, session: &Session) -> Result<Response> {
        let mut transport = req
            .header
            .get("Transport")
            .map(TransportSpec::parse)
            .unwrap_or_else(|| TransportSpec {
                profile: "RTP/AVP".to_string(),
                ..Default::default()
            });
        transport.server_port = Some(DEFAULT_SERVER_PORTS);
        Ok(Response::ok()
            .with_header("Transport", transport.to_string())
            .with_header("Session", session.header_value()))
    }

    async fn play(&self, req: &Request, session: &Session) -> Result<Response> {
        let range = req.header.get("Range").unwrap_or("npt=0.000-").to_string();
        Ok(Response::ok()
            .with_header("Session", session.header_value())
            .with_header("Range", range))
    }

    async fn pause(&self, _req: &Request, session: &Session) -> Result<Response> {
        Ok(Response::ok().with_header("Session", session.header_value()))
    }

    async fn teardown(&self, _req: &Request, session: &Session) -> Result<Response> {
        Ok(Response::ok().with_header("Session", session.id.to_string()))
    }

    async fn announce(&self, _req: &Request, session: &Session) -> Result<Response> {
        Ok(Response::ok().with_header("Session", session.header_value()))
    }

    async fn record(&self, _req: &Request, session: &Session) -> Result<Response> {
        Ok(Response::ok().with_header("Session", session.header_value()))
    }

    /// An empty body is a keepalive.
    async fn get_parameter(&self, _req: &Request, session: &Session) -> Result<Response> {
        Ok(Response::ok().with_header("Session", session.header_value()))
    }

    async fn set_parameter(&self, _req: &Request, session: &Session) -> Result<Response> {
        Ok(Response::ok().with_header("Session", session.header_value()))
    }

    async fn redirect(&self, _req: &Request, _session: &Session) -> Result<Response> {
        Ok(Response::ok())
    }
}

/// Uses every canned answer, making the server usable standalone.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}

/// Route a request to the handler method for its verb. Methods outside
/// RFC 2326 never reach the handler.
pub async fn dispatch(handler: &dyn Handler, req: &Request, session: &Session) -> Result<Response> {
    match &req.method {
        Method::Options => handler.options(req, session).await,
        Method::Describe => handler.describe(req, session).await,
        Method::Setup => handler.setup(req, session).await,
        Method::Play => handler.play(req, session).await,
        Method::Pause => handler.pause(req, session).await,
        Method::Teardown => handler.teardown(req, session).await,
        Method::Announce => handler.announce(req, session).await,
        Method::Record => handler.record(req, session).await,
        Method::GetParameter => handler.get_parameter(req, session).await,
        Method::SetParameter => handler.set_parameter(req, session).await,
        Method::Redirect => handler.redirect(req, session).await,
        Method::Extension(_) => {
            Ok(Response::method_not_allowed().with_header("Allow", public_methods()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::net::SocketAddr;

    fn session() -> Session {
        Session::new(
            SocketAddr::from(([127, 0, 0, 1], 40000)),
            SocketAddr::from(([127, 0, 0, 1], 8554)),
            60,
        )
    }

    #[tokio::test]
    async fn default_handler_answers_every_method() {
        let session = session();
        for method in Method::ALL {
            let req = Request::new(method.clone(), "rtsp://127.0.0.1:8554/live");
            let resp = dispatch(&DefaultHandler, &req, &session).await.unwrap();
            assert!(resp.is_success(), "{} -> {}", method, resp.status_code);
        }
    }

    #[tokio::test]
    async fn extension_method_is_not_allowed() {
        let req = Request::new(Method::from("FLUSH"), "*");
        let resp = dispatch(&DefaultHandler, &req, &session()).await.unwrap();
        assert_eq!(resp.status_code, 405);
        assert!(resp.header.get("Allow").unwrap().contains("GET_PARAMETER"));
    }

    #[tokio::test]
    async fn setup_echoes_transport_with_server_port() {
        let session = session();
        let mut req = Request::new(Method::Setup, "rtsp://127.0.0.1:8554/live/track1");
        req.header.set("Transport", "RTP/AVP;unicast;client_port=8000-8001");

        let resp = dispatch(&DefaultHandler, &req, &session).await.unwrap();
        assert_eq!(
            resp.header.get("Transport"),
            Some("RTP/AVP;unicast;client_port=8000-8001;server_port=6970-6971")
        );
        assert_eq!(resp.header.get("Session"), Some(session.header_value().as_str()));
    }

    #[tokio::test]
    async fn describe_returns_sdp() {
        let req = Request::new(Method::Describe, "rtsp://127.0.0.1:8554/live");
        let resp = dispatch(&DefaultHandler, &req, &session()).await.unwrap();
        assert_eq!(resp.header.get("Content-Type"), Some("application/sdp"));
        assert_eq!(resp.header.get("Content-Base"), Some("rtsp://127.0.0.1:8554/live/"));
        assert!(resp.body_text().contains("m=video 0 RTP/AVP 96"));
    }

    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        async fn play(&self, _req: &Request, _session: &Session) -> Result<Response> {
            Err(RelayError::Handler("no media".into()))
        }
    }

    #[tokio::test]
    async fn overrides_replace_only_their_verb() {
        let session = session();
        let play = Request::new(Method::Play, "rtsp://h/live");
        assert!(dispatch(&Failing, &play, &session).await.is_err());
        let options = Request::new(Method::Options, "*");
        assert!(dispatch(&Failing, &options, &session).await.unwrap().is_success());
    }
}
