use std::fmt;

/// Parsed `Transport` header (RFC 2326 §12.39), unicast UDP profile only.
///
/// ```text
/// Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSpec {
    pub profile: String,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub interleaved: bool,
}

impl TransportSpec {
    pub fn udp(rtp_port: u16, rtcp_port: u16) -> Self {
        Self {
            profile: "RTP/AVP".to_string(),
            client_port: Some((rtp_port, rtcp_port)),
            server_port: None,
            interleaved: false,
        }
    }

    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(';').map(str::trim);
        let mut spec = TransportSpec {
            profile: parts.next().unwrap_or_default().to_string(),
            ..Default::default()
        };

        for part in parts {
            if let Some(ports) = part.strip_prefix("client_port=") {
                spec.client_port = parse_port_pair(ports);
            } else if let Some(ports) = part.strip_prefix("server_port=") {
                spec.server_port = parse_port_pair(ports);
            } else if part.starts_with("interleaved=") {
                spec.interleaved = true;
            }
        }
        spec
    }

    pub fn is_tcp(&self) -> bool {
        self.interleaved || self.profile.ends_with("/TCP")
    }
}

fn parse_port_pair(ports: &str) -> Option<(u16, u16)> {
    match ports.split_once('-') {
        Some((rtp, rtcp)) => Some((rtp.parse().ok()?, rtcp.parse().ok()?)),
        None => {
            let rtp: u16 = ports.parse().ok()?;
            Some((rtp, rtp.checked_add(1)?))
        }
    }
}

impl fmt::Display for TransportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};unicast", self.profile)?;
        if let Some((rtp, rtcp)) = self.client_port {
            write!(f, ";client_port={}-{}", rtp, rtcp)?;
        }
        if let Some((rtp, rtcp)) = self.server_port {
            write!(f, ";server_port={}-{}", rtp, rtcp)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_setup_transport() {
        assert_eq!(
            TransportSpec::udp(8000, 8001).to_string(),
            "RTP/AVP;unicast;client_port=8000-8001"
        );
    }

    #[test]
    fn parses_server_reply() {
        let t = TransportSpec::parse("RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001");
        assert_eq!(t.client_port, Some((8000, 8001)));
        assert_eq!(t.server_port, Some((5000, 5001)));
        assert!(!t.is_tcp());
    }

    #[test]
    fn detects_interleaved() {
        assert!(TransportSpec::parse("RTP/AVP/TCP;unicast;interleaved=0-1").is_tcp());
        assert_eq!(TransportSpec::parse("RTP/AVP;unicast").client_port, None);
    }
}
