//! SDP (RFC 4566) reading for DESCRIBE responses and a minimal writer for
//! the server's canned DESCRIBE answer.
//!
//! Only the fields the relay needs are extracted. Unknown lines are ignored.

pub const DEFAULT_VIDEO_CODEC: &str = "H264";
pub const DEFAULT_AUDIO_CODEC: &str = "AAC";
pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_FRAMERATE: f64 = 25.0;
pub const DEFAULT_BITRATE_KBPS: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Session,
    Video,
    Audio,
    Other,
}

/// Stream parameters advertised by an upstream source.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub video_codec: String,
    pub audio_codec: String,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub bitrate_kbps: u32,
    pub video_payload_type: Option<u8>,
    /// `a=control:` of the video media section.
    pub video_control: Option<String>,
}

impl Default for SessionDescription {
    fn default() -> Self {
        Self {
            video_codec: DEFAULT_VIDEO_CODEC.to_string(),
            audio_codec: DEFAULT_AUDIO_CODEC.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            framerate: DEFAULT_FRAMERATE,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            video_payload_type: None,
            video_control: None,
        }
    }
}

impl SessionDescription {
    pub fn parse(text: &str) -> Self {
        let mut sd = SessionDescription::default();
        let mut section = Section::Session;

        for line in text.lines().map(str::trim) {
            if let Some(media) = line.strip_prefix("m=") {
                let mut fields = media.split_whitespace();
                section = match fields.next() {
                    Some("video") => {
                        sd.video_payload_type = fields.nth(2).and_then(|pt| pt.parse().ok());
                        Section::Video
                    }
                    Some("audio") => Section::Audio,
                    _ => Section::Other,
                };
            } else if let Some(rtpmap) = line.strip_prefix("a=rtpmap:") {
                let codec = rtpmap
                    .split_whitespace()
                    .nth(1)
                    .and_then(|enc| enc.split('/').next())
                    .filter(|c| !c.is_empty());
                match (section, codec) {
                    (Section::Video, Some(c)) => sd.video_codec = c.to_uppercase(),
                    (Section::Audio, Some(c)) => sd.audio_codec = normalize_audio_codec(c),
                    _ => {}
                }
            } else if let Some(control) = line.strip_prefix("a=control:") {
                if section == Section::Video {
                    sd.video_control = Some(control.trim().to_string());
                }
            } else if let Some(rate) = line.strip_prefix("a=framerate:") {
                if let Ok(fps) = rate.trim().parse::<f64>() {
                    if fps > 0.0 {
                        sd.framerate = fps;
                    }
                }
            } else if let Some(dims) = line.strip_prefix("a=x-dimensions:") {
                if let Some((w, h)) = dims.split_once(',') {
                    if let (Ok(w), Ok(h)) = (w.trim().parse(), h.trim().parse()) {
                        sd.width = w;
                        sd.height = h;
                    }
                }
            } else if let Some(bw) = line.strip_prefix("b=AS:") {
                if matches!(section, Section::Session | Section::Video) {
                    if let Ok(kbps) = bw.trim().parse() {
                        sd.bitrate_kbps = kbps;
                    }
                }
            }
        }

        sd
    }

    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

fn normalize_audio_codec(codec: &str) -> String {
    if codec.eq_ignore_ascii_case("MPEG4-GENERIC") || codec.eq_ignore_ascii_case("MP4A-LATM") {
        DEFAULT_AUDIO_CODEC.to_string()
    } else {
        codec.to_uppercase()
    }
}

/// Resolve an `a=control:` value against the presentation base URL.
pub fn resolve_control(base: &str, control: &str) -> String {
    if control == "*" || control.is_empty() {
        return base.to_string();
    }
    if control.contains("://") {
        return control.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, control)
    } else {
        format!("{}/{}", base, control)
    }
}

/// Minimal single-video-track SDP used by the default DESCRIBE handler.
pub fn default_sdp(host: &str) -> String {
    let lines = [
        "v=0".to_string(),
        format!("o=- 0 0 IN IP4 {}", host),
        "s=rtsp-relay".to_string(),
        format!("c=IN IP4 {}", host),
        "t=0 0".to_string(),
        "m=video 0 RTP/AVP 96".to_string(),
        format!("a=rtpmap:96 {}/90000", DEFAULT_VIDEO_CODEC),
        "a=fmtp:96 packetization-mode=1".to_string(),
        "a=control:track1".to_string(),
    ];
    format!("{}\r\n", lines.join("\r\n"))
}
