//! FLV byte construction for live HTTP delivery.
//!
//! A stream is the 9-byte file header, `PreviousTagSize0`, then a sequence of
//! tags each followed by its 4-byte back-reference size.

use bytes::{BufMut, Bytes, BytesMut};

use crate::rtp::RtpInfo;

pub const FLV_HEADER_SIZE: u32 = 9;
pub const TAG_HEADER_SIZE: usize = 11;
pub const TAG_TYPE_VIDEO: u8 = 9;
pub const FLV_FLAG_VIDEO: u8 = 0x01;

/// Frame type nibble values.
pub const FRAME_KEY: u8 = 1;
pub const FRAME_INTER: u8 = 2;
pub const CODEC_AVC: u8 = 7;
/// AVCPacketType: NALU.
pub const AVC_NALU: u8 = 1;

/// RTP video clock ticks per millisecond.
const RTP_TICKS_PER_MS: u32 = 90;

/// The file header for a video-only stream, followed by `PreviousTagSize0`.
pub fn stream_header() -> Bytes {
    let mut buf = BytesMut::with_capacity(FLV_HEADER_SIZE as usize + 4);
    buf.put_slice(b"FLV");
    buf.put_u8(1);
    buf.put_u8(FLV_FLAG_VIDEO);
    buf.put_u32(FLV_HEADER_SIZE);
    buf.put_u32(0);
    buf.freeze()
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

/// Build one AVC NALU video tag plus its trailing PreviousTagSize.
pub fn video_tag(payload: &[u8], timestamp_ms: u32, keyframe: bool) -> Bytes {
    // frame/codec byte, AVCPacketType, 24-bit composition time
    let data_size = 5 + payload.len();
    let mut buf = BytesMut::with_capacity(TAG_HEADER_SIZE + data_size + 4);

    buf.put_u8(TAG_TYPE_VIDEO);
    put_u24(&mut buf, data_size as u32);
    put_u24(&mut buf, timestamp_ms & 0x00FF_FFFF);
    buf.put_u8((timestamp_ms >> 24) as u8);
    put_u24(&mut buf, 0);

    let frame_type = if keyframe { FRAME_KEY } else { FRAME_INTER };
    buf.put_u8((frame_type << 4) | CODEC_AVC);
    buf.put_u8(AVC_NALU);
    put_u24(&mut buf, 0);
    buf.put_slice(payload);

    buf.put_u32((TAG_HEADER_SIZE + data_size) as u32);
    buf.freeze()
}

/// Turns RTP packets into FLV tags with timestamps relative to the first
/// packet seen.
#[derive(Debug, Default)]
pub struct FlvEncoder {
    base_timestamp: Option<u32>,
}

impl FlvEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, packet: &RtpInfo) -> Bytes {
        let base = *self.base_timestamp.get_or_insert(packet.timestamp);
        let elapsed_ms = packet.timestamp.wrapping_sub(base) / RTP_TICKS_PER_MS;
        video_tag(&packet.payload, elapsed_ms, packet.marker)
    }
}
