use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

use crate::metrics::MetricsCollector;

/// Capacity of every packet channel between pipeline stages.
pub const PACKET_CHANNEL_CAPACITY: usize = 1024;

const RTP_HEADER_LEN: usize = 12;

/// One received RTP packet with its header fields decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpInfo {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload_type: u8,
    pub marker: bool,
    pub payload: Bytes,
}

impl RtpInfo {
    /// Parse an RFC 3550 packet: 12-byte fixed header, CSRC list, optional
    /// extension header, payload, optional padding.
    ///
    /// Returns `None` for anything that is not a well-formed version 2 packet.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_LEN {
            return None;
        }

        let version = (data[0] >> 6) & 0x03;
        if version != 2 {
            return None;
        }

        let padding = (data[0] >> 5) & 0x01 != 0;
        let extension = (data[0] >> 4) & 0x01 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;
        let marker = (data[1] >> 7) & 0x01 != 0;
        let payload_type = data[1] & 0x7F;

        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut payload_start = RTP_HEADER_LEN + csrc_count * 4;
        if extension {
            if data.len() < payload_start + 4 {
                return None;
            }
            let ext_words =
                u16::from_be_bytes([data[payload_start + 2], data[payload_start + 3]]) as usize;
            payload_start += 4 + ext_words * 4;
        }
        if payload_start > data.len() {
            return None;
        }

        let mut payload_end = data.len();
        if padding {
            let padding_len = data[data.len() - 1] as usize;
            if padding_len == 0 || padding_len > payload_end - payload_start {
                return None;
            }
            payload_end -= padding_len;
        }

        Some(RtpInfo {
            sequence_number,
            timestamp,
            ssrc,
            payload_type,
            marker,
            payload: Bytes::copy_from_slice(&data[payload_start..payload_end]),
        })
    }
}

/// RTCP common header (RFC 3550 §6.4): enough to acknowledge receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub packet_type: u8,
    pub count: u8,
    /// Length of this packet in bytes, header included.
    pub length: usize,
}

impl RtcpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 4 || (data[0] >> 6) != 2 {
            return None;
        }
        let words = u16::from_be_bytes([data[2], data[3]]) as usize;
        Some(RtcpHeader {
            packet_type: data[1],
            count: data[0] & 0x1F,
            length: (words + 1) * 4,
        })
    }
}

pub fn packet_channel() -> (PacketSender, mpsc::Receiver<RtpInfo>) {
    let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
    (PacketSender::new(tx, "ingest"), rx)
}

/// Producer side of a packet channel that never waits for the consumer.
///
/// When the channel is full the packet is dropped: live media prefers fresh
/// packets over complete delivery.
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<RtpInfo>,
    stage: &'static str,
}

impl PacketSender {
    pub fn new(tx: mpsc::Sender<RtpInfo>, stage: &'static str) -> Self {
        Self { tx, stage }
    }

    /// Enqueue without blocking. Returns `false` if the packet was dropped.
    pub fn push(&self, packet: RtpInfo) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                trace!(stage = self.stage, seq = packet.sequence_number, "channel full, dropping packet");
                MetricsCollector::record_packet_dropped(self.stage);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Free slots left in the channel.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}
