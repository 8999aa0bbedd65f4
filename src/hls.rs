//! Sliding-window HLS output: numbered `.ts` segments plus `playlist.m3u8`.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::HlsConfig;
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::rtp::RtpInfo;

pub const PLAYLIST_NAME: &str = "playlist.m3u8";

const RTP_CLOCK_RATE: u32 = 90_000;

pub fn segment_name(sequence: u64) -> String {
    format!("segment_{}.ts", sequence)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub sequence: u64,
    pub duration_secs: f64,
}

impl SegmentEntry {
    pub fn file_name(&self) -> String {
        segment_name(self.sequence)
    }
}

struct OpenSegment {
    sequence: u64,
    start_timestamp: u32,
    last_timestamp: u32,
    file: fs::File,
}

/// Render a live playlist for the given window, oldest segment first.
pub fn render_playlist(target_duration_secs: u32, window: &VecDeque<SegmentEntry>) -> String {
    let longest = window
        .iter()
        .map(|s| s.duration_secs.ceil() as u32)
        .max()
        .unwrap_or(0);
    let media_sequence = window.front().map(|s| s.sequence).unwrap_or(0);

    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", target_duration_secs.max(longest));
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", media_sequence);
    for segment in window {
        let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration_secs);
        out.push_str(&segment.file_name());
        out.push('\n');
    }
    out
}

/// Writes RTP payloads into rotating segment files.
///
/// A segment closes once the RTP clock has advanced `target_duration` past
/// its first packet, and lasts until the packet that opens the next one. Only
/// closed segments appear in the playlist, and files that fall out of the
/// window are removed from disk.
pub struct HlsSegmenter {
    dir: PathBuf,
    target_duration_secs: u32,
    window_size: usize,
    next_sequence: u64,
    /// Last observed frame spacing in RTP ticks, used to end the final segment.
    frame_interval: u32,
    current: Option<OpenSegment>,
    window: VecDeque<SegmentEntry>,
}

impl HlsSegmenter {
    pub fn new(config: &HlsConfig) -> Self {
        Self {
            dir: config.output_dir.clone(),
            target_duration_secs: config.target_duration_secs.max(1),
            window_size: config.window_size.max(1),
            next_sequence: 0,
            frame_interval: 0,
            current: None,
            window: VecDeque::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn window(&self) -> &VecDeque<SegmentEntry> {
        &self.window
    }

    pub async fn write_packet(&mut self, packet: &RtpInfo) -> Result<()> {
        let target_ticks = u64::from(self.target_duration_secs) * u64::from(RTP_CLOCK_RATE);
        let rotate = match &self.current {
            Some(segment) => {
                u64::from(packet.timestamp.wrapping_sub(segment.start_timestamp)) >= target_ticks
            }
            None => false,
        };
        if let Some(segment) = &self.current {
            let delta = packet.timestamp.wrapping_sub(segment.last_timestamp);
            if delta > 0 && delta < RTP_CLOCK_RATE {
                self.frame_interval = delta;
            }
        }
        if rotate {
            self.close_segment(packet.timestamp).await?;
        }
        if self.current.is_none() {
            self.open_segment(packet.timestamp).await?;
        }

        if let Some(segment) = self.current.as_mut() {
            segment.file.write_all(&packet.payload).await?;
            segment.last_timestamp = packet.timestamp;
        }
        Ok(())
    }

    /// Close the segment in progress, if any, and publish it. With no next
    /// packet to end it, the last frame is counted at the observed spacing.
    pub async fn finish(&mut self) -> Result<()> {
        if let Some(segment) = &self.current {
            let end = segment.last_timestamp.wrapping_add(self.frame_interval);
            self.close_segment(end).await?;
        }
        Ok(())
    }

    async fn open_segment(&mut self, start_timestamp: u32) -> Result<()> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let file = fs::File::create(self.dir.join(segment_name(sequence))).await?;
        debug!(sequence, "opened hls segment");
        self.current = Some(OpenSegment {
            sequence,
            start_timestamp,
            last_timestamp: start_timestamp,
            file,
        });
        Ok(())
    }

    async fn close_segment(&mut self, end_timestamp: u32) -> Result<()> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };
        segment.file.flush().await?;

        let ticks = end_timestamp.wrapping_sub(segment.start_timestamp);
        self.window.push_back(SegmentEntry {
            sequence: segment.sequence,
            duration_secs: ticks as f64 / RTP_CLOCK_RATE as f64,
        });
        MetricsCollector::record_hls_segment();

        while self.window.len() > self.window_size {
            if let Some(expired) = self.window.pop_front() {
                let path = self.dir.join(expired.file_name());
                if let Err(e) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), "failed to remove expired segment: {}", e);
                }
            }
        }

        self.write_playlist().await
    }

    async fn write_playlist(&self) -> Result<()> {
        let body = render_playlist(self.target_duration_secs, &self.window);
        let tmp = self.dir.join(format!("{}.tmp", PLAYLIST_NAME));
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, self.dir.join(PLAYLIST_NAME)).await?;
        Ok(())
    }
}
