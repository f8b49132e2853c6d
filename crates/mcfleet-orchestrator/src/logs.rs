//! Per-instance log fan-out: one pump task demultiplexes the engine's framed
//! log stream into lines and broadcasts them, interleaved with command-channel
//! echo events, to any number of subscribers.

use bytes::{Buf, BytesMut};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mcfleet_common::{ByteStream, LogEvent, LogSource};

/// Broadcast buffer per instance; slow subscribers that lag past this many
/// events observe a gap, not backpressure on the pump.
const CHANNEL_CAPACITY: usize = 1000;

const HEADER_LEN: usize = 8;
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

pub struct LogMultiplexer {
    channels: DashMap<String, broadcast::Sender<LogEvent>>,
    pumps: DashMap<String, JoinHandle<()>>,
}

impl Default for LogMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogMultiplexer {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            pumps: DashMap::new(),
        }
    }

    fn sender(&self, instance_id: &str) -> broadcast::Sender<LogEvent> {
        self.channels
            .entry(instance_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish one line into the instance's channel. Used by the command
    /// session for echo/response events; needs no subscriber to exist.
    pub fn publish(&self, instance_id: &str, source: LogSource, line: &str) {
        let cleaned = clean_line(line);
        if cleaned.is_empty() {
            return;
        }
        let _ = self.sender(instance_id).send(LogEvent {
            line: cleaned,
            timestamp: Utc::now(),
            source,
        });
    }

    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<LogEvent> {
        self.sender(instance_id).subscribe()
    }

    /// Whether a live pump is already feeding this instance's channel.
    pub fn pump_active(&self, instance_id: &str) -> bool {
        self.pumps
            .get(instance_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the single pump for an instance from a freshly opened raw
    /// stream. A raced second call drops its stream and keeps the live pump.
    pub fn spawn_pump(&self, instance_id: &str, raw: ByteStream) {
        match self.pumps.entry(instance_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_finished() {
                    let sender = self.sender(instance_id);
                    entry.insert(tokio::spawn(pump(instance_id.to_string(), raw, sender)));
                }
            }
            Entry::Vacant(entry) => {
                let sender = self.sender(instance_id);
                entry.insert(tokio::spawn(pump(instance_id.to_string(), raw, sender)));
            }
        }
    }

    /// Drop the instance's channel and pump; used when the instance is
    /// removed from the fleet.
    pub fn close(&self, instance_id: &str) {
        if let Some((_, handle)) = self.pumps.remove(instance_id) {
            handle.abort();
        }
        self.channels.remove(instance_id);
    }
}

async fn pump(instance_id: String, mut raw: ByteStream, sender: broadcast::Sender<LogEvent>) {
    let mut decoder = LogFrameDecoder::new();
    while let Some(chunk) = raw.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(%instance_id, error = %e, "log stream error");
                return;
            }
        };
        for payload in decoder.feed(&chunk) {
            for line in payload.lines() {
                let cleaned = clean_line(line);
                if cleaned.is_empty() {
                    continue;
                }
                let event = LogEvent {
                    line: cleaned,
                    timestamp: Utc::now(),
                    source: LogSource::Server,
                };
                if sender.send(event).is_err() {
                    // Last subscriber detached; dropping the stream reclaims it.
                    debug!(%instance_id, "no log subscribers left, closing stream");
                    return;
                }
            }
        }
    }
    debug!(%instance_id, "log stream ended");
}

/// Reassembles the engine's multiplexed log framing across arbitrary chunk
/// boundaries: an 8-byte header (1 stream-type byte, 3 reserved, u32
/// big-endian payload length) followed by that many bytes of UTF-8 text.
/// Only stdout/stderr frames are emitted.
pub(crate) struct LogFrameDecoder {
    buf: BytesMut,
}

impl LogFrameDecoder {
    pub(crate) fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let stream_type = self.buf[0];
            let length =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if self.buf.len() < HEADER_LEN + length {
                break;
            }
            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(length);
            if stream_type == STREAM_STDOUT || stream_type == STREAM_STDERR {
                payloads.push(String::from_utf8_lossy(&payload).into_owned());
            }
        }
        payloads
    }
}

/// Strip ANSI control sequences and surrounding whitespace from a log line.
pub(crate) fn clean_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for terminator in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&terminator) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out.trim().to_string()
}
