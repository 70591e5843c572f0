//! Byte-stream to message framing
//!
//! Turns arbitrarily chunked MIDI 1.0 input into channel-voice [`Message`]s.
//! Handles running status, keeps an incomplete trailing message across calls
//! and drops System Real-Time bytes in place without disturbing the message
//! they interrupt.

use tracing::{debug, trace, warn};

use crate::midi::{format_hex, Message, StatusByte};

/// Counters for conditions the framer logs and skips
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Data bytes dropped because no running status was established
    pub discarded_data: u64,
    /// System Real-Time bytes recognized and dropped
    pub real_time_dropped: u64,
    /// System Common / SysEx status bytes (unsupported)
    pub unsupported_status: u64,
    /// Messages cut short by a new status byte
    pub abandoned: u64,
}

/// Stateful MIDI stream decoder.
///
/// Not safe for concurrent `feed` calls; wrap it in a lock if more than one
/// thread can deliver bytes.
#[derive(Debug, Default)]
pub struct MessageFramer {
    running_status: Option<StatusByte>,
    /// Status byte plus the data bytes of a message still missing data
    pending: Vec<u8>,
    scratch: Vec<u8>,
    events: Vec<Message>,
    stats: FramerStats,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk of the stream.
    ///
    /// The returned slice borrows the framer's event buffer and is valid until
    /// the next call. Zero-length chunks are a no-op.
    pub fn feed(&mut self, bytes: &[u8]) -> &[Message] {
        self.events.clear();
        if bytes.is_empty() {
            return &self.events;
        }

        self.scratch.clear();
        self.scratch.extend_from_slice(&self.pending);
        self.scratch.extend_from_slice(bytes);
        self.pending.clear();

        let mut data = [0u8; 2];
        let mut have = 0usize;
        let mut discarded = 0u64;

        for &byte in self.scratch.iter() {
            let Some(status) = StatusByte::new(byte) else {
                let Some(running) = self.running_status else {
                    discarded += 1;
                    continue;
                };

                data[have] = byte;
                have += 1;

                let needed = running.data_len().unwrap_or(2) as usize;
                if have == needed {
                    if let Some(msg) = Message::new(running, data[0], data[1]) {
                        self.events.push(msg);
                    }
                    have = 0;
                }
                continue;
            };

            if status.is_real_time() {
                self.stats.real_time_dropped += 1;
                trace!("Dropping real-time byte {:02X}", byte);
                continue;
            }

            if have > 0 {
                self.stats.abandoned += 1;
                debug!(
                    "Incomplete message abandoned by new status {:02X}: {}",
                    byte,
                    format_hex(&data[..have])
                );
                have = 0;
            }

            if status.data_len().is_some() {
                self.running_status = Some(status);
            } else {
                // System Common cancels running status; its payload is skipped
                // as leading data until the next channel-voice status.
                self.stats.unsupported_status += 1;
                self.running_status = None;
                warn!("Unsupported MIDI status {:02X} skipped", byte);
            }
        }

        if have > 0 {
            if let Some(running) = self.running_status {
                self.pending.push(running.value());
                self.pending.extend_from_slice(&data[..have]);
            }
        }

        if discarded > 0 {
            self.stats.discarded_data += discarded;
            warn!("Discarded {} MIDI data byte(s) with no running status", discarded);
        }

        &self.events
    }

    /// Forget running status and any partial message (new port binding)
    pub fn reset(&mut self) {
        self.running_status = None;
        self.pending.clear();
    }

    pub fn running_status(&self) -> Option<StatusByte> {
        self.running_status
    }

    /// Bytes carried over from the last chunk
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }
}
