// Receive-side frame accumulation
//
// Bytes read from the transport are appended to a bounded buffer. `frames()` walks
// the buffer from the start and yields decoded frames; whatever it consumed is
// dropped from the buffer when the iterator goes away, and a trailing partial frame
// stays put until the next tick completes it.

use tracing::{debug, info, warn};

use super::protocol::{
    decode_frame, frame_len, hex, is_supported_length, FrameError, ParsedFrame, MAX_FRAME_LEN,
    MIN_FRAME_LEN, START_ERR, START_OK,
};

/// Default receive buffer capacity
pub const DEFAULT_RX_CAPACITY: usize = 1024;

pub struct FrameReceiver {
    buf: Vec<u8>,
    capacity: usize,
    trace: bool,
}

impl FrameReceiver {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RX_CAPACITY)
    }

    /// Capacity is raised to one maximal frame if smaller
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MAX_FRAME_LEN);
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            trace: false,
        }
    }

    /// Log every received chunk as hex
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Bytes retained from earlier ticks and not yet consumed
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append freshly read bytes.
    ///
    /// If they do not fit, the retained bytes are dropped first (they are the
    /// oldest and most likely stale), then anything past capacity.
    pub fn extend(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.trace {
            info!("received: {}", hex(bytes));
        }

        if self.buf.len() + bytes.len() > self.capacity {
            warn!(
                "Receive buffer overflow: dropping {} retained bytes",
                self.buf.len()
            );
            self.buf.clear();
        }
        let take = bytes.len().min(self.capacity);
        if take < bytes.len() {
            warn!(
                "Receive buffer overflow: dropping {} incoming bytes",
                bytes.len() - take
            );
        }
        self.buf.extend_from_slice(&bytes[..take]);
    }

    /// Decode frames from the start of the buffer.
    ///
    /// Recoverable errors are yielded in place so the caller can report them;
    /// parsing carries on after each one. Iteration stops at a partial frame.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            rx: self,
            offset: 0,
            done: false,
        }
    }
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Frames<'a> {
    rx: &'a mut FrameReceiver,
    offset: usize,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<ParsedFrame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let buf = &self.rx.buf;
        if buf.len() - self.offset < MIN_FRAME_LEN {
            self.done = true;
            return None;
        }

        match decode_frame(buf, self.offset) {
            Ok((frame, consumed)) => {
                self.offset += consumed;
                Some(Ok(frame))
            }
            Err(FrameError::Truncated { needed, available }) => {
                let declared = buf[self.offset + 1];
                // only lengths the ESC can send are worth waiting for; any other
                // split frame is treated as a corrupt length and dropped
                if is_supported_length(declared) {
                    debug!("Partial frame: retaining {} of {} bytes", available, needed);
                } else {
                    warn!(
                        "Corrupt frame length {} ({} bytes needed, {} available), discarding buffer",
                        declared, needed, available
                    );
                    self.offset = buf.len();
                }
                self.done = true;
                None
            }
            Err(err @ FrameError::ChecksumMismatch { length, .. }) => {
                self.offset += frame_len(length);
                Some(Err(err))
            }
            Err(err @ FrameError::UnknownMarker { .. }) => {
                // resync on the next byte that could start an ESC frame
                let skip = buf[self.offset + 1..]
                    .iter()
                    .position(|&b| b == START_OK || b == START_ERR)
                    .map_or(buf.len() - self.offset, |p| p + 1);
                self.offset += skip;
                Some(Err(err))
            }
        }
    }
}

impl Drop for Frames<'_> {
    fn drop(&mut self) {
        self.rx.buf.drain(..self.offset);
    }
}
