//! Incremental frame reassembly for a raw transport byte stream.
//!
//! Serial adapters and BLE notifications deliver frames in arbitrary chunks:
//! split mid-frame, glued together, or interleaved with line noise. The
//! [`StreamReassembler`] is fed whatever arrives and emits complete validated
//! frames plus non-fatal error events; it never blocks and never gives up on
//! the stream.
//!
//! On anything structurally wrong it discards the partially matched bytes and
//! hunts for the next start marker rather than trying to salvage a frame from
//! data it cannot trust.

use crate::error::FrameError;
use crate::protocol::{self, ValidatedFrame, FRAME_OVERHEAD, START_BYTE};
use bytes::{Buf, BytesMut};
use std::time::{Duration, Instant};

/// How long a partial frame may sit in the buffer before it is abandoned.
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// One output of a [`StreamReassembler::push`] call, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete frame with valid markers, length and checksum.
    Frame(ValidatedFrame),
    /// A non-fatal framing error; the stream continues after it.
    Error(FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning for a start marker; nothing buffered.
    SeekingStart,
    /// Start marker seen, waiting for code and length bytes.
    ReadingHeader,
    /// Header complete, collecting the declared payload.
    ReadingPayload { payload_len: usize },
    /// Payload complete, collecting checksum and end marker.
    ReadingTail { payload_len: usize },
}

/// State machine turning byte chunks into validated frames.
///
/// One instance per transport connection, fed sequentially from a single
/// reader task.
#[derive(Debug)]
pub struct StreamReassembler {
    buffer: BytesMut,
    state: State,
    /// When the current partial frame started, `None` while seeking.
    started: Option<Instant>,
    timeout: Duration,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_FRAME_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            buffer: BytesMut::with_capacity(2 * protocol::MAX_FRAME_LENGTH),
            state: State::SeekingStart,
            started: None,
            timeout,
        }
    }

    /// Feed a chunk of transport bytes, returning all events it produced.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.push_at(chunk, Instant::now())
    }

    /// Abandon a stale partial frame without feeding new data.
    ///
    /// Useful for callers that poll a quiet transport; [`push`](Self::push)
    /// performs the same check on every feed.
    pub fn check_timeout(&mut self) -> Option<FrameError> {
        self.check_timeout_at(Instant::now())
    }

    /// Discard all buffered state, e.g. after a transport reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = State::SeekingStart;
        self.started = None;
    }

    fn push_at(&mut self, chunk: &[u8], now: Instant) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(err) = self.check_timeout_at(now) {
            events.push(StreamEvent::Error(err));
        }
        self.buffer.extend_from_slice(chunk);
        while self.step(&mut events, now) {}
        events
    }

    fn check_timeout_at(&mut self, now: Instant) -> Option<FrameError> {
        let started = self.started?;
        if now.duration_since(started) < self.timeout {
            return None;
        }
        log::warn!(
            "Partial frame abandoned after {:?} - state={:?} buffered={}",
            self.timeout,
            self.state,
            self.buffer.len()
        );
        self.reset();
        Some(FrameError::Timeout)
    }

    /// Run one state transition; returns false when more bytes are needed.
    fn step(&mut self, events: &mut Vec<StreamEvent>, now: Instant) -> bool {
        match self.state {
            State::SeekingStart => {
                match self.buffer.iter().position(|&b| b == START_BYTE) {
                    Some(0) => {}
                    Some(skipped) => {
                        log::debug!("Skipped {} noise bytes before start marker", skipped);
                        self.buffer.advance(skipped);
                        events.push(StreamEvent::Error(FrameError::BadStart));
                    }
                    None => {
                        if !self.buffer.is_empty() {
                            log::debug!("Discarded {} noise bytes", self.buffer.len());
                            self.buffer.clear();
                            events.push(StreamEvent::Error(FrameError::BadStart));
                        }
                        return false;
                    }
                }
                self.state = State::ReadingHeader;
                self.started = Some(now);
                true
            }
            State::ReadingHeader => {
                if self.buffer.len() < 3 {
                    return false;
                }
                self.state = State::ReadingPayload {
                    payload_len: self.buffer[2] as usize,
                };
                true
            }
            State::ReadingPayload { payload_len } => {
                if self.buffer.len() < 3 + payload_len {
                    return false;
                }
                self.state = State::ReadingTail { payload_len };
                true
            }
            State::ReadingTail { payload_len } => {
                let total = FRAME_OVERHEAD + payload_len;
                if self.buffer.len() < total {
                    return false;
                }
                // The candidate is consumed whatever the verdict: a frame
                // that fails validation is dropped, never salvaged.
                let event = match protocol::validate_frame(&self.buffer[..total]) {
                    Ok(frame) => {
                        log::trace!(
                            "Frame complete - code={:#04X} payload_len={}",
                            frame.code,
                            frame.payload.len()
                        );
                        StreamEvent::Frame(frame)
                    }
                    Err(err) => {
                        log::debug!("Dropping invalid frame candidate ({err})");
                        StreamEvent::Error(err)
                    }
                };
                self.buffer.advance(total);
                self.state = State::SeekingStart;
                self.started = None;
                events.push(event);
                true
            }
        }
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{checksum, END_BYTE};

    fn response_frame(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![START_BYTE, code, payload.len() as u8];
        raw.extend_from_slice(payload);
        let chk = checksum(&raw[1..]);
        raw.extend_from_slice(&chk.to_be_bytes());
        raw.push(END_BYTE);
        raw
    }

    fn frames_of(events: &[StreamEvent]) -> Vec<ValidatedFrame> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Frame(f) => Some(f.clone()),
                StreamEvent::Error(_) => None,
            })
            .collect()
    }

    fn errors_of(events: &[StreamEvent]) -> Vec<FrameError> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Error(err) => Some(*err),
                StreamEvent::Frame(_) => None,
            })
            .collect()
    }

    #[test]
    fn whole_frame_in_one_chunk() {
        let mut reassembler = StreamReassembler::new();
        let events = reassembler.push(&response_frame(0x03, &[0xAB, 0xCD]));
        assert_eq!(events.len(), 1);
        assert_eq!(
            frames_of(&events),
            vec![ValidatedFrame {
                code: 0x03,
                payload: vec![0xAB, 0xCD]
            }]
        );
    }

    #[test]
    fn frame_fed_byte_by_byte() {
        let mut reassembler = StreamReassembler::new();
        let raw = response_frame(0x04, &[0x0C, 0xF0]);
        let mut events = Vec::new();
        for byte in &raw {
            events.extend(reassembler.push(&[*byte]));
        }
        assert_eq!(frames_of(&events).len(), 1);
        assert_eq!(errors_of(&events), vec![]);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut reassembler = StreamReassembler::new();
        let mut raw = response_frame(0x03, &[0x01]);
        raw.extend_from_slice(&response_frame(0x04, &[0x02]));
        let events = reassembler.push(&raw);
        let frames = frames_of(&events);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].code, 0x03);
        assert_eq!(frames[1].code, 0x04);
        assert_eq!(errors_of(&events), vec![]);
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut reassembler = StreamReassembler::new();
        let raw = response_frame(0x03, &[0x01, 0x02, 0x03]);
        assert_eq!(reassembler.push(&raw[..2]), vec![]);
        assert_eq!(reassembler.push(&raw[2..5]), vec![]);
        let events = reassembler.push(&raw[5..]);
        assert_eq!(frames_of(&events).len(), 1);
    }

    #[test]
    fn noise_between_frames_is_bracketed() {
        let mut reassembler = StreamReassembler::new();
        let mut raw = response_frame(0x03, &[0x01]);
        raw.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        raw.extend_from_slice(&response_frame(0x04, &[0x02]));
        let events = reassembler.push(&raw);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::Frame(ref f) if f.code == 0x03));
        assert_eq!(events[1], StreamEvent::Error(FrameError::BadStart));
        assert!(matches!(events[2], StreamEvent::Frame(ref f) if f.code == 0x04));
    }

    #[test]
    fn pure_noise_is_reported_and_discarded() {
        let mut reassembler = StreamReassembler::new();
        let events = reassembler.push(&[0x00, 0x11, 0x22]);
        assert_eq!(events, vec![StreamEvent::Error(FrameError::BadStart)]);
        // stream stays usable
        let events = reassembler.push(&response_frame(0x03, &[]));
        assert_eq!(frames_of(&events).len(), 1);
    }

    #[test]
    fn flipped_checksum_drops_frame_and_resynchronizes() {
        let mut reassembler = StreamReassembler::new();
        let mut corrupt = response_frame(0x03, &[0x01]);
        let at = corrupt.len() - 2;
        corrupt[at] ^= 0x01;
        corrupt.extend_from_slice(&response_frame(0x04, &[0x02]));
        let events = reassembler.push(&corrupt);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            StreamEvent::Error(FrameError::ChecksumMismatch { .. })
        ));
        assert!(matches!(events[1], StreamEvent::Frame(ref f) if f.code == 0x04));
    }

    #[test]
    fn wrong_end_marker_discards_candidate() {
        let mut reassembler = StreamReassembler::new();
        let mut corrupt = response_frame(0x03, &[0x01]);
        let last = corrupt.len() - 1;
        corrupt[last] = 0x00;
        corrupt.extend_from_slice(&response_frame(0x04, &[]));
        let events = reassembler.push(&corrupt);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Error(FrameError::BadEnd));
        assert!(matches!(events[1], StreamEvent::Frame(ref f) if f.code == 0x04));
    }

    #[test]
    fn stale_partial_frame_times_out() {
        let mut reassembler = StreamReassembler::with_timeout(Duration::from_millis(100));
        let raw = response_frame(0x03, &[0x01, 0x02]);
        let t0 = Instant::now();
        assert_eq!(reassembler.push_at(&raw[..4], t0), vec![]);

        // next feed arrives long after the timeout: the stale partial is
        // abandoned first, then the fresh frame parses normally
        let events = reassembler.push_at(&raw, t0 + Duration::from_secs(2));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Error(FrameError::Timeout));
        assert!(matches!(events[1], StreamEvent::Frame(ref f) if f.code == 0x03));
    }

    #[test]
    fn timeout_poll_without_data() {
        let mut reassembler = StreamReassembler::with_timeout(Duration::from_millis(100));
        let raw = response_frame(0x03, &[]);
        let t0 = Instant::now();
        reassembler.push_at(&raw[..2], t0);
        assert_eq!(
            reassembler.check_timeout_at(t0 + Duration::from_millis(50)),
            None
        );
        assert_eq!(
            reassembler.check_timeout_at(t0 + Duration::from_millis(150)),
            Some(FrameError::Timeout)
        );
        // nothing pending anymore
        assert_eq!(
            reassembler.check_timeout_at(t0 + Duration::from_secs(10)),
            None
        );
    }

    #[test]
    fn timer_resets_between_frames() {
        let mut reassembler = StreamReassembler::with_timeout(Duration::from_millis(100));
        let raw = response_frame(0x03, &[]);
        let t0 = Instant::now();
        // a complete frame arrives slowly but within the timeout each time
        reassembler.push_at(&raw[..3], t0);
        let events = reassembler.push_at(&raw[3..], t0 + Duration::from_millis(90));
        assert_eq!(frames_of(&events).len(), 1);
        // idle stream afterwards never reports a timeout
        assert_eq!(
            reassembler.check_timeout_at(t0 + Duration::from_secs(5)),
            None
        );
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut reassembler = StreamReassembler::new();
        let raw = response_frame(0x03, &[0x01]);
        reassembler.push(&raw[..3]);
        reassembler.reset();
        // the tail of the old frame is just noise now
        let events = reassembler.push(&raw[3..]);
        assert_eq!(frames_of(&events).len(), 0);
        let events = reassembler.push(&response_frame(0x04, &[]));
        assert_eq!(frames_of(&events).len(), 1);
    }
}
