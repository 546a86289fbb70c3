//! Byte-level framing for the terminal link.
//!
//! Outbound frames are always single-part:
//!
//! ```text
//! STX  <payload>  ETX  LRC
//! 0x02 ...        0x03 xor
//! ```
//!
//! The LRC is the XOR of every byte from the first byte after STX up to and
//! including ETX. Inbound frames may span multiple parts: a part whose last
//! data byte is ETB (immediately before ETX) announces a continuation; the
//! logical payload is the concatenation of the part bodies with the ETB
//! markers stripped. Each part is acknowledged individually by the reader.
//!
//! The [`WireAssembler`] is a byte-push state machine: the reader feeds it one
//! byte at a time and reacts to the returned [`WireEvent`]s. Single control
//! bytes (ACK/NAK/ENQ) outside a frame are surfaced as their own events so
//! the sender rendezvous can observe them.

use bytes::{BufMut, BytesMut};
use ecrlink_core::constants::{ACK, ENQ, ETB, ETX, NAK, STX};
use tracing::{trace, warn};

/// Upper bound on a single part body; a malformed stream that never produces
/// ETX is discarded once it grows past this.
const MAX_PART_SIZE: usize = 64 * 1024;

/// XOR-fold checksum over a byte sequence.
#[must_use]
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Checksum of a frame payload: XOR over payload ∥ ETX.
#[must_use]
pub fn payload_lrc(payload: &[u8]) -> u8 {
    lrc(payload) ^ ETX
}

/// Wrap a payload as `STX ∥ payload ∥ ETX ∥ LRC`.
///
/// The host only ever emits single-part frames.
#[must_use]
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(payload.len() + 3);
    frame.put_u8(STX);
    frame.put_slice(payload);
    frame.put_u8(ETX);
    frame.put_u8(payload_lrc(payload));
    frame.to_vec()
}

/// Events produced by the assembler, one per pushed byte at most.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// ACK received outside a frame.
    Ack,

    /// NAK received outside a frame.
    Nak,

    /// ENQ received outside a frame (terminal-side handshake).
    Enq,

    /// Any other byte outside a frame; logged and ignored by the reader.
    Noise(u8),

    /// A non-final part passed its checksum; more parts follow.
    /// The reader acknowledges it and keeps assembling.
    Part,

    /// The final part passed its checksum; the logical payload is complete.
    Frame(Vec<u8>),

    /// Checksum mismatch; the current part is discarded and the assembler
    /// resynchronizes on the next STX. The reader answers with NAK.
    BadChecksum { computed: u8, received: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblerState {
    /// Outside a frame, classifying single bytes and waiting for STX.
    Idle,

    /// Between STX and ETX, accumulating the part body.
    Payload,

    /// ETX seen; the next byte is the part checksum.
    Checksum,

    /// After a checksum mismatch: discard until the next STX.
    Resync,
}

/// Stateful frame assembler fed one byte at a time.
#[derive(Debug)]
pub struct WireAssembler {
    state: AssemblerState,

    /// Body of the part currently being received (between STX and ETX).
    part: BytesMut,

    /// Concatenated bodies of the parts accepted so far for this frame.
    logical: BytesMut,
}

impl WireAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            part: BytesMut::with_capacity(256),
            logical: BytesMut::with_capacity(256),
        }
    }

    /// True while the assembler is inside a frame (STX seen, frame not
    /// complete). Bytes classified in this window never signal the sender
    /// rendezvous.
    #[must_use]
    pub fn in_frame(&self) -> bool {
        !matches!(self.state, AssemblerState::Idle)
    }

    /// Drop all partial state and return to idle.
    pub fn reset(&mut self) {
        self.state = AssemblerState::Idle;
        self.part.clear();
        self.logical.clear();
    }

    /// Feed one byte; returns the event it completes, if any.
    pub fn push(&mut self, byte: u8) -> Option<WireEvent> {
        match self.state {
            AssemblerState::Idle => self.push_idle(byte),
            AssemblerState::Payload => self.push_payload(byte),
            AssemblerState::Checksum => Some(self.push_checksum(byte)),
            AssemblerState::Resync => self.push_resync(byte),
        }
    }

    fn push_idle(&mut self, byte: u8) -> Option<WireEvent> {
        match byte {
            ACK => Some(WireEvent::Ack),
            NAK => Some(WireEvent::Nak),
            ENQ => Some(WireEvent::Enq),
            STX => {
                self.state = AssemblerState::Payload;
                self.part.clear();
                None
            }
            other => Some(WireEvent::Noise(other)),
        }
    }

    fn push_payload(&mut self, byte: u8) -> Option<WireEvent> {
        if byte == ETX {
            self.state = AssemblerState::Checksum;
            return None;
        }
        if self.part.len() >= MAX_PART_SIZE {
            warn!(len = self.part.len(), "part exceeds size limit, discarding");
            self.reset();
            return None;
        }
        self.part.put_u8(byte);
        None
    }

    fn push_checksum(&mut self, received: u8) -> WireEvent {
        let computed = payload_lrc(&self.part);
        if received != computed {
            self.part.clear();
            self.logical.clear();
            self.state = AssemblerState::Resync;
            return WireEvent::BadChecksum { computed, received };
        }

        // ETB as the final data byte marks a continuation part.
        let more_follows = self.part.last() == Some(&ETB);
        if more_follows {
            self.part.truncate(self.part.len() - 1);
        }
        self.logical.put_slice(&self.part);
        self.part.clear();
        self.state = AssemblerState::Idle;

        if more_follows {
            trace!(assembled = self.logical.len(), "continuation part accepted");
            WireEvent::Part
        } else {
            WireEvent::Frame(self.logical.split().to_vec())
        }
    }

    fn push_resync(&mut self, byte: u8) -> Option<WireEvent> {
        if byte == STX {
            self.state = AssemblerState::Payload;
            self.part.clear();
        }
        None
    }
}

impl Default for WireAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a byte slice and collect every event.
    fn feed(assembler: &mut WireAssembler, bytes: &[u8]) -> Vec<WireEvent> {
        bytes.iter().filter_map(|&b| assembler.push(b)).collect()
    }

    #[test]
    fn test_lrc_is_xor_fold() {
        assert_eq!(lrc(&[]), 0);
        assert_eq!(lrc(&[0xAA]), 0xAA);
        assert_eq!(lrc(&[0x01, 0x02, 0x03]), 0x00);
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = build_frame(b"72");
        assert_eq!(frame[0], STX);
        assert_eq!(&frame[1..3], b"72");
        assert_eq!(frame[3], ETX);
        assert_eq!(frame[4], lrc(b"72") ^ ETX);
    }

    #[test]
    fn test_single_frame_roundtrip() {
        let mut assembler = WireAssembler::new();
        let events = feed(&mut assembler, &build_frame(b"2A000000042"));
        assert_eq!(events, vec![WireEvent::Frame(b"2A000000042".to_vec())]);
        assert!(!assembler.in_frame());
    }

    #[test]
    fn test_control_bytes_outside_frame() {
        let mut assembler = WireAssembler::new();
        assert_eq!(assembler.push(ACK), Some(WireEvent::Ack));
        assert_eq!(assembler.push(NAK), Some(WireEvent::Nak));
        assert_eq!(assembler.push(ENQ), Some(WireEvent::Enq));
        assert_eq!(assembler.push(b'x'), Some(WireEvent::Noise(b'x')));
    }

    #[test]
    fn test_ack_inside_payload_is_data() {
        let mut assembler = WireAssembler::new();
        let payload = [b'2', ACK, b'Z'];
        let events = feed(&mut assembler, &build_frame(&payload));
        assert_eq!(events, vec![WireEvent::Frame(payload.to_vec())]);
    }

    #[test]
    fn test_two_part_reassembly() {
        let mut assembler = WireAssembler::new();

        // First part carries "2A20" with an ETB continuation marker.
        let mut part1 = b"2A20".to_vec();
        part1.push(ETB);
        let events1 = feed(&mut assembler, &build_frame(&part1));
        assert_eq!(events1, vec![WireEvent::Part]);

        let events2 = feed(&mut assembler, &build_frame(b"01XYZ"));
        assert_eq!(events2, vec![WireEvent::Frame(b"2A2001XYZ".to_vec())]);
    }

    #[test]
    fn test_bad_checksum_then_resync() {
        let mut assembler = WireAssembler::new();
        let mut frame = build_frame(b"2A0000");
        let good_lrc = *frame.last().unwrap();
        *frame.last_mut().unwrap() = good_lrc ^ 0xFF;

        let events = feed(&mut assembler, &frame);
        assert_eq!(
            events,
            vec![WireEvent::BadChecksum {
                computed: good_lrc,
                received: good_lrc ^ 0xFF
            }]
        );

        // Garbage between the bad frame and the retransmission is skipped.
        assert_eq!(feed(&mut assembler, b"noise"), vec![]);

        let events = feed(&mut assembler, &build_frame(b"2A0000"));
        assert_eq!(events, vec![WireEvent::Frame(b"2A0000".to_vec())]);
    }

    #[test]
    fn test_bad_checksum_discards_earlier_parts() {
        let mut assembler = WireAssembler::new();

        let mut part1 = b"AB".to_vec();
        part1.push(ETB);
        feed(&mut assembler, &build_frame(&part1));

        // Corrupt second part: the whole logical frame is abandoned.
        let mut frame = build_frame(b"CD");
        *frame.last_mut().unwrap() ^= 0x01;
        feed(&mut assembler, &frame);

        let events = feed(&mut assembler, &build_frame(b"EF"));
        assert_eq!(events, vec![WireEvent::Frame(b"EF".to_vec())]);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut assembler = WireAssembler::new();
        let events = feed(&mut assembler, &build_frame(b""));
        assert_eq!(events, vec![WireEvent::Frame(vec![])]);
    }

    #[test]
    fn test_in_frame_flag() {
        let mut assembler = WireAssembler::new();
        assert!(!assembler.in_frame());
        assembler.push(STX);
        assert!(assembler.in_frame());
        assembler.push(b'7');
        assembler.push(ETX);
        assert!(assembler.in_frame());
        assembler.push(payload_lrc(b"7"));
        assert!(!assembler.in_frame());
    }

    #[test]
    fn test_oversized_part_is_discarded() {
        let mut assembler = WireAssembler::new();
        assembler.push(STX);
        for _ in 0..(64 * 1024 + 1) {
            assembler.push(b'X');
        }
        // Assembler gave up and returned to idle; a fresh frame still works.
        let events = feed(&mut assembler, &build_frame(b"ok"));
        assert_eq!(events.last(), Some(&WireEvent::Frame(b"ok".to_vec())));
    }
}
