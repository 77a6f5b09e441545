//! Unix-socket transport framing (spec §3 "Frame (Unix transport)", §4.A).
//!
//! Header is 12 bytes, little-endian (the Open Question in spec §9 is
//! resolved here): `op: u8`, `fragmented: u8`, `padding: u16`, `sz_payload:
//! u64`. `sz_payload` is widened to 64 bits (rather than the 32 bits named
//! in spec §3's shorthand) so the four fixed fields actually sum to the 12
//! bytes spec §3 specifies.

use super::FrameError;

pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnixOp {
    Continuation = 0,
    Text = 1,
    Bin = 2,
    End = 3,
    Close = 4,
    Ping = 5,
    Pong = 6,
}

impl UnixOp {
    fn from_u8(v: u8) -> Result<Self, FrameError> {
        Ok(match v {
            0 => UnixOp::Continuation,
            1 => UnixOp::Text,
            2 => UnixOp::Bin,
            3 => UnixOp::End,
            4 => UnixOp::Close,
            5 => UnixOp::Ping,
            6 => UnixOp::Pong,
            _ => return Err(FrameError::Protocol("unknown unix frame opcode")),
        })
    }
}

/// Result of feeding bytes into the [`UnixFrameDecoder`].
#[derive(Debug)]
pub enum UnixEvent {
    Message { body: Vec<u8>, is_text: bool },
    /// Caller must write an encoded `Pong` frame back immediately.
    PongNeeded,
    /// Peer sent a `Pong`; caller should bump last-activity.
    PongReceived,
    Close,
}

enum State {
    AwaitHeader,
    AwaitPayload {
        is_text: bool,
        /// `true` once this payload is known to be the final segment of a
        /// (possibly multi-frame) packet.
        terminal: bool,
        sz_expected: usize,
        buf: Vec<u8>,
    },
}

/// Per-client Unix frame decoder. Owns no socket; the transport layer feeds
/// it bytes as they arrive and drains fully-assembled messages.
pub struct UnixFrameDecoder {
    state: State,
    inbuf: Vec<u8>,
    /// Whether the in-progress fragmented packet is text, carried across its
    /// Continuation/End frames (which don't repeat the opcode).
    pending_is_text: Option<bool>,
    max_inmem_payload: usize,
    /// Running count of bytes allocated for the in-progress message, surfaced
    /// to the endpoint layer for liveness/memory-pressure checks.
    pub bytes_allocated: usize,
}

impl UnixFrameDecoder {
    pub fn new(max_inmem_payload: usize) -> Self {
        Self {
            state: State::AwaitHeader,
            inbuf: Vec::new(),
            pending_is_text: None,
            max_inmem_payload,
            bytes_allocated: 0,
        }
    }

    /// Appends freshly-read bytes to the internal buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.inbuf.extend_from_slice(data);
    }

    /// Tries to make progress, yielding at most one event per call. Callers
    /// should loop until `Ok(None)` (need more bytes).
    pub fn poll(&mut self) -> Result<Option<UnixEvent>, FrameError> {
        loop {
            match &mut self.state {
                State::AwaitHeader => {
                    if self.inbuf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let header: Vec<u8> = self.inbuf.drain(0..HEADER_LEN).collect();
                    let op = UnixOp::from_u8(header[0])?;
                    let fragmented = header[1];
                    let sz_payload = u64::from_le_bytes(header[4..12].try_into().unwrap()) as usize;

                    match op {
                        UnixOp::Ping => return Ok(Some(UnixEvent::PongNeeded)),
                        UnixOp::Pong => return Ok(Some(UnixEvent::PongReceived)),
                        UnixOp::Close => return Ok(Some(UnixEvent::Close)),
                        UnixOp::Continuation | UnixOp::End => {
                            let is_text = self.pending_is_text.ok_or(FrameError::Protocol(
                                "continuation/end with no packet in progress",
                            ))?;
                            if sz_payload > self.max_inmem_payload {
                                return Err(FrameError::PacketTooLarge);
                            }
                            self.state = State::AwaitPayload {
                                is_text,
                                terminal: matches!(op, UnixOp::End),
                                sz_expected: sz_payload,
                                buf: Vec::with_capacity(sz_payload.min(64 * 1024)),
                            };
                        }
                        UnixOp::Text | UnixOp::Bin => {
                            let is_text = op == UnixOp::Text;
                            if fragmented > 0 {
                                if sz_payload > self.max_inmem_payload {
                                    return Err(FrameError::PacketTooLarge);
                                }
                                self.pending_is_text = Some(is_text);
                                self.state = State::AwaitPayload {
                                    is_text,
                                    terminal: false,
                                    sz_expected: sz_payload,
                                    buf: Vec::with_capacity(sz_payload.min(64 * 1024)),
                                };
                            } else {
                                if sz_payload > self.max_inmem_payload {
                                    return Err(FrameError::PacketTooLarge);
                                }
                                self.state = State::AwaitPayload {
                                    is_text,
                                    terminal: true,
                                    sz_expected: sz_payload,
                                    buf: Vec::with_capacity(sz_payload.min(64 * 1024)),
                                };
                            }
                        }
                    }
                }
                State::AwaitPayload {
                    is_text,
                    terminal,
                    sz_expected,
                    buf,
                } => {
                    let need = *sz_expected - buf.len();
                    let take = need.min(self.inbuf.len());
                    if take > 0 {
                        buf.extend(self.inbuf.drain(0..take));
                    }
                    self.bytes_allocated = buf.len();
                    if buf.len() < *sz_expected {
                        return Ok(None);
                    }
                    let is_text = *is_text;
                    let terminal = *terminal;
                    let mut body = std::mem::take(buf);
                    self.state = State::AwaitHeader;
                    self.bytes_allocated = 0;
                    if terminal {
                        self.pending_is_text = None;
                        if is_text {
                            body.push(0);
                        }
                        return Ok(Some(UnixEvent::Message { body, is_text }));
                    }
                    // Continuation frame consumed; wait for the next header.
                }
            }
        }
    }
}

/// Encodes one logical message, splitting it into multiple frames when it
/// exceeds `max_frame`. Returns the raw bytes ready to write to the socket.
pub fn encode_message(body: &[u8], is_text: bool, max_frame: usize) -> Vec<u8> {
    let op = if is_text { UnixOp::Text } else { UnixOp::Bin };
    if body.len() <= max_frame {
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        write_header(&mut out, op, 0, body.len());
        out.extend_from_slice(body);
        return out;
    }

    let mut out = Vec::with_capacity(body.len() + HEADER_LEN * (body.len() / max_frame + 2));
    write_header(&mut out, op, body.len(), max_frame.min(body.len()));
    out.extend_from_slice(&body[..max_frame]);

    let mut offset = max_frame;
    while offset < body.len() {
        let remaining = body.len() - offset;
        let chunk = remaining.min(max_frame);
        let is_last = offset + chunk >= body.len();
        let frame_op = if is_last { UnixOp::End } else { UnixOp::Continuation };
        write_header(&mut out, frame_op, 0, chunk);
        out.extend_from_slice(&body[offset..offset + chunk]);
        offset += chunk;
    }
    out
}

pub fn encode_control(op: UnixOp) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = op as u8;
    out
}

fn write_header(out: &mut Vec<u8>, op: UnixOp, fragmented: usize, sz_payload: usize) {
    out.push(op as u8);
    out.push(if fragmented > 0 { 1 } else { 0 });
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&(sz_payload as u64).to_le_bytes());
    let _ = fragmented;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(frames: &[u8], max: usize) -> Vec<UnixEvent> {
        let mut dec = UnixFrameDecoder::new(max);
        dec.feed(frames);
        let mut events = Vec::new();
        while let Some(ev) = dec.poll().unwrap() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn round_trips_a_single_frame_message() {
        let body = b"hello world";
        let encoded = encode_message(body, true, 1 << 20);
        let events = decode_all(&encoded, 1 << 20);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UnixEvent::Message { body: got, is_text } => {
                assert!(*is_text);
                assert_eq!(&got[..got.len() - 1], body);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn round_trips_a_fragmented_message() {
        let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let encoded = encode_message(&body, false, 1024);
        let events = decode_all(&encoded, 1 << 20);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UnixEvent::Message { body: got, is_text } => {
                assert!(!is_text);
                assert_eq!(got, &body);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn oversize_declared_payload_is_rejected_before_allocation() {
        let mut dec = UnixFrameDecoder::new(1024);
        let mut header = Vec::new();
        write_header(&mut header, UnixOp::Text, 2048, 2048);
        dec.feed(&header);
        assert!(matches!(dec.poll(), Err(FrameError::PacketTooLarge)));
    }

    #[test]
    fn continuation_without_a_packet_in_progress_is_a_protocol_error() {
        let mut dec = UnixFrameDecoder::new(1024);
        let header = encode_control(UnixOp::Continuation);
        dec.feed(&header);
        assert!(matches!(dec.poll(), Err(FrameError::Protocol(_))));
    }

    #[test]
    fn ping_yields_pong_needed() {
        let mut dec = UnixFrameDecoder::new(1024);
        dec.feed(&encode_control(UnixOp::Ping));
        assert!(matches!(dec.poll().unwrap(), Some(UnixEvent::PongNeeded)));
    }
}
