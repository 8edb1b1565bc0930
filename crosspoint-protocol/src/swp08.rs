//! SW-P-08 (Probel) binary protocol codec.
//!
//! Frame format:
//! ```text
//! DLE STX  <message bytes> <BTC> <CHK>  DLE ETX
//! ```
//!
//! Every `DLE (0x10)` inside the payload is escaped by doubling. `BTC`
//! counts the message bytes plus the four framing bytes (the convention
//! the reference control clients generate), and `CHK` is the
//! two's-complement of `sum(message bytes || BTC) mod 256`, so that the
//! whole of `message || BTC || CHK` sums to zero.
//!
//! A receiver answers each verified frame with `DLE ACK (0x06)` and a
//! corrupt one with `DLE NAK (0x15)`; both also appear as standalone
//! tokens in the stream.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Default TCP port for SW-P-08 routers.
pub const SWP08_PORT: u16 = 8910;

pub const DLE: u8 = 0x10;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// BTC counts message bytes plus DLE STX / DLE ETX.
const FRAMING_OVERHEAD: usize = 4;

/// Upper bound on a single unescaped payload.
const MAX_PAYLOAD: usize = 4096;

/// Largest address expressible in the standard 10-bit packing.
pub const STANDARD_ADDRESS_MAX: u16 = 0x3FF;

/// Label width selector carried in the name request/response messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharLen {
    C4,
    C8,
    C12,
}

impl CharLen {
    pub fn width(self) -> usize {
        match self {
            CharLen::C4 => 4,
            CharLen::C8 => 8,
            CharLen::C12 => 12,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            CharLen::C4 => 0,
            CharLen::C8 => 1,
            CharLen::C12 => 2,
        }
    }

    pub fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(CharLen::C4),
            1 => Some(CharLen::C8),
            2 => Some(CharLen::C12),
            _ => None,
        }
    }
}

/// Decoded SW-P-08 message. `extended` selects the 16-bit address
/// opcodes (`0x80`-offset family).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Swp08Message {
    /// `0x01` / `0x81` - ask for the source routed to one destination.
    Interrogate { matrix: u8, level: u8, dest: u16, extended: bool },
    /// `0x02` / `0x82` - route `src` to `dest`.
    Connect { matrix: u8, level: u8, dest: u16, src: u16, extended: bool },
    /// `0x03` / `0x83` - crosspoint tally (reply to interrogate / dump).
    Tally { matrix: u8, level: u8, dest: u16, src: u16, extended: bool },
    /// `0x04` / `0x84` - crosspoint connected, broadcast after a take.
    Connected { matrix: u8, level: u8, dest: u16, src: u16, extended: bool },
    /// `0x15` / `0x95` - request one tally per destination of a level.
    TallyDump { matrix: u8, level: u8, extended: bool },
    /// `0x64` / `0xE4` - request source names at the given width.
    SourceNamesRequest { matrix: u8, chars: CharLen, extended: bool },
    /// `0x66` / `0xE6` - request destination names at the given width.
    DestNamesRequest { matrix: u8, chars: CharLen, extended: bool },
    /// `0x6A` / `0xEA` - source names, fixed width, space padded.
    SourceNamesReply {
        matrix: u8,
        chars: CharLen,
        start: u16,
        names: Vec<String>,
        extended: bool,
    },
    /// `0x6B` / `0xEB` - destination names, fixed width, space padded.
    DestNamesReply {
        matrix: u8,
        chars: CharLen,
        start: u16,
        names: Vec<String>,
        extended: bool,
    },
}

/// One decoded stream element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Swp08Item {
    /// Standalone `DLE ACK`.
    Ack,
    /// Standalone `DLE NAK`.
    Nak,
    Message(Swp08Message),
    /// BTC or checksum verification failed; answer with `DLE NAK`.
    Invalid(ProtocolError),
    /// Verified frame whose opcode or layout is not handled; the frame
    /// is acknowledged and otherwise ignored.
    Unhandled(u8),
}

/// Pack `(dest, src)` into the standard multiplier + low-byte form.
///
/// The multiplier byte carries dest bits 7..9 in bits 4-6 and src bits
/// 7..9 in bits 0-2.
pub fn pack_standard(dest: u16, src: u16) -> Result<[u8; 3], ProtocolError> {
    if dest > STANDARD_ADDRESS_MAX {
        return Err(ProtocolError::AddressRange(dest as u32, "standard"));
    }
    if src > STANDARD_ADDRESS_MAX {
        return Err(ProtocolError::AddressRange(src as u32, "standard"));
    }
    let mult = (((dest >> 7) as u8 & 0x07) << 4) | ((src >> 7) as u8 & 0x07);
    Ok([mult, (dest & 0x7F) as u8, (src & 0x7F) as u8])
}

/// Inverse of [`pack_standard`].
pub fn unpack_standard(mult: u8, dest_low: u8, src_low: u8) -> (u16, u16) {
    let dest = (((mult >> 4) & 0x07) as u16) << 7 | (dest_low & 0x7F) as u16;
    let src = ((mult & 0x07) as u16) << 7 | (src_low & 0x7F) as u16;
    (dest, src)
}

fn matrix_level_byte(matrix: u8, level: u8) -> u8 {
    (matrix & 0x0F) << 4 | (level & 0x0F)
}

fn split_matrix_level(b: u8) -> (u8, u8) {
    (b >> 4, b & 0x0F)
}

/// Encode a message and wrap it in a complete frame.
pub fn encode_message(msg: &Swp08Message) -> Result<Bytes, ProtocolError> {
    let mut data = Vec::with_capacity(8);

    match msg {
        Swp08Message::Interrogate { matrix, level, dest, extended } => {
            if *extended {
                data.push(0x81);
                data.push(matrix_level_byte(*matrix, *level));
                data.extend_from_slice(&dest.to_be_bytes());
            } else {
                data.push(0x01);
                data.push(matrix_level_byte(*matrix, *level));
                let packed = pack_standard(*dest, 0)?;
                data.push(packed[0] & 0x70); // src bits unused
                data.push(packed[1]);
            }
        }
        Swp08Message::Connect { matrix, level, dest, src, extended }
        | Swp08Message::Tally { matrix, level, dest, src, extended }
        | Swp08Message::Connected { matrix, level, dest, src, extended } => {
            let base = match msg {
                Swp08Message::Connect { .. } => 0x02,
                Swp08Message::Tally { .. } => 0x03,
                _ => 0x04,
            };
            if *extended {
                data.push(base | 0x80);
                data.push(matrix_level_byte(*matrix, *level));
                data.extend_from_slice(&dest.to_be_bytes());
                data.extend_from_slice(&src.to_be_bytes());
            } else {
                data.push(base);
                data.push(matrix_level_byte(*matrix, *level));
                data.extend_from_slice(&pack_standard(*dest, *src)?);
            }
        }
        Swp08Message::TallyDump { matrix, level, extended } => {
            data.push(if *extended { 0x95 } else { 0x15 });
            data.push(matrix_level_byte(*matrix, *level));
        }
        Swp08Message::SourceNamesRequest { matrix, chars, extended } => {
            data.push(if *extended { 0xE4 } else { 0x64 });
            data.push((matrix & 0x0F) << 4);
            data.push(chars.index());
        }
        Swp08Message::DestNamesRequest { matrix, chars, extended } => {
            data.push(if *extended { 0xE6 } else { 0x66 });
            data.push((matrix & 0x0F) << 4);
            data.push(chars.index());
        }
        Swp08Message::SourceNamesReply { matrix, chars, start, names, extended }
        | Swp08Message::DestNamesReply { matrix, chars, start, names, extended } => {
            let base = match msg {
                Swp08Message::SourceNamesReply { .. } => 0x6A,
                _ => 0x6B,
            };
            if names.len() > u8::MAX as usize {
                return Err(ProtocolError::Malformed(format!(
                    "{} names exceed a single reply",
                    names.len()
                )));
            }
            data.push(if *extended { base | 0x80 } else { base });
            data.push((matrix & 0x0F) << 4);
            data.push(chars.index());
            if *extended {
                data.extend_from_slice(&start.to_be_bytes());
            } else {
                if *start > u8::MAX as u16 {
                    return Err(ProtocolError::AddressRange(*start as u32, "standard"));
                }
                data.push(*start as u8);
            }
            data.push(names.len() as u8);
            for name in names {
                push_fixed_name(&mut data, name, chars.width());
            }
        }
    }

    Ok(encode_frame(&data))
}

fn push_fixed_name(data: &mut Vec<u8>, name: &str, width: usize) {
    let mut bytes: Vec<u8> = name.bytes().take(width).collect();
    bytes.resize(width, b' ');
    data.extend_from_slice(&bytes);
}

/// Wrap raw message bytes in `DLE STX .. DLE ETX` with BTC and checksum.
pub fn encode_frame(data: &[u8]) -> Bytes {
    let btc = (data.len() + FRAMING_OVERHEAD) as u8;
    let sum = data.iter().fold(btc, |acc, b| acc.wrapping_add(*b));
    let chk = 0u8.wrapping_sub(sum);

    let mut out = BytesMut::with_capacity(data.len() + 8);
    out.put_u8(DLE);
    out.put_u8(STX);
    for &b in data.iter().chain([btc, chk].iter()) {
        out.put_u8(b);
        if b == DLE {
            out.put_u8(DLE);
        }
    }
    out.put_u8(DLE);
    out.put_u8(ETX);
    out.freeze()
}

/// `DLE ACK` token.
pub fn encode_ack() -> Bytes {
    Bytes::from_static(&[DLE, ACK])
}

/// `DLE NAK` token.
pub fn encode_nak() -> Bytes {
    Bytes::from_static(&[DLE, NAK])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Idle,
    IdleDle,
    Frame,
    FrameDle,
}

/// Streaming frame reader: feed socket bytes, collect decoded items.
#[derive(Debug)]
pub struct FrameReader {
    state: ReaderState,
    payload: Vec<u8>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self {
            state: ReaderState::Idle,
            payload: Vec::new(),
        }
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Swp08Item> {
        let mut items = Vec::new();
        for &b in chunk {
            self.step(b, &mut items);
        }
        items
    }

    fn step(&mut self, b: u8, items: &mut Vec<Swp08Item>) {
        match self.state {
            ReaderState::Idle => {
                if b == DLE {
                    self.state = ReaderState::IdleDle;
                }
                // anything else between frames is line noise
            }
            ReaderState::IdleDle => match b {
                STX => {
                    self.payload.clear();
                    self.state = ReaderState::Frame;
                }
                ACK => {
                    items.push(Swp08Item::Ack);
                    self.state = ReaderState::Idle;
                }
                NAK => {
                    items.push(Swp08Item::Nak);
                    self.state = ReaderState::Idle;
                }
                DLE => {} // stay armed
                _ => self.state = ReaderState::Idle,
            },
            ReaderState::Frame => {
                if b == DLE {
                    self.state = ReaderState::FrameDle;
                } else {
                    self.push_payload(b, items);
                }
            }
            ReaderState::FrameDle => match b {
                DLE => {
                    self.state = ReaderState::Frame;
                    self.push_payload(DLE, items);
                }
                ETX => {
                    let item = finish_frame(&self.payload);
                    items.push(item);
                    self.payload.clear();
                    self.state = ReaderState::Idle;
                }
                STX => {
                    // previous frame never terminated
                    items.push(Swp08Item::Invalid(ProtocolError::Truncated {
                        expected: self.payload.len() + 1,
                        actual: self.payload.len(),
                    }));
                    self.payload.clear();
                    self.state = ReaderState::Frame;
                }
                _ => {
                    items.push(Swp08Item::Invalid(ProtocolError::Malformed(format!(
                        "unexpected 0x{b:02X} after DLE inside frame"
                    ))));
                    self.payload.clear();
                    self.state = ReaderState::Idle;
                }
            },
        }
    }

    fn push_payload(&mut self, b: u8, items: &mut Vec<Swp08Item>) {
        if self.payload.len() >= MAX_PAYLOAD {
            items.push(Swp08Item::Invalid(ProtocolError::FrameTooLarge(
                self.payload.len(),
                MAX_PAYLOAD,
            )));
            self.payload.clear();
            self.state = ReaderState::Idle;
        } else {
            self.payload.push(b);
        }
    }
}

fn finish_frame(payload: &[u8]) -> Swp08Item {
    if payload.len() < 3 {
        return Swp08Item::Invalid(ProtocolError::Truncated {
            expected: 3,
            actual: payload.len(),
        });
    }

    let data = &payload[..payload.len() - 2];
    let btc = payload[payload.len() - 2];
    let chk = payload[payload.len() - 1];

    let expected_btc = data.len() + FRAMING_OVERHEAD;
    if btc as usize != expected_btc {
        return Swp08Item::Invalid(ProtocolError::ByteCountMismatch {
            expected: btc as usize,
            actual: expected_btc,
        });
    }

    let sum = data.iter().fold(btc, |acc, b| acc.wrapping_add(*b));
    let computed = 0u8.wrapping_sub(sum);
    if computed != chk {
        return Swp08Item::Invalid(ProtocolError::ChecksumMismatch {
            computed,
            received: chk,
        });
    }

    parse_message(data)
}

fn parse_message(data: &[u8]) -> Swp08Item {
    let op = data[0];
    let body = &data[1..];

    let msg = match op {
        0x01 if body.len() == 3 => {
            let (matrix, level) = split_matrix_level(body[0]);
            let (dest, _) = unpack_standard(body[1], body[2], 0);
            Swp08Message::Interrogate { matrix, level, dest, extended: false }
        }
        0x02 | 0x03 | 0x04 if body.len() == 4 => {
            let (matrix, level) = split_matrix_level(body[0]);
            let (dest, src) = unpack_standard(body[1], body[2], body[3]);
            match op {
                0x02 => Swp08Message::Connect { matrix, level, dest, src, extended: false },
                0x03 => Swp08Message::Tally { matrix, level, dest, src, extended: false },
                _ => Swp08Message::Connected { matrix, level, dest, src, extended: false },
            }
        }
        0x15 if body.len() == 1 => {
            let (matrix, level) = split_matrix_level(body[0]);
            Swp08Message::TallyDump { matrix, level, extended: false }
        }
        0x64 | 0x66 if body.len() == 2 => {
            let matrix = body[0] >> 4;
            let Some(chars) = CharLen::from_index(body[1]) else {
                return Swp08Item::Unhandled(op);
            };
            if op == 0x64 {
                Swp08Message::SourceNamesRequest { matrix, chars, extended: false }
            } else {
                Swp08Message::DestNamesRequest { matrix, chars, extended: false }
            }
        }
        0x6A | 0x6B if body.len() >= 4 => {
            let matrix = body[0] >> 4;
            let Some(chars) = CharLen::from_index(body[1]) else {
                return Swp08Item::Unhandled(op);
            };
            let start = body[2] as u16;
            let count = body[3] as usize;
            let Some(names) = parse_names(&body[4..], count, chars.width()) else {
                return Swp08Item::Unhandled(op);
            };
            if op == 0x6A {
                Swp08Message::SourceNamesReply { matrix, chars, start, names, extended: false }
            } else {
                Swp08Message::DestNamesReply { matrix, chars, start, names, extended: false }
            }
        }
        0x81 if body.len() == 3 => {
            let (matrix, level) = split_matrix_level(body[0]);
            let dest = u16::from_be_bytes([body[1], body[2]]);
            Swp08Message::Interrogate { matrix, level, dest, extended: true }
        }
        0x82 | 0x83 | 0x84 if body.len() == 5 => {
            let (matrix, level) = split_matrix_level(body[0]);
            let dest = u16::from_be_bytes([body[1], body[2]]);
            let src = u16::from_be_bytes([body[3], body[4]]);
            match op {
                0x82 => Swp08Message::Connect { matrix, level, dest, src, extended: true },
                0x83 => Swp08Message::Tally { matrix, level, dest, src, extended: true },
                _ => Swp08Message::Connected { matrix, level, dest, src, extended: true },
            }
        }
        0x95 if body.len() == 1 => {
            let (matrix, level) = split_matrix_level(body[0]);
            Swp08Message::TallyDump { matrix, level, extended: true }
        }
        0xE4 | 0xE6 if body.len() == 2 => {
            let matrix = body[0] >> 4;
            let Some(chars) = CharLen::from_index(body[1]) else {
                return Swp08Item::Unhandled(op);
            };
            if op == 0xE4 {
                Swp08Message::SourceNamesRequest { matrix, chars, extended: true }
            } else {
                Swp08Message::DestNamesRequest { matrix, chars, extended: true }
            }
        }
        0xEA | 0xEB if body.len() >= 5 => {
            let matrix = body[0] >> 4;
            let Some(chars) = CharLen::from_index(body[1]) else {
                return Swp08Item::Unhandled(op);
            };
            let start = u16::from_be_bytes([body[2], body[3]]);
            let count = body[4] as usize;
            let Some(names) = parse_names(&body[5..], count, chars.width()) else {
                return Swp08Item::Unhandled(op);
            };
            if op == 0xEA {
                Swp08Message::SourceNamesReply { matrix, chars, start, names, extended: true }
            } else {
                Swp08Message::DestNamesReply { matrix, chars, start, names, extended: true }
            }
        }
        _ => return Swp08Item::Unhandled(op),
    };

    Swp08Item::Message(msg)
}

fn parse_names(bytes: &[u8], count: usize, width: usize) -> Option<Vec<String>> {
    if bytes.len() != count * width {
        return None;
    }
    let mut names = Vec::with_capacity(count);
    for chunk in bytes.chunks(width) {
        let name = String::from_utf8_lossy(chunk).trim_end().to_string();
        names.push(name);
    }
    Some(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Swp08Message) {
        let encoded = encode_message(&msg).unwrap();
        let mut reader = FrameReader::new();
        let items = reader.feed(&encoded);
        assert_eq!(items, vec![Swp08Item::Message(msg)]);
    }

    #[test]
    fn test_connect_scenario_bytes() {
        // CMD=0x02 dest=3 src=7 on matrix 0 level 0
        let wire = [0x10, 0x02, 0x02, 0x00, 0x00, 0x03, 0x07, 0x09, 0xEB, 0x10, 0x03];
        let mut reader = FrameReader::new();
        let items = reader.feed(&wire);
        assert_eq!(
            items,
            vec![Swp08Item::Message(Swp08Message::Connect {
                matrix: 0,
                level: 0,
                dest: 3,
                src: 7,
                extended: false,
            })]
        );

        // and the encoder produces the same bytes
        let encoded = encode_message(&Swp08Message::Connect {
            matrix: 0,
            level: 0,
            dest: 3,
            src: 7,
            extended: false,
        })
        .unwrap();
        assert_eq!(&encoded[..], &wire[..]);
    }

    #[test]
    fn test_ack_nak_tokens() {
        let mut reader = FrameReader::new();
        let items = reader.feed(&[0x10, 0x06, 0x10, 0x15]);
        assert_eq!(items, vec![Swp08Item::Ack, Swp08Item::Nak]);
    }

    #[test]
    fn test_dle_escaping_round_trip() {
        // dest 16 has a 0x10 low byte, which must be doubled on the wire
        let msg = Swp08Message::Connect {
            matrix: 0,
            level: 0,
            dest: 16,
            src: 16,
            extended: false,
        };
        let encoded = encode_message(&msg).unwrap();
        let doubled = encoded.windows(2).filter(|w| w == &[DLE, DLE]).count();
        assert!(doubled >= 2);
        round_trip(msg);
    }

    #[test]
    fn test_checksum_failure() {
        let mut wire = encode_message(&Swp08Message::TallyDump {
            matrix: 0,
            level: 1,
            extended: false,
        })
        .unwrap()
        .to_vec();
        // corrupt the checksum byte (last payload byte before DLE ETX)
        let n = wire.len();
        wire[n - 3] ^= 0x01;
        let mut reader = FrameReader::new();
        let items = reader.feed(&wire);
        assert!(matches!(
            items[..],
            [Swp08Item::Invalid(ProtocolError::ChecksumMismatch { .. })]
        ));
    }

    #[test]
    fn test_btc_mismatch() {
        // hand-built frame with a wrong byte count
        let data = [0x15u8, 0x00];
        let btc = 3u8; // should be 6
        let sum = data.iter().fold(btc, |acc, b| acc.wrapping_add(*b));
        let chk = 0u8.wrapping_sub(sum);
        let wire = [DLE, STX, data[0], data[1], btc, chk, DLE, ETX];
        let mut reader = FrameReader::new();
        let items = reader.feed(&wire);
        assert!(matches!(
            items[..],
            [Swp08Item::Invalid(ProtocolError::ByteCountMismatch { .. })]
        ));
    }

    #[test]
    fn test_standard_packing_law() {
        for addr in 0..=STANDARD_ADDRESS_MAX {
            let [mult, dl, sl] = pack_standard(addr, STANDARD_ADDRESS_MAX - addr).unwrap();
            let (dest, src) = unpack_standard(mult, dl, sl);
            assert_eq!(dest, addr);
            assert_eq!(src, STANDARD_ADDRESS_MAX - addr);
        }
        assert!(pack_standard(STANDARD_ADDRESS_MAX + 1, 0).is_err());
    }

    #[test]
    fn test_extended_round_trip_across_range() {
        for addr in [0u16, 1, 127, 128, 1023, 1024, 0x7FFF, 0xFFFF] {
            round_trip(Swp08Message::Connect {
                matrix: 2,
                level: 5,
                dest: addr,
                src: addr ^ 0x5AA5,
                extended: true,
            });
        }
    }

    #[test]
    fn test_interrogate_and_dump_round_trip() {
        round_trip(Swp08Message::Interrogate { matrix: 1, level: 3, dest: 200, extended: false });
        round_trip(Swp08Message::Interrogate { matrix: 1, level: 3, dest: 40000, extended: true });
        round_trip(Swp08Message::TallyDump { matrix: 0, level: 2, extended: false });
        round_trip(Swp08Message::TallyDump { matrix: 0, level: 2, extended: true });
    }

    #[test]
    fn test_name_reply_round_trip() {
        round_trip(Swp08Message::SourceNamesReply {
            matrix: 0,
            chars: CharLen::C8,
            start: 0,
            names: vec!["Cam 1".into(), "Cam 2".into(), "VTR".into()],
            extended: false,
        });
        round_trip(Swp08Message::DestNamesReply {
            matrix: 0,
            chars: CharLen::C12,
            start: 300,
            names: vec!["Monitor Wall".into()],
            extended: true,
        });
    }

    #[test]
    fn test_name_truncation_to_width() {
        let encoded = encode_message(&Swp08Message::SourceNamesReply {
            matrix: 0,
            chars: CharLen::C4,
            start: 0,
            names: vec!["A very long source name".into()],
            extended: false,
        })
        .unwrap();
        let mut reader = FrameReader::new();
        let items = reader.feed(&encoded);
        match &items[..] {
            [Swp08Item::Message(Swp08Message::SourceNamesReply { names, .. })] => {
                assert_eq!(names, &vec!["A ve".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_split_feed() {
        let msg = Swp08Message::Connect { matrix: 0, level: 0, dest: 3, src: 7, extended: false };
        let encoded = encode_message(&msg).unwrap();
        let mut reader = FrameReader::new();
        let mut items = Vec::new();
        for b in encoded.iter() {
            items.extend(reader.feed(&[*b]));
        }
        assert_eq!(items, vec![Swp08Item::Message(msg)]);
    }

    #[test]
    fn test_unknown_opcode_is_unhandled() {
        let wire = encode_frame(&[0x7Fu8, 0x00]);
        let mut reader = FrameReader::new();
        let items = reader.feed(&wire);
        assert_eq!(items, vec![Swp08Item::Unhandled(0x7F)]);
    }
}
