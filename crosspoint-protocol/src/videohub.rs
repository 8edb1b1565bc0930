//! Blackmagic VideoHub text protocol codec.
//!
//! Frame format:
//! ```text
//! HEADER LINE:\n      <- block name, terminated by a colon
//! <index> <value>\n   <- zero or more body lines
//! \n                  <- blank line ends the block
//! ```
//!
//! Line endings `\r\n` and bare `\r` are normalized to `\n` on ingress.
//! A request block with an empty body is a *query*; a non-empty body is
//! an *update*. Replies are the bare `ACK` / `NAK` blocks.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Default TCP port a VideoHub listens on.
pub const VIDEOHUB_PORT: u16 = 9990;

/// Protocol version announced in the preamble.
pub const PREAMBLE_VERSION: &str = "2.7";

/// Cap on a single unterminated block before the connection is dropped.
pub const MAX_BLOCK_BYTES: usize = 64 * 1024;

/// Lock state character as it appears on the wire.
///
/// `O`/`L`/`U` appear in status blocks (relative to the receiving peer);
/// requests use `O` (take), `U` (release) and `F` (force release).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockChar {
    /// `O` - locked by the receiving peer (status) or "take" (request).
    Owned,
    /// `L` - locked by some other peer.
    Locked,
    /// `U` - unlocked (status) or "release" (request).
    Unlocked,
    /// `F` - force release, request only.
    ForceUnlock,
}

impl LockChar {
    pub fn as_char(self) -> char {
        match self {
            LockChar::Owned => 'O',
            LockChar::Locked => 'L',
            LockChar::Unlocked => 'U',
            LockChar::ForceUnlock => 'F',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'O' => Some(LockChar::Owned),
            'L' => Some(LockChar::Locked),
            'U' => Some(LockChar::Unlocked),
            'F' => Some(LockChar::ForceUnlock),
            _ => None,
        }
    }
}

/// Device identity section of the status dump.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub present: bool,
    pub model_name: String,
    pub friendly_name: String,
    pub unique_id: String,
    pub video_inputs: u32,
    pub video_outputs: u32,
}

/// Indexed label lines (`<index> <label>`), labels free-form to end of line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelLines {
    pub entries: Vec<(u32, String)>,
    /// Body lines that did not parse; they count as rejected entries.
    pub invalid: usize,
}

/// Indexed routing lines (`<dest> <src>`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteLines {
    pub entries: Vec<(u32, u32)>,
    pub invalid: usize,
}

/// Indexed lock lines (`<dest> <O|L|U|F>`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockLines {
    pub entries: Vec<(u32, LockChar)>,
    pub invalid: usize,
}

impl LabelLines {
    pub fn new(entries: Vec<(u32, String)>) -> Self {
        Self { entries, invalid: 0 }
    }

    /// Empty body means the block is a query, not an update.
    pub fn is_query(&self) -> bool {
        self.entries.is_empty() && self.invalid == 0
    }
}

impl RouteLines {
    pub fn new(entries: Vec<(u32, u32)>) -> Self {
        Self { entries, invalid: 0 }
    }

    pub fn is_query(&self) -> bool {
        self.entries.is_empty() && self.invalid == 0
    }
}

impl LockLines {
    pub fn new(entries: Vec<(u32, LockChar)>) -> Self {
        Self { entries, invalid: 0 }
    }

    pub fn is_query(&self) -> bool {
        self.entries.is_empty() && self.invalid == 0
    }
}

/// A complete VideoHub block, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Ping,
    Ack,
    Nak,
    Preamble { version: String },
    Device(DeviceInfo),
    InputLabels(LabelLines),
    OutputLabels(LabelLines),
    Routing(RouteLines),
    Locks(LockLines),
    /// A header this implementation does not recognize; ignored silently.
    Unknown(String),
}

const H_PING: &str = "PING";
const H_PREAMBLE: &str = "PROTOCOL PREAMBLE";
const H_DEVICE: &str = "VIDEOHUB DEVICE";
const H_INPUT_LABELS: &str = "INPUT LABELS";
const H_OUTPUT_LABELS: &str = "OUTPUT LABELS";
const H_ROUTING: &str = "VIDEO OUTPUT ROUTING";
const H_LOCKS: &str = "VIDEO OUTPUT LOCKS";

/// Stream reader: feed raw socket bytes, pull complete blocks.
///
/// Normalizes line endings as bytes arrive, so a `\r\n` split across two
/// reads is still collapsed to a single `\n`.
#[derive(Debug, Default)]
pub struct BlockReader {
    buf: BytesMut,
    last_was_cr: bool,
}

impl BlockReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the socket, normalizing `\r\n` / `\r` to `\n`.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.reserve(chunk.len());
        for &b in chunk {
            match b {
                b'\r' => {
                    self.buf.put_u8(b'\n');
                    self.last_was_cr = true;
                }
                b'\n' if self.last_was_cr => {
                    // second half of a CRLF, already emitted
                    self.last_was_cr = false;
                }
                _ => {
                    self.buf.put_u8(b);
                    self.last_was_cr = false;
                }
            }
        }
    }

    /// Pull the next complete block, if one is buffered.
    ///
    /// Returns `Err` on per-block overflow or invalid UTF-8; the caller
    /// is expected to close the connection.
    pub fn next_block(&mut self) -> Result<Option<Block>, ProtocolError> {
        loop {
            let end = self.buf.windows(2).position(|w| w == b"\n\n");
            match end {
                Some(pos) => {
                    let raw = self.buf.split_to(pos + 2);
                    let text = std::str::from_utf8(&raw[..pos])
                        .map_err(|_| ProtocolError::InvalidUtf8)?;
                    let text = text.trim_start_matches('\n');
                    if text.is_empty() {
                        continue; // stray blank line between blocks
                    }
                    return Ok(Some(parse_block(text)));
                }
                None => {
                    if self.buf.len() > MAX_BLOCK_BYTES {
                        return Err(ProtocolError::BlockTooLarge { max: MAX_BLOCK_BYTES });
                    }
                    return Ok(None);
                }
            }
        }
    }
}

fn parse_block(text: &str) -> Block {
    let mut lines = text.lines();
    let header = lines.next().unwrap_or("");

    match header {
        "ACK" => return Block::Ack,
        "NAK" => return Block::Nak,
        _ => {}
    }

    let Some(name) = header.strip_suffix(':') else {
        return Block::Unknown(header.to_string());
    };

    match name {
        H_PING => Block::Ping,
        H_PREAMBLE => {
            let mut version = String::new();
            for line in lines {
                if let Some(v) = line.strip_prefix("Version:") {
                    version = v.trim().to_string();
                }
            }
            Block::Preamble { version }
        }
        H_DEVICE => Block::Device(parse_device(lines)),
        H_INPUT_LABELS => Block::InputLabels(parse_labels(lines)),
        H_OUTPUT_LABELS => Block::OutputLabels(parse_labels(lines)),
        H_ROUTING => Block::Routing(parse_routes(lines)),
        H_LOCKS => Block::Locks(parse_locks(lines)),
        _ => Block::Unknown(name.to_string()),
    }
}

fn parse_device<'a>(lines: impl Iterator<Item = &'a str>) -> DeviceInfo {
    let mut info = DeviceInfo::default();
    for line in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Device present" => info.present = value == "true",
            "Model name" => info.model_name = value.to_string(),
            "Friendly name" => info.friendly_name = value.to_string(),
            "Unique ID" => info.unique_id = value.to_string(),
            "Video inputs" => info.video_inputs = value.parse().unwrap_or(0),
            "Video outputs" => info.video_outputs = value.parse().unwrap_or(0),
            _ => {} // unrecognized keys are ignored
        }
    }
    info
}

fn parse_labels<'a>(lines: impl Iterator<Item = &'a str>) -> LabelLines {
    let mut out = LabelLines::default();
    for line in lines {
        // the first whitespace run after the index delimits; the rest is
        // the literal label, embedded spaces included
        let index_end = line.find(char::is_whitespace).unwrap_or(line.len());
        let (index, rest) = line.split_at(index_end);
        match index.parse::<u32>() {
            Ok(i) => out.entries.push((i, rest.trim_start().to_string())),
            Err(_) => out.invalid += 1,
        }
    }
    out
}

fn parse_routes<'a>(lines: impl Iterator<Item = &'a str>) -> RouteLines {
    let mut out = RouteLines::default();
    for line in lines {
        let mut parts = line.split_whitespace();
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(s), None) => match (d.parse(), s.parse()) {
                (Ok(d), Ok(s)) => Some((d, s)),
                _ => None,
            },
            _ => None,
        };
        match parsed {
            Some(pair) => out.entries.push(pair),
            None => out.invalid += 1,
        }
    }
    out
}

fn parse_locks<'a>(lines: impl Iterator<Item = &'a str>) -> LockLines {
    let mut out = LockLines::default();
    for line in lines {
        let mut parts = line.split_whitespace();
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(state), None) if state.len() == 1 => {
                match (d.parse(), LockChar::from_char(state.chars().next().unwrap_or(' '))) {
                    (Ok(d), Some(c)) => Some((d, c)),
                    _ => None,
                }
            }
            _ => None,
        };
        match parsed {
            Some(pair) => out.entries.push(pair),
            None => out.invalid += 1,
        }
    }
    out
}

/// Encode a single block, including its terminating blank line.
pub fn encode_block(block: &Block) -> Bytes {
    let mut out = String::new();
    write_block(&mut out, block);
    Bytes::from(out)
}

/// Encode several blocks back to back (the initial status dump).
pub fn encode_blocks(blocks: &[Block]) -> Bytes {
    let mut out = String::new();
    for block in blocks {
        write_block(&mut out, block);
    }
    Bytes::from(out)
}

fn write_block(out: &mut String, block: &Block) {
    use std::fmt::Write;

    match block {
        Block::Ping => out.push_str("PING:\n"),
        Block::Ack => out.push_str("ACK\n"),
        Block::Nak => out.push_str("NAK\n"),
        Block::Preamble { version } => {
            let _ = write!(out, "{H_PREAMBLE}:\nVersion: {version}\n");
        }
        Block::Device(info) => {
            let _ = write!(
                out,
                "{H_DEVICE}:\n\
                 Device present: {}\n\
                 Model name: {}\n\
                 Friendly name: {}\n\
                 Unique ID: {}\n\
                 Video inputs: {}\n\
                 Video outputs: {}\n",
                if info.present { "true" } else { "false" },
                info.model_name,
                info.friendly_name,
                info.unique_id,
                info.video_inputs,
                info.video_outputs,
            );
        }
        Block::InputLabels(labels) => {
            out.push_str(H_INPUT_LABELS);
            out.push_str(":\n");
            for (i, label) in &labels.entries {
                let _ = write!(out, "{i} {label}\n");
            }
        }
        Block::OutputLabels(labels) => {
            out.push_str(H_OUTPUT_LABELS);
            out.push_str(":\n");
            for (i, label) in &labels.entries {
                let _ = write!(out, "{i} {label}\n");
            }
        }
        Block::Routing(routes) => {
            out.push_str(H_ROUTING);
            out.push_str(":\n");
            for (d, s) in &routes.entries {
                let _ = write!(out, "{d} {s}\n");
            }
        }
        Block::Locks(locks) => {
            out.push_str(H_LOCKS);
            out.push_str(":\n");
            for (d, c) in &locks.entries {
                let _ = write!(out, "{d} {}\n", c.as_char());
            }
        }
        Block::Unknown(name) => {
            let _ = write!(out, "{name}:\n");
        }
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut BlockReader) -> Vec<Block> {
        let mut blocks = Vec::new();
        while let Some(b) = reader.next_block().unwrap() {
            blocks.push(b);
        }
        blocks
    }

    #[test]
    fn test_ping() {
        let mut r = BlockReader::new();
        r.push(b"PING:\n\n");
        assert_eq!(read_all(&mut r), vec![Block::Ping]);
    }

    #[test]
    fn test_ack_nak() {
        let mut r = BlockReader::new();
        r.push(b"ACK\n\nNAK\n\n");
        assert_eq!(read_all(&mut r), vec![Block::Ack, Block::Nak]);
    }

    #[test]
    fn test_routing_update() {
        let mut r = BlockReader::new();
        r.push(b"VIDEO OUTPUT ROUTING:\n3 7\n0 11\n\n");
        let blocks = read_all(&mut r);
        assert_eq!(
            blocks,
            vec![Block::Routing(RouteLines::new(vec![(3, 7), (0, 11)]))]
        );
    }

    #[test]
    fn test_empty_body_is_query() {
        let mut r = BlockReader::new();
        r.push(b"VIDEO OUTPUT ROUTING:\n\n");
        match read_all(&mut r).remove(0) {
            Block::Routing(lines) => assert!(lines.is_query()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_body_line_is_not_query() {
        let mut r = BlockReader::new();
        r.push(b"VIDEO OUTPUT ROUTING:\n3 banana\n\n");
        match read_all(&mut r).remove(0) {
            Block::Routing(lines) => {
                assert!(lines.entries.is_empty());
                assert_eq!(lines.invalid, 1);
                assert!(!lines.is_query());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_label_keeps_embedded_spaces() {
        let mut r = BlockReader::new();
        r.push(b"INPUT LABELS:\n2 Camera 1 (left)\n\n");
        match read_all(&mut r).remove(0) {
            Block::InputLabels(lines) => {
                assert_eq!(lines.entries, vec![(2, "Camera 1 (left)".to_string())]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_line_ending_normalization() {
        let mut r = BlockReader::new();
        r.push(b"PING:\r\n\r\n");
        assert_eq!(read_all(&mut r), vec![Block::Ping]);

        let mut r = BlockReader::new();
        r.push(b"PING:\r\r");
        assert_eq!(read_all(&mut r), vec![Block::Ping]);
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut r = BlockReader::new();
        r.push(b"PING:\r");
        r.push(b"\n\r\n");
        assert_eq!(read_all(&mut r), vec![Block::Ping]);
    }

    #[test]
    fn test_partial_block_stays_buffered() {
        let mut r = BlockReader::new();
        r.push(b"VIDEO OUTPUT ROUTING:\n3 7\n");
        assert_eq!(r.next_block().unwrap(), None);
        r.push(b"\n");
        assert!(matches!(r.next_block().unwrap(), Some(Block::Routing(_))));
    }

    #[test]
    fn test_unknown_header_is_surfaced() {
        let mut r = BlockReader::new();
        r.push(b"VIDEO MONITORING OUTPUT ROUTING:\n0 4\n\n");
        assert_eq!(
            read_all(&mut r),
            vec![Block::Unknown("VIDEO MONITORING OUTPUT ROUTING".to_string())]
        );
    }

    #[test]
    fn test_block_overflow_errors() {
        let mut r = BlockReader::new();
        r.push(b"INPUT LABELS:\n");
        let filler = vec![b'x'; MAX_BLOCK_BYTES + 16];
        r.push(&filler);
        assert!(matches!(
            r.next_block(),
            Err(ProtocolError::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn test_device_round_trip() {
        let info = DeviceInfo {
            present: true,
            model_name: "Smart Videohub 12x12".to_string(),
            friendly_name: "Studio B hub".to_string(),
            unique_id: "A1B2C3D4E5F6".to_string(),
            video_inputs: 12,
            video_outputs: 12,
        };
        let encoded = encode_block(&Block::Device(info.clone()));
        let mut r = BlockReader::new();
        r.push(&encoded);
        assert_eq!(read_all(&mut r), vec![Block::Device(info)]);
    }

    #[test]
    fn test_all_blocks_round_trip() {
        let blocks = vec![
            Block::Ping,
            Block::Ack,
            Block::Nak,
            Block::Preamble { version: PREAMBLE_VERSION.to_string() },
            Block::InputLabels(LabelLines::new(vec![(0, "Cam 1".into()), (1, "VTR".into())])),
            Block::OutputLabels(LabelLines::new(vec![(0, "Monitor".into())])),
            Block::Routing(RouteLines::new(vec![(0, 0), (3, 7)])),
            Block::Locks(LockLines::new(vec![
                (0, LockChar::Owned),
                (1, LockChar::Locked),
                (2, LockChar::Unlocked),
            ])),
        ];
        let encoded = encode_blocks(&blocks);
        let mut r = BlockReader::new();
        r.push(&encoded);
        assert_eq!(read_all(&mut r), blocks);
    }
}
