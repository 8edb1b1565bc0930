//! Grass Valley Native Series 7000 ASCII protocol codec.
//!
//! Frame format:
//! ```text
//! SOH  'N' '0' CC [HT P1 HT P2 ...]  CKS CKS  EOT
//! ```
//!
//! `CC` is the two-character command mnemonic, parameters are separated
//! by `HT (0x09)`, and `CKS` is `(256 - sum(body) mod 256) mod 256`
//! rendered as two upper-case hex digits. Indices travel as 4-digit
//! upper-case hex; level bitmaps as 8 hex digits with bit *i* selecting
//! level *i*; names are space-padded to eight characters on the wire.
//!
//! A checksum mismatch is reported alongside the decoded message rather
//! than discarding it: receivers log the warning and dispatch anyway.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Default TCP port for GV Native routers.
pub const GVNATIVE_PORT: u16 = 12345;

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const HT: u8 = 0x09;

/// Wire width of a GV Native name field.
pub const NAME_WIDTH: usize = 8;

const MAX_BODY: usize = 8192;

/// Name table selector for `QN` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameKind {
    /// `S` - source names.
    Source,
    /// `D` - destination names.
    Dest,
    /// `L` - level names.
    Level,
    /// `IS` - source names with indices.
    IndexedSource,
    /// `ID` - destination names with indices.
    IndexedDest,
    /// `XS` - extended source names (indexed).
    ExtSource,
    /// `XD` - extended destination names (indexed).
    ExtDest,
    /// `XL` - extended level names (indexed).
    ExtLevel,
}

impl NameKind {
    pub fn code(self) -> &'static str {
        match self {
            NameKind::Source => "S",
            NameKind::Dest => "D",
            NameKind::Level => "L",
            NameKind::IndexedSource => "IS",
            NameKind::IndexedDest => "ID",
            NameKind::ExtSource => "XS",
            NameKind::ExtDest => "XD",
            NameKind::ExtLevel => "XL",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "S" => Some(NameKind::Source),
            "D" => Some(NameKind::Dest),
            "L" => Some(NameKind::Level),
            "IS" => Some(NameKind::IndexedSource),
            "ID" => Some(NameKind::IndexedDest),
            "XS" => Some(NameKind::ExtSource),
            "XD" => Some(NameKind::ExtDest),
            "XL" => Some(NameKind::ExtLevel),
            _ => None,
        }
    }

    /// Indexed kinds carry a 4-hex index before each name.
    pub fn indexed(self) -> bool {
        !matches!(self, NameKind::Source | NameKind::Dest | NameKind::Level)
    }
}

/// Decoded GV Native message, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GvMessage {
    /// `QN` - query a name table.
    QueryNames { kind: NameKind },
    /// `QD` / `Qd` - destination status by name.
    QueryDestByName { name: String, extended: bool },
    /// `QJ` / `Qj` - bulk destination status by index.
    QueryDestBulk { start: Option<u32>, extended: bool },
    /// `QI` / `Qi` - one destination on one level.
    QueryDest { dest: u32, level: u32, extended: bool },
    /// `TA` - take by names, all levels.
    TakeByName { dest: String, src: String },
    /// `TD` - take by names on a level bitmap.
    TakeByNameLevels { dest: String, src: String, levels: u32 },
    /// `TI` - take by indices on one level.
    TakeIndex { dest: u32, src: u32, level: u32 },
    /// `TJ` - take by indices on a level bitmap.
    TakeIndexLevels { dest: u32, src: u32, levels: u32 },
    /// `BK` - background/port configuration, single-character sub-code.
    Background { sub: char, args: Vec<String> },
    /// `QE` - query the error table.
    QueryErrors,
    /// `QT` - query time of day.
    QueryTime,

    /// `NQ` - name table contents. Entries are `(index, name)`;
    /// non-indexed kinds number sequentially from zero.
    NamesReply { kind: NameKind, entries: Vec<(u32, String)> },
    /// `DQ` - destination status by name, one source name per level.
    DestByNameReply { dest: String, sources: Vec<String> },
    /// `JQ` - one destination's status, one source index per level.
    DestBulkReply { dest: u32, sources: Vec<u32> },
    /// `IQ` - single destination x level status.
    DestReply { dest: u32, level: u32, src: u32 },
    /// `KB` - background reply, echoes the sub-code.
    BackgroundReply { sub: char, args: Vec<String> },
    /// `EQ` - error table contents.
    ErrorTableReply { entries: Vec<String> },
    /// `TQ` - time of day.
    TimeReply { time: String },
    /// `ER` - command acknowledge; code `00` is success, the echo names
    /// the acknowledged mnemonic.
    CommandError { code: u8, echo: Option<String> },
}

/// One decoded frame plus the result of checksum verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GvItem {
    pub message: Result<GvMessage, ProtocolError>,
    pub checksum_ok: bool,
}

/// Error codes used in `ER` replies.
pub mod er_code {
    pub const OK: u8 = 0;
    pub const SYNTAX: u8 = 1;
    pub const RANGE: u8 = 2;
    pub const UNKNOWN_NAME: u8 = 3;
    pub const REFUSED: u8 = 4;
}

/// Checksum over the body bytes: two's complement of the byte sum.
pub fn checksum(body: &[u8]) -> u8 {
    0u8.wrapping_sub(body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)))
}

/// Render an index as 4-digit upper-case hex.
pub fn format_index(v: u32) -> String {
    format!("{v:04X}")
}

pub fn parse_index(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 8 {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// Render a level bitmap as 8 upper-case hex digits.
pub fn format_level_bitmap(mask: u32) -> String {
    format!("{mask:08X}")
}

pub fn parse_level_bitmap(s: &str) -> Option<u32> {
    if s.len() != 8 {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// Space-pad (or truncate) a name to the fixed wire width.
pub fn pad_name(name: &str) -> String {
    let mut out: String = name.chars().take(NAME_WIDTH).collect();
    while out.len() < NAME_WIDTH {
        out.push(' ');
    }
    out
}

/// Encode a message into a complete SOH..EOT frame.
pub fn encode_message(msg: &GvMessage) -> Bytes {
    let body = encode_body(msg);
    encode_frame(&body)
}

/// Frame an already-built body with checksum and delimiters.
pub fn encode_frame(body: &str) -> Bytes {
    let cks = checksum(body.as_bytes());
    let mut out = BytesMut::with_capacity(body.len() + 4);
    out.put_u8(SOH);
    out.put_slice(body.as_bytes());
    out.put_slice(format!("{cks:02X}").as_bytes());
    out.put_u8(EOT);
    out.freeze()
}

fn encode_body(msg: &GvMessage) -> String {
    let (mnemonic, params): (&str, Vec<String>) = match msg {
        GvMessage::QueryNames { kind } => ("QN", vec![kind.code().to_string()]),
        GvMessage::QueryDestByName { name, extended } => (
            if *extended { "Qd" } else { "QD" },
            vec![pad_name(name)],
        ),
        GvMessage::QueryDestBulk { start, extended } => (
            if *extended { "Qj" } else { "QJ" },
            start.map(format_index).into_iter().collect(),
        ),
        GvMessage::QueryDest { dest, level, extended } => (
            if *extended { "Qi" } else { "QI" },
            vec![format_index(*dest), format_index(*level)],
        ),
        GvMessage::TakeByName { dest, src } => ("TA", vec![pad_name(dest), pad_name(src)]),
        GvMessage::TakeByNameLevels { dest, src, levels } => (
            "TD",
            vec![pad_name(dest), pad_name(src), format_level_bitmap(*levels)],
        ),
        GvMessage::TakeIndex { dest, src, level } => (
            "TI",
            vec![format_index(*dest), format_index(*src), format_index(*level)],
        ),
        GvMessage::TakeIndexLevels { dest, src, levels } => (
            "TJ",
            vec![format_index(*dest), format_index(*src), format_level_bitmap(*levels)],
        ),
        GvMessage::Background { sub, args } => (
            "BK",
            std::iter::once(sub.to_string())
                .chain(args.iter().cloned())
                .collect(),
        ),
        GvMessage::QueryErrors => ("QE", Vec::new()),
        GvMessage::QueryTime => ("QT", Vec::new()),
        GvMessage::NamesReply { kind, entries } => {
            let mut params = vec![kind.code().to_string()];
            for (index, name) in entries {
                if kind.indexed() {
                    params.push(format_index(*index));
                }
                params.push(pad_name(name));
            }
            ("NQ", params)
        }
        GvMessage::DestByNameReply { dest, sources } => (
            "DQ",
            std::iter::once(pad_name(dest))
                .chain(sources.iter().map(|s| pad_name(s)))
                .collect(),
        ),
        GvMessage::DestBulkReply { dest, sources } => (
            "JQ",
            std::iter::once(format_index(*dest))
                .chain(sources.iter().copied().map(format_index))
                .collect(),
        ),
        GvMessage::DestReply { dest, level, src } => (
            "IQ",
            vec![format_index(*dest), format_index(*level), format_index(*src)],
        ),
        GvMessage::BackgroundReply { sub, args } => (
            "KB",
            std::iter::once(sub.to_string())
                .chain(args.iter().cloned())
                .collect(),
        ),
        GvMessage::ErrorTableReply { entries } => ("EQ", entries.clone()),
        GvMessage::TimeReply { time } => ("TQ", vec![time.clone()]),
        GvMessage::CommandError { code, echo } => (
            "ER",
            std::iter::once(format!("{code:02}"))
                .chain(echo.iter().cloned())
                .collect(),
        ),
    };

    let mut body = format!("N0{mnemonic}");
    for p in &params {
        body.push('\t');
        body.push_str(p);
    }
    body
}

/// Streaming frame reader: feed socket bytes, collect decoded items.
#[derive(Debug, Default)]
pub struct GvReader {
    in_frame: bool,
    buf: Vec<u8>,
}

impl GvReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<GvItem> {
        let mut items = Vec::new();
        for &b in chunk {
            if !self.in_frame {
                if b == SOH {
                    self.in_frame = true;
                    self.buf.clear();
                }
                continue;
            }
            match b {
                EOT => {
                    items.push(finish_frame(&self.buf));
                    self.in_frame = false;
                }
                SOH => {
                    // previous frame never terminated
                    items.push(GvItem {
                        message: Err(ProtocolError::Truncated {
                            expected: self.buf.len() + 1,
                            actual: self.buf.len(),
                        }),
                        checksum_ok: false,
                    });
                    self.buf.clear();
                }
                _ => {
                    if self.buf.len() >= MAX_BODY {
                        items.push(GvItem {
                            message: Err(ProtocolError::FrameTooLarge(self.buf.len(), MAX_BODY)),
                            checksum_ok: false,
                        });
                        self.buf.clear();
                        self.in_frame = false;
                    } else {
                        self.buf.push(b);
                    }
                }
            }
        }
        items
    }
}

fn finish_frame(raw: &[u8]) -> GvItem {
    if raw.len() < 6 {
        // "N0" + mnemonic + two checksum chars
        return GvItem {
            message: Err(ProtocolError::Truncated { expected: 6, actual: raw.len() }),
            checksum_ok: false,
        };
    }

    let (body, cks_chars) = raw.split_at(raw.len() - 2);
    let computed = checksum(body);
    let received = std::str::from_utf8(cks_chars)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok());
    let checksum_ok = received == Some(computed);

    let message = match std::str::from_utf8(body) {
        Ok(text) => parse_body(text),
        Err(_) => Err(ProtocolError::InvalidUtf8),
    };

    GvItem { message, checksum_ok }
}

fn parse_body(body: &str) -> Result<GvMessage, ProtocolError> {
    let rest = body
        .strip_prefix("N0")
        .ok_or_else(|| ProtocolError::Malformed("missing N0 preamble".into()))?;
    if rest.len() < 2 {
        return Err(ProtocolError::Malformed("missing command mnemonic".into()));
    }
    let (mnemonic, rest) = rest.split_at(2);
    let params: Vec<&str> = match rest.strip_prefix('\t') {
        Some(p) => p.split('\t').collect(),
        None if rest.is_empty() => Vec::new(),
        None => {
            return Err(ProtocolError::Malformed(format!(
                "junk after mnemonic {mnemonic}"
            )))
        }
    };

    let malformed = |what: &str| ProtocolError::Malformed(format!("{mnemonic}: {what}"));
    let index_at = |i: usize| -> Result<u32, ProtocolError> {
        params
            .get(i)
            .and_then(|s| parse_index(s))
            .ok_or_else(|| malformed("bad index"))
    };
    let name_at = |i: usize| -> Result<String, ProtocolError> {
        params
            .get(i)
            .map(|s| s.trim_end().to_string())
            .ok_or_else(|| malformed("missing name"))
    };

    let msg = match mnemonic {
        "QN" => {
            let kind = params
                .first()
                .and_then(|s| NameKind::from_code(s))
                .ok_or_else(|| malformed("unknown name table"))?;
            GvMessage::QueryNames { kind }
        }
        "QD" | "Qd" => GvMessage::QueryDestByName {
            name: name_at(0)?,
            extended: mnemonic == "Qd",
        },
        "QJ" | "Qj" => {
            let start = match params.first() {
                Some(s) => Some(parse_index(s).ok_or_else(|| malformed("bad start index"))?),
                None => None,
            };
            GvMessage::QueryDestBulk { start, extended: mnemonic == "Qj" }
        }
        "QI" | "Qi" => GvMessage::QueryDest {
            dest: index_at(0)?,
            level: index_at(1)?,
            extended: mnemonic == "Qi",
        },
        "TA" => GvMessage::TakeByName { dest: name_at(0)?, src: name_at(1)? },
        "TD" => GvMessage::TakeByNameLevels {
            dest: name_at(0)?,
            src: name_at(1)?,
            levels: params
                .get(2)
                .and_then(|s| parse_level_bitmap(s))
                .ok_or_else(|| malformed("bad level bitmap"))?,
        },
        "TI" => GvMessage::TakeIndex {
            dest: index_at(0)?,
            src: index_at(1)?,
            level: index_at(2)?,
        },
        "TJ" => GvMessage::TakeIndexLevels {
            dest: index_at(0)?,
            src: index_at(1)?,
            levels: params
                .get(2)
                .and_then(|s| parse_level_bitmap(s))
                .ok_or_else(|| malformed("bad level bitmap"))?,
        },
        "BK" => {
            let sub = params
                .first()
                .filter(|s| s.chars().count() == 1)
                .and_then(|s| s.chars().next())
                .ok_or_else(|| malformed("missing sub-code"))?;
            GvMessage::Background {
                sub,
                args: params[1..].iter().map(|s| s.to_string()).collect(),
            }
        }
        "QE" => GvMessage::QueryErrors,
        "QT" => GvMessage::QueryTime,
        "NQ" => {
            let kind = params
                .first()
                .and_then(|s| NameKind::from_code(s))
                .ok_or_else(|| malformed("unknown name table"))?;
            let rest = &params[1..];
            let mut entries = Vec::new();
            if kind.indexed() {
                if rest.len() % 2 != 0 {
                    return Err(malformed("odd indexed name list"));
                }
                for pair in rest.chunks(2) {
                    let index = parse_index(pair[0]).ok_or_else(|| malformed("bad index"))?;
                    entries.push((index, pair[1].trim_end().to_string()));
                }
            } else {
                for (i, name) in rest.iter().enumerate() {
                    entries.push((i as u32, name.trim_end().to_string()));
                }
            }
            GvMessage::NamesReply { kind, entries }
        }
        "DQ" => GvMessage::DestByNameReply {
            dest: name_at(0)?,
            sources: params[1..].iter().map(|s| s.trim_end().to_string()).collect(),
        },
        "JQ" => {
            let dest = index_at(0)?;
            let sources = params[1..]
                .iter()
                .map(|s| parse_index(s).ok_or_else(|| malformed("bad source index")))
                .collect::<Result<Vec<_>, _>>()?;
            GvMessage::DestBulkReply { dest, sources }
        }
        "IQ" => GvMessage::DestReply {
            dest: index_at(0)?,
            level: index_at(1)?,
            src: index_at(2)?,
        },
        "KB" => {
            let sub = params
                .first()
                .filter(|s| s.chars().count() == 1)
                .and_then(|s| s.chars().next())
                .ok_or_else(|| malformed("missing sub-code"))?;
            GvMessage::BackgroundReply {
                sub,
                args: params[1..].iter().map(|s| s.to_string()).collect(),
            }
        }
        "EQ" => GvMessage::ErrorTableReply {
            entries: params.iter().map(|s| s.to_string()).collect(),
        },
        "TQ" => GvMessage::TimeReply { time: name_at(0)? },
        "ER" => {
            let code = params
                .first()
                .and_then(|s| s.parse::<u8>().ok())
                .ok_or_else(|| malformed("bad error code"))?;
            GvMessage::CommandError {
                code,
                echo: params.get(1).map(|s| s.to_string()),
            }
        }
        _ => return Err(ProtocolError::Malformed(format!("unknown mnemonic {mnemonic}"))),
    };

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: GvMessage) {
        let encoded = encode_message(&msg);
        let mut reader = GvReader::new();
        let items = reader.feed(&encoded);
        assert_eq!(items.len(), 1, "{msg:?}");
        assert!(items[0].checksum_ok, "{msg:?}");
        assert_eq!(items[0].message, Ok(msg));
    }

    #[test]
    fn test_take_index_scenario_bytes() {
        // TI dest 3, src 7, level 0 with its literal wire checksum
        let mut wire = vec![SOH];
        wire.extend_from_slice(b"N0TI\t0003\t0007\t0000");
        wire.extend_from_slice(b"80");
        wire.push(EOT);

        let mut reader = GvReader::new();
        let items = reader.feed(&wire);
        assert_eq!(items.len(), 1);
        assert!(items[0].checksum_ok);
        assert_eq!(
            items[0].message,
            Ok(GvMessage::TakeIndex { dest: 3, src: 7, level: 0 })
        );

        // encoder produces the same frame
        let encoded = encode_message(&GvMessage::TakeIndex { dest: 3, src: 7, level: 0 });
        assert_eq!(&encoded[..], &wire[..]);
    }

    #[test]
    fn test_checksum_mismatch_still_dispatches() {
        let mut wire = encode_message(&GvMessage::QueryTime).to_vec();
        let n = wire.len();
        wire[n - 2] = b'0'; // clobber one checksum digit
        wire[n - 3] = b'0';
        let mut reader = GvReader::new();
        let items = reader.feed(&wire);
        assert_eq!(items.len(), 1);
        assert!(!items[0].checksum_ok);
        assert_eq!(items[0].message, Ok(GvMessage::QueryTime));
    }

    #[test]
    fn test_checksum_law() {
        for msg in [
            GvMessage::QueryNames { kind: NameKind::IndexedSource },
            GvMessage::TakeByName { dest: "MON 1".into(), src: "CAM 7".into() },
            GvMessage::DestBulkReply { dest: 3, sources: vec![7, 2] },
        ] {
            let encoded = encode_message(&msg);
            let body = &encoded[1..encoded.len() - 3];
            let cks = std::str::from_utf8(&encoded[encoded.len() - 3..encoded.len() - 1])
                .unwrap()
                .to_string();
            assert_eq!(cks, format!("{:02X}", checksum(body)));
        }
    }

    #[test]
    fn test_query_round_trips() {
        round_trip(GvMessage::QueryNames { kind: NameKind::Source });
        round_trip(GvMessage::QueryNames { kind: NameKind::ExtLevel });
        round_trip(GvMessage::QueryDestByName { name: "MON 1".into(), extended: false });
        round_trip(GvMessage::QueryDestBulk { start: None, extended: false });
        round_trip(GvMessage::QueryDestBulk { start: Some(4), extended: true });
        round_trip(GvMessage::QueryDest { dest: 11, level: 1, extended: false });
        round_trip(GvMessage::QueryErrors);
        round_trip(GvMessage::QueryTime);
    }

    #[test]
    fn test_take_round_trips() {
        round_trip(GvMessage::TakeByName { dest: "MON 1".into(), src: "CAM 7".into() });
        round_trip(GvMessage::TakeByNameLevels {
            dest: "MON 1".into(),
            src: "CAM 7".into(),
            levels: 0x0000_0003,
        });
        round_trip(GvMessage::TakeIndex { dest: 3, src: 7, level: 0 });
        round_trip(GvMessage::TakeIndexLevels { dest: 3, src: 7, levels: 0xFFFF_FFFF });
    }

    #[test]
    fn test_reply_round_trips() {
        round_trip(GvMessage::NamesReply {
            kind: NameKind::Level,
            entries: vec![(0, "Video".into()), (1, "Audio 1".into())],
        });
        round_trip(GvMessage::NamesReply {
            kind: NameKind::IndexedDest,
            entries: vec![(0, "MON 1".into()), (5, "MON 2".into())],
        });
        round_trip(GvMessage::DestByNameReply {
            dest: "MON 1".into(),
            sources: vec!["CAM 7".into()],
        });
        round_trip(GvMessage::DestBulkReply { dest: 3, sources: vec![7] });
        round_trip(GvMessage::DestReply { dest: 3, level: 0, src: 7 });
        round_trip(GvMessage::BackgroundReply {
            sub: 'F',
            args: vec!["00000001".into()],
        });
        round_trip(GvMessage::ErrorTableReply { entries: vec![] });
        round_trip(GvMessage::TimeReply { time: "12:34:56".into() });
        round_trip(GvMessage::CommandError { code: 0, echo: Some("TI".into()) });
        round_trip(GvMessage::CommandError { code: 2, echo: None });
    }

    #[test]
    fn test_background_round_trips() {
        round_trip(GvMessage::Background { sub: 'N', args: vec![] });
        round_trip(GvMessage::Background { sub: 'F', args: vec![] });
        round_trip(GvMessage::Background { sub: 'E', args: vec!["1".into()] });
    }

    #[test]
    fn test_level_bitmap_rendering() {
        assert_eq!(format_level_bitmap(0), "00000000");
        assert_eq!(format_level_bitmap(0x8000_0001), "80000001");
        assert_eq!(parse_level_bitmap("00000003"), Some(3));
        assert_eq!(parse_level_bitmap("0003"), None);
    }

    #[test]
    fn test_unknown_mnemonic() {
        let wire = encode_frame("N0ZZ");
        let mut reader = GvReader::new();
        let items = reader.feed(&wire);
        assert!(items[0].checksum_ok);
        assert!(matches!(items[0].message, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_split_feed() {
        let encoded = encode_message(&GvMessage::QueryDestBulk { start: None, extended: false });
        let mut reader = GvReader::new();
        let mut items = Vec::new();
        for b in encoded.iter() {
            items.extend(reader.feed(&[*b]));
        }
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].message,
            Ok(GvMessage::QueryDestBulk { start: None, extended: false })
        );
    }

    #[test]
    fn test_restarted_frame_is_reported() {
        let mut reader = GvReader::new();
        let mut wire = vec![SOH];
        wire.extend_from_slice(b"N0QT");
        wire.push(SOH); // second SOH aborts the first frame
        wire.extend_from_slice(b"N0QT");
        wire.extend_from_slice(format!("{:02X}", checksum(b"N0QT")).as_bytes());
        wire.push(EOT);
        let items = reader.feed(&wire);
        assert_eq!(items.len(), 2);
        assert!(items[0].message.is_err());
        assert_eq!(items[1].message, Ok(GvMessage::QueryTime));
    }
}
