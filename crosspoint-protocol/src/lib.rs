//! Wire codecs for the three broadcast router-control protocols.
//!
//! Each codec is a pair of pure encode/decode functions plus a stream
//! reader that buffers partial frames; none of them perform I/O.
//!
//! - [`videohub`] - Blackmagic VideoHub: text blocks framed by a blank
//!   line, free-form UTF-8 labels.
//! - [`swp08`] - SW-P-08 (Probel): `DLE STX .. DLE ETX` binary frames
//!   with DLE doubling, a byte count and a two's-complement checksum.
//! - [`gvnative`] - Grass Valley Native Series 7000: `SOH .. EOT` ASCII
//!   frames with an upper-case hex checksum and HT-separated parameters.
//!
//! # Example
//!
//! ```rust
//! use crosspoint_protocol::swp08::{encode_message, FrameReader, Swp08Item, Swp08Message};
//!
//! let msg = Swp08Message::Connect { matrix: 0, level: 0, dest: 3, src: 7, extended: false };
//! let wire = encode_message(&msg).unwrap();
//!
//! let mut reader = FrameReader::new();
//! assert_eq!(reader.feed(&wire), vec![Swp08Item::Message(msg)]);
//! ```

pub mod error;
pub mod gvnative;
pub mod swp08;
pub mod videohub;

pub use error::ProtocolError;
