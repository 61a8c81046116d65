//! Wire codec and transport for the Stratum v2 Template Distribution role.
//!
//! Three layers, bottom up:
//!
//! - [`datatypes`] and [`codec`]: the bounded Sv2 value types and their
//!   little-endian field encoding.
//! - [`header`], [`common`], [`template_distribution`], [`parser`]: the
//!   6-byte message header, the typed messages, and the mapping between
//!   message-type bytes and variants.
//! - [`transport`]: the AEAD record layer that carries framed messages over
//!   an established Noise session, with fragmentation and silent rekeying.

pub mod codec;
pub mod common;
pub mod datatypes;
mod error;
pub mod header;
pub mod parser;
pub mod template_distribution;
pub mod transport;

pub use codec::{from_bytes, to_bytes, Decodable, Encodable, Reader};
pub use error::{Error, Result};
pub use header::{Header, EXTENSION_TYPE_NO_EXTENSION};
pub use parser::TpMessage;
pub use transport::{Incoming, Transport, MAX_RECORD_LEN, MAX_RECORD_PLAINTEXT};
