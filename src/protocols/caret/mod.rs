//! Caret protocol implementation.
//!
//! A streaming byte-shift service. Payload bytes framed by `^` and `$` are
//! shifted by one and echoed back as soon as they arrive:
//! - Server sends on connect: `*`
//! - Client sends: `^<payload>$`, in any chunking, any number of times
//! - Server streams: each payload byte plus one, modulo 256
//!
//! Bytes outside a frame are dropped. The sentinels themselves are never
//! echoed and cannot be escaped, so a payload can never contain `^` or `$`.
//!
//! ## Protocol Format
//!
//! ```text
//! Server:   *
//! Client:   ^abc$junk^00$
//! Server:   bcd11
//! ```
//!
//! There is no close frame. Either side ends the exchange by closing the
//! connection.

pub mod handler;
pub mod parser;

pub use handler::{handle_connection, SessionOptions};
