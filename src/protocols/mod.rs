//! Protocol implementations.
//!
//! Each protocol has a parser module holding the pure byte-level logic and a
//! handler module that drives it over a connection.
//!
//! - `caret`: `^`/`$` framed byte-shift streaming

pub mod caret;
