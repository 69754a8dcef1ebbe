//! Caret protocol transcoder.
//!
//! Pure byte-level state machine with no I/O. Output is appended to a
//! caller-owned buffer so a session can reuse one allocation per read cycle.

use bytes::{BufMut, BytesMut};

/// Handshake byte written once when a connection is accepted.
pub const HANDSHAKE: u8 = b'*';

/// Start-of-frame sentinel.
pub const FRAME_START: u8 = b'^';

/// End-of-frame sentinel.
pub const FRAME_END: u8 = b'$';

/// Position of the scanner relative to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Outside a frame, discarding bytes until `^`.
    #[default]
    Seeking,
    /// Inside a frame, emitting shifted bytes until `$`.
    Transcoding,
}

/// Shift applied to every payload byte.
#[inline]
pub fn transform(byte: u8) -> u8 {
    byte.wrapping_add(1)
}

/// Outcome of scanning one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan {
    /// Mode after the last byte of the chunk.
    pub mode: Mode,
    /// Frames closed by an end sentinel within the chunk.
    pub frames_closed: u64,
}

/// Scan `input` starting in `mode`, appending shifted payload bytes to
/// `output`.
///
/// Sentinels are never emitted. A `^` seen while already transcoding is
/// ordinary payload. There is no escape, so payload can never carry a
/// sentinel byte.
pub fn transcode(mode: Mode, input: &[u8], output: &mut BytesMut) -> Scan {
    let mut mode = mode;
    let mut frames_closed = 0;
    output.reserve(input.len());

    for &byte in input {
        mode = match (mode, byte) {
            (Mode::Seeking, FRAME_START) => Mode::Transcoding,
            (Mode::Seeking, _) => Mode::Seeking,
            (Mode::Transcoding, FRAME_END) => {
                frames_closed += 1;
                Mode::Seeking
            }
            (Mode::Transcoding, _) => {
                output.put_u8(transform(byte));
                Mode::Transcoding
            }
        };
    }

    Scan {
        mode,
        frames_closed,
    }
}
