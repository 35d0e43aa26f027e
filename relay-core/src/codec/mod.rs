//! Frame codec for stream transports.
//!
//! Every envelope travels as one length-prefixed frame:
//!
//! ```text
//! length:  u32 big-endian (4)
//! payload: [u8] (JSON envelope, `length` bytes)
//! ```

use tokio_util::codec::LengthDelimitedCodec;

/// Default upper bound for a single frame (96 MiB).
///
/// Large enough for a 50 MiB clipboard image after base64 expansion.
pub const DEFAULT_MAX_FRAME: usize = 96 * 1024 * 1024;

/// Build the codec used on both ends of a stream transport.
///
/// Frames longer than `max_frame` are rejected by the decoder with an
/// `InvalidData` I/O error, which tears the link down.
pub fn frame_codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame)
        .new_codec()
}
