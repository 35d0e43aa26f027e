//! File transfer wire constants and chunk arithmetic.
//!
//! ```text
//! Sender ──[file_transfer_start]──────────► Receiver   (opens session)
//! Sender ──[file_chunk]───────────────────► Receiver   (repeated, in order)
//! Sender ──[file_transfer_complete]───────► Receiver   (finalize)
//! Sender ◄─[file_transfer_complete]──────── Receiver   (ack)
//!
//! Either ──[file_transfer_error]──────────► Other      (abort session)
//! ```

/// Default chunk size for file transfers (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Prefix of sender-generated transfer ids.
pub const TRANSFER_ID_PREFIX: &str = "upload_";

/// Compute the number of `file_chunk` envelopes for a file of given size.
pub fn compute_total_chunks(file_size: u64, chunk_size: usize) -> u64 {
    if file_size == 0 || chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size as u64)
}

/// Percentage of `received` over `expected`, clamped to 100.
///
/// An empty file is complete as soon as it exists.
pub fn percent(received: u64, expected: u64) -> u8 {
    if expected == 0 {
        return 100;
    }
    (received.saturating_mul(100) / expected).min(100) as u8
}
