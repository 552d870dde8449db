//! 16-bit wrapping sequence arithmetic.
//!
//! Sequence and ack numbers wrap at 2^16. Every comparison goes through
//! these helpers so ordering is decided by the signed distance between two
//! numbers rather than by their raw values.

use std::cmp::Ordering;

/// Signed distance `a - b` modulo 2^16, in `[-32768, 32767]`.
pub fn seq_diff(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Wrapping-aware ordering of two sequence numbers.
pub fn seq_cmp(a: u16, b: u16) -> Ordering {
    seq_diff(a, b).cmp(&0)
}

/// `true` if `seq` is at or before `cursor` (i.e. `cursor - seq >= 0`).
///
/// Used for cumulative acks (`cursor = acknr`) and duplicate detection
/// (`cursor = expected_seq`).
pub fn seq_covered(seq: u16, cursor: u16) -> bool {
    seq_diff(cursor, seq) >= 0
}
