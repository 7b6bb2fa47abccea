//! Plausibility test for bytes sampled at a candidate baud rate.
//!
//! A wrong baud rate mostly produces framing garbage outside the printable
//! ASCII range. Binary protocols look the same as garbage here, so a
//! negative verdict only means "not text at this rate".

pub const PRINTABLE_MIN: u8 = 32;
pub const PRINTABLE_MAX: u8 = 126;

pub fn printable_count(sample: &[u8]) -> usize {
    sample
        .iter()
        .filter(|&&b| (PRINTABLE_MIN..=PRINTABLE_MAX).contains(&b))
        .count()
}

/// Printable bytes a sample of this length needs: max(2, len / 3)
pub fn required_printable(len: usize) -> usize {
    (len / 3).max(2)
}

pub fn is_plausible(sample: &[u8]) -> bool {
    printable_count(sample) >= required_printable(sample.len())
}
