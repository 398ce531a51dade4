//! Bit twiddling helpers shared by the sketch, the ring buffers and the
//! timer wheel.

/// Returns the smallest power of two strictly greater than `x`.
///
/// Unlike `usize::next_power_of_two`, a power-of-two input is doubled:
/// `2` maps to `4`, not `2`. The sizing code relies on this to always leave
/// headroom above the requested value.
///
/// # Panics
///
/// Panics in debug builds when `x` is zero or when the result would
/// overflow.
pub(crate) const fn next_power_of_two_above(x: u32) -> u32 {
    debug_assert!(x > 0 && x < 1 << 31);
    1 << (u32::BITS - leading_zeros(x))
}

/// The `u64` variant of [`next_power_of_two_above`].
pub(crate) const fn next_power_of_two_above_u64(x: u64) -> u64 {
    debug_assert!(x > 0 && x < 1 << 63);
    1 << (u64::BITS - leading_zeros_u64(x))
}

pub(crate) const fn leading_zeros(x: u32) -> u32 {
    x.leading_zeros()
}

pub(crate) const fn leading_zeros_u64(x: u64) -> u32 {
    x.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two_above() {
        assert_eq!(next_power_of_two_above(1), 2);
        assert_eq!(next_power_of_two_above(2), 4);
        assert_eq!(next_power_of_two_above(4), 8);
        assert_eq!(next_power_of_two_above(5), 8);
        assert_eq!(next_power_of_two_above(11), 16);
        assert_eq!(next_power_of_two_above(33), 64);

        assert_eq!(next_power_of_two_above_u64(1), 2);
        assert_eq!(next_power_of_two_above_u64(33), 64);
    }

    #[test]
    fn leading_zero_counts() {
        assert_eq!(leading_zeros(1), 31);
        assert_eq!(leading_zeros(16), 27);
        assert_eq!(leading_zeros_u64(1), 63);
        assert_eq!(leading_zeros_u64(256), 55);
    }
}
