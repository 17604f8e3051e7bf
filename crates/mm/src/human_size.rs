//! Human-readable byte sizes for log lines.

use core::fmt;

/// Wraps a size in bytes and formats it with binary prefixes (KiB, MiB, ...).
///
/// Formatting uses integer arithmetic only, so it is safe to call from code that runs
/// before (or without) floating-point state being set up. Up to two decimals are shown,
/// truncated, with trailing zeros removed.
///
/// ```
/// use mm::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(0)), "0B");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// assert_eq!(format!("{}", HumanSize(64 << 20)), "64MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let bytes = self.0 as u128;
        let mut unit = 0;
        while unit + 1 < UNITS.len() && bytes >= 1u128 << (10 * (unit + 1)) {
            unit += 1;
        }

        let divisor = 1u128 << (10 * unit);
        let whole = bytes / divisor;
        let hundredths = (bytes % divisor) * 100 / divisor;

        match hundredths {
            0 => write!(f, "{}{}", whole, UNITS[unit]),
            h if h % 10 == 0 => write!(f, "{}.{}{}", whole, h / 10, UNITS[unit]),
            h => write!(f, "{}.{:02}{}", whole, h, UNITS[unit]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_plain_bytes() {
        assert_eq!(format!("{}", HumanSize(0)), "0B");
        assert_eq!(format!("{}", HumanSize(1023)), "1023B");
    }

    #[test]
    fn formats_binary_units() {
        assert_eq!(format!("{}", HumanSize(1024)), "1KiB");
        assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", HumanSize(16 << 20)), "16MiB");
        assert_eq!(format!("{}", HumanSize(3 << 29)), "1.5GiB");
        assert_eq!(format!("{}", HumanSize(1 << 40)), "1TiB");
    }

    #[test]
    fn truncates_to_two_decimals() {
        // 1.0009765625 KiB
        assert_eq!(format!("{}", HumanSize(1025)), "1KiB");
        // 1.2490234375 KiB
        assert_eq!(format!("{}", HumanSize(1279)), "1.24KiB");
    }

    #[test]
    fn formats_largest_values() {
        assert_eq!(format!("{}", HumanSize(usize::MAX)), "15.99EiB");
    }
}
