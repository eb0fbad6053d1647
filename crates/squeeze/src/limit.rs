//! Parsing for the `<number><unit>` bandwidth-limit argument.

use std::str::FromStr;

/// Unit-of-measurement suffixes and their bytes-per-second conversion, as a
/// multiplier/divisor pair.
///
/// Bit units use decimal (SI) multipliers, following iperf, which takes a
/// megabit to be exactly 1_000_000 bits. Byte units use powers of 1024,
/// following tcptrack. Order matters: `Kbps` must be tried before its own
/// suffix `bps`.
const UOM_SUFFIXES: &[(&str, u64, u64)] = &[
    ("Kbps", 1000, 8),
    ("Mbps", 1000 * 1000, 8),
    ("Gbps", 1000 * 1000 * 1000, 8),
    ("KBps", 1024, 1),
    ("MBps", 1024 * 1024, 1),
    ("GBps", 1024 * 1024 * 1024, 1),
    ("bps", 1, 8),
    ("Bps", 1, 1),
];

/// A bandwidth limit, stored in bytes per second.
///
/// Parsed from strings like `10Mbps` or `512KBps`; a bare number is read as
/// bits per second. Divisions truncate toward zero, so `"100"` (100 bits/s)
/// parses to 12 bytes/s. Zero means unlimited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BandwidthLimit(u64);

impl BandwidthLimit {
    /// The limit in bytes per second. 0 means unlimited.
    pub(crate) fn bytes_per_sec(self) -> u64 {
        self.0
    }

    /// Whether this limit disables throttling.
    pub(crate) fn is_unlimited(self) -> bool {
        self.0 == 0
    }
}

/// A bandwidth-limit string could not be parsed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub(crate) enum ParseLimitError {
    /// The numeric portion was missing or not a non-negative base-10
    /// integer.
    #[error("failed to parse {0:?} as a bandwidth limit")]
    Invalid(String),
    /// The value does not fit in 64 bits of bytes-per-second.
    #[error("bandwidth limit {0:?} is out of range")]
    OutOfRange(String),
}

impl FromStr for BandwidthLimit {
    type Err = ParseLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (number, mul, div) = split_suffix(s);
        // Parsing as u64 also rejects negative values outright.
        let value: u64 = number
            .parse()
            .map_err(|_| ParseLimitError::Invalid(s.to_owned()))?;
        let bytes_per_sec = value
            .checked_mul(mul)
            .ok_or_else(|| ParseLimitError::OutOfRange(s.to_owned()))?
            / div;
        Ok(BandwidthLimit(bytes_per_sec))
    }
}

/// Strip a recognized unit suffix from `s`, returning the remainder and the
/// suffix's multiplier/divisor. Without a recognized suffix the whole
/// string is returned with a multiplier of 1 and divisor of 8 (bits/sec).
fn split_suffix(s: &str) -> (&str, u64, u64) {
    for (unit, mul, div) in UOM_SUFFIXES {
        if let Some(number) = s.strip_suffix(unit) {
            return (number, *mul, *div);
        }
    }
    (s, 1, 8)
}
