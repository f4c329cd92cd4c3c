//! Core types

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp in Unix epoch milliseconds.
pub type Millis = u64;

/// Current wall-clock time in Unix epoch milliseconds.
///
/// A clock set before the epoch reads as `0` rather than failing.
pub fn unix_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_millis_is_monotone_enough() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(b >= a);
        // Sanity: after 2020-01-01
        assert!(a > 1_577_836_800_000);
    }
}
