//! Rate-limit string normalization.

use serde::Serialize;

/// Directional ceiling pair, in the unit the policy store uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    /// Downlink ceiling (first field of "rx/tx").
    pub downlink: u64,
    /// Uplink ceiling (second field of "rx/tx").
    pub uplink: u64,
}

/// Parse a rate-limit encoding into a ceiling pair.
///
/// Accepts a single value (`"100"`, `"100M"`) applied to both directions, or a
/// `"rx/tx"` pair with optional trailing burst/priority fields. Anything that
/// does not start with digits degrades to 0 for that side. Never fails.
pub fn parse(raw: Option<&str>) -> RateLimit {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => return RateLimit::default(),
    };

    if raw.contains('/') {
        let mut fields = raw.splitn(2, '/');
        let downlink = fields.next().map_or(0, leading_integer);
        let uplink = fields.next().map_or(0, leading_integer);
        RateLimit { downlink, uplink }
    } else {
        let value = leading_integer(raw);
        RateLimit {
            downlink: value,
            uplink: value,
        }
    }
}

/// Parse the leading run of ASCII digits (e.g. "10M" -> 10, "M10" -> 0).
fn leading_integer(field: &str) -> u64 {
    let mut num = 0u64;

    for &byte in field.trim_start().as_bytes() {
        if !byte.is_ascii_digit() {
            break;
        }
        num = num.saturating_mul(10).saturating_add((byte - b'0') as u64);
    }

    num
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn pair(downlink: u64, uplink: u64) -> RateLimit {
        RateLimit { downlink, uplink }
    }

    #[test]
    fn test_parse_empty_and_absent() {
        assert_eq!(parse(None), pair(0, 0));
        assert_eq!(parse(Some("")), pair(0, 0));
        assert_eq!(parse(Some("   ")), pair(0, 0));
    }

    #[test]
    fn test_parse_single_value_applies_to_both() {
        assert_eq!(parse(Some("100")), pair(100, 100));
    }

    #[test]
    fn test_parse_rx_tx_pair() {
        assert_eq!(parse(Some("50000000/20000000")), pair(50_000_000, 20_000_000));
    }

    #[test]
    fn test_parse_unit_suffixes() {
        assert_eq!(parse(Some("10M/20M")), pair(10, 20));
        assert_eq!(parse(Some("512k")), pair(512, 512));
    }

    #[test]
    fn test_parse_ignores_burst_fields() {
        assert_eq!(parse(Some("10M/20M 15M/25M 8M/16M 10/10 8")), pair(10, 20));
    }

    #[test]
    fn test_parse_missing_side() {
        assert_eq!(parse(Some("10M/")), pair(10, 0));
        assert_eq!(parse(Some("/20M")), pair(0, 20));
        assert_eq!(parse(Some("/")), pair(0, 0));
    }

    #[test]
    fn test_parse_whitespace_around_fields() {
        assert_eq!(parse(Some(" 30 / 40 ")), pair(30, 40));
    }

    #[test]
    fn test_parse_garbage_degrades_to_zero() {
        assert_eq!(parse(Some("unlimited")), pair(0, 0));
        assert_eq!(parse(Some("gold")), pair(0, 0));
        assert_eq!(parse(Some("-5/-5")), pair(0, 0));
        assert_eq!(parse(Some("abc/7")), pair(0, 7));
    }

    #[test]
    fn test_parse_overflow_saturates() {
        let limit = parse(Some("999999999999999999999999/1"));
        assert_eq!(limit, pair(u64::MAX, 1));
    }

    proptest! {
        #[test]
        fn prop_parse_accepts_any_string(raw in any::<String>()) {
            let limit = parse(Some(&raw));
            if raw.trim().is_empty() {
                prop_assert_eq!(limit, RateLimit::default());
            }
        }

        #[test]
        fn prop_parse_pair_yields_both_fields(downlink in any::<u64>(), uplink in any::<u64>()) {
            prop_assert_eq!(parse(Some(&format!("{downlink}/{uplink}"))), pair(downlink, uplink));
        }

        #[test]
        fn prop_parse_single_value_mirrors(value in any::<u64>(), suffix in "[kKmMgG]?") {
            prop_assert_eq!(parse(Some(&format!("{value}{suffix}"))), pair(value, value));
        }
    }
}
