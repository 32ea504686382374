// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversion between human memory strings ("4GB") and byte counts.
//!
//! `parse_memory` and `format_memory` are approximate inverses only for
//! values that are exact multiples of a unit: formatting rounds to a whole
//! number of the largest fitting unit, so precision below that unit is lost.
//! Callers that need exact round trips must keep the byte count.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Units recognized by [`parse_memory`] and emitted by [`format_memory`].
const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Grammar for human memory strings: a decimal number followed by a unit.
static MEMORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(\.\d+)?)([KMGT]?B)$").expect("valid regex"));

/// Format a byte count as a human memory string.
///
/// Divides by 1024 while the value still holds a full unit (up to TB),
/// then rounds to a whole number.
pub fn format_memory(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = 0usize;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{}{}", size.round() as u64, UNITS[unit])
}

/// Parse a human memory string into a byte count.
///
/// The empty string parses to 0. Anything else must match the grammar
/// `^(\d+(\.\d+)?)([KMGT]?B)$` or the call fails with
/// [`Error::MalformedInput`].
pub fn parse_memory(s: &str) -> Result<u64> {
    if s.is_empty() {
        return Ok(0);
    }
    let caps = MEMORY_RE
        .captures(s)
        .ok_or_else(|| Error::MalformedInput(format!("invalid memory string: {s:?}")))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| Error::MalformedInput(format!("invalid memory value: {s:?}")))?;
    let unit = UNITS
        .iter()
        .position(|u| *u == &caps[3])
        .unwrap_or(0) as i32;
    Ok((value * 1024f64.powi(unit)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_units() {
        assert_eq!(parse_memory("512B").unwrap(), 512);
        assert_eq!(parse_memory("4KB").unwrap(), 4 * 1024);
        assert_eq!(parse_memory("4MB").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_memory("4GB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("2TB").unwrap(), 2 * 1024u64.pow(4));
    }

    #[test]
    fn test_parse_empty_is_zero() {
        assert_eq!(parse_memory("").unwrap(), 0);
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_memory("1.5GB").unwrap(), (1.5 * 1024f64.powi(3)) as u64);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["bogus", "4gb", "GB", "4 GB", "-4GB", "4PB", "4"] {
            assert!(
                matches!(parse_memory(bad), Err(Error::MalformedInput(_))),
                "expected MalformedInput for {bad:?}"
            );
        }
    }

    #[test]
    fn test_format_round_trip_on_exact_multiples() {
        assert_eq!(format_memory(parse_memory("4GB").unwrap()), "4GB");
        assert_eq!(format_memory(parse_memory("16GB").unwrap()), "16GB");
        assert_eq!(format_memory(parse_memory("512KB").unwrap()), "512KB");
        assert_eq!(format_memory(parse_memory("2TB").unwrap()), "2TB");
    }

    #[test]
    fn test_format_rounds() {
        assert_eq!(format_memory(0), "0B");
        assert_eq!(format_memory(1023), "1023B");
        assert_eq!(format_memory(1024), "1KB");
        // 1.5GB rounds up to 2GB; precision below the unit is lost.
        assert_eq!(format_memory((1.5 * 1024f64.powi(3)) as u64), "2GB");
    }
}
