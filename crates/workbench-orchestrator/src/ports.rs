// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-port selection for the instance management proxy.
//!
//! Ports are assigned from `[min, max)`: the configured maximum is never
//! handed out, allocation wraps back to the minimum instead.
//!
//! This module only computes a candidate; the reservation itself happens
//! atomically inside the registry insert (a uniqueness constraint over live
//! instances). On a conflict the orchestrator advances to the next candidate
//! with [`PortRange::next_after`] and retries, bounded by the range size, so
//! two concurrent creates can never end up with the same port.
//!
//! Ports of DELETED instances are excluded from the scan: a soft-deleted
//! instance releases its port.

/// Default lower bound when the configured minimum is 0.
pub const DEFAULT_MIN_PORT: u16 = 30000;

/// Default (exclusive) upper bound when the configured maximum is 0.
pub const DEFAULT_MAX_PORT: u16 = 40000;

/// Host-port range for instance proxies; `min` inclusive, `max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// Lowest assignable port; 0 means [`DEFAULT_MIN_PORT`].
    pub min: u16,
    /// Exclusive upper bound; 0 means [`DEFAULT_MAX_PORT`].
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_PORT,
            max: DEFAULT_MAX_PORT,
        }
    }
}

impl PortRange {
    /// Substitute defaults for zero bounds.
    pub fn normalized(self) -> PortRange {
        PortRange {
            min: if self.min == 0 { DEFAULT_MIN_PORT } else { self.min },
            max: if self.max == 0 { DEFAULT_MAX_PORT } else { self.max },
        }
    }

    /// Number of assignable ports in the normalized range.
    pub fn span(self) -> usize {
        let r = self.normalized();
        (r.max as usize).saturating_sub(r.min as usize)
    }

    /// The candidate after `port`, wrapping to `min` at the top of the range.
    pub fn next_after(self, port: u16) -> u16 {
        let r = self.normalized();
        match port.checked_add(1) {
            Some(next) if next < r.max => next,
            _ => r.min,
        }
    }
}

/// Choose the next host-port candidate given the ports of all live instances.
///
/// Empty set returns the range minimum. Otherwise the successor of the
/// highest port in use, wrapping to the minimum when the successor would
/// leave the range.
pub fn next_port(existing: &[u16], range: PortRange) -> u16 {
    let r = range.normalized();
    match existing.iter().copied().max() {
        None => r.min,
        Some(latest) => r.next_after(latest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_returns_min() {
        assert_eq!(next_port(&[], PortRange::default()), 30000);
    }

    #[test]
    fn test_zero_bounds_use_defaults() {
        assert_eq!(next_port(&[], PortRange { min: 0, max: 0 }), 30000);
        assert_eq!(next_port(&[39999], PortRange { min: 0, max: 0 }), 30000);
    }

    #[test]
    fn test_wraps_instead_of_reaching_max() {
        // 39999 + 1 would be the exclusive bound, so allocation wraps.
        assert_eq!(
            next_port(&[39999], PortRange { min: 30000, max: 40000 }),
            30000
        );
    }

    #[test]
    fn test_dense_prefix_advances() {
        let existing: Vec<u16> = (30000..=30010).collect();
        assert_eq!(next_port(&existing, PortRange::default()), 30011);
    }

    #[test]
    fn test_next_after_wraps() {
        let range = PortRange::default();
        assert_eq!(range.next_after(30000), 30001);
        assert_eq!(range.next_after(39999), 30000);
    }

    #[test]
    fn test_next_after_top_port_wraps() {
        // A u16::MAX port can only come from a hand-edited row, but it
        // must still wrap rather than overflow.
        let range = PortRange { min: 30000, max: 65535 };
        assert_eq!(range.next_after(65535), 30000);
        assert_eq!(next_port(&[65535], range), 30000);
    }

    #[test]
    fn test_span() {
        assert_eq!(PortRange { min: 30000, max: 30002 }.span(), 2);
        assert_eq!(PortRange { min: 0, max: 0 }.span(), 10000);
    }
}
