//! Sliding window over envelope sequence numbers.
//!
//! The window starts at the agreed receive sequence (zero after a fresh
//! handshake, the reconciled value after a resumption). `base` is the lowest
//! sequence not yet accepted; bit `i` of the bitmap records whether
//! `base + i` has been seen. Whenever the base slot fills, the window slides
//! forward past every contiguous accepted number.
//!
//! Not thread-safe; the transport keeps it behind its receive lock.

use thiserror::Error;

/// Sequences tracked ahead of the base.
pub const WINDOW_SIZE: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("sequence {seq} is older than the window (next expected {expected})")]
    Stale { seq: u64, expected: u64 },

    #[error("sequence {0} was already received")]
    Duplicate(u64),

    #[error("sequence {seq} is too far ahead of {expected}")]
    Gap { seq: u64, expected: u64 },
}

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    base: u64,
    bitmap: u64,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Window whose first acceptable sequence is `base`.
    pub fn starting_at(base: u64) -> Self {
        Self { base, bitmap: 0 }
    }

    /// Check `seq` without recording it.
    pub fn check(&self, seq: u64) -> Result<(), ReplayError> {
        if seq < self.base {
            return Err(ReplayError::Stale {
                seq,
                expected: self.base,
            });
        }
        let offset = seq - self.base;
        if offset >= WINDOW_SIZE {
            return Err(ReplayError::Gap {
                seq,
                expected: self.base,
            });
        }
        if self.bitmap & (1u64 << offset) != 0 {
            return Err(ReplayError::Duplicate(seq));
        }
        Ok(())
    }

    /// Accept `seq` if it is new and inside the window.
    pub fn check_and_update(&mut self, seq: u64) -> Result<(), ReplayError> {
        self.check(seq)?;

        self.bitmap |= 1u64 << (seq - self.base);
        while self.bitmap & 1 == 1 {
            self.bitmap >>= 1;
            self.base += 1;
        }
        Ok(())
    }

    /// Lowest sequence not yet received.
    pub fn next_expected(&self) -> u64 {
        self.base
    }

    /// Sequences accepted ahead of a missing one.
    pub fn pending(&self) -> u32 {
        self.bitmap.count_ones()
    }

    /// Restart the window at `base`.
    pub fn reset(&mut self, base: u64) {
        self.base = base;
        self.bitmap = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order() {
        let mut window = ReplayWindow::new();
        for seq in 0..200 {
            assert!(window.check_and_update(seq).is_ok(), "seq {} rejected", seq);
        }
        assert_eq!(window.next_expected(), 200);
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn test_duplicate() {
        let mut window = ReplayWindow::new();
        window.check_and_update(0).unwrap();
        window.check_and_update(2).unwrap();

        assert_eq!(window.check_and_update(2), Err(ReplayError::Duplicate(2)));
        assert!(matches!(
            window.check_and_update(0),
            Err(ReplayError::Stale { seq: 0, expected: 1 })
        ));
    }

    #[test]
    fn test_out_of_order_fills_in() {
        let mut window = ReplayWindow::new();
        for seq in [3, 1, 0, 2] {
            window.check_and_update(seq).unwrap();
        }
        assert_eq!(window.next_expected(), 4);
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn test_gap_beyond_window() {
        let mut window = ReplayWindow::new();
        assert!(window.check_and_update(WINDOW_SIZE - 1).is_ok());
        assert!(matches!(
            window.check_and_update(WINDOW_SIZE),
            Err(ReplayError::Gap { .. })
        ));
        assert_eq!(window.pending(), 1);
    }

    #[test]
    fn test_resumed_base() {
        let mut window = ReplayWindow::starting_at(42);
        assert!(matches!(
            window.check_and_update(41),
            Err(ReplayError::Stale { .. })
        ));
        window.check_and_update(42).unwrap();
        assert_eq!(window.next_expected(), 43);

        window.reset(7);
        assert!(window.check(7).is_ok());
        assert_eq!(window.next_expected(), 7);
    }

    #[test]
    fn test_check_does_not_record() {
        let window = ReplayWindow::new();
        assert!(window.check(0).is_ok());
        assert!(window.check(0).is_ok());
    }
}
