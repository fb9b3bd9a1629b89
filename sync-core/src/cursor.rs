//! Cursor tracking for carelog sync.
//!
//! A device's cursor is the last family `GlobalSeq` it has applied. This
//! module provides:
//! - Contiguous application: an entry is applied only if it is exactly the
//!   next sequence number, so a gap is never skipped over
//! - Head tracking: the highest sequence number the device has heard of
//!   (from change hints or pull responses), to know when it is behind
//!
//! The server assigns sequence numbers without gaps, so a gap seen by the
//! device means entries are still missing and must be pulled again.

use sync_types::GlobalSeq;

/// Outcome of offering a sequence number to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    /// The entry continues the cursor; apply it.
    Apply,
    /// Already applied; skip it.
    Duplicate,
    /// Entries between the cursor and this one are missing.
    Gap {
        /// The sequence number that should have come next.
        expected: GlobalSeq,
    },
}

/// Tracks the applied cursor and the known family head.
#[derive(Debug, Clone, Default)]
pub struct CursorTracker {
    /// Last contiguously applied sequence number.
    applied: GlobalSeq,
    /// Highest sequence number heard of.
    head: GlobalSeq,
}

impl CursorTracker {
    /// Create a new tracker starting at sequence 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker resuming from a persisted cursor.
    pub fn with_cursor(cursor: GlobalSeq) -> Self {
        Self {
            applied: cursor,
            head: cursor,
        }
    }

    /// Last applied sequence number.
    pub fn cursor(&self) -> GlobalSeq {
        self.applied
    }

    /// Highest sequence number heard of.
    pub fn head(&self) -> GlobalSeq {
        self.head
    }

    /// Record that the family head is at least `seq`.
    pub fn observe(&mut self, seq: GlobalSeq) {
        if seq > self.head {
            self.head = seq;
        }
    }

    /// Whether entries are known to exist past the cursor.
    pub fn is_behind(&self) -> bool {
        self.head > self.applied
    }

    /// How many entries the device is known to be missing.
    pub fn lag(&self) -> u64 {
        self.head.value().saturating_sub(self.applied.value())
    }

    /// Offer the next entry's sequence number; advances on [`CursorStep::Apply`].
    pub fn offer(&mut self, seq: GlobalSeq) -> CursorStep {
        let expected = self.applied.next();
        if seq <= self.applied {
            CursorStep::Duplicate
        } else if seq == expected {
            self.applied = seq;
            self.observe(seq);
            CursorStep::Apply
        } else {
            self.observe(seq);
            CursorStep::Gap { expected }
        }
    }

    /// Reset the tracker to a specific cursor.
    pub fn reset(&mut self, cursor: GlobalSeq) {
        self.applied = cursor;
        self.head = cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_tracker_starts_at_zero() {
        let tracker = CursorTracker::new();
        assert_eq!(tracker.cursor(), GlobalSeq::zero());
        assert!(!tracker.is_behind());
    }

    #[test]
    fn contiguous_entries_advance() {
        let mut tracker = CursorTracker::with_cursor(GlobalSeq::new(100));

        assert_eq!(tracker.offer(GlobalSeq::new(101)), CursorStep::Apply);
        assert_eq!(tracker.offer(GlobalSeq::new(102)), CursorStep::Apply);
        assert_eq!(tracker.cursor(), GlobalSeq::new(102));
    }

    #[test]
    fn gap_does_not_advance() {
        let mut tracker = CursorTracker::with_cursor(GlobalSeq::new(1));

        assert_eq!(
            tracker.offer(GlobalSeq::new(5)),
            CursorStep::Gap {
                expected: GlobalSeq::new(2)
            }
        );
        assert_eq!(tracker.cursor(), GlobalSeq::new(1));
        assert!(tracker.is_behind());
        assert_eq!(tracker.lag(), 4);
    }

    #[test]
    fn duplicates_are_skipped() {
        let mut tracker = CursorTracker::with_cursor(GlobalSeq::new(10));

        assert_eq!(tracker.offer(GlobalSeq::new(10)), CursorStep::Duplicate);
        assert_eq!(tracker.offer(GlobalSeq::new(3)), CursorStep::Duplicate);
        assert_eq!(tracker.cursor(), GlobalSeq::new(10));
    }

    #[test]
    fn observe_tracks_head_only_upwards() {
        let mut tracker = CursorTracker::with_cursor(GlobalSeq::new(100));

        tracker.observe(GlobalSeq::new(101));
        tracker.observe(GlobalSeq::new(50));
        assert_eq!(tracker.head(), GlobalSeq::new(101));
        assert!(tracker.is_behind());

        tracker.offer(GlobalSeq::new(101));
        assert!(!tracker.is_behind());
    }

    #[test]
    fn reset_clears_everything() {
        let mut tracker = CursorTracker::new();
        tracker.observe(GlobalSeq::new(40));

        tracker.reset(GlobalSeq::new(10));

        assert_eq!(tracker.cursor(), GlobalSeq::new(10));
        assert_eq!(tracker.head(), GlobalSeq::new(10));
        assert!(!tracker.is_behind());
    }
}
