// ============================================
// bootsmith - progress.rs
// ============================================
// Progress reporting types shared by the fetcher, the media writer,
// and the build adapter.
//
// Two kinds of progress exist in this program:
// 1. Real progress - bytes transferred vs. a known total (downloads).
// 2. Heuristic progress - an estimate shown while an external process
//    (dd, a build script) runs without giving us byte counts.
//
// The heuristic is for display only. It stays strictly below 100 and
// the terminal state of any operation comes from the real exit status,
// never from the estimate.
// ============================================

/// A single progress update delivered to a callback or over a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Completion percentage in 0..=100.
    Percent(u8),
    /// Total size unknown - the operation is running but no honest
    /// percentage can be computed.
    Indeterminate,
}

/// Compute a clamped percentage from a byte count and a total.
/// Returns `Indeterminate` when the total is zero (unknown size).
pub fn percent_of(done: u64, total: u64) -> Progress {
    if total == 0 {
        return Progress::Indeterminate;
    }
    let pct = (done.saturating_mul(100) / total).min(100) as u8;
    Progress::Percent(pct)
}

// ============================================
// HEURISTIC PROGRESS
// ============================================

/// How far the heuristic may climb while the operation is still running.
/// Tunable - carries no meaning beyond "visibly not done yet".
pub const HEURISTIC_CAP: u8 = 95;

/// How many percentage points one `tick()` adds.
pub const HEURISTIC_STEP: u8 = 1;

/// Monotonic progress estimate for a long-running external operation.
///
/// Each `tick()` advances the estimate by `step`, saturating at `cap`.
/// The estimate never reaches 100 - callers report completion separately
/// once the operation's real exit status is known.
#[derive(Debug, Clone)]
pub struct HeuristicProgress {
    current: u8,
    step: u8,
    cap: u8,
}

impl HeuristicProgress {
    /// Start an estimate at `start` percent with the default step and cap.
    pub fn new(start: u8) -> Self {
        Self {
            current: start.min(HEURISTIC_CAP),
            step: HEURISTIC_STEP,
            cap: HEURISTIC_CAP,
        }
    }

    /// Start an estimate with explicit step and cap values.
    pub fn with_tuning(start: u8, step: u8, cap: u8) -> Self {
        let cap = cap.min(99);
        Self {
            current: start.min(cap),
            step,
            cap,
        }
    }

    /// Advance the estimate one step and return the new value.
    pub fn tick(&mut self) -> u8 {
        self.current = self.current.saturating_add(self.step).min(self.cap);
        self.current
    }

    /// The current estimate without advancing it.
    pub fn current(&self) -> u8 {
        self.current
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of_known_total() {
        assert_eq!(percent_of(0, 200), Progress::Percent(0));
        assert_eq!(percent_of(50, 200), Progress::Percent(25));
        assert_eq!(percent_of(200, 200), Progress::Percent(100));
        // Never exceeds 100 even if more bytes arrive than advertised
        assert_eq!(percent_of(250, 200), Progress::Percent(100));
    }

    #[test]
    fn test_percent_of_unknown_total() {
        assert_eq!(percent_of(12345, 0), Progress::Indeterminate);
    }

    #[test]
    fn test_heuristic_is_monotonic_and_capped() {
        let mut h = HeuristicProgress::new(10);
        let mut last = h.current();
        for _ in 0..200 {
            let now = h.tick();
            assert!(now >= last, "heuristic went backwards");
            last = now;
        }
        // Saturates at the cap, never reaches 100
        assert_eq!(h.current(), HEURISTIC_CAP);
        assert!(h.current() < 100);
    }

    #[test]
    fn test_heuristic_custom_tuning() {
        let mut h = HeuristicProgress::with_tuning(30, 10, 85);
        assert_eq!(h.tick(), 40);
        for _ in 0..20 {
            h.tick();
        }
        assert_eq!(h.current(), 85);
    }

    #[test]
    fn test_heuristic_cap_never_100() {
        // Even a silly cap request stays below 100
        let mut h = HeuristicProgress::with_tuning(0, 50, 255);
        h.tick();
        h.tick();
        assert!(h.current() < 100);
    }
}
