use std::time::Duration;

use tokio::time::Instant;

use crate::Direction;

/// Length of one accounting window.
pub const QUOTA_WINDOW: Duration = Duration::from_secs(1);

/// Per-second upload and download allowance shared by every transfer.
///
/// A ceiling of 0 means unlimited. Unused allowance is never carried over
/// into the next window.
#[derive(Debug, Clone)]
pub struct BandwidthQuota {
    max_up: u64,
    max_down: u64,
    left_up: u64,
    left_down: u64,
    window_start: Option<Instant>,
}

impl BandwidthQuota {
    pub fn new(max_bytes_sec_up: u64, max_bytes_sec_down: u64) -> Self {
        Self {
            max_up: max_bytes_sec_up,
            max_down: max_bytes_sec_down,
            left_up: ceiling(max_bytes_sec_up),
            left_down: ceiling(max_bytes_sec_down),
            window_start: None,
        }
    }

    /// Changes the ceilings. A lower ceiling also caps what is left of the
    /// current window; a higher one takes effect from the next window.
    pub fn set_limits(&mut self, max_bytes_sec_up: u64, max_bytes_sec_down: u64) {
        self.max_up = max_bytes_sec_up;
        self.max_down = max_bytes_sec_down;
        self.left_up = self.left_up.min(ceiling(max_bytes_sec_up));
        self.left_down = self.left_down.min(ceiling(max_bytes_sec_down));
    }

    /// Configured ceilings as `(up, down)`.
    pub fn limits(&self) -> (u64, u64) {
        (self.max_up, self.max_down)
    }

    /// Starts a new window if `now` has left the current one.
    ///
    /// Windows are aligned to whole seconds after the first refresh, so
    /// they never overlap. Returns `true` when the allowance was reset.
    pub fn refresh(&mut self, now: Instant) -> bool {
        let start = match self.window_start {
            None => now,
            Some(start) => {
                let elapsed = now.saturating_duration_since(start);
                if elapsed < QUOTA_WINDOW {
                    return false;
                }
                start + QUOTA_WINDOW * (elapsed.as_secs() as u32)
            }
        };
        self.window_start = Some(start);
        self.left_up = ceiling(self.max_up);
        self.left_down = ceiling(self.max_down);
        true
    }

    /// Allowance left in the current window for `direction`.
    pub fn left(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upload => self.left_up,
            Direction::Download => self.left_down,
        }
    }

    /// How much of `requested` may move now.
    pub fn grant(&self, direction: Direction, requested: usize) -> usize {
        self.left(direction).min(requested as u64) as usize
    }

    /// Charges `bytes` against the current window.
    pub fn debit(&mut self, direction: Direction, bytes: u64) {
        let left = match direction {
            Direction::Upload => &mut self.left_up,
            Direction::Download => &mut self.left_down,
        };
        *left = left.saturating_sub(bytes);
    }

    /// Returns `true` when `direction` has nothing left this window.
    pub fn is_exhausted(&self, direction: Direction) -> bool {
        self.left(direction) == 0
    }

    /// Start of the next window, once a window has been opened.
    pub fn next_window(&self) -> Option<Instant> {
        self.window_start.map(|start| start + QUOTA_WINDOW)
    }
}

fn ceiling(max: u64) -> u64 {
    if max == 0 { u64::MAX } else { max }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_when_zero() {
        let mut quota = BandwidthQuota::new(0, 0);
        quota.refresh(Instant::now());
        assert_eq!(quota.grant(Direction::Upload, 1 << 20), 1 << 20);
        quota.debit(Direction::Download, 1 << 30);
        assert!(!quota.is_exhausted(Direction::Download));
    }

    #[test]
    fn grant_is_capped_by_allowance() {
        let mut quota = BandwidthQuota::new(1000, 500);
        quota.refresh(Instant::now());
        assert_eq!(quota.grant(Direction::Upload, 16384), 1000);
        assert_eq!(quota.grant(Direction::Download, 16384), 500);

        quota.debit(Direction::Upload, 700);
        assert_eq!(quota.grant(Direction::Upload, 16384), 300);
        quota.debit(Direction::Upload, 300);
        assert!(quota.is_exhausted(Direction::Upload));
        assert_eq!(quota.grant(Direction::Upload, 16384), 0);
        // Directions are independent.
        assert_eq!(quota.left(Direction::Download), 500);
    }

    #[test]
    fn debit_never_goes_negative() {
        let mut quota = BandwidthQuota::new(100, 0);
        quota.refresh(Instant::now());
        quota.debit(Direction::Upload, 250);
        assert_eq!(quota.left(Direction::Upload), 0);
    }

    #[test]
    fn no_carry_over_between_windows() {
        let t0 = Instant::now();
        let mut quota = BandwidthQuota::new(1000, 0);
        quota.refresh(t0);
        quota.debit(Direction::Upload, 10);

        assert!(!quota.refresh(t0 + Duration::from_millis(999)));
        assert_eq!(quota.left(Direction::Upload), 990);

        assert!(quota.refresh(t0 + Duration::from_millis(1000)));
        assert_eq!(quota.left(Direction::Upload), 1000);
    }

    #[test]
    fn windows_stay_aligned_after_gaps() {
        let t0 = Instant::now();
        let mut quota = BandwidthQuota::new(1000, 0);
        quota.refresh(t0);
        assert!(quota.refresh(t0 + Duration::from_millis(3500)));
        assert_eq!(quota.next_window(), Some(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn lowering_limit_applies_immediately() {
        let t0 = Instant::now();
        let mut quota = BandwidthQuota::new(0, 0);
        quota.refresh(t0);
        quota.set_limits(200, 300);
        assert_eq!(quota.left(Direction::Upload), 200);
        assert_eq!(quota.limits(), (200, 300));

        quota.debit(Direction::Upload, 150);
        quota.set_limits(1000, 300);
        assert_eq!(quota.left(Direction::Upload), 50);
        quota.refresh(t0 + Duration::from_secs(1));
        assert_eq!(quota.left(Direction::Upload), 1000);
    }

    /// 3500 bytes at 1000 B/s with an oversized block needs exactly four
    /// windows: 1000 + 1000 + 1000 + 500.
    #[test]
    fn ceiling_splits_body_into_windows() {
        let t0 = Instant::now();
        let mut quota = BandwidthQuota::new(0, 1000);
        let mut remaining = 3500u64;
        let mut per_window = Vec::new();

        for second in 0..10u64 {
            if remaining == 0 {
                break;
            }
            quota.refresh(t0 + Duration::from_secs(second));
            let mut moved_this_window = 0;
            // Several ready events inside one window.
            for _ in 0..5 {
                let grant = quota.grant(Direction::Download, 64 * 1024) as u64;
                let moved = grant.min(remaining);
                quota.debit(Direction::Download, moved);
                remaining -= moved;
                moved_this_window += moved;
            }
            per_window.push(moved_this_window);
        }

        assert_eq!(per_window, vec![1000, 1000, 1000, 500]);
    }
}
