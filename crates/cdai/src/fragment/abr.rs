//! Adaptive-bitrate hooks the fragment pipeline calls into.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Rampdown decisions live with the profile ladder, not the pipeline. The
/// pipeline only reports failures and asks whether a lower profile exists.
pub trait AbrContext: Send + Sync {
    /// Already at the lowest profile; ramping down further is pointless.
    fn rampdown_limit_reached(&self) -> bool;

    /// Try to step to a lower profile in response to a failed download.
    /// Returns `true` when a switch happened.
    fn try_rampdown_profile(&self, http_code: u16) -> bool;

    /// A fragment downloaded fine; consecutive-rampdown accounting resets.
    fn reset_rampdown_count(&self);

    /// Pin the estimator to the bandwidth a relay reported serving.
    fn set_assumed_bandwidth(&self, bandwidth: u64);
}

/// A fixed ladder of profile bandwidths, lowest first.
pub struct ProfileLadder {
    bandwidths: Vec<u64>,
    current: AtomicUsize,
    /// Consecutive rampdowns since the last successful video fragment.
    rampdown_count: AtomicUsize,
    /// Rampdowns allowed per run of consecutive failures.
    rampdown_limit: usize,
    assumed_bandwidth: AtomicUsize,
}

impl ProfileLadder {
    pub fn new(bandwidths: Vec<u64>) -> Self {
        let limit = bandwidths.len();
        Self::with_rampdown_limit(bandwidths, limit)
    }

    /// A ladder that only ramps down `rampdown_limit` times between
    /// successful video fragments.
    pub fn with_rampdown_limit(mut bandwidths: Vec<u64>, rampdown_limit: usize) -> Self {
        bandwidths.sort_unstable();
        let top = bandwidths.len().saturating_sub(1);
        Self {
            bandwidths,
            current: AtomicUsize::new(top),
            rampdown_count: AtomicUsize::new(0),
            rampdown_limit,
            assumed_bandwidth: AtomicUsize::new(0),
        }
    }

    pub fn current_profile(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn current_bandwidth(&self) -> Option<u64> {
        self.bandwidths.get(self.current_profile()).copied()
    }

    pub fn assumed_bandwidth(&self) -> u64 {
        self.assumed_bandwidth.load(Ordering::SeqCst) as u64
    }
}

impl AbrContext for ProfileLadder {
    fn rampdown_limit_reached(&self) -> bool {
        self.current_profile() == 0
            || self.rampdown_count.load(Ordering::SeqCst) >= self.rampdown_limit
    }

    fn try_rampdown_profile(&self, http_code: u16) -> bool {
        if self.rampdown_limit_reached() {
            return false;
        }
        let current = self.current_profile();
        self.current.store(current - 1, Ordering::SeqCst);
        self.rampdown_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            http_code,
            from = current,
            to = current - 1,
            "ramping down profile after download failure"
        );
        true
    }

    fn reset_rampdown_count(&self) {
        self.rampdown_count.store(0, Ordering::SeqCst);
    }

    fn set_assumed_bandwidth(&self, bandwidth: u64) {
        self.assumed_bandwidth
            .store(bandwidth as usize, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rampdown_walks_the_ladder_to_the_floor() {
        let ladder = ProfileLadder::new(vec![3_000_000, 800_000, 1_500_000]);
        assert_eq!(ladder.current_bandwidth(), Some(3_000_000));
        assert!(ladder.try_rampdown_profile(404));
        assert_eq!(ladder.current_bandwidth(), Some(1_500_000));
        assert!(ladder.try_rampdown_profile(404));
        assert!(ladder.rampdown_limit_reached());
        assert!(!ladder.try_rampdown_profile(404));
        assert_eq!(ladder.current_bandwidth(), Some(800_000));
    }

    #[test]
    fn rampdown_budget_caps_consecutive_steps_until_reset() {
        let ladder =
            ProfileLadder::with_rampdown_limit(vec![800_000, 1_500_000, 3_000_000], 1);
        assert!(ladder.try_rampdown_profile(404));
        assert_eq!(ladder.current_bandwidth(), Some(1_500_000));

        // Budget spent; further failures stay on the current profile.
        assert!(ladder.rampdown_limit_reached());
        assert!(!ladder.try_rampdown_profile(404));
        assert_eq!(ladder.current_bandwidth(), Some(1_500_000));

        // A successful video fragment restores the budget.
        ladder.reset_rampdown_count();
        assert!(ladder.try_rampdown_profile(404));
        assert_eq!(ladder.current_bandwidth(), Some(800_000));
    }
}
