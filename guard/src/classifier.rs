//! Deviation classification - maps an under-performance percentage to an
//! enforcement action. Pure decision logic; the tracker carries it out.

use crate::config::Sensitivity;

/// Deviations at or above this percentage terminate the deal outright,
/// regardless of the configured sensitivity.
pub const SEVERE_DEVIATION_PERCENT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Worker meets its commitment closely enough; log and move on.
    Tolerate,
    /// Put the worker on the blacklist and re-check its operator's ratio.
    Blacklist,
    /// Terminate the deal and ban the worker's own monitoring row.
    Terminate,
}

/// Both cuts are inclusive: a deviation exactly at a threshold escalates.
pub fn classify(deviation_percent: f64, policy: &Sensitivity) -> Action {
    if deviation_percent >= SEVERE_DEVIATION_PERCENT {
        Action::Terminate
    } else if deviation_percent >= policy.worker_limit_change_percent {
        Action::Blacklist
    } else {
        Action::Tolerate
    }
}

/// Under-performance percentage of an observed hashrate against the bid.
/// Positive means the worker delivers less than it committed to.
pub fn deviation_percent(observed_hashrate: f64, bid_hashrate: u64) -> f64 {
    100.0 - (observed_hashrate * 100.0 / bid_hashrate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(soft: f64) -> Sensitivity {
        Sensitivity {
            worker_limit_change_percent: soft,
            ..Sensitivity::default()
        }
    }

    #[test]
    fn severe_ceiling_is_inclusive_and_overrides_policy() {
        assert_eq!(classify(20.0, &policy(4.0)), Action::Terminate);
        assert_eq!(classify(55.3, &policy(4.0)), Action::Terminate);
        // even a policy above the ceiling cannot soften a severe deviation
        assert_eq!(classify(20.0, &policy(90.0)), Action::Terminate);
    }

    #[test]
    fn soft_band_blacklists() {
        assert_eq!(classify(4.0, &policy(4.0)), Action::Blacklist);
        assert_eq!(classify(19.999, &policy(4.0)), Action::Blacklist);
        assert_eq!(classify(6.87285223367698, &policy(5.0)), Action::Blacklist);
    }

    #[test]
    fn below_policy_is_tolerated() {
        assert_eq!(classify(3.999, &policy(4.0)), Action::Tolerate);
        assert_eq!(classify(0.0, &policy(4.0)), Action::Tolerate);
        assert_eq!(classify(-12.5, &policy(4.0)), Action::Tolerate);
    }

    #[test]
    fn deviation_math() {
        assert_eq!(deviation_percent(800.0, 1000), 20.0);
        assert_eq!(deviation_percent(950.0, 1000), 5.0);
        assert!(deviation_percent(1100.0, 1000) < 0.0);
        assert_eq!(deviation_percent(1000.0, 1000), 0.0);
    }
}
