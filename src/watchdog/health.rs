//! Per-stream health state machine and recovery tiers. Grounded in
//! `original_source/backend/services/local_stream_watchdog.py`'s
//! `StreamHealthState`/`LocalStreamWatchdog.check_and_recover` and
//! `youtube_stream_watchdog.py`'s tiered `recover_stream`.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Consecutive-failure counter with a cooldown on how often recovery may
/// fire, so a camera that is merely slow to reconnect doesn't get force-
/// restarted every check interval.
#[derive(Debug, Clone)]
pub struct HealthState {
    unhealthy_threshold: u32,
    recovery_cooldown: Duration,
    pub consecutive_unhealthy: u32,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_recovery_at: Option<DateTime<Utc>>,
    pub recovery_count: u32,
}

impl HealthState {
    pub fn new(unhealthy_threshold: u32, recovery_cooldown: Duration) -> Self {
        Self {
            unhealthy_threshold,
            recovery_cooldown,
            consecutive_unhealthy: 0,
            last_healthy_at: None,
            last_recovery_at: None,
            recovery_count: 0,
        }
    }

    pub fn mark_healthy(&mut self) {
        self.consecutive_unhealthy = 0;
        self.last_healthy_at = Some(Utc::now());
    }

    /// Returns `true` once `consecutive_unhealthy` crosses the threshold.
    pub fn mark_unhealthy(&mut self) -> bool {
        self.consecutive_unhealthy += 1;
        self.consecutive_unhealthy >= self.unhealthy_threshold
    }

    pub fn mark_recovery(&mut self) {
        self.last_recovery_at = Some(Utc::now());
        self.recovery_count += 1;
        self.consecutive_unhealthy = 0;
    }

    /// A cooldown, not a rate limit: recovery is allowed as soon as the
    /// cooldown has elapsed since the last one, regardless of how many
    /// unhealthy checks happened in between.
    pub fn should_allow_recovery(&self) -> bool {
        match self.last_recovery_at {
            None => true,
            Some(at) => Utc::now().signed_duration_since(at).num_seconds() >= self.recovery_cooldown.as_secs() as i64,
        }
    }

    /// Which recovery tier to apply next, per §4.8: the first two recoveries
    /// force-restart locally; the third and beyond escalate to the
    /// destination's control-plane reset, if one is configured.
    pub fn next_tier(&self) -> RecoveryTier {
        if self.recovery_count < 2 {
            RecoveryTier::LocalRestart
        } else {
            RecoveryTier::ControlPlaneReset
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTier {
    LocalRestart,
    ControlPlaneReset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_of_three_requires_three_consecutive_failures() {
        let mut h = HealthState::new(3, Duration::from_secs(120));
        assert!(!h.mark_unhealthy());
        assert!(!h.mark_unhealthy());
        assert!(h.mark_unhealthy());
    }

    #[test]
    fn healthy_check_resets_the_counter() {
        let mut h = HealthState::new(3, Duration::from_secs(120));
        h.mark_unhealthy();
        h.mark_unhealthy();
        h.mark_healthy();
        assert_eq!(h.consecutive_unhealthy, 0);
    }

    #[test]
    fn recovery_tier_escalates_after_two_local_restarts() {
        let mut h = HealthState::new(3, Duration::from_secs(120));
        assert_eq!(h.next_tier(), RecoveryTier::LocalRestart);
        h.mark_recovery();
        assert_eq!(h.next_tier(), RecoveryTier::LocalRestart);
        h.mark_recovery();
        assert_eq!(h.next_tier(), RecoveryTier::ControlPlaneReset);
    }

    #[test]
    fn recovery_not_allowed_again_within_cooldown() {
        let mut h = HealthState::new(3, Duration::from_secs(120));
        assert!(h.should_allow_recovery());
        h.mark_recovery();
        assert!(!h.should_allow_recovery());
    }
}
