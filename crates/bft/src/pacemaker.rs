//! View synchronization.
//!
//! The pacemaker owns the current view and its countdown. A QC or TC for
//! view `v` moves the replica to `v + 1`; an expired countdown asks the
//! replica to time out and re-arms the timer for the same view so timeout
//! votes are re-sent until a certificate arrives.
//!
//! # Exponential Backoff
//!
//! The countdown is `base * rate^min(consecutive_timeouts, max_exponent)`.
//! Only a QC-driven advance resets `consecutive_timeouts`. TC-driven and
//! view-update-driven advances keep the count, so the backoff keeps growing
//! while the network is failing to certify vertices.

use crate::config::{BftConfig, ConfigError};
use concord_core::{Action, TimerId};
use concord_types::{EpochId, View};
use std::time::Duration;
use tracing::{debug, info};

/// Pacemaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacemakerPhase {
    /// Before `start`.
    Idle,
    /// In the view, not yet voted or timed out.
    ActiveView(View),
    /// Voted or timed out in the view; waiting for a QC or TC.
    AwaitingQuorum(View),
}

/// What moved the view forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceReason {
    Qc,
    Tc,
    /// A QC relayed in a `ViewUpdate` rather than observed on a proposal.
    ViewUpdate,
}

/// View timer and backoff state for one epoch.
#[derive(Debug)]
pub struct Pacemaker {
    epoch: EpochId,
    base_timeout: Duration,
    timeout_rate: f64,
    max_exponent: u32,
    max_timeout: Duration,
    phase: PacemakerPhase,
    current_view: View,
    /// Highest view this replica holds a QC or TC for.
    last_quorum_view: View,
    consecutive_timeouts: u32,
}

impl Pacemaker {
    /// Create a pacemaker, validating the timeout parameters.
    pub fn new(epoch: EpochId, config: &BftConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let max_timeout = config.max_timeout().ok_or(ConfigError::TimeoutOverflow {
            base: config.base_timeout,
            rate: config.timeout_rate,
            exponent: config.max_timeout_exponent,
        })?;
        Ok(Self {
            epoch,
            base_timeout: config.base_timeout,
            timeout_rate: config.timeout_rate,
            max_exponent: config.max_timeout_exponent,
            max_timeout,
            phase: PacemakerPhase::Idle,
            current_view: View::GENESIS,
            last_quorum_view: View::GENESIS,
            consecutive_timeouts: 0,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn phase(&self) -> PacemakerPhase {
        self.phase
    }

    pub fn current_view(&self) -> View {
        self.current_view
    }

    pub fn last_quorum_view(&self) -> View {
        self.last_quorum_view
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Countdown for the current backoff level.
    pub fn current_timeout(&self) -> Duration {
        let exponent = self.consecutive_timeouts.min(self.max_exponent);
        let factor = self.timeout_rate.powi(exponent as i32);
        Duration::try_from_secs_f64(self.base_timeout.as_secs_f64() * factor)
            .unwrap_or(self.max_timeout)
            .min(self.max_timeout)
    }

    fn timer_id(&self, view: View) -> TimerId {
        TimerId::LocalTimeout {
            epoch: self.epoch,
            view,
        }
    }

    /// Whether a vote or timeout for `view` can still matter.
    pub fn accepts_votes_for(&self, view: View) -> bool {
        view > self.last_quorum_view
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transitions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Enter the view after the highest certificate and arm its timer.
    pub fn start(&mut self) -> Vec<Action> {
        if self.phase != PacemakerPhase::Idle {
            return vec![];
        }
        self.current_view = self.last_quorum_view.next();
        self.phase = PacemakerPhase::ActiveView(self.current_view);
        info!(
            epoch = self.epoch.0,
            view = self.current_view.0,
            "Pacemaker started"
        );
        vec![Action::SetTimer {
            id: self.timer_id(self.current_view),
            duration: self.current_timeout(),
        }]
    }

    /// Process a certificate for `view`.
    ///
    /// Returns the timer actions when the certificate moves the replica to a
    /// new view, `None` otherwise.
    pub fn process_certificate(&mut self, view: View, reason: AdvanceReason) -> Option<Vec<Action>> {
        if view > self.last_quorum_view {
            self.last_quorum_view = view;
        }
        let new_view = view.next();
        if self.phase == PacemakerPhase::Idle || new_view <= self.current_view {
            return None;
        }
        Some(self.advance(new_view, reason))
    }

    fn advance(&mut self, new_view: View, reason: AdvanceReason) -> Vec<Action> {
        let old_view = self.current_view;
        if reason == AdvanceReason::Qc {
            self.consecutive_timeouts = 0;
        }
        self.current_view = new_view;
        self.phase = PacemakerPhase::ActiveView(new_view);
        let timeout = self.current_timeout();

        debug!(
            epoch = self.epoch.0,
            old_view = old_view.0,
            new_view = new_view.0,
            reason = ?reason,
            timeout = ?timeout,
            "View advanced"
        );
        vec![
            Action::CancelTimer {
                id: self.timer_id(old_view),
            },
            Action::SetTimer {
                id: self.timer_id(new_view),
                duration: timeout,
            },
        ]
    }

    /// Record that this replica voted in `view`.
    pub fn on_voted(&mut self, view: View) {
        if view == self.current_view {
            self.phase = PacemakerPhase::AwaitingQuorum(view);
        }
    }

    /// Process an expired timer.
    ///
    /// Returns the re-armed timer when the timer belongs to the current view
    /// and the replica should emit a timeout vote; stale timers return `None`.
    pub fn on_local_timeout(&mut self, epoch: EpochId, view: View) -> Option<Vec<Action>> {
        if epoch != self.epoch || view != self.current_view || self.phase == PacemakerPhase::Idle {
            return None;
        }
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        self.phase = PacemakerPhase::AwaitingQuorum(view);
        let timeout = self.current_timeout();
        info!(
            epoch = epoch.0,
            view = view.0,
            consecutive_timeouts = self.consecutive_timeouts,
            next_timeout = ?timeout,
            "Local timeout"
        );
        Some(vec![Action::SetTimer {
            id: self.timer_id(view),
            duration: timeout,
        }])
    }

    /// Cancel the outstanding timer, used when the epoch is retired.
    pub fn stop(&mut self) -> Vec<Action> {
        if self.phase == PacemakerPhase::Idle {
            return vec![];
        }
        self.phase = PacemakerPhase::Idle;
        vec![Action::CancelTimer {
            id: self.timer_id(self.current_view),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacemaker() -> Pacemaker {
        let config = BftConfig::default()
            .with_base_timeout(Duration::from_millis(100))
            .with_backoff(2.0, 3);
        Pacemaker::new(EpochId(0), &config).unwrap()
    }

    fn timer_duration(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::SetTimer { duration, .. } => Some(*duration),
            _ => None,
        })
    }

    #[test]
    fn test_start_arms_view_one() {
        let mut pm = pacemaker();
        assert_eq!(pm.phase(), PacemakerPhase::Idle);
        let actions = pm.start();
        assert_eq!(pm.current_view(), View(1));
        assert_eq!(pm.phase(), PacemakerPhase::ActiveView(View(1)));
        assert!(matches!(
            actions.as_slice(),
            [Action::SetTimer {
                id: TimerId::LocalTimeout { view: View(1), .. },
                ..
            }]
        ));
        // Starting twice is a no-op.
        assert!(pm.start().is_empty());
    }

    #[test]
    fn test_certificate_advances_and_cancels_old_timer() {
        let mut pm = pacemaker();
        pm.start();
        let actions = pm.process_certificate(View(1), AdvanceReason::Qc).unwrap();
        assert_eq!(pm.current_view(), View(2));
        assert!(matches!(
            actions[0],
            Action::CancelTimer {
                id: TimerId::LocalTimeout { view: View(1), .. }
            }
        ));
        // Old certificates do not move the view.
        assert!(pm.process_certificate(View(1), AdvanceReason::Qc).is_none());
        assert!(pm.process_certificate(View(0), AdvanceReason::Tc).is_none());
    }

    #[test]
    fn test_backoff_resets_only_on_qc() {
        let mut pm = pacemaker();
        pm.start();
        pm.on_local_timeout(EpochId(0), View(1)).unwrap();
        assert_eq!(pm.consecutive_timeouts(), 1);

        let actions = pm.process_certificate(View(1), AdvanceReason::Tc).unwrap();
        assert_eq!(pm.consecutive_timeouts(), 1);
        assert_eq!(timer_duration(&actions), Some(Duration::from_millis(200)));

        pm.process_certificate(View(2), AdvanceReason::ViewUpdate).unwrap();
        assert_eq!(pm.consecutive_timeouts(), 1);

        let actions = pm.process_certificate(View(3), AdvanceReason::Qc).unwrap();
        assert_eq!(pm.consecutive_timeouts(), 0);
        assert_eq!(timer_duration(&actions), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_repeated_timeouts_rearm_same_view_with_backoff() {
        let mut pm = pacemaker();
        pm.start();
        let mut durations = Vec::new();
        for _ in 0..5 {
            let actions = pm.on_local_timeout(EpochId(0), View(1)).unwrap();
            durations.push(timer_duration(&actions).unwrap());
        }
        assert_eq!(pm.current_view(), View(1));
        assert_eq!(pm.phase(), PacemakerPhase::AwaitingQuorum(View(1)));
        assert_eq!(
            durations,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(800),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn test_stale_timer_ignored() {
        let mut pm = pacemaker();
        assert!(pm.on_local_timeout(EpochId(0), View(1)).is_none());
        pm.start();
        pm.process_certificate(View(1), AdvanceReason::Qc);
        assert!(pm.on_local_timeout(EpochId(0), View(1)).is_none());
        assert!(pm.on_local_timeout(EpochId(1), View(2)).is_none());
        assert!(pm.on_local_timeout(EpochId(0), View(2)).is_some());
    }

    #[test]
    fn test_votes_at_or_below_quorum_view_ignored() {
        let mut pm = pacemaker();
        pm.start();
        assert!(pm.accepts_votes_for(View(1)));
        pm.process_certificate(View(3), AdvanceReason::Tc);
        assert!(!pm.accepts_votes_for(View(3)));
        assert!(pm.accepts_votes_for(View(4)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = BftConfig::default().with_backoff(0.5, 3);
        assert!(Pacemaker::new(EpochId(0), &config).is_err());
    }

    #[test]
    fn test_stop_cancels_timer() {
        let mut pm = pacemaker();
        pm.start();
        let actions = pm.stop();
        assert!(matches!(actions.as_slice(), [Action::CancelTimer { .. }]));
        assert_eq!(pm.phase(), PacemakerPhase::Idle);
    }
}
