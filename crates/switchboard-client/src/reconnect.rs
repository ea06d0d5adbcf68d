//! Two-phase reconnect schedule.
//!
//! Failures first walk the exponential backoff from [`ReconnectPolicy`]. Once
//! `max_attempts` quick retries are spent the schedule settles on the
//! persistent interval and stays there until a connection opens.

use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Where the schedule currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    Backoff { attempt: u32 },
    Persistent,
}

#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    policy: ReconnectPolicy,
    phase: SchedulePhase,
}

impl ReconnectSchedule {
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: SchedulePhase::Backoff { attempt: 0 },
        }
    }

    pub const fn phase(&self) -> SchedulePhase {
        self.phase
    }

    /// Delay before the next retry; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        match self.phase {
            SchedulePhase::Backoff { attempt } if self.policy.in_backoff(attempt) => {
                let delay = self.policy.delay_for_attempt(attempt);
                let next = attempt.saturating_add(1);
                self.phase = if self.policy.in_backoff(next) {
                    SchedulePhase::Backoff { attempt: next }
                } else {
                    SchedulePhase::Persistent
                };
                delay
            }
            SchedulePhase::Backoff { .. } | SchedulePhase::Persistent => {
                self.phase = SchedulePhase::Persistent;
                self.policy.persistent_interval
            }
        }
    }

    /// Return to the start of the backoff phase after a successful open.
    pub const fn reset(&mut self) {
        self.phase = SchedulePhase::Backoff { attempt: 0 };
    }
}
