//! Motion guard
//!
//! Single-shot deadline that forces the actuator back to stop a fixed time
//! after the last motion command. The guard only keeps time; the panel
//! decides what to send when it fires.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::rmd::protocol::PidParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Disarmed,
    Armed {
        deadline: Instant,
        /// Gains held before the motion sequence began
        restore: Option<PidParameters>,
    },
}

/// Emitted once when an armed guard reaches its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardExpired {
    pub deadline: Instant,
    pub restore: Option<PidParameters>,
}

#[derive(Debug, Clone)]
pub struct MotionGuard {
    timeout: Duration,
    state: GuardState,
}

impl MotionGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: GuardState::Disarmed,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, GuardState::Armed { .. })
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            GuardState::Armed { deadline, .. } => Some(deadline),
            GuardState::Disarmed => None,
        }
    }

    /// Arm, or push the deadline of an armed guard forward
    ///
    /// `restore` is captured only on the disarmed to armed transition, so a
    /// burst of commands restores the gains from before the first one.
    pub fn arm(&mut self, now: Instant, restore: Option<PidParameters>) {
        let deadline = now + self.timeout;
        self.state = match self.state {
            GuardState::Disarmed => {
                debug!("Motion guard armed, deadline in {:?}", self.timeout);
                GuardState::Armed { deadline, restore }
            }
            GuardState::Armed { restore: held, .. } => {
                debug!("Motion guard rearmed, deadline in {:?}", self.timeout);
                GuardState::Armed {
                    deadline,
                    restore: held,
                }
            }
        };
    }

    /// Cancel without firing
    ///
    /// Returns whether the guard was armed.
    pub fn disarm(&mut self) -> bool {
        let was_armed = self.is_armed();
        if was_armed {
            debug!("Motion guard cancelled");
        }
        self.state = GuardState::Disarmed;
        was_armed
    }

    /// Fire if the deadline has passed
    ///
    /// Returns `Some` at most once per arm.
    pub fn poll(&mut self, now: Instant) -> Option<GuardExpired> {
        match self.state {
            GuardState::Armed { deadline, restore } if now >= deadline => {
                self.state = GuardState::Disarmed;
                Some(GuardExpired { deadline, restore })
            }
            _ => None,
        }
    }
}
