//! State transition engine.
//!
//! [`decide`] looks at a poll's state and the current time and says what the
//! workflow should do next. It performs no I/O; the decider worker applies
//! the resulting [`Plan`].
//!
//! ## Decision table
//!
//! ```text
//! Unscheduled, now <  start  -> promote Scheduled, Wait(start - now)
//! Unscheduled, now >= start  -> promote Scheduled, Activate
//! Scheduled,   now <  start  -> Wait(start - now)
//! Scheduled,   now >= start  -> Activate
//! Active,      now <  end    -> Wait(end - now)
//! Active,      now >= end    -> Expire
//! Expired                    -> Done
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::timer_delay;
use crate::poll::{PollDefinition, PollState};

/// What the workflow does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Arm a timer and decide again when it fires.
    Wait { delay: Duration },
    /// Run the activate activity.
    Activate,
    /// Run the expire activity.
    Expire,
    /// The workflow is finished.
    Done,
}

/// A decision plus the state change the decider records before acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub promote: Option<PollState>,
    pub decision: Decision,
}

impl Plan {
    fn stay(decision: Decision) -> Self {
        Self {
            promote: None,
            decision,
        }
    }

    fn promote(to: PollState, decision: Decision) -> Self {
        Self {
            promote: Some(to),
            decision,
        }
    }

    /// The state the poll is in once the plan's promotion is applied.
    pub fn resulting_state(&self, current: PollState) -> PollState {
        self.promote.unwrap_or(current)
    }
}

pub fn decide(poll: &PollDefinition, now: DateTime<Utc>) -> Plan {
    match poll.state {
        PollState::Unscheduled => match timer_delay(poll.start_time, now) {
            Some(delay) => Plan::promote(PollState::Scheduled, Decision::Wait { delay }),
            // Start already passed: skip the timer and go straight to activation.
            None => Plan::promote(PollState::Scheduled, Decision::Activate),
        },
        PollState::Scheduled => match timer_delay(poll.start_time, now) {
            Some(delay) => Plan::stay(Decision::Wait { delay }),
            None => Plan::stay(Decision::Activate),
        },
        PollState::Active => match timer_delay(poll.end_time, now) {
            Some(delay) => Plan::stay(Decision::Wait { delay }),
            None => Plan::stay(Decision::Expire),
        },
        PollState::Expired => Plan::stay(Decision::Done),
    }
}
