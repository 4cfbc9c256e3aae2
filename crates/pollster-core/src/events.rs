use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::poll::{PollDefinition, PollState};

/// Final count for one option, in ranking order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionResult {
    pub option_id: String,
    pub text: String,
    pub votes: u64,
}

/// A lifecycle change announced to a poll's notification topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Announcement {
    PollActivated {
        poll_id: String,
        title: String,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    PollExpired {
        poll_id: String,
        title: String,
        results: Vec<OptionResult>,
    },
}

impl Announcement {
    pub fn activated(poll: &PollDefinition) -> Self {
        Announcement::PollActivated {
            poll_id: poll.id.clone(),
            title: poll.title.clone(),
            start_time: poll.start_time,
            end_time: poll.end_time,
        }
    }

    /// Final tally, highest vote count first.
    pub fn expired(poll: &PollDefinition) -> Self {
        let results = poll
            .ranked_options()
            .into_iter()
            .map(|(id, option)| OptionResult {
                option_id: id.clone(),
                text: option.text.clone(),
                votes: option.votes,
            })
            .collect();
        Announcement::PollExpired {
            poll_id: poll.id.clone(),
            title: poll.title.clone(),
            results,
        }
    }

    pub fn poll_id(&self) -> &str {
        match self {
            Announcement::PollActivated { poll_id, .. } | Announcement::PollExpired { poll_id, .. } => {
                poll_id
            }
        }
    }

    /// The state this announcement reports.
    pub fn state(&self) -> PollState {
        match self {
            Announcement::PollActivated { .. } => PollState::Active,
            Announcement::PollExpired { .. } => PollState::Expired,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Announcement::PollActivated { title, .. } => format!("Pollster Poll {title} Activated"),
            Announcement::PollExpired { title, .. } => format!("Poll {title} has expired"),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Announcement::PollActivated {
                title,
                start_time,
                end_time,
                ..
            } => format!("Poll {title} was activated at {start_time} and will last until {end_time}"),
            Announcement::PollExpired { title, results, .. } => {
                let mut message = format!("Poll {title} has expired, final results are:");
                for result in results {
                    message.push_str(&format!("\n\t{}: {} Votes", result.text, result.votes));
                }
                message
            }
        }
    }
}
