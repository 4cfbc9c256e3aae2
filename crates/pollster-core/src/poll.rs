//! Poll data model.
//!
//! A [`PollDefinition`] is the root aggregate: question, options with their
//! vote counts, the start/end window, and the lifecycle [`PollState`]. The
//! [`ActivePollMarker`] is the sparse index entry that exists exactly while a
//! poll is `Active`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lifecycle state. Transitions only ever move forward.
///
/// ```text
/// Unscheduled -> Scheduled -> Active -> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PollState {
    Unscheduled,
    Scheduled,
    Active,
    Expired,
}

impl PollState {
    pub const ALL: [PollState; 4] = [
        PollState::Unscheduled,
        PollState::Scheduled,
        PollState::Active,
        PollState::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PollState::Unscheduled => "Unscheduled",
            PollState::Scheduled => "Scheduled",
            PollState::Active => "Active",
            PollState::Expired => "Expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == PollState::Expired
    }

    /// True when `next` lies strictly after `self` in the lifecycle.
    pub fn can_advance_to(self, next: PollState) -> bool {
        next > self
    }
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PollState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PollState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::InvalidValue {
                field: "state".into(),
                message: format!("unknown poll state '{s}'"),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub text: String,
    #[serde(default)]
    pub votes: u64,
}

impl PollOption {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            votes: 0,
        }
    }
}

/// Current vote count per option id.
pub type Tally = BTreeMap<String, u64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollDefinition {
    /// Empty until the repository assigns one on first save.
    #[serde(default)]
    pub id: String,
    pub author: String,
    pub title: String,
    pub question: String,
    pub options: BTreeMap<String, PollOption>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub state: PollState,
    /// Notification topic, provisioned once on first save.
    #[serde(default)]
    pub topic: Option<String>,
    /// Last state whose announcement has been published.
    #[serde(default)]
    pub announced: Option<PollState>,
    pub created_at: DateTime<Utc>,
}

impl PollDefinition {
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn tally(&self) -> Tally {
        self.options
            .iter()
            .map(|(id, option)| (id.clone(), option.votes))
            .collect()
    }

    pub fn total_votes(&self) -> u64 {
        self.options.values().map(|o| o.votes).sum()
    }

    /// Options ordered by votes descending, then by option id.
    pub fn ranked_options(&self) -> Vec<(&String, &PollOption)> {
        let mut ranked: Vec<_> = self.options.iter().collect();
        ranked.sort_by(|a, b| b.1.votes.cmp(&a.1.votes).then_with(|| a.0.cmp(b.0)));
        ranked
    }

    /// Structural checks that hold for every stored poll.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        require_text("author", &self.author, &mut violations);
        require_text("title", &self.title, &mut violations);
        require_text("question", &self.question, &mut violations);
        if self.options.is_empty() {
            violations.push(ValidationError::EmptyCollection("options".into()));
        }
        for (id, option) in &self.options {
            if id.trim().is_empty() {
                violations.push(ValidationError::Blank {
                    field: "options.id".into(),
                });
            }
            require_text(&format!("options.{id}.text"), &option.text, &mut violations);
        }
        if self.end_time <= self.start_time {
            violations.push(ValidationError::InvalidTimeRange {
                start: self.start_time,
                end: self.end_time,
            });
        }
        match ValidationError::collect(violations) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Entry in the active-poll index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePollMarker {
    pub id: String,
    pub activated_at: DateTime<Utc>,
}

/// Author input for creating a poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPoll {
    pub title: String,
    pub question: String,
    pub options: Vec<String>,
    pub author: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl NewPoll {
    /// Check the request against `now`, reporting every violated field.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        require_text("title", &self.title, &mut violations);
        require_text("question", &self.question, &mut violations);
        require_text("author", &self.author, &mut violations);

        let texts: Vec<&str> = self.options.iter().map(|o| o.trim()).collect();
        if texts.is_empty() {
            violations.push(ValidationError::EmptyCollection("options".into()));
        }
        let mut seen = HashSet::new();
        for (i, text) in texts.iter().enumerate() {
            if text.is_empty() {
                violations.push(ValidationError::Blank {
                    field: format!("options[{i}]"),
                });
            } else if !seen.insert(text.to_lowercase()) {
                violations.push(ValidationError::DuplicateOption(text.to_string()));
            }
        }

        if self.end_time <= self.start_time {
            violations.push(ValidationError::InvalidTimeRange {
                start: self.start_time,
                end: self.end_time,
            });
        } else if self.end_time <= now {
            violations.push(ValidationError::EndTimeInPast {
                end: self.end_time,
                now,
            });
        }

        match ValidationError::collect(violations) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Build an unsaved definition. Option ids are `"1".."n"` in input order.
    pub fn into_definition(self, now: DateTime<Utc>) -> PollDefinition {
        let options = self
            .options
            .into_iter()
            .enumerate()
            .map(|(i, text)| ((i + 1).to_string(), PollOption::new(text.trim())))
            .collect();
        PollDefinition {
            id: String::new(),
            author: self.author.trim().to_string(),
            title: self.title.trim().to_string(),
            question: self.question.trim().to_string(),
            options,
            start_time: self.start_time,
            end_time: self.end_time,
            state: PollState::Unscheduled,
            topic: None,
            announced: None,
            created_at: now,
        }
    }
}

fn require_text(field: &str, value: &str, violations: &mut Vec<ValidationError>) {
    if value.trim().is_empty() {
        violations.push(ValidationError::Blank {
            field: field.to_string(),
        });
    }
}
