//! # Pollster Core Library
//!
//! This library schedules polls through a time-windowed lifecycle:
//! `Unscheduled -> Scheduled -> Active -> Expired`. A poll opens for voting at
//! its start time, closes at its end time, and each transition is announced on
//! the poll's notification topic. The `pollster` CLI is a thin layer over the
//! same library.
//!
//! ## Architecture
//!
//! - **Engine**: a pure function from (poll, now) to the next decision
//! - **Storage**: SQLite-backed poll records, vote counts and the
//!   active-poll index, plus TOML configuration
//! - **Queue**: durable decision/activity task lists with leases, retries
//!   and timers
//! - **Workflow**: decider and activity workers, cancellable and joinable
//!
//! ## Key Components
//!
//! - [`PollService`]: Create, read, vote, feed and status operations
//! - [`WorkerPool`]: Runs the workflow workers until shutdown
//! - [`PollStore`]: Poll persistence
//! - [`TaskQueue`]: Workflow task delivery
//! - [`Notifier`]: Announcement sink

pub mod clock;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod poll;
pub mod queue;
pub mod repository;
pub mod service;
pub mod storage;
pub mod votes;
pub mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{decide, Decision, Plan};
pub use error::{ConfigError, CoreError, DatabaseError, Result, ValidationError};
pub use events::Announcement;
pub use notify::{LogNotifier, MemoryNotifier, Notifier, WebhookNotifier};
pub use poll::{ActivePollMarker, NewPoll, PollDefinition, PollOption, PollState, Tally};
pub use queue::{SqliteTaskQueue, TaskQueue, WorkflowRecord, WorkflowStatus};
pub use repository::PollRepository;
pub use service::{FeedEntry, PollService, WorkflowReport};
pub use storage::{Config, PollStore, SqliteHandle, SqlitePollStore};
pub use votes::VoteAggregator;
pub use workflow::{ChangeNotifier, WorkerContext, WorkerPool};
