//! Poll repository: the persistence port used by the service and the workers.
//!
//! Wraps a [`PollStore`] and owns the one side effect of a first save:
//! provisioning the poll's notification topic and subscribing its author.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{CoreError, Result, ValidationError};
use crate::notify::{Notifier, AUTHOR_PROTOCOL};
use crate::poll::{ActivePollMarker, PollDefinition, PollState};
use crate::storage::{NotificationsConfig, PollStore};

/// Result of [`PollRepository::put`].
#[derive(Debug, Clone)]
pub struct Saved {
    pub poll: PollDefinition,
    /// True when this call created the record.
    pub created: bool,
}

#[derive(Clone)]
pub struct PollRepository {
    store: Arc<dyn PollStore>,
    notifier: Arc<dyn Notifier>,
    notifications: NotificationsConfig,
}

impl PollRepository {
    pub fn new(
        store: Arc<dyn PollStore>,
        notifier: Arc<dyn Notifier>,
        notifications: NotificationsConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            notifications,
        }
    }

    pub fn store(&self) -> &Arc<dyn PollStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Fetch a poll, failing with `NotFound` when absent.
    pub async fn get(&self, id: &str) -> Result<PollDefinition> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::poll_not_found(id))
    }

    pub async fn find(&self, id: &str) -> Result<Option<PollDefinition>> {
        self.store.get(id).await
    }

    /// Save a poll, assigning an id when it has none.
    ///
    /// The first save of a poll provisions its topic and subscribes the
    /// author. Later saves update the descriptive fields only; the option set
    /// itself is fixed once stored.
    pub async fn put(&self, mut poll: PollDefinition) -> Result<Saved> {
        poll.validate()?;

        let existing = if poll.has_id() {
            self.store.get(&poll.id).await?
        } else {
            poll.id = uuid::Uuid::new_v4().to_string();
            None
        };

        match &existing {
            Some(stored) => {
                if !stored.options.keys().eq(poll.options.keys()) {
                    return Err(ValidationError::InvalidValue {
                        field: "options".into(),
                        message: "option ids cannot change after the poll is created".into(),
                    }
                    .into());
                }
                poll.topic = stored.topic.clone();
            }
            None => {
                let name = self.notifications.topic_for(&poll.id);
                let topic = self.notifier.create_topic(&name).await?;
                self.notifier
                    .subscribe(&topic, AUTHOR_PROTOCOL, &poll.author)
                    .await?;
                info!(poll_id = %poll.id, topic = %topic, "provisioned notification topic");
                poll.topic = Some(topic);
                poll.state = PollState::Unscheduled;
                poll.announced = None;
                for option in poll.options.values_mut() {
                    option.votes = 0;
                }
            }
        }

        let created = self.store.upsert(&poll).await?;
        debug!(poll_id = %poll.id, created, "saved poll");
        let poll = self.get(&poll.id).await?;
        Ok(Saved { poll, created })
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(id).await
    }

    pub async fn query_by_author(&self, author: &str) -> Result<Vec<PollDefinition>> {
        self.store.query_by_author(author).await
    }

    /// Ids of the currently active polls, oldest activation first.
    pub async fn list_active(&self) -> Result<Vec<String>> {
        Ok(self
            .active_markers()
            .await?
            .into_iter()
            .map(|marker| marker.id)
            .collect())
    }

    pub async fn active_markers(&self) -> Result<Vec<ActivePollMarker>> {
        self.store.list_active().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::poll::NewPoll;
    use crate::storage::SqlitePollStore;
    use chrono::{Duration, Utc};

    fn repo() -> (PollRepository, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let store = Arc::new(SqlitePollStore::open_memory().unwrap());
        (
            PollRepository::new(store, notifier.clone(), NotificationsConfig::default()),
            notifier,
        )
    }

    fn draft() -> PollDefinition {
        let now = Utc::now();
        NewPoll {
            title: "Lunch".into(),
            question: "Where?".into(),
            options: vec!["Tacos".into(), "Ramen".into()],
            author: "a@example.com".into(),
            start_time: now + Duration::seconds(30),
            end_time: now + Duration::seconds(60),
        }
        .into_definition(now)
    }

    #[tokio::test]
    async fn first_save_assigns_id_and_provisions_topic_once() {
        let (repo, notifier) = repo();
        let saved = repo.put(draft()).await.unwrap();
        assert!(saved.created);
        assert!(saved.poll.has_id());
        let topic = format!("pollster-poll-{}", saved.poll.id);
        assert_eq!(saved.poll.topic.as_deref(), Some(topic.as_str()));

        let mut edited = saved.poll.clone();
        edited.question = "Where today?".into();
        let again = repo.put(edited).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.poll.question, "Where today?");
        assert_eq!(again.poll.id, saved.poll.id);

        assert_eq!(notifier.topics(), vec![topic.clone()]);
        let subs = notifier.subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].protocol, "email");
        assert_eq!(subs[0].endpoint, "a@example.com");
    }

    #[tokio::test]
    async fn invalid_time_range_is_rejected_without_side_effects() {
        let (repo, notifier) = repo();
        let mut poll = draft();
        poll.end_time = poll.start_time;
        let err = repo.put(poll).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(notifier.topics().is_empty());
        assert!(repo.query_by_author("a@example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn option_set_is_fixed_after_creation() {
        let (repo, _notifier) = repo();
        let saved = repo.put(draft()).await.unwrap();
        let mut edited = saved.poll;
        edited
            .options
            .insert("3".into(), crate::poll::PollOption::new("Salad"));
        assert!(matches!(
            repo.put(edited).await.unwrap_err(),
            CoreError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let (repo, _notifier) = repo();
        assert!(matches!(
            repo.get("nope").await.unwrap_err(),
            CoreError::NotFound { kind: "Poll", .. }
        ));
        assert!(repo.list_active().await.unwrap().is_empty());
    }
}
