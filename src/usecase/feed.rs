use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::domain::notification::{Notification, NotificationId};
use crate::repository::errors::RepositoryError;
use crate::usecase::actors::{resolve_actors, ActorDirectory};
use crate::usecase::contracts::{LocalStorage, NotificationSource};
use crate::usecase::merge::merge;
use crate::usecase::read_state::ReadStateStore;
use crate::usecase::sources::{fetch_raw_events, FetchedEvents};
use crate::usecase::synthesize::synthesize_all;

const UPDATES_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub owned_posts_limit: i64,
    pub fetch_timeout: Duration,
    pub fallback_actor_name: String,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            owned_posts_limit: 500,
            fetch_timeout: Duration::from_secs(10),
            fallback_actor_name: "User".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
    pub refreshed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { count: usize },
    /// Another refresh was in flight or the session was closed; nothing
    /// was published.
    Skipped,
}

/// Returned by mutators once the session behind the feed has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("notification session is closed")]
pub struct FeedClosed;

struct FeedState<L: LocalStorage + ?Sized> {
    read_state: ReadStateStore<L>,
    notifications: Vec<Notification>,
    refreshed_at: Option<DateTime<Utc>>,
    closed: bool,
}

impl<L: LocalStorage + ?Sized> FeedState<L> {
    fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            notifications: self.notifications.clone(),
            unread_count: self.notifications.iter().filter(|n| !n.is_read).count(),
            refreshed_at: self.refreshed_at,
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The published notification list of one user.
///
/// A refresh rebuilds the list from the backend and then applies the local
/// read/dismissed overlay, so optimistic mutations made while a fetch is
/// running are never lost. Mutators are synchronous and never touch the
/// backend.
pub struct NotificationFeed<S, L>
where
    S: NotificationSource + ?Sized,
    L: LocalStorage + ?Sized,
{
    user_id: Uuid,
    source: Arc<S>,
    settings: FeedSettings,
    state: Mutex<FeedState<L>>,
    in_flight: AtomicBool,
    updates: broadcast::Sender<FeedSnapshot>,
    settled: watch::Sender<bool>,
}

impl<S, L> NotificationFeed<S, L>
where
    S: NotificationSource + ?Sized,
    L: LocalStorage + ?Sized,
{
    pub fn new(user_id: Uuid, source: Arc<S>, storage: Arc<L>, settings: FeedSettings) -> Self {
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Self {
            user_id,
            source,
            settings,
            state: Mutex::new(FeedState {
                read_state: ReadStateStore::new(storage),
                notifications: Vec::new(),
                refreshed_at: None,
                closed: false,
            }),
            in_flight: AtomicBool::new(false),
            updates,
            settled: watch::channel(false).0,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    fn state(&self) -> MutexGuard<'_, FeedState<L>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// State guard for mutators; a closed session can no longer persist.
    fn open_state(&self) -> Result<MutexGuard<'_, FeedState<L>>, FeedClosed> {
        let state = self.state();
        if state.closed {
            tracing::debug!("mutation on a closed session rejected");
            return Err(FeedClosed);
        }
        Ok(state)
    }

    /// Loads persisted read/dismissed ids, once per session.
    pub fn hydrate(&self) -> bool {
        self.state().read_state.hydrate(self.user_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedSnapshot> {
        self.updates.subscribe()
    }

    /// Open websocket streams on this feed.
    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    /// Resolves once the first refresh has finished, successfully or not, or
    /// the session was closed.
    pub async fn wait_until_settled(&self) {
        let mut settled = self.settled.subscribe();
        let _ = settled.wait_for(|done| *done).await;
    }

    fn settle(&self) {
        self.settled.send_replace(true);
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.state().snapshot()
    }

    #[cfg(test)]
    pub fn notifications(&self) -> Vec<Notification> {
        self.state().notifications.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.state().notifications.iter().filter(|n| !n.is_read).count()
    }

    #[cfg(test)]
    pub fn has_refreshed(&self) -> bool {
        self.state().refreshed_at.is_some()
    }

    /// Copies of the read and dismissed sets.
    pub fn read_state(&self) -> (BTreeSet<NotificationId>, BTreeSet<NotificationId>) {
        self.state().read_state.snapshot()
    }

    #[tracing::instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn refresh(&self) -> Result<RefreshOutcome, RepositoryError> {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("refresh already in flight, discarding request");
            metrics::counter!("notifeed_refresh_total", "outcome" => "skipped").increment(1);
            return Ok(RefreshOutcome::Skipped);
        };
        if self.state().closed {
            tracing::debug!("session closed, refresh not started");
            return Ok(RefreshOutcome::Skipped);
        }

        let started = Instant::now();
        let fetched = tokio::time::timeout(self.settings.fetch_timeout, self.fetch())
            .await
            .unwrap_or(Err(RepositoryError::Timeout(self.settings.fetch_timeout)));

        let (events, actors) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::error!(error = %e, "notification refresh failed, keeping previous list");
                metrics::counter!("notifeed_refresh_total", "outcome" => "failed").increment(1);
                self.settle();
                return Err(e);
            }
        };

        let snapshot = {
            let mut guard = self.state();
            let state = &mut *guard;
            // Sign-out happened while fetching; the result belongs to nobody.
            if state.closed {
                None
            } else {
                let read = state.read_state.read();
                let lists = [
                    synthesize_all(&events.likes, &actors, read),
                    synthesize_all(&events.comments, &actors, read),
                    synthesize_all(&events.attendances, &actors, read),
                ];
                state.notifications = merge(lists, state.read_state.dismissed());
                state.refreshed_at = Some(Utc::now());
                Some(state.snapshot())
            }
        };
        self.settle();

        let Some(snapshot) = snapshot else {
            tracing::debug!("session closed during refresh, result discarded");
            metrics::counter!("notifeed_refresh_total", "outcome" => "discarded").increment(1);
            return Ok(RefreshOutcome::Skipped);
        };

        let count = snapshot.notifications.len();
        metrics::counter!("notifeed_refresh_total", "outcome" => "ok").increment(1);
        metrics::histogram!("notifeed_refresh_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::debug!(count, unread = snapshot.unread_count, "notification feed refreshed");

        self.publish(snapshot);
        Ok(RefreshOutcome::Refreshed { count })
    }

    async fn fetch(&self) -> Result<(FetchedEvents, ActorDirectory), RepositoryError> {
        let events = fetch_raw_events(
            self.source.as_ref(),
            self.user_id,
            self.settings.owned_posts_limit,
        )
        .await?;
        let actors = resolve_actors(
            self.source.as_ref(),
            &events,
            &self.settings.fallback_actor_name,
        )
        .await?;
        Ok((events, actors))
    }

    #[tracing::instrument(skip(self, id), fields(user_id = %self.user_id, notification_id = %id))]
    pub fn mark_read(&self, id: &NotificationId) -> Result<bool, FeedClosed> {
        let (changed, snapshot) = {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            let changed = state.read_state.mark_read(id.clone());
            for notification in state.notifications.iter_mut().filter(|n| &n.id == id) {
                notification.is_read = true;
            }
            (changed, state.snapshot())
        };

        metrics::counter!("notifeed_mutations_total", "op" => "mark_read").increment(1);
        if changed {
            self.publish(snapshot);
        }
        Ok(changed)
    }

    /// Marks every currently visible notification as read.
    #[tracing::instrument(skip(self), fields(user_id = %self.user_id))]
    pub fn mark_all_read(&self) -> Result<usize, FeedClosed> {
        let (added, snapshot) = {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            let added = state
                .read_state
                .mark_all_read(state.notifications.iter().map(|n| n.id.clone()));
            for notification in state.notifications.iter_mut() {
                notification.is_read = true;
            }
            (added, state.snapshot())
        };

        metrics::counter!("notifeed_mutations_total", "op" => "mark_all_read").increment(1);
        tracing::debug!(added, "notifications marked as read");
        if added > 0 {
            self.publish(snapshot);
        }
        Ok(added)
    }

    #[tracing::instrument(skip(self, id), fields(user_id = %self.user_id, notification_id = %id))]
    pub fn dismiss(&self, id: &NotificationId) -> Result<bool, FeedClosed> {
        let (changed, snapshot) = {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            let changed = state.read_state.dismiss(id.clone());
            state.notifications.retain(|n| &n.id != id);
            (changed, state.snapshot())
        };

        metrics::counter!("notifeed_mutations_total", "op" => "dismiss").increment(1);
        if changed {
            self.publish(snapshot);
        }
        Ok(changed)
    }

    /// Drops the in-memory list and read state and closes the feed; used on
    /// sign-out. A refresh still in flight discards its result and later
    /// mutations fail with `FeedClosed`.
    pub fn reset(&self) {
        {
            let mut state = self.state();
            state.read_state.reset();
            state.notifications.clear();
            state.refreshed_at = None;
            state.closed = true;
        }
        self.settle();
    }

    fn publish(&self, snapshot: FeedSnapshot) {
        // No subscribers is fine.
        let _ = self.updates.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};

    use crate::domain::actor::ActorProfile;
    use crate::domain::notification::NotificationKind;
    use crate::domain::raw_event::{
        AttendanceRow, AttendanceStatus, CommentRow, LikeRow, OrganizedEvent, OwnedPost,
    };
    use crate::usecase::contracts::{MockLocalStorage, MockNotificationSource};

    #[derive(Clone, Copy)]
    struct Scenario {
        owner: Uuid,
        post: Uuid,
        event: Uuid,
        comment: Uuid,
        liker: Uuid,
        commenter: Uuid,
        attendee: Uuid,
        base: DateTime<Utc>,
    }

    impl Scenario {
        fn new() -> Self {
            Self {
                owner: Uuid::new_v4(),
                post: Uuid::new_v4(),
                event: Uuid::new_v4(),
                comment: Uuid::new_v4(),
                liker: Uuid::new_v4(),
                commenter: Uuid::new_v4(),
                attendee: Uuid::new_v4(),
                base: Utc.with_ymd_and_hms(2024, 3, 10, 18, 0, 0).unwrap(),
            }
        }

        fn like_id(&self) -> NotificationId {
            NotificationId::like(self.post, self.liker)
        }

        fn comment_id(&self) -> NotificationId {
            NotificationId::comment(self.comment)
        }

        fn attendance_id(&self) -> NotificationId {
            NotificationId::attendance(self.event, self.attendee)
        }

        /// A owns one post liked by B and commented on by C, and organizes
        /// one event attended by D. D has no profile row.
        fn source(&self) -> MockNotificationSource {
            let mut source = MockNotificationSource::new();
            let Scenario {
                post,
                event,
                comment,
                liker,
                commenter,
                attendee,
                base,
                ..
            } = *self;

            source.expect_owned_posts().returning(move |_, _| {
                Ok(vec![OwnedPost {
                    id: post,
                    content: Some("Spring festival photos".to_string()),
                }])
            });
            source.expect_likes().returning(move |_, _| {
                Ok(vec![LikeRow {
                    post_id: post,
                    user_id: liker,
                    created_at: base + ChronoDuration::hours(1),
                }])
            });
            source.expect_comments().returning(move |_, _| {
                Ok(vec![CommentRow {
                    id: comment,
                    post_id: post,
                    user_id: commenter,
                    content: "See you there!".to_string(),
                    created_at: base + ChronoDuration::hours(2),
                }])
            });
            source.expect_organized_events().returning(move |_| {
                Ok(vec![OrganizedEvent {
                    id: event,
                    title: "Community breakfast".to_string(),
                }])
            });
            source.expect_event_attendees().returning(move |_, _| {
                Ok(vec![AttendanceRow {
                    event_id: event,
                    user_id: attendee,
                    status: AttendanceStatus::Going,
                    created_at: base + ChronoDuration::hours(3),
                }])
            });
            source.expect_profiles().returning(move |_| {
                Ok(vec![
                    ActorProfile {
                        id: liker,
                        first_name: Some("Burak".to_string()),
                        last_name: None,
                        username: Some("burak".to_string()),
                        avatar_url: Some("https://cdn.example/b.png".to_string()),
                    },
                    ActorProfile {
                        id: commenter,
                        first_name: None,
                        last_name: None,
                        username: Some("cem".to_string()),
                        avatar_url: None,
                    },
                ])
            });
            source
        }
    }

    fn quiet_storage() -> MockLocalStorage {
        let mut storage = MockLocalStorage::new();
        storage.expect_get_item().returning(|_| Ok(None));
        storage.expect_set_item().returning(|_, _| Ok(()));
        storage
    }

    fn feed(
        scenario: &Scenario,
        source: MockNotificationSource,
        storage: MockLocalStorage,
    ) -> NotificationFeed<MockNotificationSource, MockLocalStorage> {
        let feed = NotificationFeed::new(
            scenario.owner,
            Arc::new(source),
            Arc::new(storage),
            FeedSettings::default(),
        );
        feed.hydrate();
        feed
    }

    #[tokio::test]
    async fn test_scenario_three_notifications_sorted_and_unread() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());

        let outcome = feed.refresh().await.unwrap();
        let notifications = feed.notifications();

        assert_eq!(outcome, RefreshOutcome::Refreshed { count: 3 });
        let kinds: Vec<NotificationKind> = notifications.iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::Events, NotificationKind::Comments, NotificationKind::Likes]
        );
        assert!(notifications.iter().all(|n| !n.is_read));
        assert_eq!(feed.unread_count(), 3);
        assert_eq!(notifications[2].content.as_deref(), Some("Spring festival photos"));
        assert_eq!(notifications[1].actor.name, "cem");
        assert_eq!(notifications[0].actor.name, "User");
        assert!(notifications[0].actor.avatar_url.is_none());
    }

    #[tokio::test]
    async fn test_mark_read_survives_refresh() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());
        feed.refresh().await.unwrap();

        assert!(feed.mark_read(&scenario.comment_id()).unwrap());
        feed.refresh().await.unwrap();

        for n in feed.notifications() {
            assert_eq!(n.is_read, n.id == scenario.comment_id(), "{}", n.id);
        }
        assert_eq!(feed.unread_count(), 2);
    }

    #[tokio::test]
    async fn test_dismissed_like_stays_hidden_after_refresh() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());
        feed.refresh().await.unwrap();

        assert!(feed.dismiss(&scenario.like_id()).unwrap());
        assert_eq!(feed.notifications().len(), 2);

        feed.refresh().await.unwrap();
        feed.refresh().await.unwrap();

        let ids: Vec<NotificationId> = feed.notifications().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![scenario.attendance_id(), scenario.comment_id()]);
    }

    #[tokio::test]
    async fn test_mark_all_read_zeroes_unread_count() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());
        feed.refresh().await.unwrap();

        assert_eq!(feed.mark_all_read(), Ok(3));
        assert_eq!(feed.unread_count(), 0);

        let (read, _) = feed.read_state();
        for n in feed.notifications() {
            assert_eq!(n.is_read, read.contains(&n.id));
        }

        feed.refresh().await.unwrap();
        assert_eq!(feed.unread_count(), 0);
        assert_eq!(feed.mark_all_read(), Ok(0));
    }

    #[tokio::test]
    async fn test_pipeline_is_deterministic() {
        let scenario = Scenario::new();
        let first = feed(&scenario, scenario.source(), quiet_storage());
        let second = feed(&scenario, scenario.source(), quiet_storage());

        first.refresh().await.unwrap();
        second.refresh().await.unwrap();

        let a = serde_json::to_vec(&first.notifications()).unwrap();
        let b = serde_json::to_vec(&second.notifications()).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_list() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());
        feed.refresh().await.unwrap();

        let mut failing = MockNotificationSource::new();
        failing
            .expect_owned_posts()
            .returning(|_, _| Err(RepositoryError::DatabaseError("network down".to_string())));
        failing.expect_organized_events().returning(|_| Ok(vec![]));
        let broken = NotificationFeed {
            source: Arc::new(failing),
            ..feed
        };

        tokio_test::assert_err!(broken.refresh().await);
        assert_eq!(broken.notifications().len(), 3);
    }

    #[tokio::test]
    async fn test_overlapping_refresh_is_discarded() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());

        let held = InFlight::acquire(&feed.in_flight).unwrap();
        assert_eq!(feed.refresh().await.unwrap(), RefreshOutcome::Skipped);
        assert!(!feed.has_refreshed());
        drop(held);

        assert_eq!(
            feed.refresh().await.unwrap(),
            RefreshOutcome::Refreshed { count: 3 }
        );
    }

    struct StalledSource;

    #[async_trait]
    impl NotificationSource for StalledSource {
        async fn owned_posts(&self, _: Uuid, _: i64) -> Result<Vec<OwnedPost>, RepositoryError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }
        async fn likes(&self, _: &[Uuid], _: Uuid) -> Result<Vec<LikeRow>, RepositoryError> {
            Ok(vec![])
        }
        async fn comments(&self, _: &[Uuid], _: Uuid) -> Result<Vec<CommentRow>, RepositoryError> {
            Ok(vec![])
        }
        async fn organized_events(&self, _: Uuid) -> Result<Vec<OrganizedEvent>, RepositoryError> {
            Ok(vec![])
        }
        async fn event_attendees(&self, _: &[Uuid], _: Uuid) -> Result<Vec<AttendanceRow>, RepositoryError> {
            Ok(vec![])
        }
        async fn profiles(&self, _: &[Uuid]) -> Result<Vec<ActorProfile>, RepositoryError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_soft_failure() {
        let settings = FeedSettings {
            fetch_timeout: Duration::from_millis(20),
            ..FeedSettings::default()
        };
        let feed = NotificationFeed::new(
            Uuid::new_v4(),
            Arc::new(StalledSource),
            Arc::new(quiet_storage()),
            settings,
        );
        feed.hydrate();

        let result = feed.refresh().await;

        assert!(matches!(result, Err(RepositoryError::Timeout(_))));
        assert!(feed.notifications().is_empty());
        // flag released after the failure
        assert!(InFlight::acquire(&feed.in_flight).is_some());
    }

    #[tokio::test]
    async fn test_mutations_publish_snapshots() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());
        let mut updates = feed.subscribe();

        feed.refresh().await.unwrap();
        let refreshed = updates.recv().await.unwrap();
        assert_eq!(refreshed.unread_count, 3);

        feed.mark_read(&scenario.like_id()).unwrap();
        let marked = updates.recv().await.unwrap();
        assert_eq!(marked.unread_count, 2);

        assert!(!feed.mark_read(&scenario.like_id()).unwrap());
        feed.dismiss(&scenario.attendance_id()).unwrap();
        let dismissed = updates.recv().await.unwrap();
        assert_eq!(dismissed.notifications.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_clears_feed() {
        let scenario = Scenario::new();
        let feed = feed(&scenario, scenario.source(), quiet_storage());
        feed.refresh().await.unwrap();
        feed.mark_read(&scenario.like_id()).unwrap();

        feed.reset();

        assert!(feed.notifications().is_empty());
        assert!(!feed.has_refreshed());
        let (read, dismissed) = feed.read_state();
        assert!(read.is_empty() && dismissed.is_empty());

        assert_eq!(feed.dismiss(&scenario.like_id()), Err(FeedClosed));
        assert_eq!(feed.mark_all_read(), Err(FeedClosed));
        assert_eq!(feed.refresh().await.unwrap(), RefreshOutcome::Skipped);
        assert!(feed.notifications().is_empty());
        // settled, so late waiters do not hang
        feed.wait_until_settled().await;
    }

    #[tokio::test]
    async fn test_read_and_dismissed_survive_a_new_session() {
        use crate::repository::local::FileStorage;

        let dir = tempfile::tempdir().unwrap();
        let scenario = Scenario::new();
        let open = |source: MockNotificationSource| {
            let feed = NotificationFeed::new(
                scenario.owner,
                Arc::new(source),
                Arc::new(FileStorage::open(dir.path()).unwrap()),
                FeedSettings::default(),
            );
            feed.hydrate();
            feed
        };

        let first = open(scenario.source());
        first.refresh().await.unwrap();
        first.mark_read(&scenario.comment_id()).unwrap();
        first.dismiss(&scenario.like_id()).unwrap();
        first.reset();

        let second = open(scenario.source());
        second.refresh().await.unwrap();

        let notifications = second.notifications();
        assert_eq!(notifications.len(), 2);
        assert!(notifications.iter().all(|n| n.id != scenario.like_id()));
        assert_eq!(second.unread_count(), 1);
    }
}
