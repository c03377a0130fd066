use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::usecase::contracts::{ChangeFeed, LocalStorage, NotificationSource};
use crate::usecase::feed::{FeedSettings, NotificationFeed};
use crate::usecase::live::LiveRefresh;

struct Session<S, L>
where
    S: NotificationSource + ?Sized,
    L: LocalStorage + ?Sized,
{
    feed: Arc<NotificationFeed<S, L>>,
    shutdown: watch::Sender<bool>,
    live: JoinHandle<()>,
    last_seen: Mutex<Instant>,
}

impl<S, L> Session<S, L>
where
    S: NotificationSource + ?Sized,
    L: LocalStorage + ?Sized,
{
    fn touch(&self) -> Arc<NotificationFeed<S, L>> {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.feed.clone()
    }

    /// Idle for at least `idle` and no websocket is streaming the feed.
    fn is_idle(&self, idle: Duration) -> bool {
        let last_seen = *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        last_seen.elapsed() >= idle && self.feed.subscriber_count() == 0
    }
}

/// Signed-in users and their notification feeds.
///
/// `sign_in` creates the session, hydrates the read state, starts the live
/// refresh subscription and runs the first refresh. `sign_out` tears all of
/// that down again, and so does the idle sweeper for sessions nobody has
/// touched for a while. Persisted read/dismissed ids outlive the session.
pub struct SessionRegistry<S, L, C>
where
    S: NotificationSource + ?Sized + 'static,
    L: LocalStorage + ?Sized + 'static,
    C: ChangeFeed,
{
    source: Arc<S>,
    storage: Arc<L>,
    changes: Arc<C>,
    settings: FeedSettings,
    debounce: Duration,
    sessions: RwLock<HashMap<Uuid, Session<S, L>>>,
}

impl<S, L, C> SessionRegistry<S, L, C>
where
    S: NotificationSource + ?Sized + 'static,
    L: LocalStorage + ?Sized + 'static,
    C: ChangeFeed,
{
    pub fn new(
        source: Arc<S>,
        storage: Arc<L>,
        changes: Arc<C>,
        settings: FeedSettings,
        debounce: Duration,
    ) -> Self {
        Self {
            source,
            storage,
            changes,
            settings,
            debounce,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn feed(&self, user_id: Uuid) -> Option<Arc<NotificationFeed<S, L>>> {
        self.sessions.read().await.get(&user_id).map(Session::touch)
    }

    #[cfg(test)]
    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns the user's feed, starting a session first if there is none.
    /// Every caller gets the feed only after its first refresh has finished.
    #[tracing::instrument(skip(self), fields(%user_id))]
    pub async fn sign_in(&self, user_id: Uuid) -> Arc<NotificationFeed<S, L>> {
        if let Some(feed) = self.feed(user_id).await {
            feed.wait_until_settled().await;
            return feed;
        }

        let (feed, created) = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&user_id) {
                Some(session) => (session.touch(), false),
                None => {
                    let feed = Arc::new(NotificationFeed::new(
                        user_id,
                        self.source.clone(),
                        self.storage.clone(),
                        self.settings.clone(),
                    ));
                    feed.hydrate();

                    // Subscribe before the first refresh so no change slips through.
                    let (shutdown, shutdown_rx) = watch::channel(false);
                    let live = tokio::spawn(LiveRefresh::new(self.debounce).run(
                        self.changes.subscribe(),
                        feed.clone(),
                        shutdown_rx,
                    ));

                    sessions.insert(
                        user_id,
                        Session {
                            feed: feed.clone(),
                            shutdown,
                            live,
                            last_seen: Mutex::new(Instant::now()),
                        },
                    );
                    metrics::gauge!("notifeed_sessions_active").set(sessions.len() as f64);
                    (feed, true)
                }
            }
        };

        if !created {
            feed.wait_until_settled().await;
            return feed;
        }

        tracing::info!("notification session started");
        // Errors are logged by the feed; an empty list is shown until the next
        // successful refresh.
        let _ = feed.refresh().await;
        feed
    }

    /// Ends the session: stops live refresh and drops in-memory state.
    #[tracing::instrument(skip(self), fields(%user_id))]
    pub async fn sign_out(&self, user_id: Uuid) -> bool {
        let session = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.remove(&user_id);
            metrics::gauge!("notifeed_sessions_active").set(sessions.len() as f64);
            session
        };

        let Some(session) = session else {
            tracing::debug!("no active session to sign out");
            return false;
        };

        Self::teardown(session).await;
        tracing::info!("notification session ended");
        true
    }

    /// Signs every user out; used on server shutdown.
    pub async fn sign_out_all(&self) {
        let sessions: Vec<Session<S, L>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        metrics::gauge!("notifeed_sessions_active").set(0.0);

        for session in sessions {
            Self::teardown(session).await;
        }
    }

    /// Ends every session untouched for `idle` that has no open websocket.
    /// Returns how many were evicted.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let evicted: Vec<(Uuid, Session<S, L>)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, session)| session.is_idle(idle))
                .map(|(id, _)| *id)
                .collect();
            let evicted = ids
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|session| (id, session)))
                .collect();
            metrics::gauge!("notifeed_sessions_active").set(sessions.len() as f64);
            evicted
        };

        let count = evicted.len();
        for (user_id, session) in evicted {
            Self::teardown(session).await;
            tracing::info!(%user_id, "idle notification session evicted");
        }
        count
    }

    /// Runs `evict_idle` every `every` until `shutdown` fires.
    pub async fn run_idle_sweeper(
        &self,
        idle: Duration,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(idle_secs = idle.as_secs(), "idle session sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let evicted = self.evict_idle(idle).await;
                    if evicted > 0 {
                        tracing::debug!(evicted, "idle sessions swept");
                    }
                }
            }
        }
    }

    async fn teardown(session: Session<S, L>) {
        // Close the feed first so a refresh still in flight cannot republish.
        session.feed.reset();
        let _ = session.shutdown.send(true);
        if let Err(e) = session.live.await {
            tracing::warn!(error = %e, "live refresh task ended abnormally");
        }
    }
}
