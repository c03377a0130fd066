use std::collections::BTreeSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::domain::notification::NotificationId;
use crate::usecase::contracts::LocalStorage;

pub fn read_key(user_id: Uuid) -> String {
    format!("notifications:read:{}", user_id)
}

pub fn dismissed_key(user_id: Uuid) -> String {
    format!("notifications:dismissed:{}", user_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetKind {
    Read,
    Dismissed,
}

/// Per-user read and dismissed id sets, written through to local storage on
/// every mutation. Storage failures are logged and never surface to callers.
pub struct ReadStateStore<L: LocalStorage + ?Sized> {
    storage: Arc<L>,
    user_id: Option<Uuid>,
    hydrated: bool,
    read: BTreeSet<NotificationId>,
    dismissed: BTreeSet<NotificationId>,
}

impl<L: LocalStorage + ?Sized> ReadStateStore<L> {
    pub fn new(storage: Arc<L>) -> Self {
        Self {
            storage,
            user_id: None,
            hydrated: false,
            read: BTreeSet::new(),
            dismissed: BTreeSet::new(),
        }
    }

    /// Loads the persisted sets for `user_id`. Runs at most once per session;
    /// returns false when the hydration guard skipped the load.
    #[tracing::instrument(skip(self), fields(%user_id))]
    pub fn hydrate(&mut self, user_id: Uuid) -> bool {
        if self.is_hydrated() && self.user_id == Some(user_id) {
            tracing::debug!("read state already hydrated for this session");
            return false;
        }

        self.reset();
        self.read = self.load(&read_key(user_id));
        self.dismissed = self.load(&dismissed_key(user_id));
        self.user_id = Some(user_id);
        self.hydrated = true;

        tracing::debug!(
            read = self.read.len(),
            dismissed = self.dismissed.len(),
            "read state hydrated"
        );
        true
    }

    /// Clears the in-memory sets and the hydration guard. Persisted data is
    /// kept for the next sign-in.
    pub fn reset(&mut self) {
        self.read.clear();
        self.dismissed.clear();
        self.user_id = None;
        self.hydrated = false;
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn read(&self) -> &BTreeSet<NotificationId> {
        &self.read
    }

    pub fn dismissed(&self) -> &BTreeSet<NotificationId> {
        &self.dismissed
    }

    /// Copies of both sets.
    pub fn snapshot(&self) -> (BTreeSet<NotificationId>, BTreeSet<NotificationId>) {
        (self.read.clone(), self.dismissed.clone())
    }

    pub fn mark_read(&mut self, id: NotificationId) -> bool {
        let changed = self.read.insert(id);
        if changed {
            self.persist(SetKind::Read);
        }
        changed
    }

    /// Returns how many ids were newly marked.
    pub fn mark_all_read<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = NotificationId>,
    {
        let added = ids
            .into_iter()
            .filter(|id| self.read.insert(id.clone()))
            .count();
        if added > 0 {
            self.persist(SetKind::Read);
        }
        added
    }

    pub fn dismiss(&mut self, id: NotificationId) -> bool {
        let changed = self.dismissed.insert(id);
        if changed {
            self.persist(SetKind::Dismissed);
        }
        changed
    }

    fn load(&self, key: &str) -> BTreeSet<NotificationId> {
        let raw = match self.storage.get_item(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return BTreeSet::new(),
            Err(e) => {
                tracing::error!(error = %e, key, "failed to read local storage, starting empty");
                return BTreeSet::new();
            }
        };

        match serde_json::from_str::<Vec<NotificationId>>(&raw) {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, key, "malformed persisted ids, resetting");
                BTreeSet::new()
            }
        }
    }

    fn persist(&self, kind: SetKind) {
        let Some(user_id) = self.user_id else {
            tracing::warn!(?kind, "read state not hydrated, keeping change in memory only");
            return;
        };

        let (key, set) = match kind {
            SetKind::Read => (read_key(user_id), &self.read),
            SetKind::Dismissed => (dismissed_key(user_id), &self.dismissed),
        };

        let value = match serde_json::to_string(set) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, key = %key, "failed to serialize notification ids");
                return;
            }
        };

        if let Err(e) = self.storage.set_item(&key, &value) {
            tracing::error!(error = %e, key = %key, "failed to persist notification ids");
        }
    }
}
