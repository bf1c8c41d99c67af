//! Cancellation registry for running upload pipelines

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use ferry_common::Event;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::Broadcaster;

/// Cancel handle held by one pipeline invocation
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub manifest_id: i64,
    pub session_id: Uuid,
    pub cancel: CancellationToken,
}

impl UploadSession {
    fn new(manifest_id: i64, root: &CancellationToken) -> Self {
        Self {
            manifest_id,
            session_id: Uuid::new_v4(),
            cancel: root.child_token(),
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<i64, UploadSession>>,
    /// Manifest id -> session that owns the post-upload grace window
    grace_windows: Arc<DashMap<i64, Uuid>>,
    /// Parent of every session token, superseded ones included
    root: CancellationToken,
    broadcaster: Broadcaster,
}

impl SessionRegistry {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            grace_windows: Arc::new(DashMap::new()),
            root: CancellationToken::new(),
            broadcaster,
        }
    }

    /// Start tracking a new pipeline for `manifest_id`.
    ///
    /// A session already registered for the manifest is replaced, not
    /// cancelled; it keeps running but can no longer be cancelled by id.
    pub fn register(&self, manifest_id: i64) -> UploadSession {
        let session = UploadSession::new(manifest_id, &self.root);
        if let Some(previous) = self.sessions.insert(manifest_id, session.clone()) {
            warn!(
                manifest_id,
                previous_session = %previous.session_id,
                session = %session.session_id,
                "Upload session superseded"
            );
        }
        session
    }

    /// Cancel the session for `manifest_id`, or every session when
    /// `cancel_all` is set. Returns how many sessions were cancelled.
    pub fn cancel(&self, manifest_id: i64, cancel_all: bool) -> usize {
        let targets: Vec<i64> = if cancel_all {
            self.sessions.iter().map(|entry| *entry.key()).collect()
        } else {
            vec![manifest_id]
        };

        let mut cancelled = 0;
        for id in targets {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.cancel.cancel();
                cancelled += 1;
                info!(manifest_id = id, session = %session.session_id, "Upload session cancelled");
                self.broadcaster.broadcast(Event::cancel_notice(format!(
                    "upload for manifest {} cancelled",
                    id
                )));
            }
        }
        cancelled
    }

    /// Cancel every session ever registered, including superseded ones
    /// that are no longer reachable by manifest id. Sessions registered
    /// afterwards start out cancelled. Returns how many tracked sessions
    /// were cancelled.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.cancel(0, true);
        self.root.cancel();
        info!(cancelled, "Session registry shut down");
        cancelled
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Remove the session entry if it still belongs to `session`
    pub fn deregister(&self, session: &UploadSession) -> bool {
        self.sessions
            .remove_if(&session.manifest_id, |_, current| {
                current.session_id == session.session_id
            })
            .is_some()
    }

    pub fn is_active(&self, manifest_id: i64) -> bool {
        self.sessions.contains_key(&manifest_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Claim the grace window for a manifest. Only one session may hold it.
    pub fn try_begin_grace_window(&self, manifest_id: i64, session_id: Uuid) -> bool {
        match self.grace_windows.entry(manifest_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(session_id);
                true
            }
        }
    }

    pub fn end_grace_window(&self, manifest_id: i64, session_id: Uuid) {
        self.grace_windows
            .remove_if(&manifest_id, |_, owner| *owner == session_id);
    }

    pub fn in_grace_window(&self, manifest_id: i64) -> bool {
        self.grace_windows.contains_key(&manifest_id)
    }
}
