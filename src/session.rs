//! Session lifecycle.
//!
//! [`SessionCoordinator`] ties the permission gate, the sync engine and the
//! live queries together for one logged-in user:
//! - login syncs membership arrays, and every registered live query waits for
//!   the gate before subscribing
//! - snapshots from live queries are reconciled into the local cache
//! - logout closes the gate, detaches listeners and drops the user's
//!   uncommitted operations

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncHandle;
use crate::error::{MedSyncError, MedSyncResult};
use crate::models::{CollectionPath, EntityKind};
use crate::permissions::{wait_until_ready, MembershipSync, PermissionGate};
use crate::remote::RemoteStore;

pub struct SessionCoordinator {
    gate: Arc<PermissionGate>,
    engine: SyncHandle,
    remote: Arc<dyn RemoteStore>,
    live_kinds: Vec<EntityKind>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCoordinator {
    pub fn new(
        gate: Arc<PermissionGate>,
        engine: SyncHandle,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            gate,
            engine,
            remote,
            live_kinds: Vec::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Keep a live query open on the user's collection of `kind` during sessions
    pub fn with_live_query(mut self, kind: EntityKind) -> Self {
        if !self.live_kinds.contains(&kind) {
            self.live_kinds.push(kind);
        }
        self
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn engine(&self) -> &SyncHandle {
        &self.engine
    }

    fn lock_listeners(&self) -> MedSyncResult<std::sync::MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.listeners
            .lock()
            .map_err(|e| MedSyncError::Other(format!("listener lock poisoned: {}", e)))
    }

    /// Number of live queries attached or waiting to attach
    pub fn listener_count(&self) -> usize {
        self.lock_listeners()
            .map(|l| l.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Start a session. Ends any previous session first.
    pub async fn login(&self, user_id: &str) -> MedSyncResult<MembershipSync> {
        if self.gate.current_user().is_some() {
            self.logout().await?;
        }

        let collections = self
            .live_kinds
            .iter()
            .map(|kind| CollectionPath::for_owner(user_id, *kind))
            .collect::<MedSyncResult<Vec<_>>>()?;

        {
            let mut listeners = self.lock_listeners()?;
            for collection in collections {
                listeners.push(self.spawn_listener(collection, user_id.to_string()));
            }
        }

        match self.gate.login(user_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.detach_listeners();
                Err(e)
            }
        }
    }

    fn spawn_listener(&self, collection: CollectionPath, owner_id: String) -> JoinHandle<()> {
        let mut ready = self.gate.subscribe();
        let remote = Arc::clone(&self.remote);
        let engine = self.engine.clone();

        tokio::spawn(async move {
            if wait_until_ready(&mut ready).await.is_err() {
                return;
            }

            let mut snapshots = match remote.subscribe(&collection, &owner_id).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(collection = %collection, error = %e, "Failed to attach live query");
                    return;
                }
            };
            debug!(collection = %collection, "Live query attached");

            while let Some(snapshot) = snapshots.recv().await {
                if let Err(e) = engine.reconcile_snapshot(snapshot).await {
                    warn!(collection = %collection, error = %e, "Failed to reconcile snapshot");
                    if matches!(e, MedSyncError::EngineStopped) {
                        break;
                    }
                }
            }
            debug!(collection = %collection, "Live query ended");
        })
    }

    fn detach_listeners(&self) {
        if let Ok(mut listeners) = self.lock_listeners() {
            for handle in listeners.drain(..) {
                handle.abort();
            }
        }
    }

    /// End the session. Returns how many uncommitted operations were dropped.
    pub async fn logout(&self) -> MedSyncResult<usize> {
        self.detach_listeners();
        let Some(user_id) = self.gate.logout()? else {
            return Ok(0);
        };
        let discarded = self.engine.end_session(&user_id).await?;
        info!(user_id = %user_id, discarded, "Logged out");
        Ok(discarded)
    }
}
