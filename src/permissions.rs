//! Permission synchronization gate.
//!
//! Remote authorization rules read a flattened list of user ids allowed to act
//! on a user's data. That list is derived from the nested care-network
//! structure and must be current before any live query attaches, otherwise
//! listeners hit permission-denied errors while the change propagates.
//!
//! State machine: `Unsynced --login--> Syncing --success|failure--> Ready`,
//! `Ready --logout--> Unsynced`. A failed sync still opens the gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MedSyncError, MedSyncResult};
use crate::remote::RemoteError;
use crate::validation::validate_user_id;

/// Readiness of the current session's membership arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Unsynced,
    Syncing,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    #[default]
    Active,
    Invited,
    Revoked,
}

/// One entry in a user's care network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CareMember {
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub status: MemberStatus,
}

/// Authoritative nested membership structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CareNetwork {
    #[serde(default)]
    pub caregivers: Vec<CareMember>,
    #[serde(default)]
    pub patients: Vec<CareMember>,
}

/// Flatten a care network into the sorted, deduplicated id list the
/// authorization rules consume. The owner is always included.
pub fn flatten_membership(owner_id: &str, network: &CareNetwork) -> Vec<String> {
    let mut ids: Vec<String> = network
        .caregivers
        .iter()
        .chain(network.patients.iter())
        .filter(|m| m.status == MemberStatus::Active)
        .map(|m| m.user_id.clone())
        .chain(std::iter::once(owner_id.to_string()))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Where membership structures are read from and written to
#[async_trait]
pub trait MembershipBackend: Send + Sync {
    async fn load_care_network(&self, user_id: &str) -> Result<CareNetwork, RemoteError>;

    /// Currently stored flattened array, if any
    async fn stored_membership(&self, user_id: &str) -> Result<Option<Vec<String>>, RemoteError>;

    async fn write_membership(
        &self,
        user_id: &str,
        member_ids: &[String],
    ) -> Result<(), RemoteError>;
}

/// Result of one membership sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipSync {
    /// Stored array was replaced with this many ids
    Written(usize),
    /// Stored array already matched
    Unchanged,
    /// Backend failed; the gate opened anyway
    Failed(RemoteError),
}

/// Gate that opens once the session's membership arrays are current
pub struct PermissionGate {
    backend: Arc<dyn MembershipBackend>,
    state: watch::Sender<PermissionState>,
    session: Mutex<Option<String>>,
    /// Bumped on every login and logout, under the session lock
    generation: AtomicU64,
}

impl PermissionGate {
    pub fn new(backend: Arc<dyn MembershipBackend>) -> Self {
        let (state, _rx) = watch::channel(PermissionState::Unsynced);
        Self {
            backend,
            state,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn lock_session(&self) -> MedSyncResult<std::sync::MutexGuard<'_, Option<String>>> {
        self.session
            .lock()
            .map_err(|e| MedSyncError::Other(format!("session lock poisoned: {}", e)))
    }

    pub fn current_user(&self) -> Option<String> {
        self.lock_session().ok().and_then(|s| s.clone())
    }

    pub fn state(&self) -> PermissionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PermissionState::Ready
    }

    pub fn subscribe(&self) -> watch::Receiver<PermissionState> {
        self.state.subscribe()
    }

    /// Start a session for `user_id` and sync its membership arrays
    pub async fn login(&self, user_id: &str) -> MedSyncResult<MembershipSync> {
        validate_user_id(user_id)?;
        {
            let mut session = self.lock_session()?;
            *session = Some(user_id.to_string());
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.state.send_replace(PermissionState::Syncing);
        info!(user_id, "Session started, syncing membership arrays");
        self.sync_membership_arrays().await
    }

    /// Recompute the flattened membership array and write it if it differs
    /// from the stored one. Opens the gate on completion either way.
    pub async fn sync_membership_arrays(&self) -> MedSyncResult<MembershipSync> {
        let (user_id, generation) = {
            let session = self.lock_session()?;
            let user_id = session
                .clone()
                .ok_or_else(|| MedSyncError::NotFound("no active session".to_string()))?;
            (user_id, self.generation.load(Ordering::SeqCst))
        };

        let outcome = match self.write_if_changed(&user_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error = %e,
                    "Membership sync failed, opening gate anyway"
                );
                MembershipSync::Failed(e)
            }
        };

        // A logout or a newer login during the sync leaves the gate to that session
        let session = self.lock_session()?;
        if session.is_some() && self.generation.load(Ordering::SeqCst) == generation {
            self.state.send_replace(PermissionState::Ready);
        } else {
            debug!(user_id = %user_id, "Session changed during membership sync");
        }
        Ok(outcome)
    }

    async fn write_if_changed(&self, user_id: &str) -> Result<MembershipSync, RemoteError> {
        let network = self.backend.load_care_network(user_id).await?;
        let desired = flatten_membership(user_id, &network);
        let stored = self.backend.stored_membership(user_id).await?;

        if stored.as_ref() == Some(&desired) {
            debug!(user_id, "Membership arrays unchanged");
            return Ok(MembershipSync::Unchanged);
        }

        self.backend.write_membership(user_id, &desired).await?;
        info!(user_id, members = desired.len(), "Membership arrays written");
        Ok(MembershipSync::Written(desired.len()))
    }

    /// End the session and close the gate. Returns the user that was logged in.
    pub fn logout(&self) -> MedSyncResult<Option<String>> {
        let previous = {
            let mut session = self.lock_session()?;
            self.generation.fetch_add(1, Ordering::SeqCst);
            session.take()
        };
        self.state.send_replace(PermissionState::Unsynced);
        if let Some(user_id) = &previous {
            info!(user_id = %user_id, "Session ended");
        }
        Ok(previous)
    }
}

/// Wait until the gate observed by `rx` is ready
pub async fn wait_until_ready(rx: &mut watch::Receiver<PermissionState>) -> MedSyncResult<()> {
    rx.wait_for(|state| *state == PermissionState::Ready)
        .await
        .map(|_| ())
        .map_err(|_| MedSyncError::Other("permission gate dropped".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::MemoryMembership;

    fn member(id: &str, status: MemberStatus) -> CareMember {
        CareMember {
            user_id: id.to_string(),
            role: "caregiver".to_string(),
            status,
        }
    }

    fn network() -> CareNetwork {
        CareNetwork {
            caregivers: vec![
                member("carol", MemberStatus::Active),
                member("dave", MemberStatus::Invited),
                member("bob", MemberStatus::Active),
            ],
            patients: vec![member("bob", MemberStatus::Active)],
        }
    }

    #[test]
    fn test_flatten_sorts_dedups_and_filters() {
        let ids = flatten_membership("alice", &network());
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_care_network_json_shape() {
        let json = r#"{"caregivers":[{"userId":"bob"}]}"#;
        let parsed: CareNetwork = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.caregivers[0].status, MemberStatus::Active);
        assert!(parsed.patients.is_empty());
    }

    #[tokio::test]
    async fn test_login_opens_gate() {
        let backend = Arc::new(MemoryMembership::new());
        backend.set_network("alice", network());
        let gate = PermissionGate::new(backend.clone());
        assert_eq!(gate.state(), PermissionState::Unsynced);

        let outcome = gate.login("alice").await.unwrap();
        assert_eq!(outcome, MembershipSync::Written(3));
        assert!(gate.is_ready());
        assert_eq!(
            backend.stored("alice"),
            Some(vec!["alice".to_string(), "bob".to_string(), "carol".to_string()])
        );
    }

    #[tokio::test]
    async fn test_repeat_sync_writes_once() {
        let backend = Arc::new(MemoryMembership::new());
        backend.set_network("alice", network());
        let gate = PermissionGate::new(backend.clone());

        gate.login("alice").await.unwrap();
        let second = gate.sync_membership_arrays().await.unwrap();

        assert_eq!(second, MembershipSync::Unchanged);
        assert_eq!(backend.write_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_still_opens_gate() {
        let backend = Arc::new(MemoryMembership::new());
        backend.fail_with(RemoteError::transient("offline"));
        let gate = PermissionGate::new(backend.clone());

        let outcome = gate.login("alice").await.unwrap();
        assert!(matches!(outcome, MembershipSync::Failed(_)));
        assert!(gate.is_ready());
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_logout_closes_gate() {
        let backend = Arc::new(MemoryMembership::new());
        let gate = PermissionGate::new(backend);
        let mut rx = gate.subscribe();

        gate.login("alice").await.unwrap();
        wait_until_ready(&mut rx).await.unwrap();

        assert_eq!(gate.logout().unwrap().as_deref(), Some("alice"));
        assert_eq!(gate.state(), PermissionState::Unsynced);
        assert!(gate.current_user().is_none());
    }

    #[tokio::test]
    async fn test_sync_without_session_fails() {
        let gate = PermissionGate::new(Arc::new(MemoryMembership::new()));
        let result = gate.sync_membership_arrays().await;
        assert!(matches!(result, Err(MedSyncError::NotFound(_))));
        assert_eq!(gate.state(), PermissionState::Unsynced);
    }

    #[tokio::test]
    async fn test_invalid_user_rejected() {
        let gate = PermissionGate::new(Arc::new(MemoryMembership::new()));
        assert!(gate.login("a/b").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sync_does_not_open_relogged_session() {
        let backend = Arc::new(MemoryMembership::new());
        backend.set_delay(Duration::from_millis(100));
        let gate = Arc::new(PermissionGate::new(backend));

        let first = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.login("alice").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.logout().unwrap();
        let second = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.login("alice").await }
        });

        first.await.unwrap().unwrap();
        assert_eq!(gate.state(), PermissionState::Syncing);

        second.await.unwrap().unwrap();
        assert_eq!(gate.state(), PermissionState::Ready);
    }
}
