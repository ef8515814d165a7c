//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{CollectionPath, Payload};
use crate::permissions::{CareNetwork, MembershipBackend};
use crate::remote::{DocumentRef, RemoteDocument, RemoteError, RemoteSnapshot, RemoteStore};

/// One recorded remote call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub method: &'static str,
    pub collection: String,
    pub document_id: String,
    pub payload: Option<Payload>,
}

/// Remote store that records calls and replays scripted results.
///
/// Results are scripted per document id and consumed in order; once a
/// document's script is exhausted every call succeeds.
#[derive(Default)]
pub struct ScriptedRemote {
    calls: Mutex<Vec<RemoteCall>>,
    script: Mutex<HashMap<String, VecDeque<Result<(), RemoteError>>>>,
    overwrite_script: Mutex<VecDeque<Result<(), RemoteError>>>,
    delay: Mutex<Option<Duration>>,
    subscribers: Mutex<Vec<(CollectionPath, String, mpsc::Sender<RemoteSnapshot>)>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results for writes to `document_id`
    pub fn script(&self, document_id: &str, results: Vec<Result<(), RemoteError>>) {
        self.script
            .lock()
            .unwrap()
            .entry(document_id.to_string())
            .or_default()
            .extend(results);
    }

    /// Fail every write to `document_id` `times` times in a row
    pub fn fail_times(&self, document_id: &str, times: usize, error: RemoteError) {
        self.script(document_id, vec![Err(error); times]);
    }

    /// Queue results for overwrite calls
    pub fn script_overwrite(&self, results: Vec<Result<(), RemoteError>>) {
        self.overwrite_script.lock().unwrap().extend(results);
    }

    /// Delay every write by `delay` before answering
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, document_id: &str) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.document_id == document_id)
            .collect()
    }

    /// Decoded payloads sent for `document_id`, in call order
    pub fn payloads_for(&self, document_id: &str) -> Vec<serde_json::Value> {
        self.calls_for(document_id)
            .into_iter()
            .filter_map(|c| c.payload)
            .map(|p| p.decode().unwrap())
            .collect()
    }

    pub fn document_order(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.document_id).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deliver a snapshot to every live query on `collection`
    pub async fn push_snapshot(&self, collection: &CollectionPath, documents: Vec<RemoteDocument>) {
        let targets: Vec<_> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| c == collection)
            .map(|(c, owner, tx)| (c.clone(), owner.clone(), tx.clone()))
            .collect();
        for (collection, owner_id, tx) in targets {
            let _ = tx
                .send(RemoteSnapshot {
                    collection,
                    owner_id,
                    documents: documents.clone(),
                })
                .await;
        }
    }

    async fn respond(
        &self,
        method: &'static str,
        target: &DocumentRef,
        payload: Option<&Payload>,
    ) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(RemoteCall {
            method,
            collection: target.collection.to_string(),
            document_id: target.document_id.clone(),
            payload: payload.cloned(),
        });

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = if method == "overwrite" {
            self.overwrite_script.lock().unwrap().pop_front()
        } else {
            self.script
                .lock()
                .unwrap()
                .get_mut(&target.document_id)
                .and_then(VecDeque::pop_front)
        };
        scripted.unwrap_or(Ok(()))
    }
}

#[async_trait]
impl RemoteStore for ScriptedRemote {
    async fn create(&self, target: &DocumentRef, payload: &Payload) -> Result<(), RemoteError> {
        self.respond("create", target, Some(payload)).await
    }

    async fn update(&self, target: &DocumentRef, payload: &Payload) -> Result<(), RemoteError> {
        self.respond("update", target, Some(payload)).await
    }

    async fn delete(&self, target: &DocumentRef) -> Result<(), RemoteError> {
        self.respond("delete", target, None).await
    }

    async fn overwrite(
        &self,
        target: &DocumentRef,
        payload: Option<&Payload>,
    ) -> Result<(), RemoteError> {
        self.respond("overwrite", target, payload).await
    }

    async fn subscribe(
        &self,
        collection: &CollectionPath,
        owner_id: &str,
    ) -> Result<mpsc::Receiver<RemoteSnapshot>, RemoteError> {
        let (tx, rx) = mpsc::channel(8);
        self.subscribers
            .lock()
            .unwrap()
            .push((collection.clone(), owner_id.to_string(), tx));
        Ok(rx)
    }
}

/// Membership backend backed by hash maps
#[derive(Default)]
pub struct MemoryMembership {
    networks: Mutex<HashMap<String, CareNetwork>>,
    stored: Mutex<HashMap<String, Vec<String>>>,
    failure: Mutex<Option<RemoteError>>,
    delay: Mutex<Option<Duration>>,
    writes: AtomicUsize,
}

impl MemoryMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_network(&self, user_id: &str, network: CareNetwork) {
        self.networks
            .lock()
            .unwrap()
            .insert(user_id.to_string(), network);
    }

    pub fn stored(&self, user_id: &str) -> Option<Vec<String>> {
        self.stored.lock().unwrap().get(user_id).cloned()
    }

    pub fn fail_with(&self, error: RemoteError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Delay every care network load by `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RemoteError> {
        match self.failure.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MembershipBackend for MemoryMembership {
    async fn load_care_network(&self, user_id: &str) -> Result<CareNetwork, RemoteError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        Ok(self
            .networks
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn stored_membership(&self, user_id: &str) -> Result<Option<Vec<String>>, RemoteError> {
        self.check()?;
        Ok(self.stored(user_id))
    }

    async fn write_membership(
        &self,
        user_id: &str,
        member_ids: &[String],
    ) -> Result<(), RemoteError> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.stored
            .lock()
            .unwrap()
            .insert(user_id.to_string(), member_ids.to_vec());
        Ok(())
    }
}
