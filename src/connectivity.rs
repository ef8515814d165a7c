//! Network reachability signal.
//!
//! [`ConnectivityMonitor`] holds the process-wide online/offline boolean.
//! The environment (or a [`ReachabilityCheck`]) feeds it; the sync engine
//! and session layer observe it through `watch` receivers.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{MedSyncError, MedSyncResult};

/// Online/offline state shared by every component
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// Record the current reachability. Returns true when the state changed;
    /// repeated reports of the same state notify nobody.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Periodic HTTP health check feeding a [`ConnectivityMonitor`]
pub struct ReachabilityCheck {
    client: Client,
    url: String,
    interval: Duration,
    monitor: ConnectivityMonitor,
}

impl ReachabilityCheck {
    pub fn new(
        base_url: &str,
        health_path: &str,
        interval: Duration,
        timeout: Duration,
        monitor: ConnectivityMonitor,
    ) -> MedSyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MedSyncError::Network(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), health_path),
            interval,
            monitor,
        })
    }

    /// Check once and publish the result
    pub async fn check_once(&self) -> bool {
        let reachable = match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %self.url, error = %e, "Health check failed");
                false
            }
        };
        self.monitor.set_online(reachable);
        reachable
    }

    /// Run the polling loop on the current runtime until the handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_once().await;
            }
        })
    }
}
