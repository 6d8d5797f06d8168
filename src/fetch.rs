use crate::manager::SessionManager;
use crate::types::jid::BareJid;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, watch};

/// Result of a background fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// At least one account was reconnected or pinged.
    NewData,
    /// Nothing to do (foregrounded, or no push-less accounts).
    NoData,
    /// Network unreachable, or the expiry fired before the wait drained.
    Failed,
    /// A fetch cycle was already in flight; this call did nothing.
    Busy,
}

/// Accounts whose establishment the current fetch cycle is waiting on.
///
/// Removal is idempotent so a late success event and the expiry path can
/// both fire without double-counting.
pub(crate) struct WaitSet {
    inflight: AtomicBool,
    pending: Mutex<HashSet<BareJid>>,
    count: watch::Sender<usize>,
}

impl WaitSet {
    pub(crate) fn new() -> Self {
        Self {
            inflight: AtomicBool::new(false),
            pending: Mutex::new(HashSet::new()),
            count: watch::channel(0).0,
        }
    }

    fn begin(&self) -> bool {
        !self.inflight.swap(true, Ordering::SeqCst)
    }

    fn finish(&self) {
        self.inflight.store(false, Ordering::SeqCst);
    }

    fn register(&self, jid: BareJid) {
        let mut pending = self.pending.lock().expect("wait-set lock poisoned");
        pending.insert(jid);
        let _ = self.count.send_replace(pending.len());
    }

    /// Removes an account from the wait-set. Safe to call for accounts that
    /// were never registered or were already removed.
    pub(crate) fn satisfy(&self, jid: &BareJid) -> bool {
        let mut pending = self.pending.lock().expect("wait-set lock poisoned");
        let removed = pending.remove(jid);
        if removed {
            let _ = self.count.send_replace(pending.len());
        }
        removed
    }

    /// Clears the set, returning whatever was still being waited on.
    fn drain(&self) -> Vec<BareJid> {
        let mut pending = self.pending.lock().expect("wait-set lock poisoned");
        let remaining = pending.drain().collect();
        let _ = self.count.send_replace(0);
        remaining
    }

    fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }
}

impl SessionManager {
    /// Runs one bounded reconnection cycle for accounts with no push
    /// channel, as driven by the platform's periodic fetch.
    ///
    /// Completes when every waited account establishes or resumes its
    /// session, or when `expiry` fires, in which case the remaining waited
    /// accounts are force-disconnected. At most one cycle runs at a time; a
    /// concurrent call returns [`FetchOutcome::Busy`].
    pub async fn perform_fetch(self: &Arc<Self>, expiry: Arc<Notify>) -> FetchOutcome {
        if self.is_foregrounded() {
            debug!(target: "Fetch", "App is foregrounded, nothing to fetch");
            return FetchOutcome::NoData;
        }
        if !self.is_reachable() {
            info!(target: "Fetch", "Network unreachable, failing fetch");
            return FetchOutcome::Failed;
        }
        if !self.fetch_waits.begin() {
            warn!(target: "Fetch", "Fetch requested while one is already in flight");
            return FetchOutcome::Busy;
        }
        let _cycle = scopeguard::guard(self.fetch_waits.clone(), |waits| waits.finish());

        let mut count_rx = self.fetch_waits.subscribe();
        let accounts = match self.accounts.list().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(target: "Fetch", "Account list failed: {e}");
                return FetchOutcome::Failed;
            }
        };

        let mut did_anything = false;
        for account in accounts.iter().filter(|a| a.active) {
            let connected = self
                .connection_state(&account.jid)
                .await
                .is_some_and(|state| state.is_connected());
            if connected {
                debug!(target: "Fetch", "{}: already connected, pinging", account.jid);
                self.keepalive(&account.jid).await;
                did_anything = true;
            } else if !account.push_enabled {
                // Accounts with a push channel are woken by the server; only
                // push-less ones are reconnected here. Register before the
                // connect so a fast establishment can only ever remove,
                // never be missed.
                self.fetch_waits.register(account.jid.clone());
                if self.connect(&account.jid).await {
                    did_anything = true;
                } else {
                    // No attempt was made; nothing to wait for.
                    self.fetch_waits.satisfy(&account.jid);
                }
            }
        }

        if *count_rx.borrow() == 0 {
            info!(target: "Fetch", "Nothing to wait for, completing");
            return if did_anything {
                FetchOutcome::NewData
            } else {
                FetchOutcome::NoData
            };
        }

        loop {
            tokio::select! {
                changed = count_rx.changed() => {
                    if changed.is_err() || *count_rx.borrow() == 0 {
                        info!(target: "Fetch", "All waited accounts established");
                        return FetchOutcome::NewData;
                    }
                }
                _ = expiry.notified() => {
                    let remaining = self.fetch_waits.drain();
                    info!(
                        target: "Fetch",
                        "Expiry fired with {} accounts still pending, disconnecting them",
                        remaining.len()
                    );
                    for jid in remaining {
                        self.disconnect(&jid, true).await;
                    }
                    return FetchOutcome::Failed;
                }
            }
        }
    }
}
