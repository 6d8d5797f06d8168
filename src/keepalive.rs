use crate::manager::SessionManager;
use crate::session::Session;
use crate::types::jid::BareJid;
use log::debug;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

impl SessionManager {
    /// Spawns the per-session keepalive loop. Runs from establishment until
    /// the session disconnects or is torn down; at most one loop per
    /// session.
    pub(crate) fn spawn_keepalive(self: &Arc<Self>, session: Arc<Session>) {
        if session.keepalive_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let min = self.config.keepalive_interval_min;
        let max = self.config.keepalive_interval_max;
        tokio::spawn(async move {
            let _done = scopeguard::guard((), {
                let session = session.clone();
                move |_| session.keepalive_running.store(false, Ordering::SeqCst)
            });
            loop {
                let interval_ms = rand::rng()
                    .random_range(min.as_millis() as u64..=max.as_millis() as u64);
                let interval = Duration::from_millis(interval_ms);

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if !session.is_connected() {
                            debug!(target: "Manager/Keepalive", "{}: not connected, exiting keepalive loop", session.account);
                            return;
                        }
                        debug!(target: "Manager/Keepalive", "{}: sending keepalive ping", session.account);
                        session.proto.keepalive().await;
                    }
                    _ = session.shutdown.notified() => {
                        debug!(target: "Manager/Keepalive", "{}: shutdown signaled, exiting keepalive loop", session.account);
                        return;
                    }
                }
            }
        });
    }

    /// One keepalive ping to a single session, if it is connected.
    pub async fn keepalive(&self, jid: &BareJid) {
        for session in self.sessions_snapshot().await {
            if &session.account == jid && session.is_connected() {
                session.proto.keepalive().await;
                return;
            }
        }
    }

    /// One keepalive ping to every connected session; used when the network
    /// comes back while backgrounded and during a background fetch.
    pub async fn keepalive_all(&self) {
        for session in self.sessions_snapshot().await {
            if session.is_connected() {
                session.proto.keepalive().await;
            }
        }
    }
}
