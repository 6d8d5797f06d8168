use crate::config::RuntimeConfig;
use crate::error::ManagerError;
use crate::fetch::WaitSet;
use crate::session::{
    AuthErrorKind, CSI_FEATURE, ConnectedKind, ConnectionState, Session, SessionConfig,
    SessionEvent, SessionFactory,
};
use crate::store::accounts::AccountStore;
use crate::store::chats::ChatStore;
use crate::types::account::CertificateIdentity;
use crate::types::events::{AccountFailure, ConnectionStateChanged, EventBus, FailureKind};
use crate::types::jid::BareJid;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};

/// Owns one protocol session per active account and drives every
/// connect/disconnect/retry decision.
///
/// Constructed once at process start and shared by reference; the
/// account→session map is only ever touched under its own lock, and each
/// session's events are processed in emission order by a dedicated pump task
/// registered before the session can emit anything.
pub struct SessionManager {
    pub(crate) accounts: Arc<AccountStore>,
    pub(crate) chats: Arc<ChatStore>,
    factory: Arc<dyn SessionFactory>,
    bus: Arc<EventBus>,
    pub(crate) config: RuntimeConfig,

    sessions: Mutex<HashMap<BareJid, Arc<Session>>>,
    reachable: AtomicBool,
    foregrounded: AtomicBool,
    /// Wakes the background keepalive timer when the app comes forward.
    foreground_notify: Notify,
    /// Invalidates stale background timers across background/foreground flaps.
    background_generation: AtomicU64,
    pub(crate) fetch_waits: Arc<WaitSet>,
}

impl SessionManager {
    pub fn new(
        accounts: Arc<AccountStore>,
        chats: Arc<ChatStore>,
        factory: Arc<dyn SessionFactory>,
        bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            accounts,
            chats,
            factory,
            bus,
            config,
            sessions: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            foregrounded: AtomicBool::new(true),
            foreground_notify: Notify::new(),
            background_generation: AtomicU64::new(0),
            fetch_waits: Arc::new(WaitSet::new()),
        })
    }

    /// Reads the account registry and connects everything active.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let accounts = self.accounts.list().await?;
        info!(target: "Manager", "Starting with {} configured accounts", accounts.len());
        for account in accounts.iter().filter(|a| a.active) {
            self.connect(&account.jid).await;
        }
        Ok(())
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    pub fn is_foregrounded(&self) -> bool {
        self.foregrounded.load(Ordering::Relaxed)
    }

    /// Submits a connection attempt for the account. No-op unless the
    /// account is active, the network is reachable, and the session is
    /// currently disconnected. Returns whether an attempt was actually made.
    pub async fn connect(self: &Arc<Self>, jid: &BareJid) -> bool {
        if !self.is_reachable() {
            debug!(target: "Manager", "{jid}: not connecting, network unreachable");
            return false;
        }
        let account = match self.accounts.get(jid).await {
            Ok(Some(account)) if account.active => account,
            Ok(_) => {
                debug!(target: "Manager", "{jid}: not connecting, account missing or inactive");
                return false;
            }
            Err(e) => {
                warn!(target: "Manager", "{jid}: account lookup failed: {e}");
                return false;
            }
        };

        let session = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(jid) {
                Some(existing) => existing.clone(),
                None => {
                    let (proto, events) = match self.factory.create_session(&account).await {
                        Ok(created) => created,
                        Err(e) => {
                            warn!(target: "Manager", "{jid}: session creation failed: {e:#}");
                            return false;
                        }
                    };
                    let session = Arc::new(Session::new(jid.clone(), proto));
                    sessions.insert(jid.clone(), session.clone());
                    // Pump registered while the map lock is held, before any
                    // event for this session can be observed.
                    self.spawn_event_pump(session.clone(), events);
                    session
                }
            }
        };

        if !session.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            debug!(target: "Manager", "{jid}: not connecting, state is {:?}", session.state());
            return false;
        }
        self.publish_state(jid, ConnectionState::Connecting);

        if let Err(e) = self.chats.ensure_loaded(jid).await {
            warn!(target: "Manager", "{jid}: conversation load failed: {e}");
        }

        let config = SessionConfig {
            resource: self.config.device_name.clone(),
            endpoint: account.last_endpoint.clone(),
        };
        info!(target: "Manager", "{jid}: connecting (endpoint {:?})", config.endpoint);
        let proto = session.proto.clone();
        let jid = jid.clone();
        tokio::spawn(async move {
            if let Err(e) = proto.login(config).await {
                warn!(target: "Manager", "{jid}: login submission failed: {e:#}");
            }
        });
        true
    }

    /// Requests a protocol-level disconnect. `force` skips graceful stream
    /// closure; safe to call in any state.
    pub async fn disconnect(&self, jid: &BareJid, force: bool) {
        let session = self.sessions.lock().await.get(jid).cloned();
        if let Some(session) = session {
            session.proto.disconnect(force).await;
        }
    }

    pub async fn connection_state(&self, jid: &BareJid) -> Option<ConnectionState> {
        self.sessions.lock().await.get(jid).map(|s| s.state())
    }

    /// Connect attempts since the last successful establishment, for status
    /// display. Zero for unknown accounts.
    pub async fn retry_count(&self, jid: &BareJid) -> u32 {
        self.sessions
            .lock()
            .await
            .get(jid)
            .map(|s| s.retry_count())
            .unwrap_or(0)
    }

    /// Reacts to a registry edit: newly active accounts get a session,
    /// deactivated or removed ones are torn down.
    pub async fn account_changed(self: &Arc<Self>, jid: &BareJid) {
        match self.accounts.get(jid).await {
            Ok(Some(account)) if account.active => {
                self.connect(jid).await;
            }
            _ => {
                self.disconnect(jid, false).await;
                self.teardown(jid).await;
            }
        }
    }

    /// Connectivity transition from the platform.
    pub async fn network_changed(self: &Arc<Self>, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
        if !reachable {
            info!(target: "Manager", "Network lost, force-disconnecting all sessions");
            for session in self.sessions_snapshot().await {
                session.proto.disconnect(true).await;
            }
        } else if self.is_foregrounded() {
            info!(target: "Manager", "Network regained in foreground, reconnecting");
            self.connect_all().await;
        } else {
            debug!(target: "Manager", "Network regained in background, sending keepalives");
            self.keepalive_all().await;
        }
    }

    /// App came to the foreground: presence refresh, retry counter reset,
    /// reconnection sweep.
    pub async fn app_foregrounded(self: &Arc<Self>) {
        self.foregrounded.store(true, Ordering::Relaxed);
        self.foreground_notify.notify_waiters();

        for session in self.sessions_snapshot().await {
            session.retry_count.store(0, Ordering::Relaxed);
            if session.is_connected() {
                session.proto.send_presence().await;
                if session.has_feature(CSI_FEATURE) {
                    session.proto.set_client_state(true).await;
                }
            }
        }
        self.connect_all().await;
    }

    /// App moved to the background with `platform_remaining` execution
    /// budget left. Sessions go idle and a bounded timer force-disconnects
    /// whatever is still connected when the window closes.
    pub async fn app_backgrounded(self: &Arc<Self>, platform_remaining: Duration) {
        self.foregrounded.store(false, Ordering::Relaxed);
        let generation = self.background_generation.fetch_add(1, Ordering::SeqCst) + 1;

        for session in self.sessions_snapshot().await {
            if session.is_connected() && session.has_feature(CSI_FEATURE) {
                session.proto.set_client_state(false).await;
            }
        }

        let window = self.config.background_window(platform_remaining);
        info!(target: "Manager", "Backgrounded, keeping sessions alive for {window:?}");
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(window) => {
                    if manager.background_generation.load(Ordering::SeqCst) != generation
                        || manager.is_foregrounded()
                    {
                        return;
                    }
                    info!(target: "Manager", "Background budget exhausted, disconnecting");
                    for session in manager.sessions_snapshot().await {
                        if session.is_connected() {
                            session.proto.disconnect(true).await;
                        }
                    }
                }
                _ = manager.foreground_notify.notified() => {
                    debug!(target: "Manager", "Background timer cancelled by foreground");
                }
            }
        });
    }

    /// Disconnects everything and clears the session map.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in sessions {
            session.shutdown.notify_waiters();
            session.proto.disconnect(false).await;
        }
    }

    async fn connect_all(self: &Arc<Self>) {
        match self.accounts.list().await {
            Ok(accounts) => {
                for account in accounts.iter().filter(|a| a.active) {
                    self.connect(&account.jid).await;
                }
            }
            Err(e) => warn!(target: "Manager", "Account sweep failed: {e}"),
        }
    }

    pub(crate) async fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        session: Arc<Session>,
        mut events: mpsc::Receiver<SessionEvent>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.handle_event(&session, event).await;
            }
            debug!(target: "Manager", "{}: event stream ended", session.account);
        });
    }

    async fn handle_event(self: &Arc<Self>, session: &Arc<Session>, event: SessionEvent) {
        if !self.is_registered(session).await {
            debug!(
                target: "Manager",
                "{}: dropping event for unregistered session", session.account
            );
            return;
        }
        match event {
            SessionEvent::Connected => {
                debug!(target: "Manager", "{}: transport up, negotiating", session.account);
            }
            SessionEvent::ServerFeatures(features) => session.set_features(features),
            SessionEvent::SessionEstablished => {
                self.handle_connected(session, ConnectedKind::Established).await;
            }
            SessionEvent::StreamResumed => {
                self.handle_connected(session, ConnectedKind::Resumed).await;
            }
            SessionEvent::Disconnected { reason, redirect } => {
                self.handle_disconnected(session, reason, redirect).await;
            }
            SessionEvent::CertificateError(identity) => {
                self.handle_certificate_error(session, identity).await;
            }
            SessionEvent::AuthFailed(kind) => {
                self.handle_auth_failed(session, kind).await;
            }
        }
    }

    async fn handle_connected(self: &Arc<Self>, session: &Arc<Session>, kind: ConnectedKind) {
        let jid = &session.account;
        session.set_state(ConnectionState::Connected(kind));
        session.retry_count.store(0, Ordering::Relaxed);
        info!(
            target: "Manager",
            "{jid}: {}",
            match kind {
                ConnectedKind::Established => "session established",
                ConnectedKind::Resumed => "stream resumed",
            }
        );
        self.publish_state(jid, ConnectionState::Connected(kind));

        if session.has_feature(CSI_FEATURE) {
            session.proto.set_client_state(self.is_foregrounded()).await;
        }
        self.fetch_waits.satisfy(jid);
        self.spawn_keepalive(session.clone());
    }

    async fn handle_disconnected(
        self: &Arc<Self>,
        session: &Arc<Session>,
        reason: Option<String>,
        redirect: Option<String>,
    ) {
        let jid = &session.account;
        session.set_state(ConnectionState::Disconnected);
        session.shutdown.notify_waiters();
        self.publish_state(jid, ConnectionState::Disconnected);

        if let Some(endpoint) = redirect
            && let Err(e) = self.accounts.set_last_endpoint(jid, Some(&endpoint)).await
        {
            warn!(target: "Manager", "{jid}: failed to persist redirect endpoint: {e}");
        }

        match self.accounts.get(jid).await {
            Ok(Some(account)) if account.active => {
                if self.is_foregrounded() {
                    let attempt = session.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(
                        target: "Manager",
                        "{jid}: disconnected ({reason:?}), reconnect attempt {attempt}"
                    );
                    self.connect(jid).await;
                } else {
                    debug!(target: "Manager", "{jid}: disconnected in background, not retrying");
                }
            }
            _ => {
                info!(target: "Manager", "{jid}: disconnected and no longer active, tearing down");
                self.teardown(jid).await;
            }
        }
    }

    /// Certificate validation failure: fatal. The account is deactivated and
    /// the offending identity persisted for the user's decision; no retry
    /// until explicit reactivation.
    async fn handle_certificate_error(
        self: &Arc<Self>,
        session: &Arc<Session>,
        identity: CertificateIdentity,
    ) {
        let jid = &session.account;
        warn!(
            target: "Manager",
            "{jid}: certificate validation failed (subject: {})", identity.subject
        );
        if let Err(e) = self.accounts.set_server_certificate(jid, Some(&identity)).await {
            warn!(target: "Manager", "{jid}: failed to persist certificate identity: {e}");
        }
        if let Err(e) = self.accounts.set_active(jid, false).await {
            warn!(target: "Manager", "{jid}: failed to deactivate account: {e}");
        }
        let _ = self.bus.account_failure.send(Arc::new(AccountFailure {
            account: jid.clone(),
            kind: FailureKind::Certificate(identity),
        }));
        session.set_state(ConnectionState::Disconnected);
        self.publish_state(jid, ConnectionState::Disconnected);
        self.teardown(jid).await;
    }

    /// SASL failure: transient kinds retry like an ordinary disconnect,
    /// everything else deactivates the account.
    async fn handle_auth_failed(self: &Arc<Self>, session: &Arc<Session>, kind: AuthErrorKind) {
        let jid = &session.account;
        if kind.is_transient() {
            info!(target: "Manager", "{jid}: transient SASL failure ({kind:?}), will retry");
            return;
        }
        warn!(target: "Manager", "{jid}: authentication failed ({kind:?}), deactivating");
        if let Err(e) = self.accounts.set_active(jid, false).await {
            warn!(target: "Manager", "{jid}: failed to deactivate account: {e}");
        }
        let _ = self.bus.account_failure.send(Arc::new(AccountFailure {
            account: jid.clone(),
            kind: FailureKind::Auth(kind),
        }));
        session.set_state(ConnectionState::Disconnected);
        self.publish_state(jid, ConnectionState::Disconnected);
        self.teardown(jid).await;
    }

    /// Removes the session from the map and unloads the account's cached
    /// conversations. The event pump drains on its own once the engine drops
    /// its sender; events arriving after removal are ignored.
    async fn teardown(&self, jid: &BareJid) {
        if let Some(session) = self.sessions.lock().await.remove(jid) {
            session.shutdown.notify_waiters();
        }
        self.chats.unload_account(jid).await;
    }

    async fn is_registered(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .lock()
            .await
            .get(&session.account)
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false)
    }

    fn publish_state(&self, jid: &BareJid, state: ConnectionState) {
        let _ = self
            .bus
            .connection_state
            .send(Arc::new(ConnectionStateChanged {
                account: jid.clone(),
                state,
            }));
    }
}
