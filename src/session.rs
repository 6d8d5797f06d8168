use crate::types::account::{Account, CertificateIdentity};
use crate::types::jid::BareJid;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Notify, mpsc};

/// Stream-management namespace advertised by servers that support
/// client state indication.
pub const CSI_FEATURE: &str = "urn:xmpp:csi:0";

/// An event produced by the underlying protocol engine for one session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The socket is up; authentication and binding are still in flight.
    Connected,
    /// The stream ended. `redirect` carries a see-other-host endpoint when
    /// the server asked us to move.
    Disconnected {
        reason: Option<String>,
        redirect: Option<String>,
    },
    /// Server certificate validation failed.
    CertificateError(CertificateIdentity),
    /// SASL authentication failed.
    AuthFailed(AuthErrorKind),
    /// A fresh session was negotiated.
    SessionEstablished,
    /// A previous stream was resumed without losing state.
    StreamResumed,
    /// The server advertised its stream features.
    ServerFeatures(HashSet<String>),
}

/// SASL failure conditions, split into transient and fatal classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    Aborted,
    TemporaryAuthFailure,
    NotAuthorized,
    InvalidMechanism,
    MalformedRequest,
    MechanismTooWeak,
    InvalidAuthzid,
    IncorrectEncoding,
}

impl AuthErrorKind {
    /// Transient failures are retried like an ordinary disconnect; anything
    /// else deactivates the account until the user intervenes.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            AuthErrorKind::Aborted | AuthErrorKind::TemporaryAuthFailure
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedKind {
    Established,
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected(ConnectedKind),
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Transient per-connection settings applied before login.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Resource string (device name) bound for this connection.
    pub resource: String,
    /// Cached redirect endpoint from a previous see-other-host.
    pub endpoint: Option<String>,
}

/// One live protocol connection, as exposed by the underlying engine.
///
/// All methods submit work and return; outcomes arrive on the event stream.
/// `disconnect` must be safe to call in any state, including on a session
/// that is already down.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    async fn login(&self, config: SessionConfig) -> Result<(), anyhow::Error>;
    async fn disconnect(&self, force: bool);
    async fn keepalive(&self);
    async fn send_presence(&self);
    /// Client state indication: `active = false` asks the server to defer
    /// non-essential traffic. Only called when the server advertises CSI.
    async fn set_client_state(&self, active: bool);
}

/// A factory responsible for creating new protocol sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Creates a session for the account and returns it along with its
    /// event stream. The receiver must be registered with a pump before the
    /// engine can emit anything, which the lifecycle manager guarantees.
    async fn create_session(
        &self,
        account: &Account,
    ) -> Result<(Arc<dyn ProtocolSession>, mpsc::Receiver<SessionEvent>), anyhow::Error>;
}

/// Runtime wrapper around one account's protocol session.
///
/// Owned exclusively by the lifecycle manager; exactly one exists per active
/// account at any time.
pub struct Session {
    pub account: BareJid,
    pub(crate) proto: Arc<dyn ProtocolSession>,
    state: Mutex<ConnectionState>,
    pub(crate) retry_count: AtomicU32,
    /// Signaled on disconnect and teardown; stops the keepalive loop.
    pub(crate) shutdown: Notify,
    features: Mutex<HashSet<String>>,
    pub(crate) keepalive_running: AtomicBool,
}

impl Session {
    pub(crate) fn new(account: BareJid, proto: Arc<dyn ProtocolSession>) -> Self {
        Self {
            account,
            proto,
            state: Mutex::new(ConnectionState::Disconnected),
            retry_count: AtomicU32::new(0),
            shutdown: Notify::new(),
            features: Mutex::new(HashSet::new()),
            keepalive_running: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("session state lock poisoned") = state;
    }

    /// Compare-and-set state transition. Returns false when the current
    /// state is not `from`, in which case nothing changes.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut guard = self.state.lock().expect("session state lock poisoned");
        if *guard == from {
            *guard = to;
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_features(&self, features: HashSet<String>) {
        *self.features.lock().expect("session features lock poisoned") = features;
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features
            .lock()
            .expect("session features lock poisoned")
            .contains(feature)
    }
}
