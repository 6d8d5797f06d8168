use crate::session::{AuthErrorKind, ConnectionState};
use crate::types::account::CertificateIdentity;
use crate::types::chat::Chat;
use crate::types::jid::BareJid;
use crate::types::message::HistoryItem;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// A history row was removed.
#[derive(Debug, Clone)]
pub struct MessageRemoved {
    pub account: BareJid,
    pub peer: BareJid,
    pub id: i64,
}

/// An account row was created, edited, or removed in the registry.
#[derive(Debug, Clone)]
pub struct AccountChanged {
    pub jid: BareJid,
    pub removed: bool,
}

/// The connection state of an account's session changed.
#[derive(Debug, Clone)]
pub struct ConnectionStateChanged {
    pub account: BareJid,
    pub state: ConnectionState,
}

#[derive(Debug, Clone)]
pub enum FailureKind {
    Certificate(CertificateIdentity),
    Auth(AuthErrorKind),
}

/// One-shot notification of a fatal credential or trust failure.
/// The account has already been deactivated when this fires.
#[derive(Debug, Clone)]
pub struct AccountFailure {
    pub account: BareJid,
    pub kind: FailureKind,
}

#[derive(Debug, Clone)]
pub struct UnreadChanged {
    pub account: BareJid,
    pub peer: BareJid,
    pub unread: u32,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event
        /// category. Collaborators subscribe to exactly the channels they
        /// care about; there is no stringly-typed dispatch.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Conversation registry events
    (chat_opened, Arc<Chat>),
    (chat_closed, Arc<Chat>),
    (chat_updated, Arc<Chat>),
    (unread_changed, Arc<UnreadChanged>),

    // History store events
    (message_appended, Arc<HistoryItem>),
    (message_updated, Arc<HistoryItem>),
    (message_removed, Arc<MessageRemoved>),

    // Account and session events
    (account_changed, Arc<AccountChanged>),
    (connection_state, Arc<ConnectionStateChanged>),
    (account_failure, Arc<AccountFailure>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
