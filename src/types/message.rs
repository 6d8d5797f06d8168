use crate::types::jid::BareJid;
use chrono::{DateTime, Utc};

/// Direction of a history item, derived from the parity of its state code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Delivery state of a history item.
///
/// The integer codes are the on-disk representation in `chat_history.state`.
/// Even codes are incoming, odd codes are outgoing; 8 and 10 are deliberately
/// unassigned so the parity encoding holds for the delivered/read states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    Incoming,
    Outgoing,
    IncomingUnread,
    OutgoingUnsent,
    IncomingError,
    OutgoingError,
    IncomingErrorUnread,
    OutgoingErrorUnread,
    OutgoingDelivered,
    OutgoingRead,
}

impl MessageState {
    pub fn code(self) -> i64 {
        match self {
            MessageState::Incoming => 0,
            MessageState::Outgoing => 1,
            MessageState::IncomingUnread => 2,
            MessageState::OutgoingUnsent => 3,
            MessageState::IncomingError => 4,
            MessageState::OutgoingError => 5,
            MessageState::IncomingErrorUnread => 6,
            MessageState::OutgoingErrorUnread => 7,
            MessageState::OutgoingDelivered => 9,
            MessageState::OutgoingRead => 11,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(MessageState::Incoming),
            1 => Some(MessageState::Outgoing),
            2 => Some(MessageState::IncomingUnread),
            3 => Some(MessageState::OutgoingUnsent),
            4 => Some(MessageState::IncomingError),
            5 => Some(MessageState::OutgoingError),
            6 => Some(MessageState::IncomingErrorUnread),
            7 => Some(MessageState::OutgoingErrorUnread),
            9 => Some(MessageState::OutgoingDelivered),
            11 => Some(MessageState::OutgoingRead),
            _ => None,
        }
    }

    pub fn direction(self) -> Direction {
        if self.code() % 2 == 0 {
            Direction::Incoming
        } else {
            Direction::Outgoing
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            MessageState::IncomingError
                | MessageState::OutgoingError
                | MessageState::IncomingErrorUnread
                | MessageState::OutgoingErrorUnread
        )
    }

    pub fn is_unread(self) -> bool {
        matches!(
            self,
            MessageState::IncomingUnread
                | MessageState::IncomingErrorUnread
                | MessageState::OutgoingErrorUnread
        )
    }

    /// The state this item moves to when its conversation is marked read.
    /// Identity for states that carry no unread flag.
    pub fn marked_read(self) -> Self {
        match self {
            MessageState::IncomingUnread => MessageState::Incoming,
            MessageState::IncomingErrorUnread => MessageState::IncomingError,
            MessageState::OutgoingErrorUnread => MessageState::OutgoingError,
            other => other,
        }
    }

    /// Whether this state is a delivery or error report for a previously
    /// stored outgoing item, correlated by stanza id rather than inserted.
    pub(crate) fn is_outgoing_report(self) -> bool {
        matches!(
            self,
            MessageState::OutgoingDelivered
                | MessageState::OutgoingRead
                | MessageState::OutgoingError
                | MessageState::OutgoingErrorUnread
        )
    }
}

/// Kind of payload a history row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Message,
    Attachment,
}

impl ItemKind {
    pub fn code(self) -> i64 {
        match self {
            ItemKind::Message => 0,
            ItemKind::Attachment => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ItemKind::Message),
            1 => Some(ItemKind::Attachment),
            _ => None,
        }
    }
}

/// End-to-end encryption marker for a stored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encryption {
    #[default]
    None,
    Omemo,
}

impl Encryption {
    pub fn code(self) -> i64 {
        match self {
            Encryption::None => 0,
            Encryption::Omemo => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Encryption::None),
            1 => Some(Encryption::Omemo),
            _ => None,
        }
    }
}

/// One durable row of conversation history.
#[derive(Debug, Clone)]
pub struct HistoryItem {
    pub id: i64,
    pub account: BareJid,
    pub peer: BareJid,
    pub author: Option<BareJid>,
    pub author_nickname: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: ItemKind,
    pub payload: String,
    pub stanza_id: Option<String>,
    pub state: MessageState,
    pub encryption: Encryption,
    pub fingerprint: Option<String>,
    pub error: Option<String>,
    pub preview: Option<String>,
}

/// Parameters for appending a new history item.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub account: BareJid,
    pub peer: BareJid,
    pub author: Option<BareJid>,
    pub author_nickname: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: ItemKind,
    pub payload: String,
    pub stanza_id: Option<String>,
    pub state: MessageState,
    pub encryption: Encryption,
    pub fingerprint: Option<String>,
    pub error: Option<String>,
}

impl AppendRequest {
    pub fn new(account: BareJid, peer: BareJid, state: MessageState, payload: &str) -> Self {
        Self {
            account,
            peer,
            author: None,
            author_nickname: None,
            timestamp: Utc::now(),
            kind: ItemKind::Message,
            payload: payload.to_string(),
            stanza_id: None,
            state,
            encryption: Encryption::None,
            fingerprint: None,
            error: None,
        }
    }
}
