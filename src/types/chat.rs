use crate::types::jid::BareJid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Kind-specific conversation fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatKind {
    Direct { thread: Option<String> },
    Room { nickname: String, password: Option<String> },
}

impl ChatKind {
    pub fn code(&self) -> i64 {
        match self {
            ChatKind::Direct { .. } => 0,
            ChatKind::Room { .. } => 1,
        }
    }

    pub fn is_room(&self) -> bool {
        matches!(self, ChatKind::Room { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPreference {
    None,
    Omemo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPolicy {
    Always,
    Mention,
    Never,
}

/// Per-conversation options, persisted as a free-form JSON blob.
///
/// Known keys are typed; everything else rides along untouched in `extra` so
/// collaborators can stash their own settings without schema churn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionPreference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationPolicy>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An open conversation, mirrored in memory from its durable row.
///
/// Shared via `Arc` between the registry and event subscribers; the mutable
/// pieces (options, unread counter, last activity) are interior so a published
/// object never needs a re-query.
#[derive(Debug)]
pub struct Chat {
    pub id: i64,
    pub account: BareJid,
    pub peer: BareJid,
    pub kind: ChatKind,
    options: Mutex<ChatOptions>,
    unread: AtomicU32,
    last_activity: Mutex<DateTime<Utc>>,
}

impl Chat {
    pub fn new(
        id: i64,
        account: BareJid,
        peer: BareJid,
        kind: ChatKind,
        options: ChatOptions,
        unread: u32,
        last_activity: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            account,
            peer,
            kind,
            options: Mutex::new(options),
            unread: AtomicU32::new(unread),
            last_activity: Mutex::new(last_activity),
        }
    }

    pub fn options(&self) -> ChatOptions {
        self.options.lock().expect("chat options lock poisoned").clone()
    }

    pub(crate) fn set_options(&self, options: ChatOptions) {
        *self.options.lock().expect("chat options lock poisoned") = options;
    }

    pub fn unread(&self) -> u32 {
        self.unread.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_unread(&self) -> u32 {
        self.unread.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn decrement_unread(&self, by: u32) -> u32 {
        let mut current = self.unread.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(by);
            match self.unread.compare_exchange(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().expect("chat activity lock poisoned")
    }

    pub(crate) fn set_last_activity(&self, timestamp: DateTime<Utc>) {
        *self.last_activity.lock().expect("chat activity lock poisoned") = timestamp;
    }
}
