use crate::store::db::Database;
use crate::store::error::{Result, StoreError};
use crate::types::chat::{Chat, ChatKind, ChatOptions};
use crate::types::events::{EventBus, UnreadChanged};
use crate::types::jid::BareJid;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::{OptionalExtension, params};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory index of open conversations, mirrored from durable rows.
///
/// Populated lazily per account when it comes online and torn down on
/// deactivation. The map is a cache: after a restart everything is rebuilt
/// from the `chats` table.
pub struct ChatStore {
    db: Database,
    bus: Arc<EventBus>,
    chats: RwLock<HashMap<BareJid, HashMap<BareJid, Arc<Chat>>>>,
}

struct ChatRow {
    id: i64,
    account: String,
    jid: String,
    kind: i64,
    timestamp: i64,
    thread_id: Option<String>,
    nickname: Option<String>,
    password: Option<String>,
    options: Option<String>,
}

const CHAT_COLUMNS: &str =
    "id, account, jid, type, timestamp, thread_id, nickname, password, options";

fn read_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        account: row.get(1)?,
        jid: row.get(2)?,
        kind: row.get(3)?,
        timestamp: row.get(4)?,
        thread_id: row.get(5)?,
        nickname: row.get(6)?,
        password: row.get(7)?,
        options: row.get(8)?,
    })
}

impl ChatRow {
    fn into_chat(self, unread: u32) -> Result<Chat> {
        let account: BareJid = self
            .account
            .parse()
            .map_err(|e| StoreError::Serialization(format!("stored chat account: {e}")))?;
        let peer: BareJid = self
            .jid
            .parse()
            .map_err(|e| StoreError::Serialization(format!("stored chat jid: {e}")))?;
        let kind = match self.kind {
            1 => ChatKind::Room {
                nickname: self.nickname.unwrap_or_default(),
                password: self.password,
            },
            _ => ChatKind::Direct {
                thread: self.thread_id,
            },
        };
        let options = match self.options.as_deref() {
            Some(json) => serde_json::from_str(json)?,
            None => ChatOptions::default(),
        };
        let last_activity =
            DateTime::from_timestamp_millis(self.timestamp).unwrap_or_else(Utc::now);
        Ok(Chat::new(
            self.id,
            account,
            peer,
            kind,
            options,
            unread,
            last_activity,
        ))
    }
}

impl ChatStore {
    pub fn new(db: Database, bus: Arc<EventBus>) -> Self {
        Self {
            db,
            bus,
            chats: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the in-memory index for an account from durable rows.
    /// No-op when the account is already loaded.
    pub async fn ensure_loaded(&self, account: &BareJid) -> Result<()> {
        {
            let map = self.chats.read().await;
            if map.contains_key(account) {
                return Ok(());
            }
        }

        let account_str = account.to_string();
        let loaded = self
            .db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CHAT_COLUMNS} FROM chats WHERE account = ?1"
                ))?;
                let rows = stmt
                    .query_map(params![account_str], read_chat)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let mut chats = Vec::with_capacity(rows.len());
                for row in rows {
                    let unread: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM chat_history
                         WHERE account = ?1 AND jid = ?2 AND state IN (2, 6, 7)",
                        params![row.account, row.jid],
                        |r| r.get(0),
                    )?;
                    chats.push(row.into_chat(unread as u32)?);
                }
                Ok(chats)
            })
            .await?;

        let mut map = self.chats.write().await;
        let entry = map.entry(account.clone()).or_default();
        for chat in loaded {
            entry.insert(chat.peer.clone(), Arc::new(chat));
        }
        debug!(target: "Store", "Loaded {} conversations for {account}", entry.len());
        Ok(())
    }

    /// Drops the in-memory index for an account. Durable rows are untouched.
    pub async fn unload_account(&self, account: &BareJid) {
        self.chats.write().await.remove(account);
    }

    pub async fn get(&self, account: &BareJid, peer: &BareJid) -> Option<Arc<Chat>> {
        self.chats
            .read()
            .await
            .get(account)
            .and_then(|chats| chats.get(peer))
            .cloned()
    }

    pub async fn chats_for(&self, account: &BareJid) -> Vec<Arc<Chat>> {
        self.chats
            .read()
            .await
            .get(account)
            .map(|chats| chats.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Opens a conversation, reusing the existing one for (account, peer)
    /// when present. Publishes `chat_opened` only when something was
    /// actually brought into the index.
    pub async fn open(
        &self,
        account: &BareJid,
        peer: &BareJid,
        kind: ChatKind,
    ) -> Result<Arc<Chat>> {
        self.ensure_loaded(account).await?;

        let mut map = self.chats.write().await;
        if let Some(existing) = map.get(account).and_then(|chats| chats.get(peer)) {
            return Ok(existing.clone());
        }

        let account_str = account.to_string();
        let peer_str = peer.to_string();
        let kind_clone = kind.clone();
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let id = self
            .db
            .with_conn(move |conn| {
                // Reuse a durable row if one exists; the index may simply
                // not have seen it yet.
                let existing: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM chats WHERE account = ?1 AND jid = ?2",
                        params![account_str, peer_str],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing {
                    return Ok(id);
                }
                let (thread_id, nickname, password) = match &kind_clone {
                    ChatKind::Direct { thread } => (thread.clone(), None, None),
                    ChatKind::Room { nickname, password } => {
                        (None, Some(nickname.clone()), password.clone())
                    }
                };
                conn.execute(
                    "INSERT INTO chats
                        (account, jid, type, timestamp, thread_id, nickname, password, options)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
                    params![
                        account_str,
                        peer_str,
                        kind_clone.code(),
                        now_ms,
                        thread_id,
                        nickname,
                        password,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        let chat = Arc::new(Chat::new(
            id,
            account.clone(),
            peer.clone(),
            kind,
            ChatOptions::default(),
            0,
            now,
        ));
        map.entry(account.clone())
            .or_default()
            .insert(peer.clone(), chat.clone());
        drop(map);

        let _ = self.bus.chat_opened.send(chat.clone());
        Ok(chat)
    }

    /// Closes a conversation: removes it from the index and deletes its
    /// durable row. Returns false when there was nothing to close.
    pub async fn close(&self, account: &BareJid, peer: &BareJid) -> Result<bool> {
        let removed = {
            let mut map = self.chats.write().await;
            map.get_mut(account).and_then(|chats| chats.remove(peer))
        };
        let Some(chat) = removed else {
            return Ok(false);
        };

        let id = chat.id;
        self.db
            .with_conn(move |conn| {
                conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;

        let _ = self.bus.chat_closed.send(chat);
        Ok(true)
    }

    /// Read-modify-write of the opaque options blob. The durable write
    /// happens first; the in-memory object and the `chat_updated` event only
    /// reflect writes that stuck.
    pub async fn update_options<F>(&self, account: &BareJid, peer: &BareJid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ChatOptions),
    {
        let chat = self
            .get(account, peer)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("chat {account}/{peer}")))?;

        let mut options = chat.options();
        apply(&mut options);
        let json = serde_json::to_string(&options)?;

        let id = chat.id;
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE chats SET options = ?1 WHERE id = ?2",
                    params![json, id],
                )?;
                Ok(())
            })
            .await?;

        chat.set_options(options);
        let _ = self.bus.chat_updated.send(chat);
        Ok(())
    }

    /// Refreshes the cached last-activity timestamp. Best-effort: a failed
    /// durable write is logged and otherwise ignored.
    pub async fn touch(&self, account: &BareJid, peer: &BareJid, timestamp: DateTime<Utc>) {
        let Some(chat) = self.get(account, peer).await else {
            return;
        };
        if timestamp <= chat.last_activity() {
            return;
        }
        let id = chat.id;
        let ts_ms = timestamp.timestamp_millis();
        let result = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE chats SET timestamp = ?1 WHERE id = ?2 AND timestamp < ?1",
                    params![ts_ms, id],
                )?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => chat.set_last_activity(timestamp),
            Err(e) => warn!(target: "Store", "Failed to persist chat activity for {peer}: {e}"),
        }
    }

    /// Bumps the unread counter for a conversation after an unread append.
    pub async fn increment_unread(&self, account: &BareJid, peer: &BareJid) {
        if let Some(chat) = self.get(account, peer).await {
            let unread = chat.increment_unread();
            self.publish_unread(account, peer, unread);
        }
    }

    /// Applies the row count reported by the history store's mark-as-read.
    pub async fn apply_read(&self, account: &BareJid, peer: &BareJid, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(chat) = self.get(account, peer).await {
            let unread = chat.decrement_unread(count as u32);
            self.publish_unread(account, peer, unread);
        }
    }

    fn publish_unread(&self, account: &BareJid, peer: &BareJid, unread: u32) {
        let _ = self.bus.unread_changed.send(Arc::new(UnreadChanged {
            account: account.clone(),
            peer: peer.clone(),
            unread,
        }));
    }
}
