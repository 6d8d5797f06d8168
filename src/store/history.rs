use crate::config::RuntimeConfig;
use crate::store::db::Database;
use crate::store::error::{Result, StoreError};
use crate::types::events::{EventBus, MessageRemoved};
use crate::types::jid::BareJid;
use crate::types::message::{
    AppendRequest, Encryption, HistoryItem, ItemKind, MessageState,
};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::sync::Arc;
use std::time::Duration;

/// Result of an append attempt.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// A new row was stored and a `message_appended` event published.
    Inserted(Arc<HistoryItem>),
    /// The append was a delivery/error report for an existing outgoing row,
    /// which had its state transitioned instead.
    Correlated(i64),
    /// An equivalent row already existed inside the deduplication window;
    /// nothing was stored and no event was published.
    Duplicate,
}

enum AppendResult {
    Inserted(HistoryItem),
    Correlated { id: i64, updated: Option<HistoryItem> },
    Duplicate,
}

/// Append-only history log with in-place state transitions.
pub struct MessageStore {
    db: Database,
    bus: Arc<EventBus>,
    config: RuntimeConfig,
}

const ITEM_COLUMNS: &str = "id, account, jid, author_jid, author_nickname, timestamp, \
     item_type, data, stanza_id, state, encryption, fingerprint, error, preview";

struct ItemRow {
    id: i64,
    account: String,
    jid: String,
    author_jid: Option<String>,
    author_nickname: Option<String>,
    timestamp: i64,
    item_type: i64,
    data: String,
    stanza_id: Option<String>,
    state: i64,
    encryption: i64,
    fingerprint: Option<String>,
    error: Option<String>,
    preview: Option<String>,
}

fn read_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        account: row.get(1)?,
        jid: row.get(2)?,
        author_jid: row.get(3)?,
        author_nickname: row.get(4)?,
        timestamp: row.get(5)?,
        item_type: row.get(6)?,
        data: row.get(7)?,
        stanza_id: row.get(8)?,
        state: row.get(9)?,
        encryption: row.get(10)?,
        fingerprint: row.get(11)?,
        error: row.get(12)?,
        preview: row.get(13)?,
    })
}

impl ItemRow {
    fn into_item(self) -> Result<HistoryItem> {
        let account: BareJid = self
            .account
            .parse()
            .map_err(|e| StoreError::Serialization(format!("stored item account: {e}")))?;
        let peer: BareJid = self
            .jid
            .parse()
            .map_err(|e| StoreError::Serialization(format!("stored item jid: {e}")))?;
        let author = self
            .author_jid
            .as_deref()
            .map(|a| a.parse())
            .transpose()
            .map_err(|e| StoreError::Serialization(format!("stored item author: {e}")))?;
        let state = MessageState::from_code(self.state).ok_or_else(|| {
            StoreError::Serialization(format!("unknown message state code {}", self.state))
        })?;
        let kind = ItemKind::from_code(self.item_type).ok_or_else(|| {
            StoreError::Serialization(format!("unknown item type code {}", self.item_type))
        })?;
        let encryption = Encryption::from_code(self.encryption).ok_or_else(|| {
            StoreError::Serialization(format!("unknown encryption code {}", self.encryption))
        })?;
        let timestamp = DateTime::from_timestamp_millis(self.timestamp).ok_or_else(|| {
            StoreError::Serialization(format!("invalid timestamp {}", self.timestamp))
        })?;
        Ok(HistoryItem {
            id: self.id,
            account,
            peer,
            author,
            author_nickname: self.author_nickname,
            timestamp,
            kind,
            payload: self.data,
            stanza_id: self.stanza_id,
            state,
            encryption,
            fingerprint: self.fingerprint,
            error: self.error,
            preview: self.preview,
        })
    }
}

fn get_item_row(conn: &Connection, id: i64) -> Result<Option<HistoryItem>> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM chat_history WHERE id = ?1"),
        params![id],
        read_item,
    )
    .optional()?
    .map(ItemRow::into_item)
    .transpose()
}

/// Shared by append-correlation and `update_item_state`: conditional
/// transition, timestamp and error only overwritten when supplied.
fn apply_transition(
    conn: &Connection,
    id: i64,
    from: Option<MessageState>,
    to: MessageState,
    timestamp: Option<DateTime<Utc>>,
    error: Option<&str>,
) -> Result<Option<HistoryItem>> {
    let changed = conn.execute(
        "UPDATE chat_history SET
            state = ?1,
            timestamp = COALESCE(?2, timestamp),
            error = COALESCE(?3, error)
         WHERE id = ?4 AND (?5 IS NULL OR state = ?5)",
        params![
            to.code(),
            timestamp.map(|t| t.timestamp_millis()),
            error,
            id,
            from.map(MessageState::code),
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    get_item_row(conn, id)
}

impl MessageStore {
    pub fn new(db: Database, bus: Arc<EventBus>, config: RuntimeConfig) -> Self {
        Self { db, bus, config }
    }

    /// Appends a history item, absorbing duplicate deliveries and routing
    /// outgoing delivery/error reports to the row they refer to.
    ///
    /// The correlation check, the dedup check, and the insert run under one
    /// connection hold, so concurrent appends of the same item cannot both
    /// pass the window check.
    pub async fn append_item(&self, req: AppendRequest) -> Result<AppendOutcome> {
        let window = if req.stanza_id.is_some() {
            self.config.dedup_window_stanza_id
        } else {
            self.config.dedup_window
        };

        let result = self
            .db
            .with_conn(move |conn| {
                if req.state.is_outgoing_report()
                    && let Some(id) = find_correlated(conn, &req)?
                {
                    let updated =
                        apply_transition(conn, id, None, req.state, None, req.error.as_deref())?;
                    return Ok(AppendResult::Correlated { id, updated });
                }

                if find_duplicate(conn, &req, window)?.is_some() {
                    return Ok(AppendResult::Duplicate);
                }

                conn.execute(
                    "INSERT INTO chat_history
                        (account, jid, author_jid, author_nickname, timestamp, item_type,
                         data, stanza_id, state, encryption, fingerprint, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        req.account.as_str(),
                        req.peer.as_str(),
                        req.author.as_ref().map(|a| a.as_str()),
                        req.author_nickname,
                        req.timestamp.timestamp_millis(),
                        req.kind.code(),
                        req.payload,
                        req.stanza_id,
                        req.state.code(),
                        req.encryption.code(),
                        req.fingerprint,
                        req.error,
                    ],
                )?;
                let id = conn.last_insert_rowid();
                Ok(AppendResult::Inserted(HistoryItem {
                    id,
                    account: req.account,
                    peer: req.peer,
                    author: req.author,
                    author_nickname: req.author_nickname,
                    timestamp: req.timestamp,
                    kind: req.kind,
                    payload: req.payload,
                    stanza_id: req.stanza_id,
                    state: req.state,
                    encryption: req.encryption,
                    fingerprint: req.fingerprint,
                    error: req.error,
                    preview: None,
                }))
            })
            .await?;

        match result {
            AppendResult::Inserted(item) => {
                let item = Arc::new(item);
                let _ = self.bus.message_appended.send(item.clone());
                Ok(AppendOutcome::Inserted(item))
            }
            AppendResult::Correlated { id, updated } => {
                if let Some(item) = updated {
                    let _ = self.bus.message_updated.send(Arc::new(item));
                }
                Ok(AppendOutcome::Correlated(id))
            }
            AppendResult::Duplicate => {
                // Not a failure: duplicate delivery via a second channel.
                debug!(target: "Store", "Duplicate delivery absorbed (window {window:?})");
                Ok(AppendOutcome::Duplicate)
            }
        }
    }

    /// Conditional state transition. Applies only when the current state is
    /// `from` (unconditional when `from` is None); a mismatch is a lost
    /// race, not an error, and produces no event.
    pub async fn update_item_state(
        &self,
        id: i64,
        from: Option<MessageState>,
        to: MessageState,
        timestamp: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<bool> {
        let error = error.map(|e| e.to_string());
        let updated = self
            .db
            .with_conn(move |conn| apply_transition(conn, id, from, to, timestamp, error.as_deref()))
            .await?;
        match updated {
            Some(item) => {
                let _ = self.bus.message_updated.send(Arc::new(item));
                Ok(true)
            }
            None => {
                debug!(target: "Store", "State transition for item {id} skipped (precondition mismatch)");
                Ok(false)
            }
        }
    }

    /// Bulk-transitions every unread row of the conversation to its read
    /// counterpart, optionally bounded to `timestamp <= before`. Returns the
    /// number of rows affected so the conversation registry can adjust its
    /// unread counter.
    pub async fn mark_as_read(
        &self,
        account: &BareJid,
        peer: &BareJid,
        before: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let account = account.to_string();
        let peer = peer.to_string();
        self.db
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE chat_history SET state = CASE state
                        WHEN 2 THEN 0
                        WHEN 6 THEN 4
                        ELSE 5
                     END
                     WHERE account = ?1 AND jid = ?2 AND state IN (2, 6, 7)
                       AND (?3 IS NULL OR timestamp <= ?3)",
                    params![account, peer, before.map(|t| t.timestamp_millis())],
                )?;
                Ok(changed)
            })
            .await
    }

    /// Most recent `limit` items, newest first. With `before_id`, the page
    /// starts at that item's position, computed as the count of strictly
    /// newer rows, which stays stable under concurrent appends, unlike a
    /// row-number
    /// offset.
    pub async fn history(
        &self,
        account: &BareJid,
        peer: &BareJid,
        before_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<HistoryItem>> {
        let account = account.to_string();
        let peer = peer.to_string();
        self.db
            .with_conn(move |conn| {
                let offset: i64 = match before_id {
                    Some(id) => {
                        let ts: i64 = conn
                            .query_row(
                                "SELECT timestamp FROM chat_history WHERE id = ?1",
                                params![id],
                                |r| r.get(0),
                            )
                            .optional()?
                            .ok_or_else(|| {
                                StoreError::NotFound(format!("history item {id}"))
                            })?;
                        conn.query_row(
                            "SELECT COUNT(*) FROM chat_history
                             WHERE account = ?1 AND jid = ?2 AND timestamp > ?3",
                            params![account, peer, ts],
                            |r| r.get(0),
                        )?
                    }
                    None => 0,
                };

                let mut stmt = conn.prepare(&format!(
                    "SELECT {ITEM_COLUMNS} FROM chat_history
                     WHERE account = ?1 AND jid = ?2
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?3 OFFSET ?4"
                ))?;
                let rows = stmt
                    .query_map(params![account, peer, limit as i64, offset], read_item)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(ItemRow::into_item).collect()
            })
            .await
    }

    /// Number of messages still in `outgoing_unsent` for the account, for
    /// "N messages failed to send" reporting before suspension.
    pub async fn unsent_count(&self, account: &BareJid) -> Result<usize> {
        let account = account.to_string();
        self.db
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM chat_history WHERE account = ?1 AND state = ?2",
                    params![account, MessageState::OutgoingUnsent.code()],
                    |r| r.get(0),
                )?;
                Ok(count as usize)
            })
            .await
    }

    pub async fn get_item(&self, id: i64) -> Result<Option<HistoryItem>> {
        self.db.with_conn(move |conn| get_item_row(conn, id)).await
    }

    /// Attaches a preview reference to a stored item. Best-effort: failures
    /// are logged, never propagated, and produce no event.
    pub async fn attach_preview(&self, id: i64, key: &str, data: &str) {
        let key = key.to_string();
        let data = data.to_string();
        let result = self
            .db
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO preview_cache (key, data) VALUES (?1, ?2)",
                    params![key, data],
                )?;
                tx.execute(
                    "UPDATE chat_history SET preview = ?1 WHERE id = ?2",
                    params![key, id],
                )?;
                tx.commit()?;
                get_item_row(conn, id)
            })
            .await;
        match result {
            Ok(Some(item)) => {
                let _ = self.bus.message_updated.send(Arc::new(item));
            }
            Ok(None) => {}
            Err(e) => warn!(target: "Store", "Failed to attach preview to item {id}: {e}"),
        }
    }

    /// Deletes a single item together with its pinned preview.
    pub async fn remove_item(&self, id: i64) -> Result<bool> {
        let removed = self
            .db
            .with_conn(move |conn| {
                let Some(item) = get_item_row(conn, id)? else {
                    return Ok(None);
                };
                let tx = conn.transaction()?;
                if let Some(preview) = &item.preview {
                    tx.execute("DELETE FROM preview_cache WHERE key = ?1", params![preview])?;
                }
                tx.execute("DELETE FROM chat_history WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(Some(item))
            })
            .await?;
        match removed {
            Some(item) => {
                let _ = self.bus.message_removed.send(Arc::new(MessageRemoved {
                    account: item.account,
                    peer: item.peer,
                    id,
                }));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deletes all history of one conversation, cascading pinned previews.
    pub async fn delete_conversation(&self, account: &BareJid, peer: &BareJid) -> Result<()> {
        let account = account.to_string();
        let peer = peer.to_string();
        self.db
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM preview_cache WHERE key IN
                        (SELECT preview FROM chat_history
                         WHERE account = ?1 AND jid = ?2 AND preview IS NOT NULL)",
                    params![account, peer],
                )?;
                tx.execute(
                    "DELETE FROM chat_history WHERE account = ?1 AND jid = ?2",
                    params![account, peer],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }
}

fn find_correlated(conn: &Connection, req: &AppendRequest) -> Result<Option<i64>> {
    let Some(stanza_id) = &req.stanza_id else {
        return Ok(None);
    };
    let id = conn
        .query_row(
            "SELECT id FROM chat_history
             WHERE account = ?1 AND jid = ?2 AND stanza_id = ?3 AND (state % 2) = 1
             ORDER BY id DESC LIMIT 1",
            params![req.account.as_str(), req.peer.as_str(), stanza_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// The identifier-dependent temporal dedup check. The window is centered on
/// the candidate timestamp; which identifiers participate depends on which
/// are present, so duplicates arriving via archive replay or carbons are
/// caught even when stanza ids differ or are missing.
fn find_duplicate(
    conn: &Connection,
    req: &AppendRequest,
    window: Duration,
) -> Result<Option<i64>> {
    let half = window.as_millis() as i64;
    let ts = req.timestamp.timestamp_millis();

    let mut sql = String::from(
        "SELECT id FROM chat_history
         WHERE account = ?1 AND jid = ?2 AND (state % 2) = ?3 AND item_type = ?4
           AND timestamp BETWEEN ?5 AND ?6 AND (data = ?7",
    );
    let mut values: Vec<Value> = vec![
        req.account.as_str().to_string().into(),
        req.peer.as_str().to_string().into(),
        (req.state.code() % 2).into(),
        req.kind.code().into(),
        (ts - half).into(),
        (ts + half).into(),
        req.payload.clone().into(),
    ];
    if let Some(stanza_id) = &req.stanza_id {
        values.push(stanza_id.clone().into());
        sql.push_str(&format!(" OR stanza_id = ?{}", values.len()));
    }
    if let Some(nickname) = &req.author_nickname {
        values.push(nickname.clone().into());
        sql.push_str(&format!(" OR author_nickname = ?{}", values.len()));
    }
    sql.push_str(") LIMIT 1");

    let id = conn
        .query_row(&sql, params_from_iter(values), |r| r.get(0))
        .optional()?;
    Ok(id)
}
