use crate::store::db::Database;
use crate::store::error::{Result, StoreError};
use crate::types::account::{Account, CertificateIdentity};
use crate::types::events::{AccountChanged, EventBus};
use crate::types::jid::BareJid;
use log::info;
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Arc;

/// Durable account registry.
///
/// Rows are the authority; the lifecycle manager reads them at startup and on
/// change notification, and writes back deactivation on fatal auth or trust
/// failures.
pub struct AccountStore {
    db: Database,
    bus: Arc<EventBus>,
}

const ACCOUNT_COLUMNS: &str =
    "jid, password, active, push_enabled, last_endpoint, roster_version, server_certificate";

struct AccountRow {
    jid: String,
    password: String,
    active: i64,
    push_enabled: i64,
    last_endpoint: Option<String>,
    roster_version: Option<String>,
    server_certificate: Option<String>,
}

fn read_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        jid: row.get(0)?,
        password: row.get(1)?,
        active: row.get(2)?,
        push_enabled: row.get(3)?,
        last_endpoint: row.get(4)?,
        roster_version: row.get(5)?,
        server_certificate: row.get(6)?,
    })
}

impl AccountRow {
    fn into_account(self) -> Result<Account> {
        let jid: BareJid = self
            .jid
            .parse()
            .map_err(|e| StoreError::Serialization(format!("stored account jid: {e}")))?;
        let server_certificate = self
            .server_certificate
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Account {
            jid,
            password: self.password,
            active: self.active != 0,
            push_enabled: self.push_enabled != 0,
            last_endpoint: self.last_endpoint,
            roster_version: self.roster_version,
            server_certificate,
        })
    }
}

impl AccountStore {
    pub fn new(db: Database, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    pub async fn list(&self) -> Result<Vec<Account>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY jid"))?;
                let rows = stmt
                    .query_map([], read_account)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(AccountRow::into_account).collect()
            })
            .await
    }

    pub async fn get(&self, jid: &BareJid) -> Result<Option<Account>> {
        let jid = jid.to_string();
        self.db
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE jid = ?1"),
                        params![jid],
                        read_account,
                    )
                    .optional()?;
                row.map(AccountRow::into_account).transpose()
            })
            .await
    }

    /// Inserts or replaces the configuration row for an account.
    pub async fn upsert(&self, account: &Account) -> Result<()> {
        let account = account.clone();
        let jid = account.jid.clone();
        let cert_json = account
            .server_certificate
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO accounts
                        (jid, password, active, push_enabled, last_endpoint,
                         roster_version, server_certificate)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(jid) DO UPDATE SET
                        password = excluded.password,
                        active = excluded.active,
                        push_enabled = excluded.push_enabled,
                        last_endpoint = excluded.last_endpoint,
                        roster_version = excluded.roster_version,
                        server_certificate = excluded.server_certificate",
                    params![
                        account.jid.as_str(),
                        account.password,
                        account.active as i64,
                        account.push_enabled as i64,
                        account.last_endpoint,
                        account.roster_version,
                        cert_json,
                    ],
                )?;
                Ok(())
            })
            .await?;
        self.publish_changed(jid, false);
        Ok(())
    }

    pub async fn set_active(&self, jid: &BareJid, active: bool) -> Result<()> {
        let changed = self
            .update_column(jid, move |conn, jid| {
                conn.execute(
                    "UPDATE accounts SET active = ?1 WHERE jid = ?2",
                    params![active as i64, jid],
                )
            })
            .await?;
        if changed {
            info!(target: "Store", "Account {jid} set active={active}");
            self.publish_changed(jid.clone(), false);
        }
        Ok(())
    }

    pub async fn set_last_endpoint(&self, jid: &BareJid, endpoint: Option<&str>) -> Result<()> {
        let endpoint = endpoint.map(|e| e.to_string());
        self.update_column(jid, move |conn, jid| {
            conn.execute(
                "UPDATE accounts SET last_endpoint = ?1 WHERE jid = ?2",
                params![endpoint, jid],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn set_roster_version(&self, jid: &BareJid, version: Option<&str>) -> Result<()> {
        let version = version.map(|v| v.to_string());
        self.update_column(jid, move |conn, jid| {
            conn.execute(
                "UPDATE accounts SET roster_version = ?1 WHERE jid = ?2",
                params![version, jid],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn set_server_certificate(
        &self,
        jid: &BareJid,
        certificate: Option<&CertificateIdentity>,
    ) -> Result<()> {
        let cert_json = certificate.map(serde_json::to_string).transpose()?;
        self.update_column(jid, move |conn, jid| {
            conn.execute(
                "UPDATE accounts SET server_certificate = ?1 WHERE jid = ?2",
                params![cert_json, jid],
            )
        })
        .await?;
        Ok(())
    }

    /// Removes the account and everything hanging off it: conversations,
    /// history, and preview cache entries pinned to deleted rows.
    pub async fn delete(&self, jid: &BareJid) -> Result<()> {
        let jid_str = jid.to_string();
        self.db
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM preview_cache WHERE key IN
                        (SELECT preview FROM chat_history
                         WHERE account = ?1 AND preview IS NOT NULL)",
                    params![jid_str],
                )?;
                tx.execute("DELETE FROM chat_history WHERE account = ?1", params![jid_str])?;
                tx.execute("DELETE FROM chats WHERE account = ?1", params![jid_str])?;
                tx.execute("DELETE FROM accounts WHERE jid = ?1", params![jid_str])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        info!(target: "Store", "Account {jid} removed with all conversations and history");
        self.publish_changed(jid.clone(), true);
        Ok(())
    }

    async fn update_column<F>(&self, jid: &BareJid, update: F) -> Result<bool>
    where
        F: FnOnce(&mut Connection, &str) -> rusqlite::Result<usize> + Send + 'static,
    {
        let jid = jid.to_string();
        self.db
            .with_conn(move |conn| Ok(update(conn, &jid)? > 0))
            .await
    }

    fn publish_changed(&self, jid: BareJid, removed: bool) {
        let _ = self
            .bus
            .account_changed
            .send(Arc::new(AccountChanged { jid, removed }));
    }
}
