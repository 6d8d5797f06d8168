use crate::store::error::{Result, StoreError};
use log::{debug, info};
use rusqlite::Connection;

/// Latest schema version. Upgrades are linear: every migration from the
/// stored `user_version` up to this is applied in order.
pub const SCHEMA_VERSION: i32 = 3;

type MigrationFn = fn(&Connection) -> rusqlite::Result<()>;

const MIGRATIONS: &[(i32, MigrationFn)] = &[(1, migrate_v1), (2, migrate_v2), (3, migrate_v3)];

/// Columns that must exist after any upgrade path. Checked unconditionally
/// so a botched migration fails loudly instead of corrupting data later.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "accounts",
        &[
            "jid",
            "password",
            "active",
            "push_enabled",
            "last_endpoint",
            "roster_version",
            "server_certificate",
        ],
    ),
    (
        "chats",
        &[
            "account",
            "jid",
            "type",
            "timestamp",
            "thread_id",
            "nickname",
            "password",
            "options",
        ],
    ),
    (
        "chat_history",
        &[
            "account",
            "jid",
            "author_jid",
            "author_nickname",
            "timestamp",
            "item_type",
            "data",
            "stanza_id",
            "state",
            "error",
            "encryption",
            "fingerprint",
            "preview",
        ],
    ),
    ("preview_cache", &["key", "data"]),
];

pub(crate) fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "database version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    for (version, migrate) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        info!(target: "Store", "Applying schema migration {version}");
        let tx = conn.transaction()?;
        migrate(&tx)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    verify_required_columns(conn)?;
    collapse_duplicate_chats(conn)?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            jid TEXT NOT NULL UNIQUE,
            password TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            push_enabled INTEGER NOT NULL DEFAULT 0,
            last_endpoint TEXT,
            roster_version TEXT
        );
        CREATE TABLE IF NOT EXISTS chats (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account TEXT NOT NULL,
            jid TEXT NOT NULL,
            type INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL DEFAULT 0,
            thread_id TEXT,
            nickname TEXT,
            password TEXT,
            options TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_chats_account_jid ON chats(account, jid);
        CREATE TABLE IF NOT EXISTS chat_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account TEXT NOT NULL,
            jid TEXT NOT NULL,
            author_jid TEXT,
            author_nickname TEXT,
            timestamp INTEGER NOT NULL,
            item_type INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            stanza_id TEXT,
            state INTEGER NOT NULL,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_chat_history_conversation
            ON chat_history(account, jid, timestamp);
        CREATE INDEX IF NOT EXISTS idx_chat_history_state
            ON chat_history(account, state);",
    )
}

fn migrate_v2(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_missing(conn, "chat_history", "encryption", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(conn, "chat_history", "fingerprint", "TEXT")?;
    add_column_if_missing(conn, "accounts", "server_certificate", "TEXT")?;
    Ok(())
}

fn migrate_v3(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_missing(conn, "chat_history", "preview", "TEXT")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS preview_cache (
            key TEXT PRIMARY KEY,
            data TEXT NOT NULL
        );",
    )
}

/// `ALTER TABLE ADD COLUMN` guarded by a column-existence check, which is
/// what makes re-running a migration a no-op.
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    if table_columns(conn, table)?.iter().any(|c| c == column) {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

fn verify_required_columns(conn: &Connection) -> Result<()> {
    for (table, columns) in REQUIRED_COLUMNS {
        let present = table_columns(conn, table)?;
        for column in *columns {
            if !present.iter().any(|c| c == column) {
                return Err(StoreError::Migration(format!(
                    "post-migration check failed: {table}.{column} is missing"
                )));
            }
        }
    }
    Ok(())
}

/// Startup fixup: collapse any duplicate conversation rows for the same
/// (account, peer) pair down to the lowest id. Open-time reuse prevents new
/// duplicates; this catches rows written before that rule existed.
fn collapse_duplicate_chats(conn: &Connection) -> Result<()> {
    let removed = conn.execute(
        "DELETE FROM chats WHERE id NOT IN
            (SELECT MIN(id) FROM chats GROUP BY account, jid)",
        [],
    )?;
    if removed > 0 {
        debug!(target: "Store", "Collapsed {removed} duplicate chat rows");
    }
    Ok(())
}
