use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::Entry;

use super::schema::SCHEMA;

/// The persisted local store: a SQLite database owned exclusively by
/// [`OfflineDb`](super::offline::OfflineDb). Every write happens inside an
/// explicit transaction that either fully commits or rolls back; a full
/// storage device surfaces as the distinguished
/// [`StorageQuota`](crate::error::AppError::StorageQuota) error.
pub struct LocalStore {
    conn: Connection,
}

impl LocalStore {
    /// Opens (or creates) the store. The returned flag is true when the
    /// database was newly created, in which case the aggregate counters
    /// were seeded with zeros.
    pub async fn open(db_path: &str) -> Result<(Self, bool)> {
        let conn = Connection::open(db_path).await?;

        let created = conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                let empty: i64 =
                    conn.query_row("SELECT COUNT(*) FROM stats", [], |row| row.get(0))?;
                if empty == 0 {
                    for name in ["unread", "starred", "total"] {
                        conn.execute(
                            "INSERT INTO stats (name, value) VALUES (?1, 0)",
                            params![name],
                        )?;
                    }
                }
                Ok(empty == 0)
            })
            .await?;

        Ok((Self { conn }, created))
    }

    /// Runs `f` inside a transaction. Commit and rollback are all-or-nothing
    /// across every table the closure touches.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let value = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }
}

/// Datetimes are stored as RFC3339 at second precision so that the TEXT
/// column ordering matches chronological ordering.
pub fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56+00:00")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

pub const ENTRY_COLUMNS: &str =
    "id, datetime, title, content, link, author, source_title, tags, icon, thumbnail, unread, starred";

pub fn entry_from_row(row: &Row) -> rusqlite::Result<Entry> {
    let datetime: String = row.get(1)?;
    let tags: String = row.get(7)?;
    Ok(Entry {
        id: row.get(0)?,
        datetime: parse_datetime(&datetime).unwrap_or_else(Utc::now),
        title: row.get(2)?,
        content: row.get(3)?,
        link: row.get(4)?,
        author: row.get(5)?,
        source_title: row.get(6)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        icon: row.get(8)?,
        thumbnail: row.get(9)?,
        unread: row.get::<_, i64>(10)? != 0,
        starred: row.get::<_, i64>(11)? != 0,
    })
}

pub fn upsert_entry(tx: &Transaction, entry: &Entry) -> rusqlite::Result<()> {
    tx.execute(
        r#"INSERT INTO entries (id, datetime, title, content, link, author, source_title, tags, icon, thumbnail, unread, starred)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
           ON CONFLICT(id) DO UPDATE SET
               datetime = excluded.datetime,
               title = excluded.title,
               content = excluded.content,
               link = excluded.link,
               author = excluded.author,
               source_title = excluded.source_title,
               tags = excluded.tags,
               icon = excluded.icon,
               thumbnail = excluded.thumbnail,
               unread = excluded.unread,
               starred = excluded.starred"#,
        params![
            entry.id,
            fmt_datetime(entry.datetime),
            entry.title,
            entry.content,
            entry.link,
            entry.author,
            entry.source_title,
            serde_json::to_string(&entry.tags).unwrap_or_else(|_| "[]".to_string()),
            entry.icon,
            entry.thumbnail,
            entry.unread,
            entry.starred,
        ],
    )?;
    Ok(())
}

pub fn get_stamp(tx: &Transaction, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT datetime FROM stamps WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.as_deref().and_then(parse_datetime))
}

pub fn put_stamp(tx: &Transaction, name: &str, datetime: DateTime<Utc>) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO stamps (name, datetime) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET datetime = excluded.datetime",
        params![name, fmt_datetime(datetime)],
    )?;
    Ok(())
}

pub fn get_setting(tx: &Transaction, name: &str) -> rusqlite::Result<Option<String>> {
    tx.query_row(
        "SELECT value FROM settings WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()
}

pub fn put_setting(tx: &Transaction, name: &str, value: &str) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO settings (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}

/// Authoritative counters over what is actually stored locally.
pub fn offline_counts(tx: &Transaction) -> rusqlite::Result<(i64, i64, i64)> {
    tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(unread), 0), COALESCE(SUM(starred), 0) FROM entries",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
}
