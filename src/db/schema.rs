pub const SCHEMA: &str = r#"
-- cached feed items; (datetime, id) is the sort and seek key
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY,
    datetime TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    link TEXT NOT NULL DEFAULT '',
    author TEXT,
    source_title TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    icon TEXT,
    thumbnail TEXT,
    unread INTEGER NOT NULL DEFAULT 0,
    starred INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_entries_datetime ON entries(datetime);
CREATE INDEX IF NOT EXISTS idx_entries_datetime_id ON entries(datetime, id);

-- outbox: status changes not yet confirmed by the server
CREATE TABLE IF NOT EXISTS statusq (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    value INTEGER NOT NULL,
    datetime TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_statusq_entry_id ON statusq(entry_id);

-- named timestamps (lastItemsUpdate, newestGCedEntry, lastCleanup)
CREATE TABLE IF NOT EXISTS stamps (
    name TEXT PRIMARY KEY,
    datetime TEXT NOT NULL
);

-- aggregate counters mirrored from the server
CREATE TABLE IF NOT EXISTS stats (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);

-- client settings that must outlive a session (offline_days)
CREATE TABLE IF NOT EXISTS settings (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- snapshots for the navigation UI, refreshed on every sync
CREATE TABLE IF NOT EXISTS tags (
    tag TEXT PRIMARY KEY,
    color TEXT,
    unread INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sources (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    unread INTEGER NOT NULL DEFAULT 0
);
"#;
