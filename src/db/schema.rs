//! SQLite schema for durable cache state.

/// Applied on every open; all statements are idempotent.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Key-value TTL cache (one namespace per cache instance)
CREATE TABLE IF NOT EXISTS kv_cache (
    namespace TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    data BLOB NOT NULL,
    expiry INTEGER NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_kv_cache_expiry
    ON kv_cache(namespace, expiry);

-- Versioned offline buckets (shell-<version>, data-<version>)
CREATE TABLE IF NOT EXISTS offline_buckets (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

-- Cached responses keyed by absolute URL
CREATE TABLE IF NOT EXISTS offline_entries (
    bucket TEXT NOT NULL,
    url TEXT NOT NULL,
    response BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (bucket, url),
    FOREIGN KEY (bucket) REFERENCES offline_buckets(name) ON DELETE CASCADE
);

-- Mutating requests waiting for replay
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    item BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp);
"#;
