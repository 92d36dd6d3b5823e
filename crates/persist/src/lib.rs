//! Tollgate persistence: SQLite store for last-known-good gateway
//! configurations, so a restarted control plane can recover before it has
//! built anything itself.

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

const KEEP_ROWS: i64 = 3;

/// One persisted configuration. `body` is the encoded payload, possibly
/// zstd-compressed (see [`maybe_compress`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastValidRecord {
    pub hash: String,
    pub ts: i64,
    pub body: Vec<u8>,
}

pub trait LastValidStore: Send + Sync {
    fn put(&self, record: LastValidRecord) -> Result<()>;
    fn latest(&self) -> Result<Option<LastValidRecord>>;
}

pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open the database at `TOLLGATE_DB_PATH`, or `~/.tollgate/tollgate.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("TOLLGATE_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS last_valid (
                hash TEXT NOT NULL,
                ts   INTEGER NOT NULL,
                body BLOB NOT NULL
            )",
            [],
        )
        .context("creating last_valid table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_last_valid_ts ON last_valid(ts DESC)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "opened last-valid store");
        Ok(Self { db: Mutex::new(db) })
    }

    /// Newest first, at most `limit` rows.
    pub fn history(&self, limit: usize) -> Result<Vec<LastValidRecord>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare("SELECT hash, ts, body FROM last_valid ORDER BY ts DESC, rowid DESC LIMIT ?1")?;
        let mut rows = stmt.query([limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(LastValidRecord { hash: row.get(0)?, ts: row.get(1)?, body: row.get(2)? });
        }
        Ok(out)
    }
}

impl LastValidStore for SqliteStore {
    fn put(&self, record: LastValidRecord) -> Result<()> {
        let started = Instant::now();
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = db.transaction()?;
        tx.execute("INSERT INTO last_valid(hash, ts, body) VALUES (?1, ?2, ?3)", (&record.hash, record.ts, &record.body))?;
        tx.execute(
            "DELETE FROM last_valid
             WHERE rowid NOT IN (SELECT rowid FROM last_valid ORDER BY ts DESC, rowid DESC LIMIT ?1)",
            [KEEP_ROWS],
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn latest(&self) -> Result<Option<LastValidRecord>> {
        let started = Instant::now();
        let newest = self.history(1)?.into_iter().next();
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(newest)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".tollgate");
        let _ = std::fs::create_dir_all(&p);
        p.push("tollgate.db");
        return p.to_string_lossy().to_string();
    }
    "tollgate.db".to_string()
}

/// Seconds since the Unix epoch.
pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[allow(unreachable_code)]
pub fn maybe_compress(body: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("TOLLGATE_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(body, lvl).unwrap_or_else(|_| body.to_vec());
    }
    body.to_vec()
}

/// Inverse of [`maybe_compress`]; uncompressed blobs pass through.
pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}
