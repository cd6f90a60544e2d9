//! # Cache
//!
//! Local embedded-SQLite cache of known-present OIDs, scoped to a
//! repository's Cache-ID (§4.6). Repeated saves consult this before ever
//! touching the object store.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::oid::Oid;

/// Opaque 16-byte repository Cache-ID (§3).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CacheId(pub [u8; 16]);

impl CacheId {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

pub struct Cache {
    conn: Connection,
    _lock: LockFile,
}

struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Cache {
    /// Locates the per-user cache directory for `repo_url`, opens (creating
    /// if needed) the SQLite file, and reconciles it against `current_cid`:
    /// on mismatch the `known_oid` table is cleared and the new Cache-ID is
    /// recorded (I6 cache coherence).
    pub fn open(repo_url: &str, current_cid: CacheId) -> Result<Self> {
        let dir = cache_dir_for(repo_url)?;
        std::fs::create_dir_all(&dir)?;

        let lock = acquire_lock(&dir)?;

        let conn = Connection::open(dir.join("cache.db"))
            .map_err(|e| Error::Other(anyhow::anyhow!("opening cache db: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS known_oid (
                oid TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| Error::Other(anyhow::anyhow!("initializing cache schema: {e}")))?;

        let mut cache = Cache { conn, _lock: lock };
        cache.reconcile_cid(current_cid)?;
        Ok(cache)
    }

    fn stored_cid(&self) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'cid'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::Other(anyhow::anyhow!("reading cache cid: {other}"))),
            })
    }

    fn reconcile_cid(&mut self, current_cid: CacheId) -> Result<()> {
        let current_hex = current_cid.to_hex();
        if self.stored_cid()? != Some(current_hex.clone()) {
            self.reset(false)?;
            self.conn
                .execute(
                    "INSERT INTO meta (key, value) VALUES ('cid', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![current_hex],
                )
                .map_err(|e| Error::Other(anyhow::anyhow!("writing cache cid: {e}")))?;
        }
        Ok(())
    }

    pub fn contains(&self, oid: &Oid) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM known_oid WHERE oid = ?1",
                params![oid.to_hex()],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(|e| Error::Other(anyhow::anyhow!("querying cache: {e}")))
    }

    pub fn mark(&self, oid: &Oid, size: u64, now_ms: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO known_oid (oid, size, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(oid) DO UPDATE SET last_seen = excluded.last_seen",
                params![oid.to_hex(), size as i64, now_ms],
            )
            .map_err(|e| Error::Other(anyhow::anyhow!("writing cache entry: {e}")))?;
        Ok(())
    }

    pub fn forget(&self, oid: &Oid) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM known_oid WHERE oid = ?1",
                params![oid.to_hex()],
            )
            .map_err(|e| Error::Other(anyhow::anyhow!("forgetting cache entry: {e}")))?;
        Ok(())
    }

    /// Wipes the `known_oid` table. `rebuild_from_store` is left to the
    /// caller (it needs `ObjectStore::list`, which this module doesn't
    /// depend on) — see `Repository::reset_cache`.
    pub fn reset(&self, _rebuild_from_store: bool) -> Result<()> {
        self.conn
            .execute("DELETE FROM known_oid", [])
            .map_err(|e| Error::Other(anyhow::anyhow!("resetting cache: {e}")))?;
        Ok(())
    }
}

fn cache_dir_for(repo_url: &str) -> Result<PathBuf> {
    let base = dirs::cache_dir()
        .ok_or_else(|| Error::Config("could not determine per-user cache directory".into()))?;
    let digest = blake3::hash(repo_url.as_bytes()).to_hex().to_string();
    Ok(base.join("rekkord").join(&digest[..16]))
}

fn acquire_lock(dir: &Path) -> Result<LockFile> {
    let path = dir.join(".lock");
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::Concurrent(format!("cache at {} is locked by another process", dir.display()))
            } else {
                Error::Io(e)
            }
        })?;
    Ok(LockFile { path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache(cid: u8) -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_CACHE_HOME", dir.path());
        let cache = Cache::open("file:///test/repo", CacheId([cid; 16])).unwrap();
        (dir, cache)
    }

    #[test]
    fn mark_and_contains() {
        let (_dir, cache) = test_cache(1);
        let oid = Oid::from_bytes([5u8; 32]);
        assert!(!cache.contains(&oid).unwrap());
        cache.mark(&oid, 128, 1000).unwrap();
        assert!(cache.contains(&oid).unwrap());
    }

    #[test]
    fn forget_removes_entry() {
        let (_dir, cache) = test_cache(2);
        let oid = Oid::from_bytes([6u8; 32]);
        cache.mark(&oid, 1, 0).unwrap();
        cache.forget(&oid).unwrap();
        assert!(!cache.contains(&oid).unwrap());
    }

    #[test]
    fn cid_mismatch_clears_table() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_CACHE_HOME", dir.path());

        let oid = Oid::from_bytes([7u8; 32]);
        {
            let cache = Cache::open("file:///test/repo2", CacheId([1; 16])).unwrap();
            cache.mark(&oid, 1, 0).unwrap();
            assert!(cache.contains(&oid).unwrap());
        }

        let cache = Cache::open("file:///test/repo2", CacheId([2; 16])).unwrap();
        assert!(!cache.contains(&oid).unwrap());
    }
}
