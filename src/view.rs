//! # RepositoryView
//!
//! Read-only exploration on top of a [`Repository`]: listing channels and
//! snapshots, walking dir blobs to resolve a `<channel>[:<path>]` or
//! `<hex-oid>[:<path>]` identifier, and a chunk-caching file handle used by
//! both the CLI and (in a full build) a FUSE adapter (§4.10).

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::codec::BlobKind;
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::repo::Repository;
use crate::tree::{self, Dir, EntryKind};

/// Default number of chunks kept warm per open [`FileHandle`].
const CHUNK_CACHE_SIZE: usize = 32;

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub channel: String,
    pub time_ms: i64,
    pub oid: Oid,
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub latest: Option<SnapshotInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Dir,
    Link,
    Snapshot,
    /// This entry failed to save and has no blob (spec §4.8's "recorded as
    /// absent" dir entry); nothing further can be fetched or resolved
    /// through it.
    Absent,
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub name: String,
    pub oid: Oid,
    pub kind: ObjectKind,
    pub size: Option<u64>,
    pub depth: usize,
}

pub struct RepositoryView<'a> {
    repo: &'a Repository,
}

impl<'a> RepositoryView<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        RepositoryView { repo }
    }

    /// One row per channel, with its current (largest-timestamp) snapshot
    /// (§4.10, §3 "Channel": ties broken by OID lexicographic order — see
    /// `Repository::current_snapshot`).
    pub fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let mut out = Vec::new();
        for name in self.repo.list_channels()? {
            let latest = self
                .repo
                .current_snapshot(&name)?
                .map(|entry| SnapshotInfo {
                    channel: name.clone(),
                    time_ms: entry.time_ms,
                    oid: entry.oid,
                });
            out.push(ChannelInfo { name, latest });
        }
        Ok(out)
    }

    /// Every snapshot recorded for every channel, newest first within each
    /// channel.
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let mut out = Vec::new();
        for name in self.repo.list_channels()? {
            let mut entries = self.repo.list_channel_entries(&name)?;
            entries.reverse();
            out.extend(entries.into_iter().map(|e| SnapshotInfo {
                channel: name.clone(),
                time_ms: e.time_ms,
                oid: e.oid,
            }));
        }
        Ok(out)
    }

    /// Resolves `<hex-oid>[:<path>]` or `<channel>[:<path>]` to a concrete
    /// OID by walking dir blobs component by component (§4.10 `locate`).
    pub fn locate(&self, identifier: &str) -> Result<Oid> {
        self.locate_with_kind(identifier).map(|(oid, _)| oid)
    }

    /// Same as [`locate`](Self::locate), but also reports the resolved
    /// object's kind — needed by `RestoreEngine`, which must know a blob's
    /// kind before it can decode it (the envelope's AAD is bound to it).
    pub fn locate_with_kind(&self, identifier: &str) -> Result<(Oid, ObjectKind)> {
        let (head, subpath) = match identifier.split_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (identifier, None),
        };

        let (mut oid, mut kind) = if let Ok(oid) = head.parse::<Oid>() {
            (oid, self.detect_kind(oid)?)
        } else {
            let entry = self
                .repo
                .current_snapshot(head)?
                .ok_or_else(|| Error::not_found(format!("channel '{head}' has no snapshots")))?;
            (entry.oid, ObjectKind::Snapshot)
        };

        // A snapshot blob's "root" is a dir; resolving a subpath walks from
        // there, not from the snapshot wrapper itself.
        if kind == ObjectKind::Snapshot {
            let bytes = self.repo.blobs.get_blob(&oid, BlobKind::Snapshot)?;
            oid = tree::decode_snapshot(&bytes)?.root;
            kind = ObjectKind::Dir;
        }

        if let Some(path) = subpath {
            for component in path.split('/').filter(|c| !c.is_empty()) {
                let bytes = self.repo.blobs.get_blob(&oid, BlobKind::Dir)?;
                let dir = tree::decode_dir(&bytes)?;
                let entry = dir
                    .entries
                    .iter()
                    .find(|e| e.name == component)
                    .ok_or_else(|| Error::not_found(format!("no such path component '{component}'")))?;
                if entry.kind == EntryKind::Absent {
                    return Err(Error::not_found(format!(
                        "path component '{component}' failed to save and has no blob"
                    )));
                }
                oid = entry.child;
                kind = match entry.kind {
                    EntryKind::File => ObjectKind::File,
                    EntryKind::Dir => ObjectKind::Dir,
                    EntryKind::Link => ObjectKind::Link,
                    EntryKind::Snapshot => ObjectKind::Snapshot,
                    EntryKind::Absent => unreachable!("handled above"),
                };
            }
        }

        Ok((oid, kind))
    }

    /// A bare OID carries no type tag of its own; the envelope's AAD binds
    /// it to one [`BlobKind`], so only a decode under the right kind
    /// succeeds. Tried in roughly most-to-least common order for a restore
    /// entry point.
    fn detect_kind(&self, oid: Oid) -> Result<ObjectKind> {
        for (blob_kind, object_kind) in [
            (BlobKind::Snapshot, ObjectKind::Snapshot),
            (BlobKind::Dir, ObjectKind::Dir),
            (BlobKind::FileIndex, ObjectKind::File),
            (BlobKind::Link, ObjectKind::Link),
        ] {
            if self.repo.blobs.get_blob(&oid, blob_kind).is_ok() {
                return Ok(object_kind);
            }
        }
        Err(Error::not_found(format!("oid {oid} is not a known object")))
    }

    /// Lists the children of `oid` (a dir or snapshot blob) up to
    /// `max_depth` levels, depth-first. `max_depth == 0` lists only the
    /// immediate children.
    pub fn list_children(&self, oid: Oid, max_depth: usize) -> Result<Vec<ObjectInfo>> {
        let root = self.resolve_snapshot_root(oid)?;
        let mut out = Vec::new();
        self.walk_children(root, 0, max_depth, &mut out)?;
        Ok(out)
    }

    fn resolve_snapshot_root(&self, oid: Oid) -> Result<Oid> {
        if let Ok(bytes) = self.repo.blobs.get_blob(&oid, BlobKind::Snapshot) {
            return Ok(tree::decode_snapshot(&bytes)?.root);
        }
        Ok(oid)
    }

    fn walk_children(
        &self,
        dir_oid: Oid,
        depth: usize,
        max_depth: usize,
        out: &mut Vec<ObjectInfo>,
    ) -> Result<()> {
        let bytes = self.repo.blobs.get_blob(&dir_oid, BlobKind::Dir)?;
        let dir: Dir = tree::decode_dir(&bytes)?;

        for entry in &dir.entries {
            let (kind, size) = match entry.kind {
                EntryKind::File => {
                    let size = self
                        .repo
                        .blobs
                        .get_blob(&entry.child, BlobKind::FileIndex)
                        .ok()
                        .and_then(|b| tree::decode_file_index(&b).ok())
                        .map(|idx| idx.total_size);
                    (ObjectKind::File, size)
                }
                EntryKind::Dir => (ObjectKind::Dir, None),
                EntryKind::Link => (ObjectKind::Link, None),
                EntryKind::Snapshot => (ObjectKind::Snapshot, None),
                EntryKind::Absent => (ObjectKind::Absent, None),
            };

            out.push(ObjectInfo {
                name: entry.name.clone(),
                oid: entry.child,
                kind,
                size,
                depth,
            });

            if entry.kind == EntryKind::Dir && depth < max_depth {
                self.walk_children(entry.child, depth + 1, max_depth, out)?;
            }
        }

        Ok(())
    }

    pub fn read_link(&self, oid: Oid) -> Result<String> {
        let bytes = self.repo.blobs.get_blob(&oid, BlobKind::Link)?;
        Ok(tree::decode_link(&bytes)?.target)
    }

    /// Opens `oid` (a file-index blob) for random-access reads, fetching
    /// the file index once and caching recently-read chunks (§4.10
    /// `open_file`, used by FUSE).
    pub fn open_file(&self, oid: Oid) -> Result<FileHandle<'a>> {
        let bytes = self.repo.blobs.get_blob(&oid, BlobKind::FileIndex)?;
        let index = tree::decode_file_index(&bytes)?;
        Ok(FileHandle {
            repo: self.repo,
            index,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CHUNK_CACHE_SIZE).unwrap(),
            )),
        })
    }
}

pub enum ReadOutcome {
    Read(usize),
    Eof,
}

/// An open file ready for random-access reads (§4.10). Keeps the
/// file-index in memory; chunk bytes are fetched on demand through a small
/// LRU so sequential reads don't re-download a chunk per call.
pub struct FileHandle<'a> {
    repo: &'a Repository,
    index: tree::FileIndex,
    cache: Mutex<LruCache<Oid, Vec<u8>>>,
}

impl<'a> FileHandle<'a> {
    pub fn size(&self) -> u64 {
        self.index.total_size
    }

    /// Reads into `buf` starting at `offset`, returning the number of bytes
    /// actually copied (0 only at end of file).
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        if offset >= self.index.total_size || buf.is_empty() {
            return Ok(ReadOutcome::Eof);
        }

        let mut copied = 0usize;
        let mut cursor = offset;

        while copied < buf.len() {
            let Some(chunk) = self
                .index
                .chunks
                .iter()
                .find(|c| cursor >= c.offset && cursor < c.offset + c.length as u64)
            else {
                break;
            };

            let chunk_bytes = self.chunk_bytes(chunk)?;
            let within = (cursor - chunk.offset) as usize;
            let available = chunk_bytes.len() - within;
            let want = (buf.len() - copied).min(available);

            buf[copied..copied + want].copy_from_slice(&chunk_bytes[within..within + want]);
            copied += want;
            cursor += want as u64;
        }

        Ok(ReadOutcome::Read(copied))
    }

    fn chunk_bytes(&self, chunk_ref: &tree::ChunkRef) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.lock().unwrap().get(&chunk_ref.oid) {
            return Ok(cached.clone());
        }
        let bytes = self.repo.blobs.get_blob(&chunk_ref.oid, BlobKind::Chunk)?;
        self.cache
            .lock()
            .unwrap()
            .put(chunk_ref.oid, bytes.clone());
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheId;
    use crate::chunker::ChunkerParams;
    use crate::config::Config;
    use crate::keys::{KeyRole, KeySet};
    use crate::save::{SaveEngine, SaveSettings};
    use crate::store::{LocalStore, ObjectStore};
    use std::fs;
    use std::sync::Arc;

    fn test_config() -> Config {
        Config {
            repository: crate::config::RepositoryUrl::Local("/tmp/unused".into()),
            threads: Some(2),
            chunker: ChunkerParams::default(),
            s3: None,
            sftp: None,
            key_file: None,
            link: None,
        }
    }

    fn test_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_CACHE_HOME", dir.path());
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(dir.path().join("store")).unwrap());
        let master = KeySet::init_master();
        Repository::init(object_store.clone(), &master, ChunkerParams::default()).unwrap();
        let full = master.derive(KeyRole::Full);
        let repo = Repository::open(&test_config(), object_store, full).unwrap();
        (dir, repo)
    }

    fn seed_snapshot(repo: &Repository, tmp: &std::path::Path) -> Oid {
        let src = tmp.join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"hello view module").unwrap();

        let engine = SaveEngine::new(&repo.blobs, ChunkerParams::default());
        let outcome = engine
            .save("daily", &[src], &SaveSettings::default(), None)
            .unwrap();
        let snapshot_oid = outcome.snapshot.unwrap();
        repo.append_channel_entry("daily", 1_700_000_000_000, snapshot_oid)
            .unwrap();
        snapshot_oid
    }

    #[test]
    fn locate_resolves_channel_and_subpath() {
        let (tmp, repo) = test_repo();
        seed_snapshot(&repo, tmp.path());

        let view = RepositoryView::new(&repo);
        let oid = view.locate("daily:a.txt").unwrap();
        let handle = view.open_file(oid).unwrap();
        assert_eq!(handle.size(), "hello view module".len() as u64);
    }

    #[test]
    fn list_channels_reports_latest_snapshot() {
        let (tmp, repo) = test_repo();
        seed_snapshot(&repo, tmp.path());

        let view = RepositoryView::new(&repo);
        let channels = view.list_channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "daily");
        assert!(channels[0].latest.is_some());
    }

    #[test]
    fn list_children_enumerates_tree() {
        let (tmp, repo) = test_repo();
        let snapshot_oid = seed_snapshot(&repo, tmp.path());

        let view = RepositoryView::new(&repo);
        let children = view.list_children(snapshot_oid, 8).unwrap();
        let names: Vec<_> = children.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"src"));
    }

    #[test]
    fn file_handle_reads_across_offsets() {
        let (tmp, repo) = test_repo();
        seed_snapshot(&repo, tmp.path());

        let view = RepositoryView::new(&repo);
        let oid = view.locate("daily:a.txt").unwrap();
        let handle = view.open_file(oid).unwrap();

        let mut buf = vec![0u8; 5];
        match handle.read(0, &mut buf).unwrap() {
            ReadOutcome::Read(n) => assert_eq!(&buf[..n], b"hello"),
            ReadOutcome::Eof => panic!("expected data"),
        }

        let mut tail = vec![0u8; 6];
        match handle.read("hello ".len() as u64, &mut tail).unwrap() {
            ReadOutcome::Read(n) => assert_eq!(&tail[..n], b"view m"),
            ReadOutcome::Eof => panic!("expected data"),
        }
    }

    #[test]
    fn locate_rejects_unknown_channel() {
        let (_tmp, repo) = test_repo();
        let view = RepositoryView::new(&repo);
        assert!(view.locate("nonexistent").is_err());
    }
}
