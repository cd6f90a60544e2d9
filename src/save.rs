//! # SaveEngine
//!
//! Walks a set of source paths, chunks and stores file content, builds the
//! dir/file-index/link blob DAG, and emits a snapshot + channel entry
//! (§4.8). Generalizes the teacher's flat per-file walk/hash/store loop
//! (`backup_target`) to the tree-shaped, content-addressed model: every
//! directory becomes its own blob, built only after all of its children have
//! resolved to an OID.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::blobstore::BlobStore;
use crate::chunker::{self, ChunkerParams};
use crate::codec::BlobKind;
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::tree::{self, ChunkRef, Dir, DirEntry, EntryKind, FileIndex, Link, Metadata, SnapshotBlob};

#[derive(Debug, Clone)]
pub struct SaveSettings {
    pub skip_unchanged: bool,
    pub rehash: bool,
    pub follow_symlinks: bool,
    pub atime: bool,
    pub xattrs: bool,
    pub no_snapshot: bool,
}

impl Default for SaveSettings {
    fn default() -> Self {
        SaveSettings {
            skip_unchanged: true,
            rehash: false,
            follow_symlinks: false,
            atime: false,
            xattrs: false,
            no_snapshot: false,
        }
    }
}

/// One failure recorded against a single source path; the walk continues
/// past these (§4.8 failure semantics).
#[derive(Debug, Clone)]
pub struct SaveError {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SaveStats {
    pub source_size: u64,
    pub stored_size: u64,
    pub added_size: u64,
    pub files: u64,
    pub duration_ms: u64,
}

pub struct SaveOutcome {
    pub root: Oid,
    pub snapshot: Option<Oid>,
    pub stats: SaveStats,
    pub errors: Vec<SaveError>,
}

/// Flat view of a previous snapshot's tree, keyed by the entry's full
/// relative path (`dir/subdir/name`), used for `skip_unchanged` reuse.
pub type PreviousTree = HashMap<String, DirEntry>;

pub struct SaveEngine<'a> {
    blobs: &'a BlobStore,
    chunker: ChunkerParams,
}

impl<'a> SaveEngine<'a> {
    pub fn new(blobs: &'a BlobStore, chunker: ChunkerParams) -> Self {
        SaveEngine { blobs, chunker }
    }

    /// Loads every entry of a previously-saved tree into a flat map for
    /// `skip_unchanged` lookups.
    pub fn flatten_previous(&self, root: Oid) -> Result<PreviousTree> {
        let mut out = HashMap::new();
        self.flatten_dir(root, "", &mut out)?;
        Ok(out)
    }

    fn flatten_dir(&self, oid: Oid, prefix: &str, out: &mut PreviousTree) -> Result<()> {
        let bytes = self.blobs.get_blob(&oid, BlobKind::Dir)?;
        let dir = tree::decode_dir(&bytes)?;
        for entry in dir.entries {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.kind == EntryKind::Dir {
                self.flatten_dir(entry.child, &path, out)?;
            }
            out.insert(path, entry);
        }
        Ok(())
    }

    /// Runs the save algorithm over `sources` into `channel`, per §4.8.
    pub fn save(
        &self,
        channel: &str,
        sources: &[PathBuf],
        settings: &SaveSettings,
        previous: Option<&PreviousTree>,
    ) -> Result<SaveOutcome> {
        let start = Instant::now();
        let mut stats = SaveStats::default();
        let mut errors = Vec::new();

        let mut roots = Vec::new();
        for source in sources {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| source.display().to_string());

            match self.walk_child(source, &name, "", settings, previous, &mut stats, &mut errors) {
                Ok(entry) => roots.push(entry),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    errors.push(SaveError {
                        path: source.clone(),
                        message: e.to_string(),
                    });
                    roots.push(absent_entry(&name));
                }
            }
        }

        let root_dir = Dir { entries: roots };
        let encoded = tree::encode_dir(&root_dir)?;
        let root_oid = self.blobs.put_blob(&encoded, BlobKind::Dir)?;

        let snapshot_oid = if settings.no_snapshot {
            None
        } else {
            let snapshot = SnapshotBlob {
                channel: channel.to_string(),
                time_ms: now_ms(),
                root: root_oid,
                source_size: stats.source_size as i64,
                stored_size: stats.stored_size as i64,
                added_size: stats.added_size as i64,
            };
            let bytes = tree::encode_snapshot(&snapshot)?;
            Some(self.blobs.put_blob(&bytes, BlobKind::Snapshot)?)
        };

        stats.duration_ms = start.elapsed().as_millis() as u64;

        Ok(SaveOutcome {
            root: root_oid,
            snapshot: snapshot_oid,
            stats,
            errors,
        })
    }

    /// Resolves one path (file, dir, or symlink) into the `DirEntry` that
    /// will name it in its parent, recursing into directories bottom-up:
    /// every child's blob exists before the dir blob that references it is
    /// built. `rel_prefix` is the already-walked path, for `skip_unchanged`
    /// lookups against `previous`.
    fn walk_child(
        &self,
        path: &Path,
        name: &str,
        rel_prefix: &str,
        settings: &SaveSettings,
        previous: Option<&PreviousTree>,
        stats: &mut SaveStats,
        errors: &mut Vec<SaveError>,
    ) -> Result<DirEntry> {
        let file_type = fs::symlink_metadata(path)?.file_type();

        if file_type.is_symlink() {
            if settings.follow_symlinks {
                if fs::metadata(path)?.file_type().is_dir() {
                    return self.walk_dir(path, name, rel_prefix, settings, previous, stats, errors);
                }
                return self.store_file(path, name, rel_prefix, settings, previous, stats);
            }
            let target = fs::read_link(path)?;
            return self.store_link(name, &target);
        }

        if file_type.is_dir() {
            return self.walk_dir(path, name, rel_prefix, settings, previous, stats, errors);
        }

        self.store_file(path, name, rel_prefix, settings, previous, stats)
    }

    fn walk_dir(
        &self,
        dir_path: &Path,
        entry_name: &str,
        rel_prefix: &str,
        settings: &SaveSettings,
        previous: Option<&PreviousTree>,
        stats: &mut SaveStats,
        errors: &mut Vec<SaveError>,
    ) -> Result<DirEntry> {
        let mut names: Vec<_> = fs::read_dir(dir_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        names.sort();

        let child_prefix = if rel_prefix.is_empty() {
            entry_name.to_string()
        } else {
            format!("{rel_prefix}/{entry_name}")
        };

        let mut children = Vec::with_capacity(names.len());
        for name in names {
            let child_path = dir_path.join(&name);
            let child_name = name.to_string_lossy().to_string();

            let result = self.walk_child(
                &child_path,
                &child_name,
                &child_prefix,
                settings,
                previous,
                stats,
                errors,
            );
            match result {
                Ok(entry) => children.push(entry),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    errors.push(SaveError {
                        path: child_path,
                        message: e.to_string(),
                    });
                    children.push(absent_entry(&child_name));
                }
            }
        }

        let meta = fs::metadata(dir_path)?;
        let dir_blob = Dir { entries: children };
        let encoded = tree::encode_dir(&dir_blob)?;
        let oid = self.blobs.put_blob(&encoded, BlobKind::Dir)?;

        Ok(DirEntry {
            name: entry_name.to_string(),
            kind: EntryKind::Dir,
            child: oid,
            metadata: metadata_of(&meta, settings),
        })
    }

    fn store_link(&self, name: &str, target: &std::path::Path) -> Result<DirEntry> {
        let link = Link {
            target: target.to_string_lossy().to_string(),
            metadata: Metadata::default(),
        };
        let encoded = tree::encode_link(&link)?;
        let oid = self.blobs.put_blob(&encoded, BlobKind::Link)?;
        Ok(DirEntry {
            name: name.to_string(),
            kind: EntryKind::Link,
            child: oid,
            metadata: Metadata::default(),
        })
    }

    fn store_file(
        &self,
        path: &Path,
        name: &str,
        rel_prefix: &str,
        settings: &SaveSettings,
        previous: Option<&PreviousTree>,
        stats: &mut SaveStats,
    ) -> Result<DirEntry> {
        let meta = fs::metadata(path)?;
        let size = meta.len();
        stats.source_size += size;
        stats.files += 1;

        let metadata = metadata_of(&meta, settings);
        let mtime = metadata.mtime;

        let full_path = if rel_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{rel_prefix}/{name}")
        };

        if settings.skip_unchanged && !settings.rehash {
            if let Some(prior) = previous.and_then(|p| p.get(&full_path)) {
                if prior.kind == EntryKind::File
                    && prior.metadata.mtime == mtime
                    && prior.metadata.mode == metadata.mode
                {
                    if let Ok(bytes) = self.blobs.get_blob(&prior.child, BlobKind::FileIndex) {
                        if let Ok(index) = tree::decode_file_index(&bytes) {
                            if index.total_size == size {
                                return Ok(DirEntry {
                                    name: name.to_string(),
                                    kind: EntryKind::File,
                                    child: prior.child,
                                    metadata,
                                });
                            }
                        }
                    }
                }
            }
        }

        let data = fs::read(path)?;
        let chunks = chunker::chunk(&data, self.chunker);

        let mut chunk_refs = Vec::with_capacity(chunks.len());
        for c in &chunks {
            if self.blobs.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (oid, added) = self.blobs.put_blob_tracked(&c.bytes, BlobKind::Chunk)?;
            if added {
                stats.added_size += c.bytes.len() as u64;
            }
            stats.stored_size += c.bytes.len() as u64;
            chunk_refs.push(ChunkRef {
                oid,
                offset: c.offset,
                length: c.length,
            });
        }

        let index = FileIndex {
            total_size: size,
            chunks: chunk_refs,
            metadata: metadata.clone(),
        };
        let encoded = tree::encode_file_index(&index)?;
        let oid = self.blobs.put_blob(&encoded, BlobKind::FileIndex)?;

        Ok(DirEntry {
            name: name.to_string(),
            kind: EntryKind::File,
            child: oid,
            metadata,
        })
    }
}

/// Placeholder `DirEntry` for a name that failed to save (§4.8: "recorded
/// as absent in its parent dir"). Carries no blob; `child` is a zero OID.
fn absent_entry(name: &str) -> DirEntry {
    DirEntry {
        name: name.to_string(),
        kind: EntryKind::Absent,
        child: Oid::from_bytes([0u8; 32]),
        metadata: Metadata::default(),
    }
}

fn metadata_of(meta: &fs::Metadata, settings: &SaveSettings) -> Metadata {
    let mtime = system_time_ms(meta.modified().ok());
    let ctime = mtime;
    let btime = system_time_ms(meta.created().ok());
    let atime = if settings.atime {
        Some(system_time_ms(meta.accessed().ok()))
    } else {
        None
    };

    #[cfg(unix)]
    let (mode, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (meta.mode(), meta.uid(), meta.gid())
    };
    #[cfg(not(unix))]
    let (mode, uid, gid) = (0u32, 0u32, 0u32);

    Metadata {
        mode,
        uid,
        gid,
        mtime,
        ctime,
        btime,
        atime,
        xattrs: Default::default(),
    }
}

fn system_time_ms(time: Option<std::time::SystemTime>) -> i64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn now_ms() -> i64 {
    system_time_ms(Some(std::time::SystemTime::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, CacheId};
    use crate::keys::{KeyRole, KeySet};
    use crate::store::{LocalStore, ObjectStore};
    use std::sync::{Arc, Mutex};

    fn test_engine() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalStore::new(dir.path().join("store")).unwrap());
        std::env::set_var("XDG_CACHE_HOME", dir.path());
        let cache = Arc::new(Mutex::new(
            Cache::open(&object_store.url(), CacheId([3; 16])).unwrap(),
        ));
        let keys = KeySet::init_master().derive(KeyRole::Full);
        (dir, BlobStore::new(object_store, cache, keys, 2))
    }

    #[test]
    fn saves_a_small_tree() {
        let (tmp, blobs) = test_engine();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("b")).unwrap();
        fs::write(src.join("a.txt"), b"hello").unwrap();
        fs::write(src.join("b/c.bin"), vec![0x42u8; 1024]).unwrap();

        let engine = SaveEngine::new(&blobs, ChunkerParams::default());
        let outcome = engine
            .save("daily", &[src], &SaveSettings::default(), None)
            .unwrap();

        assert!(outcome.snapshot.is_some());
        assert_eq!(outcome.stats.source_size, 5 + 1024);
        assert!(outcome.errors.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_recorded_as_absent_not_dropped() {
        use std::os::unix::fs::PermissionsExt;

        let (tmp, blobs) = test_engine();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("ok.txt"), b"fine").unwrap();
        fs::write(src.join("locked.txt"), b"secret").unwrap();
        fs::set_permissions(src.join("locked.txt"), fs::Permissions::from_mode(0o000)).unwrap();

        let engine = SaveEngine::new(&blobs, ChunkerParams::default());
        let outcome = engine
            .save("daily", &[src.clone()], &SaveSettings::default(), None)
            .unwrap();

        // Running as root (common in CI containers) bypasses the permission
        // bit entirely; only assert the absent-recording behavior when the
        // read genuinely failed.
        if !outcome.errors.is_empty() {
            assert!(outcome.snapshot.is_some());

            let bytes = blobs.get_blob(&outcome.root, BlobKind::Dir).unwrap();
            let root_dir = tree::decode_dir(&bytes).unwrap();
            let src_entry = root_dir
                .entries
                .iter()
                .find(|e| e.name == src.file_name().unwrap().to_string_lossy())
                .unwrap();
            let inner = tree::decode_dir(
                &blobs.get_blob(&src_entry.child, BlobKind::Dir).unwrap(),
            )
            .unwrap();

            let locked = inner.entries.iter().find(|e| e.name == "locked.txt").unwrap();
            assert_eq!(locked.kind, EntryKind::Absent);
            let ok = inner.entries.iter().find(|e| e.name == "ok.txt").unwrap();
            assert_eq!(ok.kind, EntryKind::File);
        }

        fs::set_permissions(src.join("locked.txt"), fs::Permissions::from_mode(0o644)).unwrap();
    }
}
