//! Filesystem-backed `ObjectStore`. The variant exercised by the test suite;
//! S3 and SFTP implement the identical trait against their own transports.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::store::ObjectStore;

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalStore { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl ObjectStore for LocalStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Ok(existing) = fs::read(&full) {
            if existing == bytes {
                return Ok(());
            }
        }

        // Write-then-rename so a concurrent reader never observes a partial
        // file at the final path.
        let tmp = full.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &full)?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.resolve(path)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::not_found(path)
            } else {
                Error::Io(e)
            }
        })
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path).is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.resolve(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        walk(&base, &self.root, &mut out)?;
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(path)),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn url(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, root, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("blobs/ab/cd/abcdef", b"payload").unwrap();
        assert_eq!(store.get("blobs/ab/cd/abcdef").unwrap(), b"payload");
    }

    #[test]
    fn put_is_idempotent_for_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("x", b"same").unwrap();
        store.put("x", b"same").unwrap();
        assert_eq!(store.get("x").unwrap(), b"same");
    }

    #[test]
    fn missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        assert!(matches!(store.get("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn list_finds_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("blobs/ab/cd/one", b"1").unwrap();
        store.put("blobs/ab/ef/two", b"2").unwrap();
        let mut listed = store.list("blobs").unwrap();
        listed.sort();
        assert_eq!(listed, vec!["blobs/ab/cd/one", "blobs/ab/ef/two"]);
    }

    #[test]
    fn delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        store.put("x", b"y").unwrap();
        store.delete("x").unwrap();
        assert!(!store.exists("x").unwrap());
    }
}
