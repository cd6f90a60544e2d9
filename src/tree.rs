//! # TreeCodec
//!
//! Bit-exact, versioned binary layouts for the blobs that carry structure:
//! file-index, dir, link, and snapshot (§4.7). Hand-written with `byteorder`
//! rather than a self-describing serde format, since the layout itself is
//! specified down to the byte.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::oid::{Oid, OID_LEN};

const TREE_VERSION: u8 = 1;

const FLAG_HAS_ATIME: u8 = 0b0000_0001;

/// Common per-entry metadata (§4.7 "metadata block").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub ctime: i64,
    pub btime: i64,
    pub atime: Option<i64>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Metadata {
    fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.mode)?;
        w.write_u32::<LittleEndian>(self.uid)?;
        w.write_u32::<LittleEndian>(self.gid)?;
        w.write_i64::<LittleEndian>(self.mtime)?;
        w.write_i64::<LittleEndian>(self.ctime)?;
        w.write_i64::<LittleEndian>(self.btime)?;
        if let Some(atime) = self.atime {
            w.write_i64::<LittleEndian>(atime)?;
        }
        w.write_u16::<LittleEndian>(self.xattrs.len() as u16)?;
        for (k, v) in &self.xattrs {
            let kb = k.as_bytes();
            w.write_u16::<LittleEndian>(kb.len() as u16)?;
            w.write_all(kb)?;
            w.write_u32::<LittleEndian>(v.len() as u32)?;
            w.write_all(v)?;
        }
        Ok(())
    }

    fn read(r: &mut impl Read, has_atime: bool) -> Result<Self> {
        let mode = r.read_u32::<LittleEndian>()?;
        let uid = r.read_u32::<LittleEndian>()?;
        let gid = r.read_u32::<LittleEndian>()?;
        let mtime = r.read_i64::<LittleEndian>()?;
        let ctime = r.read_i64::<LittleEndian>()?;
        let btime = r.read_i64::<LittleEndian>()?;
        let atime = if has_atime {
            Some(r.read_i64::<LittleEndian>()?)
        } else {
            None
        };

        let xattr_count = r.read_u16::<LittleEndian>()?;
        let mut xattrs = BTreeMap::new();
        for _ in 0..xattr_count {
            let klen = r.read_u16::<LittleEndian>()? as usize;
            let mut kbuf = vec![0u8; klen];
            r.read_exact(&mut kbuf)?;
            let key = String::from_utf8(kbuf)
                .map_err(|_| Error::Other(anyhow::anyhow!("xattr key is not valid utf-8")))?;

            let vlen = r.read_u32::<LittleEndian>()? as usize;
            let mut vbuf = vec![0u8; vlen];
            r.read_exact(&mut vbuf)?;
            xattrs.insert(key, vbuf);
        }

        Ok(Metadata {
            mode,
            uid,
            gid,
            mtime,
            ctime,
            btime,
            atime,
            xattrs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub oid: Oid,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIndex {
    pub total_size: u64,
    pub chunks: Vec<ChunkRef>,
    pub metadata: Metadata,
}

pub fn encode_file_index(index: &FileIndex) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u8(TREE_VERSION)?;
    let flags = if index.metadata.atime.is_some() {
        FLAG_HAS_ATIME
    } else {
        0
    };
    out.write_u8(flags)?;
    out.write_u64::<LittleEndian>(index.total_size)?;
    out.write_u32::<LittleEndian>(index.chunks.len() as u32)?;
    for chunk in &index.chunks {
        out.write_all(chunk.oid.as_bytes())?;
        out.write_u64::<LittleEndian>(chunk.offset)?;
        out.write_u32::<LittleEndian>(chunk.length)?;
    }
    index.metadata.write(&mut out)?;
    Ok(out)
}

pub fn decode_file_index(bytes: &[u8]) -> Result<FileIndex> {
    let mut r = bytes;
    let version = r.read_u8()?;
    check_version(version)?;
    let flags = r.read_u8()?;
    let total_size = r.read_u64::<LittleEndian>()?;
    let chunk_count = r.read_u32::<LittleEndian>()?;

    let mut chunks = Vec::with_capacity(chunk_count as usize);
    for _ in 0..chunk_count {
        let mut oid_bytes = [0u8; OID_LEN];
        r.read_exact(&mut oid_bytes)?;
        let offset = r.read_u64::<LittleEndian>()?;
        let length = r.read_u32::<LittleEndian>()?;
        chunks.push(ChunkRef {
            oid: Oid::from_bytes(oid_bytes),
            offset,
            length,
        });
    }

    let metadata = Metadata::read(&mut r, flags & FLAG_HAS_ATIME != 0)?;

    Ok(FileIndex {
        total_size,
        chunks,
        metadata,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Link,
    Snapshot,
    /// This name existed in the source tree but failed to save (spec
    /// §4.8: "a single file I/O error is reported and that file is
    /// recorded as absent in its parent dir"). `child` is a zero OID; there
    /// is no blob to fetch.
    Absent,
}

impl EntryKind {
    fn tag(self) -> u8 {
        match self {
            EntryKind::File => 0,
            EntryKind::Dir => 1,
            EntryKind::Link => 2,
            EntryKind::Snapshot => 3,
            EntryKind::Absent => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => EntryKind::File,
            1 => EntryKind::Dir,
            2 => EntryKind::Link,
            3 => EntryKind::Snapshot,
            4 => EntryKind::Absent,
            other => {
                return Err(Error::Other(anyhow::anyhow!("unknown entry kind tag {other}")))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub child: Oid,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dir {
    pub entries: Vec<DirEntry>,
}

pub fn encode_dir(dir: &Dir) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u8(TREE_VERSION)?;
    out.write_u32::<LittleEndian>(dir.entries.len() as u32)?;
    for entry in &dir.entries {
        let name_bytes = entry.name.as_bytes();
        if name_bytes.contains(&0) || entry.name.contains('/') {
            return Err(Error::Other(anyhow::anyhow!(
                "entry name '{}' contains NUL or '/'",
                entry.name
            )));
        }
        out.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
        out.write_all(name_bytes)?;
        out.write_u8(entry.kind.tag())?;
        out.write_all(entry.child.as_bytes())?;
        out.write_u8(if entry.metadata.atime.is_some() {
            FLAG_HAS_ATIME
        } else {
            0
        })?;
        entry.metadata.write(&mut out)?;
    }
    Ok(out)
}

pub fn decode_dir(bytes: &[u8]) -> Result<Dir> {
    let mut r = bytes;
    let version = r.read_u8()?;
    check_version(version)?;
    let entry_count = r.read_u32::<LittleEndian>()?;

    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let name_len = r.read_u16::<LittleEndian>()? as usize;
        let mut name_buf = vec![0u8; name_len];
        r.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| Error::Other(anyhow::anyhow!("entry name is not valid utf-8")))?;

        let kind = EntryKind::from_tag(r.read_u8()?)?;

        let mut child_bytes = [0u8; OID_LEN];
        r.read_exact(&mut child_bytes)?;
        let child = Oid::from_bytes(child_bytes);

        let entry_flags = r.read_u8()?;
        let metadata = Metadata::read(&mut r, entry_flags & FLAG_HAS_ATIME != 0)?;

        entries.push(DirEntry {
            name,
            kind,
            child,
            metadata,
        });
    }

    Ok(Dir { entries })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
    pub metadata: Metadata,
}

pub fn encode_link(link: &Link) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u8(TREE_VERSION)?;
    let target_bytes = link.target.as_bytes();
    out.write_u16::<LittleEndian>(target_bytes.len() as u16)?;
    out.write_all(target_bytes)?;
    out.write_u8(if link.metadata.atime.is_some() {
        FLAG_HAS_ATIME
    } else {
        0
    })?;
    link.metadata.write(&mut out)?;
    Ok(out)
}

pub fn decode_link(bytes: &[u8]) -> Result<Link> {
    let mut r = bytes;
    let version = r.read_u8()?;
    check_version(version)?;
    let len = r.read_u16::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let target = String::from_utf8(buf)
        .map_err(|_| Error::Other(anyhow::anyhow!("link target is not valid utf-8")))?;
    let flags = r.read_u8()?;
    let metadata = Metadata::read(&mut r, flags & FLAG_HAS_ATIME != 0)?;
    Ok(Link { target, metadata })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBlob {
    pub channel: String,
    pub time_ms: i64,
    pub root: Oid,
    pub source_size: i64,
    pub stored_size: i64,
    pub added_size: i64,
}

pub fn encode_snapshot(snapshot: &SnapshotBlob) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u8(TREE_VERSION)?;
    let name_bytes = snapshot.channel.as_bytes();
    out.write_u16::<LittleEndian>(name_bytes.len() as u16)?;
    out.write_all(name_bytes)?;
    out.write_i64::<LittleEndian>(snapshot.time_ms)?;
    out.write_all(snapshot.root.as_bytes())?;
    out.write_i64::<LittleEndian>(snapshot.source_size)?;
    out.write_i64::<LittleEndian>(snapshot.stored_size)?;
    out.write_i64::<LittleEndian>(snapshot.added_size)?;
    Ok(out)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<SnapshotBlob> {
    let mut r = bytes;
    let version = r.read_u8()?;
    check_version(version)?;
    let name_len = r.read_u16::<LittleEndian>()? as usize;
    let mut name_buf = vec![0u8; name_len];
    r.read_exact(&mut name_buf)?;
    let channel = String::from_utf8(name_buf)
        .map_err(|_| Error::Other(anyhow::anyhow!("channel name is not valid utf-8")))?;

    let time_ms = r.read_i64::<LittleEndian>()?;
    let mut root_bytes = [0u8; OID_LEN];
    r.read_exact(&mut root_bytes)?;
    let root = Oid::from_bytes(root_bytes);
    let source_size = r.read_i64::<LittleEndian>()?;
    let stored_size = r.read_i64::<LittleEndian>()?;
    let added_size = r.read_i64::<LittleEndian>()?;

    Ok(SnapshotBlob {
        channel,
        time_ms,
        root,
        source_size,
        stored_size,
        added_size,
    })
}

fn check_version(version: u8) -> Result<()> {
    if version != TREE_VERSION {
        return Err(Error::Other(anyhow::anyhow!(
            "unsupported tree blob version {version}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> Metadata {
        Metadata {
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            mtime: 1_700_000_000_000,
            ctime: 1_700_000_000_000,
            btime: 1_699_000_000_000,
            atime: Some(1_700_000_100_000),
            xattrs: BTreeMap::from([("user.test".to_string(), b"value".to_vec())]),
        }
    }

    #[test]
    fn file_index_round_trips() {
        let index = FileIndex {
            total_size: 42,
            chunks: vec![ChunkRef {
                oid: Oid::from_bytes([7u8; OID_LEN]),
                offset: 0,
                length: 42,
            }],
            metadata: sample_metadata(),
        };
        let encoded = encode_file_index(&index).unwrap();
        let decoded = decode_file_index(&encoded).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn dir_round_trips() {
        let dir = Dir {
            entries: vec![DirEntry {
                name: "a.txt".to_string(),
                kind: EntryKind::File,
                child: Oid::from_bytes([1u8; OID_LEN]),
                metadata: Metadata::default(),
            }],
        };
        let encoded = encode_dir(&dir).unwrap();
        let decoded = decode_dir(&encoded).unwrap();
        assert_eq!(decoded, dir);
    }

    #[test]
    fn dir_entry_atime_round_trips() {
        let dir = Dir {
            entries: vec![DirEntry {
                name: "a.txt".to_string(),
                kind: EntryKind::File,
                child: Oid::from_bytes([1u8; OID_LEN]),
                metadata: sample_metadata(),
            }],
        };
        let encoded = encode_dir(&dir).unwrap();
        let decoded = decode_dir(&encoded).unwrap();
        assert_eq!(decoded, dir);
        assert!(decoded.entries[0].metadata.atime.is_some());
    }

    #[test]
    fn rejects_name_with_slash() {
        let dir = Dir {
            entries: vec![DirEntry {
                name: "a/b".to_string(),
                kind: EntryKind::File,
                child: Oid::from_bytes([1u8; OID_LEN]),
                metadata: Metadata::default(),
            }],
        };
        assert!(encode_dir(&dir).is_err());
    }

    #[test]
    fn link_round_trips() {
        let link = Link {
            target: "../other/file".to_string(),
            metadata: Metadata::default(),
        };
        let encoded = encode_link(&link).unwrap();
        let decoded = decode_link(&encoded).unwrap();
        assert_eq!(decoded, link);
    }

    #[test]
    fn snapshot_round_trips() {
        let snap = SnapshotBlob {
            channel: "daily".to_string(),
            time_ms: 1_700_000_000_000,
            root: Oid::from_bytes([9u8; OID_LEN]),
            source_size: 100,
            stored_size: 80,
            added_size: 80,
        };
        let encoded = encode_snapshot(&snap).unwrap();
        let decoded = decode_snapshot(&encoded).unwrap();
        assert_eq!(decoded, snap);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = encode_snapshot(&SnapshotBlob {
            channel: "x".to_string(),
            time_ms: 0,
            root: Oid::from_bytes([0u8; OID_LEN]),
            source_size: 0,
            stored_size: 0,
            added_size: 0,
        })
        .unwrap();
        bytes[0] = 99;
        assert!(decode_snapshot(&bytes).is_err());
    }
}
