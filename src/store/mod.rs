//! # ObjectStore
//!
//! The abstract contract every transport (local filesystem, S3, SFTP)
//! implements (§4.1). The core only ever depends on this trait; the three
//! concrete backends are swappable transports behind it.

mod local;
mod s3;
mod sftp;

pub use local::LocalStore;
pub use s3::S3Store;
pub use sftp::SftpStore;

use crate::error::Result;

/// Untyped, immutable blob storage. Paths are 7-bit ASCII of the form
/// `<prefix>/<hex1>/<hex2>/<rest-of-oid-hex>` for blobs,
/// `channels/<channel>/<timestamp>-<oid>` for channel entries, and fixed
/// names (`config`, `cid`, `keys/<role>`) for repository metadata.
pub trait ObjectStore: Send + Sync {
    /// Writes `bytes` at `path`. No-ops (returns `Ok`) if the path already
    /// holds byte-identical content (§4.1; blobs are content-addressed, so
    /// an overwrite-with-same-bytes is just a durability re-confirmation).
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, path: &str) -> Result<Vec<u8>>;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Lists every stored path under `prefix`. Order is not guaranteed.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn delete(&self, path: &str) -> Result<()>;

    /// Canonical URL form of this store (scheme + opaque), e.g.
    /// `file:///srv/backups` or `s3:https://s3.example.com/bucket`.
    fn url(&self) -> String;
}

/// Splits an OID's hex form into the blob path's two sharding components,
/// matching the on-store layout in spec §6: `blobs/<hex[0..2]>/<hex[2..4]>/<full-hex>`.
pub fn blob_path(oid: &crate::oid::Oid) -> String {
    let (a, b, full) = oid.shard_path();
    format!("blobs/{a}/{b}/{full}")
}

pub fn channel_entry_path(channel: &str, timestamp_ms: i64, oid: &crate::oid::Oid) -> String {
    format!("channels/{channel}/{timestamp_ms:016x}-{}", oid.to_hex())
}
