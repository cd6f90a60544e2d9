//! # Repository
//!
//! Ties `ObjectStore`, `KeyHierarchy`, `Cache` and `BlobStore` together into
//! the handle every higher-level operation (`save`, `restore`, `view`,
//! `agent`) opens once and shares. Also owns the reserved-path metadata
//! described in spec §3/§6: `config`, `cid`, `keys/<role>`, and the
//! `channels/<channel>/<timestamp>-<oid>` append-only log.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::blobstore::BlobStore;
use crate::cache::{Cache, CacheId};
use crate::chunker::ChunkerParams;
use crate::config::{Config, RepositoryUrl};
use crate::error::{Error, Result};
use crate::keys::{Capability, KeyRole, KeySet};
use crate::oid::Oid;
use crate::store::{self, LocalStore, ObjectStore, S3Store, SftpStore};

const CONFIG_VERSION: u32 = 1;
const CID_LEN: usize = 16;

/// Builds the `ObjectStore` backend named by `config.repository`, dispatching
/// on the URL scheme the way the teacher's `rk_OpenDisk` picks a `rk_Disk`
/// implementation from its config.
pub fn open_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match &config.repository {
        RepositoryUrl::Local(path) => Ok(Arc::new(LocalStore::new(path.clone())?)),
        RepositoryUrl::S3(_) => {
            let settings = config
                .s3
                .as_ref()
                .ok_or_else(|| Error::Config("repository url is s3: but no [S3] section is configured".into()))?;
            Ok(Arc::new(S3Store::new(settings)?))
        }
        RepositoryUrl::Sftp(_) => {
            let settings = config
                .sftp
                .clone()
                .ok_or_else(|| Error::Config("repository url is ssh:// but no [SFTP] section is configured".into()))?;
            Ok(Arc::new(SftpStore::new(settings)?))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoConfigData {
    version: u32,
    min_chunk: u32,
    avg_chunk: u32,
    max_chunk: u32,
    cache_id: String,
}

/// Signed repository metadata document stored at `/config` (§3, §6).
/// Signing (not encryption) binds the document to whichever key created it;
/// the payload itself carries nothing secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedConfig {
    data: RepoConfigData,
    signature: Option<String>,
}

pub struct Repository {
    pub store: Arc<dyn ObjectStore>,
    pub keys: KeySet,
    pub cache: Arc<Mutex<Cache>>,
    pub blobs: BlobStore,
    pub chunker: ChunkerParams,
    pub cache_id: CacheId,
}

impl Repository {
    /// Initializes a brand-new repository: writes `/config`, `/cid`, and a
    /// sealed `keys/<role>` copy for every role derived from `master`.
    /// Fails if `config` already exists (I2/I5: no reinitializing over live
    /// state).
    pub fn init(object_store: Arc<dyn ObjectStore>, master: &KeySet, chunker: ChunkerParams) -> Result<()> {
        if object_store.exists("config")? {
            return Err(Error::Config("repository is already initialized".into()));
        }

        let mut cid_bytes = [0u8; CID_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut cid_bytes);
        let cache_id = CacheId(cid_bytes);

        let data = RepoConfigData {
            version: CONFIG_VERSION,
            min_chunk: chunker.min_chunk,
            avg_chunk: chunker.avg_chunk,
            max_chunk: chunker.max_chunk,
            cache_id: cache_id.to_hex(),
        };
        let signed = sign_config(&data, master)?;
        let bytes = serde_json::to_vec_pretty(&signed)
            .map_err(|e| Error::Other(anyhow::anyhow!("serializing config: {e}")))?;
        object_store.put("config", &bytes)?;
        object_store.put("cid", &cid_bytes)?;

        for role in [KeyRole::Full, KeyRole::Write, KeyRole::Log, KeyRole::Config] {
            let derived = master.derive(role);
            let sealed = derived.export_key_file(None)?;
            object_store.put(&format!("keys/{role}"), &sealed)?;
        }

        Ok(())
    }

    /// Opens an existing repository with `keys` (any role). Reads and
    /// (when `keys` carries `AdminConfig`) verifies `/config`; resolves the
    /// local cache scoped to the repository's current Cache-ID (I6).
    pub fn open(config: &Config, object_store: Arc<dyn ObjectStore>, keys: KeySet) -> Result<Self> {
        let bytes = object_store.get("config")?;
        let signed: SignedConfig = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("malformed repository config: {e}")))?;

        if keys.allows(Capability::AdminConfig) {
            verify_config(&signed, &keys)?;
        }

        if signed.data.version != CONFIG_VERSION {
            return Err(Error::Config(format!(
                "unsupported repository config version {}",
                signed.data.version
            )));
        }

        let cache_id = parse_cache_id(&signed.data.cache_id)?;
        let chunker = ChunkerParams {
            min_chunk: signed.data.min_chunk,
            avg_chunk: signed.data.avg_chunk,
            max_chunk: signed.data.max_chunk,
        };

        let cache = Arc::new(Mutex::new(Cache::open(&object_store.url(), cache_id)?));
        let workers = config.threads.unwrap_or_else(BlobStore::workers);
        let blobs = BlobStore::new(object_store.clone(), cache.clone(), keys.clone(), workers);

        Ok(Repository {
            store: object_store,
            keys,
            cache,
            blobs,
            chunker,
            cache_id,
        })
    }

    /// Appends a signed channel entry at `channels/<channel>/<ts>-<oid>`
    /// (§4.1, §4.8 step 6). Requires `WriteChannel` (I5: only written after
    /// `snapshot_oid` itself is already durable — enforced by the caller
    /// ordering, not here).
    pub fn append_channel_entry(&self, channel: &str, time_ms: i64, snapshot_oid: Oid) -> Result<()> {
        let path = store::channel_entry_path(channel, time_ms, &snapshot_oid);
        let message = channel_entry_message(channel, time_ms, &snapshot_oid);
        let signature = self.keys.sign_channel(&message)?;
        self.store.put(&path, &signature)?;
        Ok(())
    }

    /// Lists every snapshot entry recorded for `channel`, verifying each
    /// signature when `keys` carries `ReadChannel`.
    pub fn list_channel_entries(&self, channel: &str) -> Result<Vec<ChannelEntry>> {
        let prefix = format!("channels/{channel}/");
        let paths = self.store.list(&prefix)?;

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(entry) = parse_channel_path(channel, &path) else {
                continue;
            };

            if self.keys.allows(Capability::ReadChannel) {
                let signature_bytes = self.store.get(&path)?;
                if signature_bytes.len() == 32 {
                    let mut sig = [0u8; 32];
                    sig.copy_from_slice(&signature_bytes);
                    let message = channel_entry_message(channel, entry.time_ms, &entry.oid);
                    self.keys.verify_channel(&message, &sig)?;
                }
            }

            entries.push(entry);
        }

        entries.sort_by(|a, b| a.time_ms.cmp(&b.time_ms).then(a.oid.cmp(&b.oid)));
        Ok(entries)
    }

    /// The current snapshot of `channel`: largest timestamp, ties broken by
    /// OID lexicographic order (§3 "Channel").
    pub fn current_snapshot(&self, channel: &str) -> Result<Option<ChannelEntry>> {
        Ok(self.list_channel_entries(channel)?.into_iter().last())
    }

    /// Rewrites `/config`'s `cid` field to a fresh random value and
    /// re-signs it, requiring `AdminConfig` (the `Config` or `Master` role).
    /// Every other client's local cache is scoped to the old Cache-ID, so
    /// this is the repository-wide cache-invalidation lever (I6): after a
    /// `change_cid`, every client's next `open` starts a fresh local cache.
    pub fn change_cid(&self) -> Result<CacheId> {
        if !self.keys.allows(Capability::AdminConfig) {
            return Err(Error::Auth(format!(
                "role {} may not change the repository cache id",
                self.keys.role()
            )));
        }

        let bytes = self.store.get("config")?;
        let mut signed: SignedConfig = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("malformed repository config: {e}")))?;

        let mut cid_bytes = [0u8; CID_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut cid_bytes);
        let new_cid = CacheId(cid_bytes);

        signed.data.cache_id = new_cid.to_hex();
        signed.signature = Some(resign_config(&signed.data, &self.keys)?);

        let encoded = serde_json::to_vec_pretty(&signed)
            .map_err(|e| Error::Other(anyhow::anyhow!("serializing config: {e}")))?;
        self.store.put("config", &encoded)?;
        self.store.put("cid", &cid_bytes)?;

        Ok(new_cid)
    }

    /// Drops the local cache's record of which blobs already exist
    /// remotely; when `rebuild_from_store` is set, repopulates it by
    /// enumerating every blob actually present under `blobs/` (§4.6 `reset`).
    /// Purely local bookkeeping: never touches object-store blobs (I6).
    pub fn reset_cache(&self, rebuild_from_store: bool) -> Result<()> {
        self.cache.lock().unwrap().reset(rebuild_from_store)?;
        if rebuild_from_store {
            // `list` only names paths; no `stat`-only call exists on
            // `ObjectStore` to learn a blob's size without fetching its
            // envelope, and `known_oid.size` is informational rather than
            // load-bearing (only `contains` is consulted by `has_blob`), so
            // rebuilt entries record size 0 instead of paying for a full
            // re-download of every blob in the repository.
            let now = now_ms();
            let mut cache = self.cache.lock().unwrap();
            for path in self.store.list("blobs/")? {
                let Some(oid) = path.rsplit('/').next().and_then(|hex| hex.parse::<Oid>().ok())
                else {
                    continue;
                };
                cache.mark(&oid, 0, now)?;
            }
        }
        Ok(())
    }

    pub fn list_channels(&self) -> Result<Vec<String>> {
        let paths = self.store.list("channels/")?;
        let mut names: Vec<String> = paths
            .iter()
            .filter_map(|p| {
                p.strip_prefix("channels/")
                    .and_then(|rest| rest.split('/').next())
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelEntry {
    pub time_ms: i64,
    pub oid: Oid,
}

fn channel_entry_message(channel: &str, time_ms: i64, oid: &Oid) -> Vec<u8> {
    let mut message = Vec::with_capacity(channel.len() + 1 + 16 + 64);
    message.extend_from_slice(channel.as_bytes());
    message.push(0);
    message.extend_from_slice(&time_ms.to_le_bytes());
    message.extend_from_slice(oid.as_bytes());
    message
}

fn parse_channel_path(channel: &str, path: &str) -> Option<ChannelEntry> {
    let prefix = format!("channels/{channel}/");
    let rest = path.strip_prefix(&prefix)?;
    let (ts_hex, oid_hex) = rest.split_once('-')?;
    let time_ms = i64::from_str_radix(ts_hex, 16).ok()?;
    let oid: Oid = oid_hex.parse().ok()?;
    Some(ChannelEntry { time_ms, oid })
}

fn sign_config(data: &RepoConfigData, master: &KeySet) -> Result<SignedConfig> {
    let payload = serde_json::to_vec(data)
        .map_err(|e| Error::Other(anyhow::anyhow!("serializing config payload: {e}")))?;
    let config_role = master.derive(KeyRole::Config);
    let sig = blake3::Hasher::new_keyed(config_role.config_key())
        .update(&payload)
        .finalize();
    Ok(SignedConfig {
        data: data.clone(),
        signature: Some(sig.to_hex().to_string()),
    })
}

fn resign_config(data: &RepoConfigData, keys: &KeySet) -> Result<String> {
    let payload = serde_json::to_vec(data)
        .map_err(|e| Error::Other(anyhow::anyhow!("serializing config payload: {e}")))?;
    let sig = blake3::Hasher::new_keyed(keys.config_key()).update(&payload).finalize();
    Ok(sig.to_hex().to_string())
}

fn verify_config(signed: &SignedConfig, keys: &KeySet) -> Result<()> {
    let Some(signature) = &signed.signature else {
        return Ok(());
    };
    let payload = serde_json::to_vec(&signed.data)
        .map_err(|e| Error::Other(anyhow::anyhow!("serializing config payload: {e}")))?;
    let expected = blake3::Hasher::new_keyed(keys.config_key())
        .update(&payload)
        .finalize();
    if expected.to_hex().as_str() != signature {
        return Err(Error::Auth("repository config signature mismatch".into()));
    }
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn parse_cache_id(hex_str: &str) -> Result<CacheId> {
    let mut bytes = [0u8; CID_LEN];
    hex::decode_to_slice(hex_str, &mut bytes)
        .map_err(|e| Error::Config(format!("malformed cache id: {e}")))?;
    Ok(CacheId(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;

    fn test_store() -> (tempfile::TempDir, Arc<dyn ObjectStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        (dir, store)
    }

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

    #[test]
    fn init_then_open_round_trips() {
        let (dir, store) = test_store();
        std::env::set_var("XDG_CACHE_HOME", dir.path());

        let master = KeySet::init_master();
        Repository::init(store.clone(), &master, ChunkerParams::default()).unwrap();

        let full = master.derive(KeyRole::Full);
        let repo = Repository::open(&test_config(), store, full).unwrap();
        assert_eq!(repo.chunker.avg_chunk, ChunkerParams::default().avg_chunk);
    }

    #[test]
    fn change_cid_requires_admin_config() {
        let (dir, store) = test_store();
        std::env::set_var("XDG_CACHE_HOME", dir.path());

        let master = KeySet::init_master();
        Repository::init(store.clone(), &master, ChunkerParams::default()).unwrap();

        let full = master.derive(KeyRole::Full);
        let repo = Repository::open(&test_config(), store, full).unwrap();
        assert!(repo.change_cid().is_err());
    }

    #[test]
    fn change_cid_rotates_and_is_visible_on_reopen() {
        let (dir, store) = test_store();
        std::env::set_var("XDG_CACHE_HOME", dir.path());

        let master = KeySet::init_master();
        Repository::init(store.clone(), &master, ChunkerParams::default()).unwrap();

        let config_role = master.derive(KeyRole::Config);
        let repo = Repository::open(&test_config(), store.clone(), config_role).unwrap();
        let old_cid = repo.cache_id;
        let new_cid = repo.change_cid().unwrap();
        assert_ne!(old_cid.to_hex(), new_cid.to_hex());

        let full = master.derive(KeyRole::Full);
        let reopened = Repository::open(&test_config(), store, full).unwrap();
        assert_eq!(reopened.cache_id.to_hex(), new_cid.to_hex());
    }

    #[test]
    fn double_init_fails() {
        let (_dir, store) = test_store();
        let master = KeySet::init_master();
        Repository::init(store.clone(), &master, ChunkerParams::default()).unwrap();
        assert!(Repository::init(store, &master, ChunkerParams::default()).is_err());
    }

    #[test]
    fn channel_entries_order_by_time_then_oid() {
        let (dir, store) = test_store();
        std::env::set_var("XDG_CACHE_HOME", dir.path());

        let master = KeySet::init_master();
        Repository::init(store.clone(), &master, ChunkerParams::default()).unwrap();
        let full = master.derive(KeyRole::Full);
        let repo = Repository::open(&test_config(), store, full).unwrap();

        repo.append_channel_entry("daily", 100, Oid::from_bytes([1u8; 32])).unwrap();
        repo.append_channel_entry("daily", 200, Oid::from_bytes([2u8; 32])).unwrap();

        let current = repo.current_snapshot("daily").unwrap().unwrap();
        assert_eq!(current.time_ms, 200);
    }

    #[test]
    fn write_role_cannot_read_channel_signature_mismatch_is_not_checked() {
        let (dir, store) = test_store();
        std::env::set_var("XDG_CACHE_HOME", dir.path());

        let master = KeySet::init_master();
        Repository::init(store.clone(), &master, ChunkerParams::default()).unwrap();
        let write = master.derive(KeyRole::Write);
        let repo = Repository::open(&test_config(), store, write).unwrap();

        repo.append_channel_entry("daily", 1, Oid::from_bytes([3u8; 32])).unwrap();
        // Write role has no ReadChannel capability, so listing must not
        // attempt (and fail) signature verification.
        assert_eq!(repo.list_channel_entries("daily").unwrap().len(), 1);
    }
}
