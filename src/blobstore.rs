//! # BlobStore
//!
//! Deduplicated, parallel blob put/get on top of `ObjectStore` + `codec`
//! (§4.5). A worker pool performs encode+upload concurrently while enforcing
//! at-most-once upload per OID per process (W1), a cache skip path (W2),
//! bounded-queue backpressure (W3), cooperative cancellation (W4), and
//! first-error propagation scoped to the affected OID (W5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use threadpool::ThreadPool;

use crate::cache::Cache;
use crate::codec::{self, BlobKind};
use crate::error::{Error, Result};
use crate::keys::{Capability, KeySet};
use crate::oid::Oid;
use crate::store::{blob_path, ObjectStore};

const QUEUE_CAPACITY: usize = 64;
const MAX_RETRIES: u32 = 5;
const BASE_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 3_000;

/// Per-OID coalescing slot: workers racing to put the same OID wait on the
/// same `Condvar` for whichever of them actually performs the upload.
struct InFlight {
    done: bool,
    result: Option<std::result::Result<(), (String, bool)>>,
}

pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    cache: Arc<Mutex<Cache>>,
    keys: KeySet,
    pool: ThreadPool,
    queue_tx: Sender<()>,
    queue_rx: Receiver<()>,
    in_flight: Mutex<HashMap<Oid, Arc<(Mutex<InFlight>, Condvar)>>>,
    cancelled: Arc<AtomicBool>,
}

/// Releases one slot of the bounded submission queue (W3) when dropped, no
/// matter which path `put_blob` took after acquiring it.
struct QueuePermit<'a>(&'a Receiver<()>);

impl Drop for QueuePermit<'_> {
    fn drop(&mut self) {
        let _ = self.0.try_recv();
    }
}

impl BlobStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: Arc<Mutex<Cache>>,
        keys: KeySet,
        workers: usize,
    ) -> Self {
        let (queue_tx, queue_rx) = bounded::<()>(QUEUE_CAPACITY);
        BlobStore {
            store,
            cache,
            keys,
            pool: ThreadPool::new(workers.max(1)),
            queue_tx,
            queue_rx,
            in_flight: Mutex::new(HashMap::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn workers() -> usize {
        num_cpus::get()
    }

    /// Cooperative cancellation flag: checked between chunks and before each
    /// store request (W4). Never leaves the cache inconsistent with the
    /// store; at worst extra blobs exist unreferenced.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Encodes and uploads `plaintext`, returning its OID. Concurrent calls
    /// for the same content coalesce onto a single upload (W1); a prior
    /// cache hit skips the store entirely (W2).
    pub fn put_blob(&self, plaintext: &[u8], kind: BlobKind) -> Result<Oid> {
        self.put_blob_tracked(plaintext, kind).map(|(oid, _)| oid)
    }

    /// Same as `put_blob`, but also reports whether this call actually
    /// performed the upload rather than finding the blob already known
    /// (callers that tally added vs. stored bytes need this distinction).
    pub fn put_blob_tracked(&self, plaintext: &[u8], kind: BlobKind) -> Result<(Oid, bool)> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let oid = codec::derive_oid(plaintext, &self.keys);

        if self.has_blob(&oid)? {
            return Ok((oid, false));
        }

        // Bounded submission queue (W3): blocks callers once `QUEUE_CAPACITY`
        // uploads are in flight rather than buffering unboundedly. The
        // permit is released on drop, whichever path below is taken.
        self.queue_tx
            .send_timeout((), Duration::from_secs(60))
            .map_err(|_| Error::Concurrent("blob submission queue is stuck".into()))?;
        let _permit = QueuePermit(&self.queue_rx);

        let slot = self.in_flight_slot(oid);
        let should_upload = {
            let (lock, _cv) = &*slot;
            let mut guard = lock.lock().unwrap();
            if guard.done {
                false
            } else {
                guard.done = false;
                true
            }
        };

        if !should_upload {
            return self.await_in_flight(&oid, &slot).map(|oid| (oid, false));
        }

        let result = self.upload_with_retry(&oid, plaintext, kind);

        {
            let (lock, cv) = &*slot;
            let mut guard = lock.lock().unwrap();
            guard.done = true;
            guard.result = Some(
                result
                    .as_ref()
                    .map(|_| ())
                    .map_err(|e| (e.to_string(), e.is_fatal())),
            );
            cv.notify_all();
        }
        self.in_flight.lock().unwrap().remove(&oid);

        result.map(|_| (oid, true))
    }

    fn in_flight_slot(&self, oid: Oid) -> Arc<(Mutex<InFlight>, Condvar)> {
        let mut table = self.in_flight.lock().unwrap();
        table
            .entry(oid)
            .or_insert_with(|| {
                Arc::new((
                    Mutex::new(InFlight {
                        done: false,
                        result: None,
                    }),
                    Condvar::new(),
                ))
            })
            .clone()
    }

    fn await_in_flight(&self, oid: &Oid, slot: &Arc<(Mutex<InFlight>, Condvar)>) -> Result<Oid> {
        let (lock, cv) = &**slot;
        let mut guard = lock.lock().unwrap();
        while !guard.done {
            guard = cv.wait(guard).unwrap();
        }
        match &guard.result {
            Some(Ok(())) => Ok(*oid),
            Some(Err((message, true))) => {
                Err(Error::Store(Box::new(Error::Other(anyhow::anyhow!(message.clone())))))
            }
            Some(Err((message, false))) => Err(Error::Other(anyhow::anyhow!(message.clone()))),
            None => Err(Error::Other(anyhow::anyhow!("in-flight upload vanished"))),
        }
    }

    /// Encodes and uploads with transient-`Io` retry. Any failure that
    /// survives retries — or isn't retryable at all — is wrapped in
    /// `Error::Store` so callers always treat a failed tree blob write as
    /// fatal (spec §4.8), whatever the underlying cause.
    fn upload_with_retry(&self, oid: &Oid, plaintext: &[u8], kind: BlobKind) -> Result<()> {
        self.upload_once(oid, plaintext, kind).map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            other => Error::Store(Box::new(other)),
        })
    }

    fn upload_once(&self, oid: &Oid, plaintext: &[u8], kind: BlobKind) -> Result<()> {
        let (_, envelope) = codec::encode(plaintext, kind, &self.keys)?;
        let path = blob_path(oid);

        let mut attempt = 0;
        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.store.put(&path, &envelope) {
                Ok(()) => {
                    self.cache
                        .lock()
                        .unwrap()
                        .mark(oid, plaintext.len() as u64, now_ms())?;
                    return Ok(());
                }
                Err(e) if e.is_transient_io() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(backoff_duration(attempt));
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn get_blob(&self, oid: &Oid, kind: BlobKind) -> Result<Vec<u8>> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if !self.keys.allows(Capability::DecryptBlob) {
            return Err(Error::Auth("this key role cannot decrypt blobs".into()));
        }
        let envelope = self.store.get(&blob_path(oid))?;
        codec::decode(&envelope, kind, &self.keys)
    }

    pub fn has_blob(&self, oid: &Oid) -> Result<bool> {
        if self.cache.lock().unwrap().contains(oid)? {
            return Ok(true);
        }
        self.store.exists(&blob_path(oid))
    }

    /// Submits `count` conceptual units of work to the pool for parallel
    /// encode+upload scheduling; used by `SaveEngine` to fan chunk puts out
    /// across workers while still going through `put_blob`'s coalescing.
    pub fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.execute(task);
    }

    pub fn join(&self) {
        self.pool.join();
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn backoff_duration(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(4));
    let capped = base.min(MAX_BACKOFF_MS);
    let jitter_range = capped / 2;
    let jitter = rand::random::<u64>() % (jitter_range.max(1) * 2);
    Duration::from_millis(capped.saturating_sub(jitter_range) + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheId;
    use crate::keys::KeyRole;
    use crate::store::LocalStore;

    fn test_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let object_store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        std::env::set_var("XDG_CACHE_HOME", dir.path());
        let cache = Arc::new(Mutex::new(
            Cache::open(&object_store.url(), CacheId([1; 16])).unwrap(),
        ));
        let master = KeySet::init_master();
        let keys = master.derive(KeyRole::Full);
        (dir, BlobStore::new(object_store, cache, keys, 2))
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = test_store();
        let oid = store.put_blob(b"hello world", BlobKind::Chunk).unwrap();
        let fetched = store.get_blob(&oid, BlobKind::Chunk).unwrap();
        assert_eq!(fetched, b"hello world");
    }

    #[test]
    fn duplicate_put_is_cheap_and_idempotent() {
        let (_dir, store) = test_store();
        let oid1 = store.put_blob(b"same content", BlobKind::Chunk).unwrap();
        let oid2 = store.put_blob(b"same content", BlobKind::Chunk).unwrap();
        assert_eq!(oid1, oid2);
        assert!(store.has_blob(&oid1).unwrap());
    }

    #[test]
    fn cancelled_store_refuses_new_work() {
        let (_dir, store) = test_store();
        store.cancel();
        assert!(matches!(
            store.put_blob(b"anything", BlobKind::Chunk),
            Err(Error::Cancelled)
        ));
    }
}
