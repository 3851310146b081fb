#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Sled-backed persistent engine for the value-normalized content index.
//!
//! One tree holds two keyspaces told apart by a one-byte domain tag:
//! index entries map a reversed, `'I'`-tagged multihash to the list of
//! value keys advertising it, and value entries map an `'M'`-tagged
//! `blake2b(provider + context)` digest to the provider record itself.
//! Normalizing values this way stores each provider record once no matter
//! how many multihashes it covers, and makes a metadata update a single
//! write.
//!
//! Consistency between the two keyspaces is deliberately loose. Removing a
//! provider record leaves its key dangling inside index entries; readers
//! drop dangling keys as they encounter them and write the shrunken list
//! back, so the index heals at exactly the entries that are actually read.

use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use indexer_core::codec;
use indexer_core::{Cancellation, Error, Indexer, Multihash, ProviderId, Value, ValueIter};

pub mod config;
mod key;
mod lock;

pub use config::Config;

use key::{is_value_key, make_index_key, make_value_key, multihash_from_stored_key};
use lock::KeyLockPool;

/// How many scan iterations pass between cancellation checks in
/// [`Indexer::remove_provider`].
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// Persistent [`Indexer`] over a sled database.
pub struct SledIndexer {
    db: sled::Db,
    tree: sled::Tree,
    /// Striped locks serializing read-modify-write cycles on index entries.
    key_locks: KeyLockPool,
    /// Guards the value keyspace: read-held while resolving value keys,
    /// write-held for record mutations and the provider-removal scan.
    /// Always acquired before any key lock, never while one is held.
    value_lock: RwLock<()>,
    flusher: Mutex<Option<Flusher>>,
    /// Last failure seen by the background flush loop; drained by `flush`.
    flush_err: Arc<Mutex<Option<sled::Error>>>,
}

struct Flusher {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

fn spawn_flusher(
    tree: sled::Tree,
    slot: Arc<Mutex<Option<sled::Error>>>,
    interval: Duration,
) -> Flusher {
    let (stop, ticker) = mpsc::channel::<()>();
    let handle = thread::spawn(move || loop {
        match ticker.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = tree.flush() {
                    *slot.lock() = Some(e);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    });
    Flusher { stop, handle }
}

impl SledIndexer {
    /// Open (or create) an index store under `dir`.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> Result<Self, Error> {
        let dir = dir.as_ref();
        let db = sled::Config::new()
            .path(dir)
            .cache_capacity(config.index_file_size)
            // The engine runs its own flush loop so asynchronous flush
            // errors stay observable through `flush`.
            .flush_every_ms(None)
            .open()
            .map_err(|e| Error::store("cannot open index store", e))?;
        let tree = db
            .open_tree("index")
            .map_err(|e| Error::store("cannot open index tree", e))?;

        let flush_err = Arc::new(Mutex::new(None));
        let flusher = spawn_flusher(tree.clone(), flush_err.clone(), config.sync_interval);
        info!(dir = %dir.display(), "opened index store");
        Ok(Self {
            db,
            tree,
            key_locks: KeyLockPool::new(),
            value_lock: RwLock::new(()),
            flusher: Mutex::new(Some(flusher)),
            flush_err,
        })
    }

    fn stop_flusher(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            drop(flusher.stop);
            let _ = flusher.handle.join();
        }
    }

    /// Create or refresh the value record, returning its key. When
    /// `save_new` is false an absent record is probed but not created; an
    /// existing record is still refreshed if its encoding changed.
    fn update_value(&self, value: &Value, save_new: bool) -> Result<Vec<u8>, Error> {
        if value.metadata.is_empty() {
            return Err(Error::MissingMetadata);
        }
        let value_key = make_value_key(&value.provider_id, &value.context_id);

        let _guard = self.value_lock.write();
        match self
            .tree
            .get(&value_key)
            .map_err(|e| Error::store("cannot get value", e))?
        {
            None => {
                if save_new {
                    let data = codec::encode_value(value)?;
                    self.tree
                        .insert(value_key.as_slice(), data)
                        .map_err(|e| Error::store("cannot save new value", e))?;
                }
            }
            Some(existing) => {
                let data = codec::encode_value(value)?;
                if existing.as_ref() != data.as_slice() {
                    self.tree
                        .insert(value_key.as_slice(), data)
                        .map_err(|e| Error::store("cannot update existing value", e))?;
                }
            }
        }
        Ok(value_key)
    }

    /// Add `value_key` to the index entry for `mh`. Idempotent.
    fn put_index(&self, mh: &Multihash, value_key: &[u8]) -> Result<(), Error> {
        let index_key = make_index_key(mh);

        let _guard = self.key_locks.lock(&index_key);
        let mut value_keys = self.get_value_keys(&index_key)?.unwrap_or_default();
        if value_keys.iter().any(|k| k.as_slice() == value_key) {
            return Ok(());
        }
        value_keys.push(value_key.to_vec());
        let data = codec::encode_value_keys(&value_keys)?;
        self.tree
            .insert(index_key.as_slice(), data)
            .map_err(|e| Error::store("cannot put multihash", e))?;
        Ok(())
    }

    /// Drop `value_key` from the index entry for `mh`; deletes the entry
    /// when it was the last reference. The value record is untouched.
    fn remove_index(&self, mh: &Multihash, value_key: &[u8]) -> Result<(), Error> {
        let index_key = make_index_key(mh);

        let _guard = self.key_locks.lock(&index_key);
        let Some(mut value_keys) = self.get_value_keys(&index_key)? else {
            return Ok(());
        };
        let Some(pos) = value_keys.iter().position(|k| k.as_slice() == value_key) else {
            return Ok(());
        };
        if value_keys.len() == 1 {
            self.tree
                .remove(index_key.as_slice())
                .map_err(|e| Error::store("cannot delete multihash", e))?;
            return Ok(());
        }
        value_keys.swap_remove(pos);
        let data = codec::encode_value_keys(&value_keys)?;
        self.tree
            .insert(index_key.as_slice(), data)
            .map_err(|e| Error::store("cannot update value keys for multihash", e))?;
        Ok(())
    }

    fn get_value_keys(&self, index_key: &[u8]) -> Result<Option<Vec<Vec<u8>>>, Error> {
        match self
            .tree
            .get(index_key)
            .map_err(|e| Error::store("cannot get multihash from store", e))?
        {
            None => Ok(None),
            Some(data) => Ok(Some(codec::decode_value_keys(&data)?)),
        }
    }

    /// Resolve `value_keys` to records. Keys whose record has been removed
    /// are dropped from the working list, and when any were dropped the
    /// index entry is repaired in place: deleted if nothing is left,
    /// rewritten with the survivors otherwise.
    fn get_values(
        &self,
        index_key: &[u8],
        mut value_keys: Vec<Vec<u8>>,
    ) -> Result<Vec<Value>, Error> {
        let original_len = value_keys.len();
        let mut values = Vec::with_capacity(original_len);
        {
            let _guard = self.value_lock.read();
            let mut i = 0;
            while i < value_keys.len() {
                match self
                    .tree
                    .get(&value_keys[i])
                    .map_err(|e| Error::store("cannot get value", e))?
                {
                    None => {
                        value_keys.swap_remove(i);
                    }
                    Some(data) => {
                        values.push(codec::decode_value(&data)?);
                        i += 1;
                    }
                }
            }
        }

        if value_keys.len() < original_len {
            let _guard = self.key_locks.lock(index_key);
            if value_keys.is_empty() {
                self.tree
                    .remove(index_key)
                    .map_err(|e| Error::store("cannot delete multihash", e))?;
            } else {
                let data = codec::encode_value_keys(&value_keys)?;
                self.tree
                    .insert(index_key, data)
                    .map_err(|e| Error::store("cannot update value keys for multihash", e))?;
            }
        }
        Ok(values)
    }
}

impl Indexer for SledIndexer {
    fn get(&self, mh: &Multihash) -> Result<Option<Vec<Value>>, Error> {
        let index_key = make_index_key(mh);
        let Some(value_keys) = self.get_value_keys(&index_key)? else {
            return Ok(None);
        };
        let values = self.get_values(&index_key, value_keys)?;
        if values.is_empty() {
            // Every reference was dangling and has been cleaned up.
            return Ok(None);
        }
        Ok(Some(values))
    }

    fn put(&self, value: Value, mhs: &[Multihash]) -> Result<(), Error> {
        let value_key = self.update_value(&value, !mhs.is_empty())?;
        for mh in mhs {
            self.put_index(mh, &value_key)?;
        }
        Ok(())
    }

    fn remove(&self, value: &Value, mhs: &[Multihash]) -> Result<(), Error> {
        let value_key = make_value_key(&value.provider_id, &value.context_id);
        for mh in mhs {
            self.remove_index(mh, &value_key)?;
        }
        Ok(())
    }

    fn remove_provider(
        &self,
        cancel: &Cancellation,
        provider_id: &ProviderId,
    ) -> Result<(), Error> {
        self.flush()?;
        let mut iter = self.tree.iter();

        let _guard = self.value_lock.write();
        let mut count = 0usize;
        loop {
            if count % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            count += 1;

            let Some(entry) = iter.next() else {
                break;
            };
            let (raw_key, _) = entry.map_err(|e| Error::store("cannot iterate store", e))?;
            if !is_value_key(&raw_key)? {
                continue;
            }

            // Re-fetch rather than trusting the iterator's snapshot, and
            // skip records held by other providers.
            if let Some(data) = self
                .tree
                .get(&raw_key)
                .map_err(|e| Error::store("cannot get value", e))?
            {
                let value = codec::decode_value(&data)?;
                if value.provider_id != *provider_id {
                    continue;
                }
            }
            self.tree
                .remove(&raw_key)
                .map_err(|e| Error::store("cannot remove value", e))?;
        }
        Ok(())
    }

    fn remove_provider_context(
        &self,
        provider_id: &ProviderId,
        context_id: &[u8],
    ) -> Result<(), Error> {
        let value_key = make_value_key(provider_id, context_id);

        let _guard = self.value_lock.write();
        self.tree
            .remove(value_key.as_slice())
            .map_err(|e| Error::store("cannot remove value", e))?;
        Ok(())
    }

    fn size(&self) -> Result<u64, Error> {
        self.db
            .size_on_disk()
            .map_err(|e| Error::store("cannot size store", e))
    }

    fn flush(&self) -> Result<(), Error> {
        self.tree
            .flush()
            .map_err(|e| Error::store("cannot flush store", e))?;
        if let Some(e) = self.flush_err.lock().take() {
            return Err(Error::store("asynchronous flush failed", e));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.stop_flusher();
        self.flush()?;
        info!("closed index store");
        Ok(())
    }

    fn iter(&self) -> Result<ValueIter<'_>, Error> {
        self.flush()?;
        Ok(Box::new(SledIter {
            store: self,
            inner: self.tree.iter(),
            seen: HashSet::new(),
        }))
    }
}

impl Drop for SledIndexer {
    fn drop(&mut self) {
        self.stop_flusher();
    }
}

/// Iterator over all indexed multihashes with their resolved values.
///
/// Keys come back from the store in their transformed form; each one is
/// unwrapped, filtered to the index keyspace, reversed back into the
/// original multihash, and deduplicated before its values are resolved the
/// same way `get` resolves them (repair included).
struct SledIter<'a> {
    store: &'a SledIndexer,
    inner: sled::Iter,
    seen: HashSet<Vec<u8>>,
}

impl Iterator for SledIter<'_> {
    type Item = Result<(Multihash, Vec<Value>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(entry) = self.inner.next() else {
                // Scan finished; the dedup set has no further use.
                self.seen = HashSet::new();
                return None;
            };
            let raw_key = match entry {
                Ok((k, _)) => k,
                Err(e) => return Some(Err(Error::store("cannot iterate store", e))),
            };
            let mh = match multihash_from_stored_key(&raw_key) {
                Ok(Some(mh)) => mh,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            if !self.seen.insert(mh.to_bytes()) {
                continue;
            }
            let value_keys = match self.store.get_value_keys(&raw_key) {
                Ok(Some(keys)) => keys,
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            };
            let values = match self.store.get_values(&raw_key, value_keys) {
                Ok(values) => values,
                Err(e) => return Some(Err(e)),
            };
            if values.is_empty() {
                continue;
            }
            return Some(Ok((mh, values)));
        }
    }
}
