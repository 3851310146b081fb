#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Sharded in-memory backend for the value-normalized content index.
//!
//! Keys are spread over a set of independently locked shards, each holding
//! two rotating generations of entries. Only the shard touched by a write
//! ever rotates, so the cache stays within its configured capacity (within
//! a factor of two) without a global sweep, and entries age out
//! incrementally. Equal values are interned per shard so that indexing the
//! same provider record under millions of multihashes stores it once.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use indexer_core::{Cancellation, CodecError, Error, Indexer, Multihash, ProviderId, Value, ValueIter};

mod shard;

use shard::Shard;

/// Shard count for caches of meaningful size. Must be a power of two; the
/// shard is chosen by masking the last key byte.
const CONCURRENCY: usize = 16;

/// Aggregate counters over all shards.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of indexed multihashes.
    pub indexes: u64,
    /// Total value references across all index entries.
    pub values: u64,
    /// Distinct value allocations referenced by index entries.
    pub unique_values: u64,
    /// Entries held by the shard interners.
    pub interned_values: u64,
    /// Generation rotations performed since construction.
    pub rotations: u64,
}

/// In-memory implementation of [`Indexer`].
pub struct ShardedCache {
    shards: Vec<Mutex<Shard>>,
}

impl ShardedCache {
    /// Create a cache that holds roughly `capacity` multihash entries.
    /// Small capacities get a single shard so the rotation window is not
    /// fragmented into uselessly small generations.
    pub fn new(capacity: usize) -> Self {
        let count = if capacity < 256 { 1 } else { CONCURRENCY };
        let rotate_size = capacity / (count * 2);
        debug!(capacity, shards = count, rotate_size, "creating sharded cache");
        let shards = (0..count).map(|_| Mutex::new(Shard::new(rotate_size))).collect();
        Self { shards }
    }

    /// Shard index for a key: the low bits of its last byte.
    fn shard_index(&self, key: &[u8]) -> usize {
        key.last()
            .map_or(0, |b| usize::from(*b) & (self.shards.len() - 1))
    }

    /// Store `value` for one multihash; returns true when the cache changed.
    pub fn put_check(&self, mh: &Multihash, value: &Value) -> bool {
        let key = mh.to_bytes();
        self.shards[self.shard_index(&key)].lock().put(&key, value)
    }

    /// Store `value` for many multihashes; returns the number of entries
    /// that changed.
    ///
    /// The value is interned once in the first shard touched and the
    /// resulting allocation is reused when interning into every further
    /// shard, so the record is cloned at most once per shard rather than
    /// once per multihash.
    pub fn put_many_count(&self, mhs: &[Multihash], value: &Value) -> u64 {
        let mut stored = 0usize;
        if self.shards.len() == 1 {
            let mut shard = self.shards[0].lock();
            for mh in mhs {
                if shard.put(&mh.to_bytes(), value) {
                    stored += 1;
                }
            }
            return u64::try_from(stored).unwrap_or(u64::MAX);
        }

        let mut reuse: Option<Arc<Value>> = None;
        let mut interned: Vec<Option<Arc<Value>>> = vec![None; self.shards.len()];
        for mh in mhs {
            let key = mh.to_bytes();
            let idx = self.shard_index(&key);
            let ent = match &interned[idx] {
                Some(ent) => ent.clone(),
                None => {
                    let mut shard = self.shards[idx].lock();
                    let ent = match &reuse {
                        None => shard.intern(value),
                        Some(exemplar) => shard.intern_shared(exemplar),
                    };
                    drop(shard);
                    if reuse.is_none() {
                        reuse = Some(ent.clone());
                    }
                    interned[idx] = Some(ent.clone());
                    ent
                }
            };
            if self.shards[idx].lock().put_interned(&key, ent) {
                stored += 1;
            }
        }
        u64::try_from(stored).unwrap_or(u64::MAX)
    }

    /// Remove `value` from one multihash; returns true when an entry was
    /// removed.
    pub fn remove_check(&self, mh: &Multihash, value: &Value) -> bool {
        let key = mh.to_bytes();
        self.shards[self.shard_index(&key)].lock().remove(&key, value)
    }

    /// Remove `value` from many multihashes; returns the number of entries
    /// removed.
    pub fn remove_many_count(&self, mhs: &[Multihash], value: &Value) -> u64 {
        let mut removed = 0usize;
        for mh in mhs {
            let key = mh.to_bytes();
            if self.shards[self.shard_index(&key)].lock().remove(&key, value) {
                removed += 1;
            }
        }
        u64::try_from(removed).unwrap_or(u64::MAX)
    }

    /// Remove every record of `provider_id`, fanning out over shards in
    /// parallel. Returns the number of entries removed.
    pub fn remove_provider_count(&self, provider_id: &ProviderId) -> u64 {
        let total = self.fan_out(|shard| shard.remove_provider(provider_id));
        u64::try_from(total).unwrap_or(u64::MAX)
    }

    /// Remove every record matching `(provider_id, context_id)`. Returns
    /// the number of entries removed.
    pub fn remove_provider_context_count(
        &self,
        provider_id: &ProviderId,
        context_id: &[u8],
    ) -> u64 {
        let total = self.fan_out(|shard| shard.remove_provider_context(provider_id, context_id));
        u64::try_from(total).unwrap_or(u64::MAX)
    }

    /// Aggregate counters over all shards, collected in parallel.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .shards
                .iter()
                .map(|shard| scope.spawn(move || shard.lock().stats()))
                .collect();
            for handle in handles {
                let stats = handle.join().unwrap_or_default();
                total.indexes += u64::try_from(stats.indexes).unwrap_or(u64::MAX);
                total.values += u64::try_from(stats.values).unwrap_or(u64::MAX);
                total.unique_values += u64::try_from(stats.unique_values).unwrap_or(u64::MAX);
                total.interned_values += u64::try_from(stats.interned_values).unwrap_or(u64::MAX);
                total.rotations += stats.rotations;
            }
        });
        total
    }

    fn fan_out(&self, op: impl Fn(&mut Shard) -> usize + Sync) -> usize {
        let op = &op;
        let mut total = 0;
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .shards
                .iter()
                .map(|shard| scope.spawn(move || op(&mut shard.lock())))
                .collect();
            for handle in handles {
                total += handle.join().unwrap_or(0);
            }
        });
        total
    }
}

impl Indexer for ShardedCache {
    fn get(&self, mh: &Multihash) -> Result<Option<Vec<Value>>, Error> {
        let key = mh.to_bytes();
        let found = self.shards[self.shard_index(&key)].lock().get(&key);
        Ok(found.map(|list| list.iter().map(|v| (**v).clone()).collect()))
    }

    fn put(&self, value: Value, mhs: &[Multihash]) -> Result<(), Error> {
        if value.metadata.is_empty() {
            return Err(Error::MissingMetadata);
        }
        // No value table to probe; an empty multihash list is a no-op here.
        self.put_many_count(mhs, &value);
        Ok(())
    }

    fn remove(&self, value: &Value, mhs: &[Multihash]) -> Result<(), Error> {
        self.remove_many_count(mhs, value);
        Ok(())
    }

    fn remove_provider(
        &self,
        _cancel: &Cancellation,
        provider_id: &ProviderId,
    ) -> Result<(), Error> {
        self.remove_provider_count(provider_id);
        Ok(())
    }

    fn remove_provider_context(
        &self,
        provider_id: &ProviderId,
        context_id: &[u8],
    ) -> Result<(), Error> {
        self.remove_provider_context_count(provider_id, context_id);
        Ok(())
    }

    fn size(&self) -> Result<u64, Error> {
        // No persistent footprint.
        Ok(0)
    }

    fn flush(&self) -> Result<(), Error> {
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }

    fn iter(&self) -> Result<ValueIter<'_>, Error> {
        let mut snapshot = Vec::new();
        for shard in &self.shards {
            for (key, values) in shard.lock().entries() {
                let mh = Multihash::from_bytes(&key)
                    .map_err(|e| Error::Codec(CodecError::Key(e)))?;
                snapshot.push(Ok((mh, values)));
            }
        }
        Ok(Box::new(snapshot.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash_codetable::{Code, MultihashDigest};

    fn mh(i: u64) -> Multihash {
        Code::Sha2_256.digest(&i.to_le_bytes())
    }

    fn value(provider: &[u8], ctx: &[u8], meta: &[u8]) -> Value {
        Value::new(ProviderId::new(provider.to_vec()), ctx.to_vec(), meta.to_vec())
    }

    #[test]
    fn put_get_roundtrip() {
        let cache = ShardedCache::new(1024);
        let v = value(b"p1", b"ctx", &[1]);
        let mhs: Vec<_> = (0..10).map(mh).collect();
        cache.put(v.clone(), &mhs).expect("put");
        let got = cache.get(&mhs[5]).expect("get").expect("present");
        assert_eq!(got, vec![v]);
    }

    #[test]
    fn get_missing_is_none() {
        let cache = ShardedCache::new(1024);
        assert!(cache.get(&mh(99)).expect("get").is_none());
    }

    #[test]
    fn put_requires_metadata() {
        let cache = ShardedCache::new(1024);
        let v = value(b"p1", b"ctx", &[]);
        assert!(matches!(
            cache.put(v, &[mh(1)]),
            Err(Error::MissingMetadata)
        ));
    }

    #[test]
    fn put_check_reports_changes() {
        let cache = ShardedCache::new(1024);
        let m = mh(1);
        let v = value(b"p1", b"ctx", &[1]);
        assert!(cache.put_check(&m, &v));
        assert!(!cache.put_check(&m, &v));
        // A metadata refresh counts as a change.
        assert!(cache.put_check(&m, &value(b"p1", b"ctx", &[2])));
    }

    #[test]
    fn remove_check_reports_removal() {
        let cache = ShardedCache::new(1024);
        let m = mh(1);
        let v = value(b"p1", b"ctx", &[1]);
        assert!(!cache.remove_check(&m, &v));
        cache.put_check(&m, &v);
        assert!(cache.remove_check(&m, &v));
        assert!(cache.get(&m).expect("get").is_none());
        assert!(!cache.remove_check(&m, &v));
    }

    #[test]
    fn duplicate_put_counts_nothing() {
        let cache = ShardedCache::new(1024);
        let v = value(b"p1", b"ctx", &[1]);
        let mhs: Vec<_> = (0..20).map(mh).collect();
        assert_eq!(cache.put_many_count(&mhs, &v), 20);
        assert_eq!(cache.put_many_count(&mhs, &v), 0);
        assert_eq!(cache.stats().values, 20);
    }

    #[test]
    fn metadata_update_is_observable_everywhere_it_lands() {
        let cache = ShardedCache::new(1024);
        let m = mh(7);
        cache.put(value(b"p1", b"ctx", &[1]), &[m]).expect("put");
        cache.put(value(b"p1", b"ctx", &[2]), &[m]).expect("put");
        let got = cache.get(&m).expect("get").expect("present");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].metadata, vec![2]);
    }

    #[test]
    fn put_many_interns_once_per_shard() {
        let cache = ShardedCache::new(1024);
        let v = value(b"p1", b"ctx", &[1]);
        let mhs: Vec<_> = (0..200).map(mh).collect();
        cache.put_many_count(&mhs, &v);
        let stats = cache.stats();
        assert_eq!(stats.values, 200);
        // One allocation per touched shard, never one per multihash.
        assert!(stats.unique_values <= CONCURRENCY as u64);
        assert_eq!(stats.unique_values, stats.interned_values);
    }

    #[test]
    fn multiple_providers_per_multihash() {
        let cache = ShardedCache::new(1024);
        let m = mh(1);
        cache.put(value(b"p1", b"a", &[1]), &[m]).expect("put");
        cache.put(value(b"p2", b"b", &[1]), &[m]).expect("put");
        let got = cache.get(&m).expect("get").expect("present");
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn remove_many() {
        let cache = ShardedCache::new(1024);
        let v = value(b"p1", b"ctx", &[1]);
        let mhs: Vec<_> = (0..50).map(mh).collect();
        cache.put(v.clone(), &mhs).expect("put");
        assert_eq!(cache.remove_many_count(&mhs, &v), 50);
        for m in &mhs {
            assert!(cache.get(m).expect("get").is_none());
        }
    }

    #[test]
    fn remove_provider_leaves_other_providers() {
        let cache = ShardedCache::new(1024);
        let m = mh(1);
        cache.put(value(b"p1", b"a", &[1]), &[m]).expect("put");
        cache.put(value(b"p2", b"b", &[1]), &[m]).expect("put");
        assert_eq!(
            cache.remove_provider_count(&ProviderId::new(b"p1".to_vec())),
            1
        );
        let got = cache.get(&m).expect("get").expect("present");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].provider_id, ProviderId::new(b"p2".to_vec()));
    }

    #[test]
    fn remove_provider_context_is_scoped() {
        let cache = ShardedCache::new(1024);
        let m = mh(1);
        let p = ProviderId::new(b"p1".to_vec());
        cache.put(value(b"p1", b"a", &[1]), &[m]).expect("put");
        cache.put(value(b"p1", b"b", &[1]), &[m]).expect("put");
        cache
            .remove_provider_context(&p, b"a")
            .expect("remove context");
        let got = cache.get(&m).expect("get").expect("present");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].context_id, b"b".to_vec());
    }

    #[test]
    fn iter_yields_every_key_once() {
        let cache = ShardedCache::new(1024);
        let v = value(b"p1", b"ctx", &[1]);
        let mhs: Vec<_> = (0..30).map(mh).collect();
        cache.put(v.clone(), &mhs).expect("put");
        let mut seen = std::collections::HashSet::new();
        for entry in cache.iter().expect("iter") {
            let (m, values) = entry.expect("entry");
            assert!(!values.is_empty());
            assert!(seen.insert(m.to_bytes()));
        }
        assert_eq!(seen.len(), 30);
    }

    #[test]
    fn small_capacity_uses_one_shard() {
        let cache = ShardedCache::new(64);
        assert_eq!(cache.shards.len(), 1);
        let cache = ShardedCache::new(4096);
        assert_eq!(cache.shards.len(), CONCURRENCY);
    }

    #[test]
    fn concurrent_puts_and_gets() {
        let cache = std::sync::Arc::new(ShardedCache::new(4096));
        let mhs: Vec<_> = (0..100).map(mh).collect();
        thread::scope(|scope| {
            for t in 0..4u8 {
                let cache = cache.clone();
                let mhs = mhs.clone();
                scope.spawn(move || {
                    let v = value(&[b'p', t], b"ctx", &[1]);
                    cache.put(v, &mhs).expect("put");
                    for m in &mhs {
                        cache.get(m).expect("get");
                    }
                });
            }
        });
        for m in &mhs {
            let got = cache.get(m).expect("get").expect("present");
            assert_eq!(got.len(), 4);
        }
    }
}
