//! A single cache shard: two rotating generations of a key → values map
//! plus a value interner.
//!
//! Rotation discards the older generation wholesale, so a shard holds at
//! most `2 * rotate_size` keys and entries age out in generation-sized
//! steps. Lookups promote hits from the old generation into the current one
//! to keep hot entries alive across rotations.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use indexer_core::{ProviderId, Value};

/// Interner key: the `(provider, context)` pair that defines value identity.
type InternKey = (Vec<u8>, Vec<u8>);

/// Counters reported by a single shard.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ShardStats {
    pub indexes: usize,
    pub values: usize,
    pub unique_values: usize,
    pub interned_values: usize,
    pub rotations: u64,
}

pub(crate) struct Shard {
    current: HashMap<Vec<u8>, Vec<Arc<Value>>>,
    old: HashMap<Vec<u8>, Vec<Arc<Value>>>,
    /// One live value per `(provider, context)` pair; equal values inserted
    /// under many keys share this allocation.
    interns: HashMap<InternKey, Arc<Value>>,
    rotate_size: usize,
    rotations: u64,
}

fn intern_key(value: &Value) -> InternKey {
    (
        value.provider_id.as_bytes().to_vec(),
        value.context_id.clone(),
    )
}

/// Insert `ent` into `list`, replacing a stale record for the same
/// `(provider, context)`. Returns false when the list already holds an
/// up-to-date copy.
fn update_list(list: &mut Vec<Arc<Value>>, ent: Arc<Value>) -> bool {
    for slot in list.iter_mut() {
        if slot.matches(&ent) {
            if slot.metadata == ent.metadata {
                return false;
            }
            *slot = ent;
            return true;
        }
    }
    list.push(ent);
    true
}

impl Shard {
    pub fn new(rotate_size: usize) -> Self {
        Self {
            current: HashMap::new(),
            old: HashMap::new(),
            interns: HashMap::new(),
            rotate_size,
            rotations: 0,
        }
    }

    /// Look up `key`, promoting a hit from the old generation.
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<Arc<Value>>> {
        if let Some(list) = self.current.get(key) {
            return Some(list.clone());
        }
        let list = self.old.remove(key)?;
        self.current.insert(key.to_vec(), list.clone());
        Some(list)
    }

    /// Intern `value`, returning the shared instance for its
    /// `(provider, context)` pair. A metadata change replaces the interned
    /// instance so later inserts pick up the new record.
    pub fn intern(&mut self, value: &Value) -> Arc<Value> {
        match self.interns.get(&intern_key(value)) {
            Some(existing) if existing.metadata == value.metadata => existing.clone(),
            _ => {
                let ent = Arc::new(value.clone());
                self.interns.insert(intern_key(value), ent.clone());
                ent
            }
        }
    }

    /// Intern a value already interned in another shard, reusing its
    /// allocation instead of cloning the record again.
    pub fn intern_shared(&mut self, ent: &Arc<Value>) -> Arc<Value> {
        match self.interns.get(&intern_key(ent)) {
            Some(existing) if existing.metadata == ent.metadata => existing.clone(),
            _ => {
                self.interns.insert(intern_key(ent), ent.clone());
                ent.clone()
            }
        }
    }

    /// Store an interned value under `key`. Returns true when the shard
    /// changed (new key, new value for the key, or metadata refresh).
    pub fn put_interned(&mut self, key: &[u8], ent: Arc<Value>) -> bool {
        if let Some(list) = self.current.get_mut(key) {
            return update_list(list, ent);
        }
        if let Some(mut list) = self.old.remove(key) {
            let changed = update_list(&mut list, ent);
            self.current.insert(key.to_vec(), list);
            return changed;
        }
        if self.rotate_size > 0 && self.current.len() >= self.rotate_size {
            self.rotate();
        }
        self.current.insert(key.to_vec(), vec![ent]);
        true
    }

    pub fn put(&mut self, key: &[u8], value: &Value) -> bool {
        let ent = self.intern(value);
        self.put_interned(key, ent)
    }

    /// Remove the record matching `value` on `(provider, context)` from
    /// `key`'s list. Returns true when a record was removed.
    pub fn remove(&mut self, key: &[u8], value: &Value) -> bool {
        for map in [&mut self.current, &mut self.old] {
            if let Some(list) = map.get_mut(key) {
                let before = list.len();
                list.retain(|e| !e.matches(value));
                let removed = list.len() != before;
                if list.is_empty() {
                    map.remove(key);
                }
                return removed;
            }
        }
        false
    }

    /// Remove every record of `provider_id`; returns the number of entries
    /// removed across all lists.
    pub fn remove_provider(&mut self, provider_id: &ProviderId) -> usize {
        let removed = Self::purge(&mut self.current, |v| v.provider_id == *provider_id)
            + Self::purge(&mut self.old, |v| v.provider_id == *provider_id);
        self.interns.retain(|(p, _), _| p != provider_id.as_bytes());
        removed
    }

    /// Remove every record matching `(provider_id, context_id)`.
    pub fn remove_provider_context(
        &mut self,
        provider_id: &ProviderId,
        context_id: &[u8],
    ) -> usize {
        let removed = Self::purge(&mut self.current, |v| v.has_context(provider_id, context_id))
            + Self::purge(&mut self.old, |v| v.has_context(provider_id, context_id));
        self.interns
            .remove(&(provider_id.as_bytes().to_vec(), context_id.to_vec()));
        removed
    }

    fn purge(
        map: &mut HashMap<Vec<u8>, Vec<Arc<Value>>>,
        dead: impl Fn(&Value) -> bool,
    ) -> usize {
        let mut removed = 0;
        map.retain(|_, list| {
            let before = list.len();
            list.retain(|v| !dead(v));
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Snapshot of every key with its values, both generations.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<Value>)> {
        self.current
            .iter()
            .chain(self.old.iter())
            .map(|(k, list)| (k.clone(), list.iter().map(|v| (**v).clone()).collect()))
            .collect()
    }

    pub fn stats(&self) -> ShardStats {
        let mut values = 0;
        let mut unique = HashSet::new();
        for list in self.current.values().chain(self.old.values()) {
            values += list.len();
            for v in list {
                unique.insert(Arc::as_ptr(v));
            }
        }
        ShardStats {
            indexes: self.current.len() + self.old.len(),
            values,
            unique_values: unique.len(),
            interned_values: self.interns.len(),
            rotations: self.rotations,
        }
    }

    /// Discard the old generation, demote the current one, and drop
    /// interned values no longer referenced by any list.
    fn rotate(&mut self) {
        self.old = mem::take(&mut self.current);
        self.rotations += 1;
        self.interns.retain(|_, ent| Arc::strong_count(ent) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexer_core::ProviderId;

    fn value(provider: &[u8], ctx: &[u8], meta: &[u8]) -> Value {
        Value::new(ProviderId::new(provider.to_vec()), ctx.to_vec(), meta.to_vec())
    }

    #[test]
    fn put_and_get() {
        let mut shard = Shard::new(16);
        let v = value(b"p1", b"a", &[1]);
        assert!(shard.put(b"k1", &v));
        assert!(!shard.put(b"k1", &v));
        let got = shard.get(b"k1").expect("present");
        assert_eq!(got.len(), 1);
        assert_eq!(*got[0], v);
    }

    #[test]
    fn metadata_update_replaces_in_place() {
        let mut shard = Shard::new(16);
        assert!(shard.put(b"k1", &value(b"p1", b"a", &[1])));
        assert!(shard.put(b"k1", &value(b"p1", b"a", &[2])));
        let got = shard.get(b"k1").expect("present");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].metadata, vec![2]);
    }

    #[test]
    fn distinct_contexts_accumulate() {
        let mut shard = Shard::new(16);
        shard.put(b"k1", &value(b"p1", b"a", &[1]));
        shard.put(b"k1", &value(b"p1", b"b", &[1]));
        shard.put(b"k1", &value(b"p2", b"a", &[1]));
        assert_eq!(shard.get(b"k1").expect("present").len(), 3);
    }

    #[test]
    fn equal_values_share_one_allocation() {
        let mut shard = Shard::new(16);
        let v = value(b"p1", b"a", &[1]);
        shard.put(b"k1", &v);
        shard.put(b"k2", &v);
        let a = shard.get(b"k1").expect("present");
        let b = shard.get(b"k2").expect("present");
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert_eq!(shard.stats().unique_values, 1);
    }

    #[test]
    fn rotation_evicts_oldest_generation() {
        let mut shard = Shard::new(2);
        let v = value(b"p1", b"a", &[1]);
        shard.put(b"k1", &v);
        shard.put(b"k2", &v);
        // Third key rotates: k1/k2 demoted, still reachable.
        shard.put(b"k3", &v);
        assert_eq!(shard.stats().rotations, 1);
        assert!(shard.get(b"k2").is_some());
        // k2 was promoted by the get above; fill current and rotate again.
        shard.put(b"k4", &v);
        shard.put(b"k5", &v);
        assert_eq!(shard.stats().rotations, 2);
        // k1 aged out with the discarded generation, promoted k2 survived.
        assert!(shard.get(b"k1").is_none());
        assert!(shard.get(b"k2").is_some());
    }

    #[test]
    fn rotation_prunes_unreferenced_interns() {
        let mut shard = Shard::new(1);
        shard.put(b"k1", &value(b"p1", b"a", &[1]));
        assert_eq!(shard.stats().interned_values, 1);
        // Two rotations drop every list referencing p1/a.
        shard.put(b"k2", &value(b"p2", b"b", &[1]));
        shard.put(b"k3", &value(b"p3", b"c", &[1]));
        assert!(shard.get(b"k1").is_none());
        let stats = shard.stats();
        assert_eq!(stats.rotations, 2);
        assert!(stats.interned_values <= 2);
    }

    #[test]
    fn remove_drops_only_matching_value() {
        let mut shard = Shard::new(16);
        shard.put(b"k1", &value(b"p1", b"a", &[1]));
        shard.put(b"k1", &value(b"p2", b"b", &[1]));
        assert!(shard.remove(b"k1", &value(b"p1", b"a", &[9])));
        let got = shard.get(b"k1").expect("present");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].provider_id, ProviderId::new(b"p2".to_vec()));
        // Removing the last value drops the key.
        assert!(shard.remove(b"k1", &value(b"p2", b"b", &[1])));
        assert!(shard.get(b"k1").is_none());
    }

    #[test]
    fn remove_provider_sweeps_both_generations() {
        let mut shard = Shard::new(1);
        shard.put(b"k1", &value(b"p1", b"a", &[1]));
        shard.put(b"k2", &value(b"p1", b"b", &[1]));
        // k1 now lives in the old generation.
        assert_eq!(shard.remove_provider(&ProviderId::new(b"p1".to_vec())), 2);
        assert!(shard.get(b"k1").is_none());
        assert!(shard.get(b"k2").is_none());
        assert_eq!(shard.stats().interned_values, 0);
    }
}
