//! Striped lock pool over index keys.
//!
//! A fixed set of mutexes indexed by a hash of the key: O(1) memory no
//! matter how many keys are live, at the cost of occasional false sharing
//! between keys that land on the same stripe.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::thread;

use parking_lot::{Mutex, MutexGuard};

pub(crate) struct KeyLockPool {
    stripes: Vec<Mutex<()>>,
}

impl KeyLockPool {
    /// Pool sized to the machine's parallelism so concurrent writers on
    /// distinct keys rarely contend.
    pub fn new() -> Self {
        let parallelism = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(8);
        Self::with_stripes(parallelism * 4)
    }

    pub fn with_stripes(stripes: usize) -> Self {
        let count = stripes.max(16).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Exclusive lock for `key`.
    pub fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let mask = u64::try_from(self.stripes.len() - 1).unwrap_or(u64::MAX);
        let idx = usize::try_from(hasher.finish() & mask).unwrap_or(0);
        self.stripes[idx].lock()
    }
}
