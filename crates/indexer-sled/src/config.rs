//! Construction-time options for the persistent engine.

use std::time::Duration;

pub const DEFAULT_INDEX_BIT_SIZE: u8 = 24;
pub const DEFAULT_INDEX_FILE_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BURST_RATE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Engine tuning knobs, all defaulted. Setters can be chained; a later
/// setter overrides an earlier one.
///
/// `sync_interval` drives the engine's background flush loop and
/// `index_file_size` sizes the store's cache. The remaining knobs are
/// accepted for callers tuned against backends that expose them directly;
/// sled manages index layout, write batching, and space reclamation
/// internally.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bit width of the on-disk index.
    pub index_bit_size: u8,
    /// Target size of index storage before rollover.
    pub index_file_size: u64,
    /// Period of the background flush loop.
    pub sync_interval: Duration,
    /// Soft cap on outstanding write work before backpressure.
    pub burst_rate: u64,
    /// Period of store garbage collection.
    pub gc_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_bit_size: DEFAULT_INDEX_BIT_SIZE,
            index_file_size: DEFAULT_INDEX_FILE_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            burst_rate: DEFAULT_BURST_RATE,
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index_bit_size(mut self, bits: u8) -> Self {
        self.index_bit_size = bits;
        self
    }

    pub fn with_index_file_size(mut self, bytes: u64) -> Self {
        self.index_file_size = bytes;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_burst_rate(mut self, bytes: u64) -> Self {
        self.burst_rate = bytes;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}
