#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Core types for the value-normalized content index.
//!
//! An index maps multihashes to the set of provider records that advertise
//! them. This crate defines the record types, the canonical codec used to
//! persist them, and the [`Indexer`] interface implemented by both the
//! in-memory cache and the persistent engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;

pub use codec::CodecError;

/// Multihash type used as the index key. Standard digests are at most 64
/// bytes, so the 64-byte allocation covers every key a caller can submit.
pub type Multihash = multihash::Multihash<64>;

/// Errors surfaced by index operations.
#[derive(Debug, Error)]
pub enum Error {
    /// `put` requires every value to carry metadata, even if it is only a
    /// protocol identifier.
    #[error("value missing metadata")]
    MissingMetadata,
    /// A persisted record or key failed to decode.
    #[error("corrupt record: {0}")]
    Codec(#[from] CodecError),
    /// Failure reported by the backing store, tagged with the operation
    /// that hit it.
    #[error("{op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A provider removal was cancelled before the scan finished.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap a backing-store failure with the operation that observed it.
    pub fn store(
        op: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Store {
            op,
            source: source.into(),
        }
    }
}

/// Opaque identifier for a content provider (peer identity bytes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(Vec<u8>);

impl ProviderId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<&[u8]> for ProviderId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// A provider record: who advertises the content and under which
/// advertisement context, plus opaque metadata describing how to retrieve it.
///
/// Identity is defined over `(provider_id, context_id)`. Two values with the
/// same pair but different metadata are the same record at different times;
/// storing the newer one replaces the older.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// The provider advertising the content.
    pub provider_id: ProviderId,
    /// Caller-assigned scope grouping a batch of advertisements.
    pub context_id: Vec<u8>,
    /// Opaque retrieval metadata. Must be non-empty on insert.
    pub metadata: Vec<u8>,
}

impl Value {
    pub fn new(
        provider_id: ProviderId,
        context_id: impl Into<Vec<u8>>,
        metadata: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            provider_id,
            context_id: context_id.into(),
            metadata: metadata.into(),
        }
    }

    /// True when `other` identifies the same record, ignoring metadata.
    pub fn matches(&self, other: &Value) -> bool {
        self.provider_id == other.provider_id && self.context_id == other.context_id
    }

    /// True when this record has the given provider and context.
    pub fn has_context(&self, provider_id: &ProviderId, context_id: &[u8]) -> bool {
        self.provider_id == *provider_id && self.context_id == context_id
    }
}

/// Cancellation token observed by long-running scans.
///
/// Cloning shares the underlying flag, so a caller can hand a clone to
/// [`Indexer::remove_provider`] and cancel it from another thread.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fallible stream of `(multihash, values)` pairs produced by [`Indexer::iter`].
pub type ValueIter<'a> = Box<dyn Iterator<Item = Result<(Multihash, Vec<Value>), Error>> + 'a>;

/// Uniform operations over an index backend.
///
/// Implemented by both the persistent engine and the in-memory cache; which
/// one backs a deployment is a construction-time decision.
pub trait Indexer {
    /// Look up all values advertised for `mh`. `Ok(None)` means the
    /// multihash is not indexed.
    fn get(&self, mh: &Multihash) -> Result<Option<Vec<Value>>, Error>;

    /// Record `value` as a provider of every multihash in `mhs`. Inserting
    /// an already-present value is a no-op; a value with the same
    /// `(provider, context)` but different metadata replaces the stored
    /// record. An empty `mhs` probes and refreshes the value record without
    /// creating it.
    fn put(&self, value: Value, mhs: &[Multihash]) -> Result<(), Error>;

    /// Remove `value` from every multihash in `mhs`. The value record
    /// itself is retained; other multihashes may still reference it.
    fn remove(&self, value: &Value, mhs: &[Multihash]) -> Result<(), Error>;

    /// Remove every record belonging to `provider_id`. May scan the whole
    /// store; checks `cancel` periodically and stops with
    /// [`Error::Cancelled`] when it fires.
    fn remove_provider(
        &self,
        cancel: &Cancellation,
        provider_id: &ProviderId,
    ) -> Result<(), Error>;

    /// Remove the single record identified by `(provider_id, context_id)`.
    /// Index entries still naming it are repaired lazily on read.
    fn remove_provider_context(
        &self,
        provider_id: &ProviderId,
        context_id: &[u8],
    ) -> Result<(), Error>;

    /// Storage footprint in bytes.
    fn size(&self) -> Result<u64, Error>;

    /// Push buffered writes to durable storage and surface any asynchronous
    /// write error observed since the last flush.
    fn flush(&self) -> Result<(), Error>;

    /// Flush and release resources. Must be the last call on the instance.
    fn close(&self) -> Result<(), Error>;

    /// Iterate all indexed multihashes with their current values. Each
    /// multihash is yielded at most once, always with a non-empty list.
    fn iter(&self) -> Result<ValueIter<'_>, Error>;
}
