//! Key derivation for the two stored keyspaces.
//!
//! Both keyspaces live in one tree and are told apart by a trailing domain
//! tag: index entries end in `'I'`, value entries in `'M'`. Every stored key
//! is identity-wrapped so it remains a well-formed multihash.

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

use indexer_core::{CodecError, Error, Multihash, ProviderId};

/// Bytes of `blake2b(provider + context)` used to identify a value record.
pub(crate) const VALUE_KEY_SIZE: usize = 20;

pub(crate) const INDEX_KEY_SUFFIX: u8 = b'I';
pub(crate) const VALUE_KEY_SUFFIX: u8 = b'M';

const IDENTITY: u64 = 0x00;

/// Stored keys are identity-wrapped multihashes. The widest is a reversed
/// 64-byte-digest multihash plus the domain tag, comfortably under 128.
type StoredKey = multihash::Multihash<128>;

/// Index-table key for a multihash: the multihash bytes reversed, tagged
/// with `'I'`. Reversal puts the hash-distributed digest tail first so the
/// store's key ordering is spread evenly.
pub(crate) fn make_index_key(mh: &Multihash) -> Vec<u8> {
    let mut data = mh.to_bytes();
    data.reverse();
    data.push(INDEX_KEY_SUFFIX);
    wrap(&data)
}

/// Value-table key for a `(provider, context)` pair: a fixed-size blake2b
/// digest tagged with `'M'`. Deterministic, so a metadata update lands on
/// the same record.
pub(crate) fn make_value_key(provider_id: &ProviderId, context_id: &[u8]) -> Vec<u8> {
    let mut hasher = Blake2bVar::new(VALUE_KEY_SIZE).expect("blake2b supports 20-byte output");
    hasher.update(provider_id.as_bytes());
    hasher.update(context_id);
    let mut digest = [0u8; VALUE_KEY_SIZE];
    hasher
        .finalize_variable(&mut digest)
        .expect("buffer matches configured output size");
    let mut data = Vec::with_capacity(VALUE_KEY_SIZE + 1);
    data.extend_from_slice(&digest);
    data.push(VALUE_KEY_SUFFIX);
    wrap(&data)
}

fn wrap(data: &[u8]) -> Vec<u8> {
    StoredKey::wrap(IDENTITY, data)
        .expect("stored key digests fit the wrap limit")
        .to_bytes()
}

/// Recover the original multihash from a raw stored key, or `None` when the
/// key belongs to the value table.
pub(crate) fn multihash_from_stored_key(raw: &[u8]) -> Result<Option<Multihash>, Error> {
    let wrapped = StoredKey::from_bytes(raw).map_err(|e| Error::Codec(CodecError::Key(e)))?;
    match wrapped.digest().split_last() {
        Some((&INDEX_KEY_SUFFIX, reversed)) => {
            let mut bytes = reversed.to_vec();
            bytes.reverse();
            let mh =
                Multihash::from_bytes(&bytes).map_err(|e| Error::Codec(CodecError::Key(e)))?;
            Ok(Some(mh))
        }
        _ => Ok(None),
    }
}

/// True when a raw stored key belongs to the value table.
pub(crate) fn is_value_key(raw: &[u8]) -> Result<bool, Error> {
    let wrapped = StoredKey::from_bytes(raw).map_err(|e| Error::Codec(CodecError::Key(e)))?;
    Ok(wrapped.digest().last() == Some(&VALUE_KEY_SUFFIX))
}
