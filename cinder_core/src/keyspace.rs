//! Abstractions the core consumes: the keyspace holding keyed objects with
//! optional expirations, and the codec that serializes object payloads for
//! dump transfer.

use crate::config::EncodingConfig;
use crate::object::Obj;
use std::fmt;

pub trait Keyspace {
    /// Looks a key up, expiring it lazily if its deadline passed.
    fn lookup(&mut self, key: &[u8], now_ms: u64) -> Option<Obj>;

    /// Inserts or replaces a key.
    fn add(&mut self, key: &[u8], value: Obj);

    /// Removes a key and its expire. Returns false when absent.
    fn delete(&mut self, key: &[u8]) -> bool;

    fn set_expire(&mut self, key: &[u8], at_ms: u64);

    fn get_expire(&self, key: &[u8]) -> Option<u64>;

    fn remove_expire(&mut self, key: &[u8]) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts up to `limit` keys whose expiration passed, returning the
    /// evicted key names so the caller can emit notifications.
    fn sweep_expired(&mut self, now_ms: u64, limit: usize) -> Vec<Vec<u8>>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    Corrupt,
    UnknownType(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::Corrupt => write!(f, "corrupt payload"),
            CodecError::UnknownType(t) => write!(f, "unknown object type {}", t),
        }
    }
}

/// Serializes object payloads for DUMP/RESTORE/MIGRATE transfer.
pub trait ObjectCodec {
    fn save_object_type(&self, out: &mut Vec<u8>, value: &Obj);

    fn save_object(&self, out: &mut Vec<u8>, value: &Obj) -> Result<(), CodecError>;

    fn load_object_type(&self, payload: &[u8]) -> Result<u8, CodecError>;

    /// Rebuilds an object from its serialized body, re-applying the compact
    /// encoding thresholds the way a fresh load does.
    fn load_object(
        &self,
        type_code: u8,
        body: &[u8],
        encodings: &EncodingConfig,
        share: bool,
    ) -> Result<Obj, CodecError>;
}
