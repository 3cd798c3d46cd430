//! Storage adapters.
//!
//! ```text
//! ┌──────────────┐  staging / locks / markers  ┌────────────────┐
//! │ Coordinator  │ ──────────────────────────► │ EphemeralStore │
//! │  + pipeline  │                             │ (kv, prefix    │
//! │  + cache     │                             │  scan, CAS)    │
//! └──────┬───────┘                             └────────────────┘
//!        │ rooms / objects / messages
//!        ▼
//! ┌──────────────┐
//! │ DurableStore │  authoritative records, referential integrity
//! └──────────────┘
//! ```
//!
//! Both traits are thin: no business logic lives behind them. Two backends
//! ship with the crate: in-process maps ([`memory`]) and RocksDB ([`rocks`]).

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{CanvasObject, ChatMessage, Room};

pub use memory::{MemoryDatabase, MemoryKv};
pub use rocks::{RocksDatabase, RocksKv, StoreConfig};

/// Key prefix for staged object writes.
pub const OBJECT_PREFIX: &str = "object:";
/// Key prefix for lock ownership.
pub const LOCK_PREFIX: &str = "lock:";
/// Key prefix for room-existence markers.
pub const ROOM_PREFIX: &str = "room:";

pub fn object_key(object_id: &str) -> String {
    format!("{OBJECT_PREFIX}{object_id}")
}

pub fn lock_key(object_id: &str) -> String {
    format!("{LOCK_PREFIX}{object_id}")
}

pub fn room_key(room_id: &str) -> String {
    format!("{ROOM_PREFIX}{room_id}")
}

/// Strip a known prefix from a key, returning the identifier part.
pub fn key_suffix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("room not found: {0}")]
    UnknownRoom(String),
    #[error("object {object_id} belongs to room {existing}, not {requested}")]
    RoomMismatch {
        object_id: String,
        existing: String,
        requested: String,
    },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Result of a compare-and-set on the ephemeral store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected value matched and the new value was written.
    Applied,
    /// The expected value did not match; nothing changed.
    Mismatch(Option<String>),
}

/// Low-latency key-value cache used for staging, locks and room markers.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys starting with `prefix`, in lexical order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically replace `expected` with `new` (None = absent / delete).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<CasOutcome, StoreError>;
}

/// Whether an upsert inserted or replaced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Authoritative store for rooms, objects and messages.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError>;

    /// Insert `room` unless a row with its id exists; returns the stored row
    /// either way, so concurrent creators all observe the single winner.
    async fn create_room_if_absent(&self, room: Room) -> Result<Room, StoreError>;

    /// Insert-or-update by object id. The room must exist and an existing
    /// object may not change rooms.
    async fn upsert_object(&self, object: &CanvasObject) -> Result<UpsertOutcome, StoreError>;

    async fn get_object(&self, object_id: &str) -> Result<Option<CanvasObject>, StoreError>;

    /// Returns whether a row was removed.
    async fn delete_object(&self, object_id: &str) -> Result<bool, StoreError>;

    /// Objects of a room ordered by ordering key ascending.
    async fn objects_in_room(&self, room_id: &str) -> Result<Vec<CanvasObject>, StoreError>;

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// Messages of a room, oldest first.
    async fn messages_in_room(&self, room_id: &str) -> Result<Vec<ChatMessage>, StoreError>;
}
