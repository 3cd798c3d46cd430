//! In-process store backends.
//!
//! Used when no storage path is configured and as test doubles. Both types
//! can be switched into an "unavailable" mode to exercise adapter failures,
//! and object upserts can be slowed down to widen races.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{CasOutcome, DurableStore, EphemeralStore, StoreError, UpsertOutcome};
use crate::model::{sort_by_ordering_key, CanvasObject, ChatMessage, Room};

fn poisoned() -> StoreError {
    StoreError::Database("store mutex poisoned".into())
}

/// Ordered in-memory key-value map.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory kv switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EphemeralStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check()?;
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<CasOutcome, StoreError> {
        self.check()?;
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let current = entries.get(key).map(String::as_str);
        if current != expected {
            return Ok(CasOutcome::Mismatch(current.map(str::to_string)));
        }
        match new {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => entries.remove(key),
        };
        Ok(CasOutcome::Applied)
    }
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<String, Room>,
    objects: BTreeMap<String, CanvasObject>,
    messages: Vec<ChatMessage>,
}

/// Counters for assertions on durable traffic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseStats {
    pub upserts: u64,
    pub deletes: u64,
    pub room_creates: u64,
    pub object_queries: u64,
}

/// In-memory relational stand-in with the same integrity rules as the
/// RocksDB backend.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    upsert_delay_ms: AtomicU64,
    upserts: AtomicU64,
    deletes: AtomicU64,
    room_creates: AtomicU64,
    object_queries: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every object upsert sleeps this long before it writes.
    pub fn set_upsert_delay(&self, delay: Duration) {
        self.upsert_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            upserts: self.upserts.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
            room_creates: self.room_creates.load(Ordering::SeqCst),
            object_queries: self.object_queries.load(Ordering::SeqCst),
        }
    }

    /// Number of object rows across all rooms.
    pub fn object_count(&self) -> usize {
        self.tables.lock().map(|t| t.objects.len()).unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory database switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryDatabase {
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        Ok(tables.rooms.get(room_id).cloned())
    }

    async fn create_room_if_absent(&self, room: Room) -> Result<Room, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        let stored = tables.rooms.entry(room.id.clone()).or_insert_with(|| {
            self.room_creates.fetch_add(1, Ordering::SeqCst);
            room
        });
        Ok(stored.clone())
    }

    async fn upsert_object(&self, object: &CanvasObject) -> Result<UpsertOutcome, StoreError> {
        self.check()?;
        let delay = self.upsert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        if !tables.rooms.contains_key(&object.room_id) {
            return Err(StoreError::UnknownRoom(object.room_id.clone()));
        }
        let outcome = match tables.objects.get(&object.id) {
            Some(existing) if existing.room_id != object.room_id => {
                return Err(StoreError::RoomMismatch {
                    object_id: object.id.clone(),
                    existing: existing.room_id.clone(),
                    requested: object.room_id.clone(),
                });
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        };
        tables.objects.insert(object.id.clone(), object.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn get_object(&self, object_id: &str) -> Result<Option<CanvasObject>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        Ok(tables.objects.get(object_id).cloned())
    }

    async fn delete_object(&self, object_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        let removed = tables.objects.remove(object_id).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    async fn objects_in_room(&self, room_id: &str) -> Result<Vec<CanvasObject>, StoreError> {
        self.check()?;
        self.object_queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        let mut objects: Vec<CanvasObject> = tables
            .objects
            .values()
            .filter(|o| o.room_id == room_id)
            .cloned()
            .collect();
        sort_by_ordering_key(&mut objects);
        Ok(objects)
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().map_err(|_| poisoned())?;
        if !tables.rooms.contains_key(&message.room_id) {
            return Err(StoreError::UnknownRoom(message.room_id.clone()));
        }
        tables.messages.push(message.clone());
        Ok(())
    }

    async fn messages_in_room(&self, room_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().map_err(|_| poisoned())?;
        Ok(tables
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect())
    }
}
