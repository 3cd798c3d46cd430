//! Read-through room cache.
//!
//! Holds each room's objects in memory so joins don't hit the durable store
//! every time. Entries are never authoritative: eviction only drops the
//! in-memory copy.
//!
//! ```text
//! get_objects(room) ──hit──► cached Vec (cloned out)
//!        │
//!       miss
//!        ▼
//! DurableStore::objects_in_room + staged `object:` entries of the room
//!        │                     (staged payloads shadow durable rows)
//!        ▼
//! insert (last writer wins)
//! ```
//!
//! Mutations are commutative: replace-if-present, append-if-missing and
//! filter-out. Two racing loads of the same room both read committed data,
//! so whichever lands last is as good as the other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::SyncError;
use crate::model::{sort_by_ordering_key, CanvasObject, Room};
use crate::pipeline::StagedWrite;
use crate::storage::{self, DurableStore, EphemeralStore, OBJECT_PREFIX};

struct CacheEntry {
    objects: Vec<CanvasObject>,
    last_access: Instant,
}

/// Why a room left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Expired,
    Capacity,
}

pub struct RoomCache {
    config: CacheConfig,
    db: Arc<dyn DurableStore>,
    kv: Arc<dyn EphemeralStore>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RoomCache {
    pub fn new(config: CacheConfig, db: Arc<dyn DurableStore>, kv: Arc<dyn EphemeralStore>) -> Self {
        Self {
            config,
            db,
            kv,
            entries: RwLock::new(HashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    /// Look up a room, creating it with a default name if absent, and mark
    /// it as existing in the ephemeral store.
    pub async fn find_or_create_room(&self, room_id: &str) -> Result<Room, SyncError> {
        let room = match self.db.get_room(room_id).await? {
            Some(room) => room,
            None => {
                self.db
                    .create_room_if_absent(Room::with_default_name(room_id))
                    .await?
            }
        };
        self.kv.set(&storage::room_key(room_id), room_id).await?;
        self.touch(room_id).await;
        Ok(room)
    }

    /// Current objects of a room, loading them on a miss.
    pub async fn get_objects(&self, room_id: &str) -> Result<Vec<CanvasObject>, SyncError> {
        {
            let mut entries = self.entries.write().await;
            let now = Instant::now();
            if let Some(entry) = entries.get_mut(room_id) {
                // an entry past its TTL that the sweep hasn't reached yet is a miss
                if now.saturating_duration_since(entry.last_access) <= self.config.ttl {
                    entry.last_access = now;
                    log::trace!("Room cache hit for {room_id}");
                    return Ok(entry.objects.clone());
                }
            }
        }

        log::debug!("Room cache miss for {room_id}, loading from store");
        let mut objects = self.db.objects_in_room(room_id).await?;
        self.overlay_staged(room_id, &mut objects).await?;

        let mut entries = self.entries.write().await;
        entries.insert(
            room_id.to_string(),
            CacheEntry { objects: objects.clone(), last_access: Instant::now() },
        );
        Ok(objects)
    }

    /// Staged payloads are newer than the rows they shadow, and may belong to
    /// objects the durable store has never seen.
    async fn overlay_staged(&self, room_id: &str, objects: &mut Vec<CanvasObject>) -> Result<(), SyncError> {
        for key in self.kv.scan_prefix(OBJECT_PREFIX).await? {
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let staged = match StagedWrite::decode(&key, &raw) {
                Ok(staged) if staged.room_id == room_id => staged.to_object(),
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("Ignoring corrupt staged entry while loading {room_id}: {e}");
                    continue;
                }
            };
            match objects.iter_mut().find(|o| o.id == staged.id) {
                Some(existing) => *existing = staged,
                None => objects.push(staged),
            }
        }
        sort_by_ordering_key(objects);
        Ok(())
    }

    /// Replace an object's payload in the cached room, or append it when the
    /// cache hasn't seen it yet. Creates the room entry on demand.
    pub async fn upsert(&self, room_id: &str, object_id: &str, object_type: &str, data: Value) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(room_id.to_string())
            .or_insert_with(|| CacheEntry { objects: Vec::new(), last_access: Instant::now() });
        entry.last_access = Instant::now();

        match entry.objects.iter_mut().find(|o| o.id == object_id) {
            Some(object) => {
                object.data = data;
                object.object_type = object_type.to_string();
            }
            None => entry.objects.push(CanvasObject {
                id: object_id.to_string(),
                room_id: room_id.to_string(),
                object_type: object_type.to_string(),
                data,
            }),
        }
    }

    /// Drop an object from the cached room. No-op if either is unknown.
    pub async fn remove(&self, room_id: &str, object_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(room_id) {
            entry.last_access = Instant::now();
            entry.objects.retain(|o| o.id != object_id);
        }
    }

    /// Whether the cached room knows `object_id`, loading the room on a miss.
    pub async fn has_object(&self, room_id: &str, object_id: &str) -> Result<bool, SyncError> {
        if let Some(entry) = self.entries.read().await.get(room_id) {
            return Ok(entry.objects.iter().any(|o| o.id == object_id));
        }
        Ok(self.get_objects(room_id).await?.iter().any(|o| o.id == object_id))
    }

    async fn touch(&self, room_id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(room_id) {
            entry.last_access = Instant::now();
        }
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.entries.read().await.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Evict rooms past the TTL, then, if still above the cap, the least
    /// recently used rooms until at most half the cap remain.
    pub async fn sweep(&self, now: Instant) -> Vec<(String, EvictReason)> {
        let mut entries = self.entries.write().await;
        let mut evicted = Vec::new();

        entries.retain(|room_id, entry| {
            let keep = now.saturating_duration_since(entry.last_access) <= self.config.ttl;
            if !keep {
                evicted.push((room_id.clone(), EvictReason::Expired));
            }
            keep
        });

        if entries.len() > self.config.max_rooms {
            let target = self.config.max_rooms / 2;
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(id, e)| (id.clone(), e.last_access))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = entries.len() - target;
            for (room_id, _) in by_age.into_iter().take(excess) {
                entries.remove(&room_id);
                evicted.push((room_id, EvictReason::Capacity));
            }
        }

        for (room_id, reason) in &evicted {
            log::info!("Evicted room {room_id} from cache ({reason:?})");
        }
        evicted
    }

    /// Spawn the periodic eviction sweep.
    pub fn start(self: &Arc<Self>) {
        let cache = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                cache.sweep(Instant::now()).await;
            }
        });
        if let Some(old) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).replace(handle) {
            old.abort();
        }
    }

    /// Stop the sweep and drop every cached room.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = sweeper {
            handle.abort();
        }
        self.entries.write().await.clear();
        log::info!("Room cache cleared");
    }
}
