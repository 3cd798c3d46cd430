//! RocksDB-backed stores.
//!
//! `RocksDatabase` column families:
//! - `rooms`       : room records, keyed by room id
//! - `objects`     : object records, keyed by `room object_id`
//!                    (payload JSON LZ4-compressed inside the record)
//! - `object_rooms`: object id → owning room id (point lookups, deletes)
//! - `messages`    : chat records, keyed by `room created_at(8 BE) seq(8 BE) id(16)`
//!
//! `room` is the room id prefixed with its byte length (4 BE), so no room's
//! keys fall under another room's scan prefix. Records are bincode-encoded.
//!
//! `RocksKv` is the node-local ephemeral store: a single default column
//! family of UTF-8 keys and values, so staged writes and lock ownership
//! survive a restart of the process.
//!
//! RocksDB calls are blocking; every trait method runs them on tokio's
//! blocking pool.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{CasOutcome, DurableStore, EphemeralStore, StoreError, UpsertOutcome};
use crate::model::{sort_by_ordering_key, CanvasObject, ChatMessage, Room};

const CF_ROOMS: &str = "rooms";
const CF_OBJECTS: &str = "objects";
const CF_OBJECT_ROOMS: &str = "object_rooms";
const CF_MESSAGES: &str = "messages";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_OBJECTS, CF_OBJECT_ROOMS, CF_MESSAGES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk object record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredObject {
    id: String,
    room_id: String,
    object_type: String,
    /// LZ4-compressed JSON payload (size-prepended)
    data: Vec<u8>,
}

impl StoredObject {
    fn from_object(object: &CanvasObject) -> Result<Self, StoreError> {
        let json = serde_json::to_vec(&object.data)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: object.id.clone(),
            room_id: object.room_id.clone(),
            object_type: object.object_type.clone(),
            data: lz4_flex::compress_prepend_size(&json),
        })
    }

    fn into_object(self) -> Result<CanvasObject, StoreError> {
        let json = lz4_flex::decompress_size_prepended(&self.data)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let data = serde_json::from_slice(&json)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(CanvasObject {
            id: self.id,
            room_id: self.room_id,
            object_type: self.object_type,
            data,
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn room_prefix(room_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(room_id.len() + 4);
    key.extend_from_slice(&(room_id.len() as u32).to_be_bytes());
    key.extend_from_slice(room_id.as_bytes());
    key
}

fn object_row_key(room_id: &str, object_id: &str) -> Vec<u8> {
    let mut key = room_prefix(room_id);
    key.extend_from_slice(object_id.as_bytes());
    key
}

/// `seq` keeps messages appended within one millisecond in append order.
fn message_row_key(message: &ChatMessage, seq: u64) -> Vec<u8> {
    let mut key = room_prefix(&message.room_id);
    key.extend_from_slice(&message.created_at.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(message.id.as_bytes());
    key
}

/// Run a blocking store call on the blocking pool.
async fn blocking<C, T, F>(core: &Arc<C>, f: F) -> Result<T, StoreError>
where
    C: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&C) -> Result<T, StoreError> + Send + 'static,
{
    let core = core.clone();
    tokio::task::spawn_blocking(move || f(&core))
        .await
        .map_err(|e| StoreError::Database(format!("blocking store task failed: {e}")))?
}

fn base_options(config: &StoreConfig) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    opts.set_max_open_files(config.max_open_files);
    opts.set_keep_log_file_num(5);
    opts.increase_parallelism(num_cpus());
    opts
}

fn cf_options(name: &str, config: &StoreConfig) -> Options {
    let mut opts = Options::default();

    let mut block_opts = BlockBasedOptions::default();
    let cache = Cache::new_lru_cache(config.block_cache_size);
    block_opts.set_block_cache(&cache);
    block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
    opts.set_block_based_table_factory(&block_opts);
    opts.set_compression_type(DBCompressionType::Lz4);
    opts.set_write_buffer_size(config.write_buffer_size);

    match name {
        CF_ROOMS | CF_OBJECT_ROOMS => {
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        CF_OBJECTS | CF_MESSAGES => {
            // prefix-scanned by room id
            opts.set_max_write_buffer_number(4);
        }
        _ => {}
    }

    opts
}

/// Durable store on RocksDB.
pub struct RocksDatabase {
    core: Arc<DatabaseCore>,
}

struct DatabaseCore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes check-then-write sequences (room creation, object upserts).
    write_guard: Mutex<()>,
    message_seq: AtomicU64,
}

impl RocksDatabase {
    /// Open the database, creating it and its column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let db_opts = base_options(&config);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened durable store at {}", config.path.display());
        Ok(Self {
            core: Arc::new(DatabaseCore {
                db,
                config,
                write_guard: Mutex::new(()),
                message_seq: AtomicU64::new(0),
            }),
        })
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.core.db.flush()?;
        Ok(())
    }
}

impl DatabaseCore {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_guard
            .lock()
            .map_err(|_| StoreError::Database("write guard poisoned".into()))
    }

    fn read_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn owning_room(&self, object_id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_OBJECT_ROOMS)?;
        match self.db.get_cf(cf, object_id.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Values of every row under `prefix` in a column family.
    fn scan_values(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(value.to_vec());
        }
        Ok(values)
    }

    fn create_room_if_absent(&self, room: Room) -> Result<Room, StoreError> {
        let _guard = self.guard()?;
        if let Some(existing) = self.read_room(&room.id)? {
            return Ok(existing);
        }
        let cf = self.cf(CF_ROOMS)?;
        self.db
            .put_cf_opt(cf, room.id.as_bytes(), encode(&room)?, &self.write_opts())?;
        log::info!("Created room {} ({})", room.id, room.name);
        Ok(room)
    }

    fn upsert_object(&self, object: &CanvasObject) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.guard()?;
        if self.read_room(&object.room_id)?.is_none() {
            return Err(StoreError::UnknownRoom(object.room_id.clone()));
        }
        let outcome = match self.owning_room(&object.id)? {
            Some(existing) if existing != object.room_id => {
                return Err(StoreError::RoomMismatch {
                    object_id: object.id.clone(),
                    existing,
                    requested: object.room_id.clone(),
                });
            }
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        };

        let record = encode(&StoredObject::from_object(object)?)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_OBJECTS)?,
            object_row_key(&object.room_id, &object.id),
            record,
        );
        batch.put_cf(
            self.cf(CF_OBJECT_ROOMS)?,
            object.id.as_bytes(),
            object.room_id.as_bytes(),
        );
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(outcome)
    }

    fn get_object(&self, object_id: &str) -> Result<Option<CanvasObject>, StoreError> {
        let Some(room_id) = self.owning_room(object_id)? else {
            return Ok(None);
        };
        let cf = self.cf(CF_OBJECTS)?;
        match self.db.get_cf(cf, object_row_key(&room_id, object_id))? {
            Some(bytes) => Ok(Some(decode::<StoredObject>(&bytes)?.into_object()?)),
            None => Ok(None),
        }
    }

    fn delete_object(&self, object_id: &str) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let Some(room_id) = self.owning_room(object_id)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_OBJECTS)?, object_row_key(&room_id, object_id));
        batch.delete_cf(self.cf(CF_OBJECT_ROOMS)?, object_id.as_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(true)
    }

    fn objects_in_room(&self, room_id: &str) -> Result<Vec<CanvasObject>, StoreError> {
        let mut objects = self
            .scan_values(CF_OBJECTS, &room_prefix(room_id))?
            .iter()
            .map(|bytes| decode::<StoredObject>(bytes)?.into_object())
            .collect::<Result<Vec<_>, _>>()?;
        sort_by_ordering_key(&mut objects);
        Ok(objects)
    }

    fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        if self.read_room(&message.room_id)?.is_none() {
            return Err(StoreError::UnknownRoom(message.room_id.clone()));
        }
        let cf = self.cf(CF_MESSAGES)?;
        let seq = self.message_seq.fetch_add(1, Ordering::Relaxed);
        self.db
            .put_cf_opt(cf, message_row_key(message, seq), encode(message)?, &self.write_opts())?;
        Ok(())
    }

    fn messages_in_room(&self, room_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.scan_values(CF_MESSAGES, &room_prefix(room_id))?
            .iter()
            .map(|bytes| decode(bytes))
            .collect()
    }
}

#[async_trait]
impl DurableStore for RocksDatabase {
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        let room_id = room_id.to_owned();
        blocking(&self.core, move |core| core.read_room(&room_id)).await
    }

    async fn create_room_if_absent(&self, room: Room) -> Result<Room, StoreError> {
        blocking(&self.core, move |core| core.create_room_if_absent(room)).await
    }

    async fn upsert_object(&self, object: &CanvasObject) -> Result<UpsertOutcome, StoreError> {
        let object = object.clone();
        blocking(&self.core, move |core| core.upsert_object(&object)).await
    }

    async fn get_object(&self, object_id: &str) -> Result<Option<CanvasObject>, StoreError> {
        let object_id = object_id.to_owned();
        blocking(&self.core, move |core| core.get_object(&object_id)).await
    }

    async fn delete_object(&self, object_id: &str) -> Result<bool, StoreError> {
        let object_id = object_id.to_owned();
        blocking(&self.core, move |core| core.delete_object(&object_id)).await
    }

    async fn objects_in_room(&self, room_id: &str) -> Result<Vec<CanvasObject>, StoreError> {
        let room_id = room_id.to_owned();
        blocking(&self.core, move |core| core.objects_in_room(&room_id)).await
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let message = message.clone();
        blocking(&self.core, move |core| core.append_message(&message)).await
    }

    async fn messages_in_room(&self, room_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let room_id = room_id.to_owned();
        blocking(&self.core, move |core| core.messages_in_room(&room_id)).await
    }
}

/// Node-local ephemeral store on RocksDB.
pub struct RocksKv {
    core: Arc<KvCore>,
}

struct KvCore {
    db: DBWithThreadMode<SingleThreaded>,
    /// Makes compare-and-set atomic with respect to other writers.
    cas_guard: Mutex<()>,
}

impl RocksKv {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let db = DBWithThreadMode::<SingleThreaded>::open(&base_options(&config), &config.path)?;
        log::info!("Opened ephemeral store at {}", config.path.display());
        Ok(Self { core: Arc::new(KvCore { db, cas_guard: Mutex::new(()) }) })
    }
}

impl KvCore {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.cas_guard
            .lock()
            .map_err(|_| StoreError::Database("cas guard poisoned".into()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        self.db.put(key.as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let existed = self.db.get(key.as_bytes())?.is_some();
        if existed {
            self.db.delete(key.as_bytes())?;
        }
        Ok(existed)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<CasOutcome, StoreError> {
        let _guard = self.guard()?;
        let current = self.read(key)?;
        if current.as_deref() != expected {
            return Ok(CasOutcome::Mismatch(current));
        }
        match new {
            Some(value) => self.db.put(key.as_bytes(), value.as_bytes())?,
            None => self.db.delete(key.as_bytes())?,
        }
        Ok(CasOutcome::Applied)
    }
}

#[async_trait]
impl EphemeralStore for RocksKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_owned();
        blocking(&self.core, move |core| core.read(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_owned(), value.to_owned());
        blocking(&self.core, move |core| core.set(&key, &value)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_owned();
        blocking(&self.core, move |core| core.delete(&key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_owned();
        blocking(&self.core, move |core| core.scan_prefix(&prefix)).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<CasOutcome, StoreError> {
        let key = key.to_owned();
        let expected = expected.map(str::to_owned);
        let new = new.map(str::to_owned);
        blocking(&self.core, move |core| {
            core.compare_and_set(&key, expected.as_deref(), new.as_deref())
        })
        .await
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectData;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_db(dir: &std::path::Path) -> RocksDatabase {
        RocksDatabase::open(StoreConfig::for_testing(dir.join("db"))).unwrap()
    }

    #[tokio::test]
    async fn test_room_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        let first = db.create_room_if_absent(Room::with_default_name("r1")).await.unwrap();
        let second = db
            .create_room_if_absent(Room { id: "r1".into(), name: "other".into() })
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.name, "Room r1");
    }

    #[tokio::test]
    async fn test_object_roundtrip_and_order() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        db.create_room_if_absent(Room::with_default_name("r1")).await.unwrap();

        let top = ObjectData::new("top", "rect", json!({"x": 1, "z": 9})).into_object("r1");
        let bottom = ObjectData::new("bottom", "circle", json!({"x": 2, "z": 0})).into_object("r1");
        assert_eq!(db.upsert_object(&top).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(db.upsert_object(&bottom).await.unwrap(), UpsertOutcome::Created);

        let objects = db.objects_in_room("r1").await.unwrap();
        assert_eq!(objects, vec![bottom.clone(), top.clone()]);
        assert_eq!(db.get_object("top").await.unwrap(), Some(top));
    }

    #[tokio::test]
    async fn test_rooms_do_not_bleed() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        // "r1" is a byte prefix of "r10"; the length prefix keeps them apart
        db.create_room_if_absent(Room::with_default_name("r1")).await.unwrap();
        db.create_room_if_absent(Room::with_default_name("r10")).await.unwrap();
        db.upsert_object(&ObjectData::new("a", "rect", json!({})).into_object("r10"))
            .await
            .unwrap();

        assert!(db.objects_in_room("r1").await.unwrap().is_empty());
        assert_eq!(db.objects_in_room("r10").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_room_id_with_nul_does_not_leak_into_shorter_room() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        for room in ["a", "a\0b"] {
            db.create_room_if_absent(Room::with_default_name(room)).await.unwrap();
        }
        db.upsert_object(&ObjectData::new("secret", "rect", json!({})).into_object("a\0b"))
            .await
            .unwrap();
        db.append_message(&ChatMessage::new("a\0b", "Mallory", "hidden")).await.unwrap();

        assert!(db.objects_in_room("a").await.unwrap().is_empty());
        assert!(db.messages_in_room("a").await.unwrap().is_empty());
        assert_eq!(db.objects_in_room("a\0b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_integrity() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let object = ObjectData::new("o1", "rect", json!({})).into_object("r1");
        assert!(matches!(
            db.upsert_object(&object).await,
            Err(StoreError::UnknownRoom(_))
        ));

        db.create_room_if_absent(Room::with_default_name("r1")).await.unwrap();
        db.upsert_object(&object).await.unwrap();
        assert!(db.delete_object("o1").await.unwrap());
        assert!(!db.delete_object("o1").await.unwrap());
        assert!(db.get_object("o1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = open_db(dir.path());
            db.create_room_if_absent(Room::with_default_name("r1")).await.unwrap();
            db.upsert_object(&ObjectData::new("o1", "rect", json!({"x": 5})).into_object("r1"))
                .await
                .unwrap();
            db.append_message(&ChatMessage::new("r1", "Alice", "hello")).await.unwrap();
            db.sync().unwrap();
        }
        let db = open_db(dir.path());
        let objects = db.objects_in_room("r1").await.unwrap();
        assert_eq!(objects[0].data, json!({"x": 5}));
        let messages = db.messages_in_room("r1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");
    }

    #[tokio::test]
    async fn test_kv_cas_and_scan() {
        let dir = tempdir().unwrap();
        let kv = RocksKv::open(StoreConfig::for_testing(dir.path().join("kv"))).unwrap();

        kv.set("lock:a", "Alice").await.unwrap();
        kv.set("lock:b", "Bob").await.unwrap();
        kv.set("room:r1", "r1").await.unwrap();
        assert_eq!(kv.scan_prefix("lock:").await.unwrap(), vec!["lock:a", "lock:b"]);

        assert_eq!(
            kv.compare_and_set("lock:a", Some("Bob"), None).await.unwrap(),
            CasOutcome::Mismatch(Some("Alice".into()))
        );
        assert_eq!(
            kv.compare_and_set("lock:a", Some("Alice"), None).await.unwrap(),
            CasOutcome::Applied
        );
        assert!(!kv.delete("lock:a").await.unwrap());
        assert!(kv.delete("lock:b").await.unwrap());
    }
}
