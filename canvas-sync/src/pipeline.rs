//! Write-behind persistence.
//!
//! ```text
//! queue(write) ──► slot[object_id] = latest payload, deadline = now + debounce
//!                      │
//!                      │ (one worker task per active object)
//!                      ▼
//!            sleep until deadline; re-check (a newer queue pushes it out)
//!                      │
//!                      ▼
//!            take object gate ──► read staged value (none: skip)
//!                      │
//!                      ▼
//!            DurableStore::upsert_object ──ok──► drop staged kv entry (CAS)
//!                      │
//!                     err ──► log, keep staged entry, mark room dirty
//! ```
//!
//! A slot holds at most one payload, so a burst collapses into a single
//! commit of its last write. Every commit and every delete of an object
//! runs under that object's gate and commits what is staged at that moment,
//! so the durable store only ever moves forward. Different objects commit
//! in parallel.
//!
//! `flush_room` drains pending slots and every staged entry of a room
//! synchronously. The idle saver flushes rooms that have been quiet for
//! `room_idle_save`, which is also how failed commits get retried.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::error::SyncError;
use crate::model::{CanvasObject, ObjectData};
use crate::storage::{self, DurableStore, EphemeralStore, OBJECT_PREFIX};

/// A staged object mutation: what the ephemeral store holds under
/// `object:{id}` and what the pipeline commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedWrite {
    pub object_id: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub data: Value,
}

impl StagedWrite {
    pub fn new(room_id: impl Into<String>, object: ObjectData) -> Self {
        Self {
            object_id: object.id,
            room_id: room_id.into(),
            object_type: object.object_type,
            data: object.payload,
        }
    }

    pub fn key(&self) -> String {
        storage::object_key(&self.object_id)
    }

    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Corrupt {
            key: self.key(),
            reason: e.to_string(),
        })
    }

    pub fn decode(key: &str, raw: &str) -> Result<Self, SyncError> {
        serde_json::from_str(raw).map_err(|e| SyncError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_object(&self) -> CanvasObject {
        CanvasObject {
            id: self.object_id.clone(),
            room_id: self.room_id.clone(),
            object_type: self.object_type.clone(),
            data: self.data.clone(),
        }
    }
}

/// Outcome of a forced flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Object ids committed.
    pub committed: Vec<String>,
    /// Object ids whose commit failed; their staged value is retained.
    pub failed: Vec<String>,
    /// Staged keys whose payload could not be parsed.
    pub corrupt: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.corrupt.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub queued: u64,
    pub superseded: u64,
    pub commits: u64,
    pub failed_commits: u64,
}

struct Slot {
    latest: Option<StagedWrite>,
    deadline: Instant,
    worker: Option<JoinHandle<()>>,
}

struct Inner {
    db: Arc<dyn DurableStore>,
    kv: Arc<dyn EphemeralStore>,
    config: PipelineConfig,
    slots: Mutex<HashMap<String, Slot>>,
    /// object id → commit gate; present only while someone holds or awaits it
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// room id → last mutation (or failed commit)
    dirty_rooms: Mutex<HashMap<String, Instant>>,
    idle_saver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    /// outstanding [`WriteTicket`]s
    admitted: AtomicUsize,
    tickets_done: Notify,
    queued: AtomicU64,
    superseded: AtomicU64,
    commits: AtomicU64,
    failed_commits: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Permission to queue one write, taken before any of its side effects.
/// Shutdown waits for every outstanding ticket, so a ticket's write always
/// lands in the pipeline.
pub struct WriteTicket<'a> {
    inner: &'a Arc<Inner>,
}

impl WriteTicket<'_> {
    pub fn queue(self, write: StagedWrite) {
        self.inner.enqueue(write);
    }
}

impl Drop for WriteTicket<'_> {
    fn drop(&mut self) {
        if self.inner.admitted.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.tickets_done.notify_one();
        }
    }
}

/// Held while one object's commit or delete runs.
struct ObjectGate<'a> {
    inner: &'a Inner,
    object_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ObjectGate<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut gates = locked(&self.inner.gates);
        if gates
            .get(&self.object_id)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.object_id);
        }
    }
}

#[derive(Clone)]
pub struct WriteBehind {
    inner: Arc<Inner>,
}

impl WriteBehind {
    pub fn new(config: PipelineConfig, db: Arc<dyn DurableStore>, kv: Arc<dyn EphemeralStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                kv,
                config,
                slots: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                dirty_rooms: Mutex::new(HashMap::new()),
                idle_saver: Mutex::new(None),
                closed: AtomicBool::new(false),
                admitted: AtomicUsize::new(0),
                tickets_done: Notify::new(),
                queued: AtomicU64::new(0),
                superseded: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                failed_commits: AtomicU64::new(0),
            }),
        }
    }

    /// Write the payload to the ephemeral staging area.
    pub async fn stage(&self, write: &StagedWrite) -> Result<(), SyncError> {
        self.inner.kv.set(&write.key(), &write.encode()?).await?;
        Ok(())
    }

    /// The staged payload of an object, if any.
    pub async fn staged(&self, object_id: &str) -> Result<Option<StagedWrite>, SyncError> {
        let key = storage::object_key(object_id);
        match self.inner.kv.get(&key).await? {
            Some(raw) => Ok(Some(StagedWrite::decode(&key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Delete an object for good: cancel its pending write, drop its staged
    /// payload and remove the durable row. Waits for a commit of the same
    /// object already in flight, so that commit cannot land afterwards.
    pub async fn delete(&self, object_id: &str) -> Result<bool, SyncError> {
        let _gate = self.inner.gate(object_id).await;
        if let Some(slot) = locked(&self.inner.slots).get_mut(object_id) {
            slot.latest = None;
        }
        self.inner.kv.delete(&storage::object_key(object_id)).await?;
        Ok(self.inner.db.delete_object(object_id).await?)
    }

    /// Reserve a place for one write. Fails once shutdown has begun.
    pub fn admit(&self) -> Result<WriteTicket<'_>, SyncError> {
        self.inner.admitted.fetch_add(1, Ordering::SeqCst);
        let ticket = WriteTicket { inner: &self.inner };
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SyncError::PipelineClosed);
        }
        Ok(ticket)
    }

    /// Schedule a debounced commit. A pending write for the same object is
    /// replaced, and its deadline pushed out.
    pub fn queue(&self, write: StagedWrite) -> Result<(), SyncError> {
        self.admit()?.queue(write);
        Ok(())
    }

    /// Synchronously commit everything pending or staged for one room.
    pub async fn flush_room(&self, room_id: &str) -> Result<FlushReport, SyncError> {
        let report = self.inner.flush_matching(|w| w.room_id == room_id).await?;
        if report.failed.is_empty() {
            locked(&self.inner.dirty_rooms).remove(room_id);
        }
        log::info!(
            "Flushed room {room_id}: {} committed, {} failed, {} corrupt",
            report.committed.len(),
            report.failed.len(),
            report.corrupt.len()
        );
        Ok(report)
    }

    /// Objects with a debounced write not yet taken by their worker.
    pub fn pending(&self) -> usize {
        locked(&self.inner.slots)
            .values()
            .filter(|s| s.latest.is_some())
            .count()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            queued: self.inner.queued.load(Ordering::Relaxed),
            superseded: self.inner.superseded.load(Ordering::Relaxed),
            commits: self.inner.commits.load(Ordering::Relaxed),
            failed_commits: self.inner.failed_commits.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Rooms quiet for at least the idle delay.
    pub fn idle_rooms(&self, now: Instant) -> Vec<String> {
        let idle = self.inner.config.room_idle_save;
        locked(&self.inner.dirty_rooms)
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= idle)
            .map(|(room, _)| room.clone())
            .collect()
    }

    /// Spawn the room idle saver.
    pub fn start(&self) {
        let pipeline = self.clone();
        let period = self.inner.config.room_idle_save.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pipeline.is_closed() {
                    break;
                }
                for room_id in pipeline.idle_rooms(Instant::now()) {
                    if let Err(e) = pipeline.flush_room(&room_id).await {
                        log::error!("Idle save of room {room_id} failed: {e}");
                    }
                }
            }
        });
        if let Some(old) = locked(&self.inner.idle_saver).replace(handle) {
            old.abort();
        }
    }

    /// Stop accepting writes, wait for admitted writes to be queued, let every
    /// pending debounce timer fire, and stop the idle saver. Later calls
    /// return immediately.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        while self.inner.admitted.load(Ordering::SeqCst) > 0 {
            self.inner.tickets_done.notified().await;
        }
        let saver = locked(&self.inner.idle_saver).take();
        if let Some(handle) = saver {
            handle.abort();
        }
        let workers: Vec<JoinHandle<()>> = locked(&self.inner.slots)
            .values_mut()
            .filter_map(|slot| slot.worker.take())
            .collect();
        log::info!("Write-behind pipeline draining {} pending objects", workers.len());
        for worker in workers {
            let _ = worker.await;
        }
        log::info!("Write-behind pipeline stopped");
    }
}

impl Inner {
    fn enqueue(self: &Arc<Self>, write: StagedWrite) {
        let now = Instant::now();
        let deadline = now + self.config.debounce;
        locked(&self.dirty_rooms).insert(write.room_id.clone(), now);

        let mut slots = locked(&self.slots);
        match slots.get_mut(&write.object_id) {
            Some(slot) => {
                if slot.latest.is_some() {
                    self.superseded.fetch_add(1, Ordering::Relaxed);
                }
                slot.latest = Some(write);
                slot.deadline = deadline;
            }
            None => {
                let object_id = write.object_id.clone();
                let worker = tokio::spawn(Inner::run_worker(self.clone(), object_id.clone()));
                slots.insert(
                    object_id,
                    Slot { latest: Some(write), deadline, worker: Some(worker) },
                );
            }
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    async fn gate(&self, object_id: &str) -> ObjectGate<'_> {
        let gate = locked(&self.gates).entry(object_id.to_string()).or_default().clone();
        let guard = gate.lock_owned().await;
        ObjectGate { inner: self, object_id: object_id.to_string(), guard: Some(guard) }
    }

    async fn run_worker(inner: Arc<Inner>, object_id: String) {
        loop {
            let deadline = match locked(&inner.slots).get(&object_id) {
                Some(slot) => slot.deadline,
                None => return,
            };
            tokio::time::sleep_until(deadline).await;

            let write = {
                let mut slots = locked(&inner.slots);
                let Some(slot) = slots.get_mut(&object_id) else { return };
                if slot.deadline > Instant::now() {
                    // pushed out by a newer write while sleeping
                    continue;
                }
                match slot.latest.take() {
                    Some(write) => write,
                    None => {
                        slots.remove(&object_id);
                        return;
                    }
                }
            };

            log::trace!("Debounce settled for object {object_id}");
            if let Err(e) = inner.commit(&object_id).await {
                locked(&inner.dirty_rooms).insert(write.room_id.clone(), Instant::now());
                log::warn!("Debounced commit of object {object_id} did not complete: {e}");
            }

            let mut slots = locked(&inner.slots);
            match slots.get(&object_id) {
                Some(slot) if slot.latest.is_none() => {
                    slots.remove(&object_id);
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }
    }

    /// Commit whatever is staged for `object_id` right now. `Ok(None)` when
    /// nothing is staged: a delete or an earlier commit got there first.
    async fn commit(&self, object_id: &str) -> Result<Option<StagedWrite>, SyncError> {
        let _gate = self.gate(object_id).await;
        let key = storage::object_key(object_id);
        let Some(raw) = self.kv.get(&key).await? else {
            log::trace!("Nothing staged for object {object_id}");
            return Ok(None);
        };
        let write = StagedWrite::decode(&key, &raw)?;

        match self.db.upsert_object(&write.to_object()).await {
            Ok(outcome) => {
                self.commits.fetch_add(1, Ordering::Relaxed);
                // only clear staging if nobody staged a newer payload meanwhile
                if let Err(e) = self.kv.compare_and_set(&key, Some(&raw), None).await {
                    log::warn!("Committed object {object_id} but could not clear staging: {e}");
                }
                log::debug!("Object {object_id} {outcome:?} in room {}", write.room_id);
                Ok(Some(write))
            }
            Err(e) => {
                self.failed_commits.fetch_add(1, Ordering::Relaxed);
                locked(&self.dirty_rooms).insert(write.room_id.clone(), Instant::now());
                log::error!(
                    "Failed to commit object {object_id} in room {}: {e}; staged value retained",
                    write.room_id
                );
                Err(e.into())
            }
        }
    }

    async fn flush_matching<F>(&self, matches: F) -> Result<FlushReport, SyncError>
    where
        F: Fn(&StagedWrite) -> bool,
    {
        let mut report = FlushReport::default();

        let drained: Vec<StagedWrite> = locked(&self.slots)
            .values_mut()
            .filter(|slot| slot.latest.as_ref().is_some_and(&matches))
            .filter_map(|slot| slot.latest.take())
            .collect();
        let mut seen = HashSet::new();
        for write in drained {
            self.record(&mut report, &write.object_id).await;
            seen.insert(write.object_id);
        }

        for key in self.kv.scan_prefix(OBJECT_PREFIX).await? {
            let Some(object_id) = storage::key_suffix(&key, OBJECT_PREFIX) else {
                continue;
            };
            if seen.contains(object_id) {
                continue;
            }
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let write = match StagedWrite::decode(&key, &raw) {
                Ok(write) => write,
                Err(e) => {
                    log::warn!("Skipping corrupt staged entry: {e}");
                    report.corrupt.push(key);
                    continue;
                }
            };
            if matches(&write) {
                self.record(&mut report, object_id).await;
            }
        }

        Ok(report)
    }

    async fn record(&self, report: &mut FlushReport, object_id: &str) {
        match self.commit(object_id).await {
            Ok(Some(_)) => report.committed.push(object_id.to_string()),
            Ok(None) => {}
            Err(SyncError::Corrupt { key, .. }) => report.corrupt.push(key),
            Err(_) => report.failed.push(object_id.to_string()),
        }
    }
}
