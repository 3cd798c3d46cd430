//! Session/event coordinator.
//!
//! Orchestrates the cache, the lock manager, the write-behind pipeline and
//! the rate limiter for every inbound client event, and fans results out to
//! room members through the broadcast groups.
//!
//! ```text
//! ClientEvent ─► validate ─► rate limit ─► lock check ─► stage (kv)
//!                                                          │
//!                              broadcast ◄── queue ◄── cache upsert
//! ```
//!
//! Per connection the state machine is `Connected → Joined(room, name) →
//! Disconnected`. Events of one connection are handled in arrival order
//! (the transport awaits each `handle` call); different connections run
//! concurrently. A rejected event produces exactly one `error` event for its
//! origin and no broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::broadcast::{Outbox, RoomManager};
use crate::cache::RoomCache;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError};
use crate::locks::{LockManager, Release};
use crate::model::{ChatMessage, ObjectData};
use crate::pipeline::{FlushReport, StagedWrite, WriteBehind};
use crate::protocol::{ClientEvent, JoinRoom, LockRequest, ObjectRef, SendMessage, ServerEvent};
use crate::rate_limit::RateLimiter;
use crate::storage::{self, DurableStore, EphemeralStore, ROOM_PREFIX};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub rejected_events: u64,
    pub active_rooms: usize,
    pub commits: u64,
    pub failed_commits: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_events: AtomicU64,
    rejected_events: AtomicU64,
}

/// Room membership of a joined connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    pub room_id: String,
    pub display_name: String,
}

/// Per-connection state owned by the transport.
pub struct Session {
    id: Uuid,
    /// rate limiter key
    key: String,
    outbox: Outbox,
    membership: Option<Membership>,
    cooldown_pending: Arc<AtomicBool>,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    fn joined(&self) -> Result<Membership, SyncError> {
        self.membership
            .clone()
            .ok_or_else(|| SyncError::validation("join a room first"))
    }
}

fn require(field: &str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(format!("missing required field `{field}`")));
    }
    Ok(())
}

pub struct Coordinator {
    config: SyncConfig,
    db: Arc<dyn DurableStore>,
    kv: Arc<dyn EphemeralStore>,
    cache: Arc<RoomCache>,
    locks: LockManager,
    pipeline: WriteBehind,
    limiter: Arc<RateLimiter>,
    rooms: RoomManager,
    /// every connected session's outbox, for the shutdown notice
    sessions: Mutex<HashMap<Uuid, Outbox>>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    stats: AtomicServerStats,
}

impl Coordinator {
    pub fn new(config: SyncConfig, db: Arc<dyn DurableStore>, kv: Arc<dyn EphemeralStore>) -> Self {
        let cache = Arc::new(RoomCache::new(config.cache.clone(), db.clone(), kv.clone()));
        let pipeline = WriteBehind::new(config.pipeline.clone(), db.clone(), kv.clone());
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            locks: LockManager::new(kv.clone()),
            config,
            db,
            kv,
            cache,
            pipeline,
            limiter,
            rooms: RoomManager::new(),
            sessions: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            stats: AtomicServerStats::default(),
        }
    }

    /// Launch the background sweeps and the room idle saver.
    pub fn start(&self) {
        self.cache.start();
        self.limiter.start();
        self.pipeline.start();
        log::info!("Coordinator started");
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Outbox>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new connection. Refused once shutdown has begun.
    pub fn connect(&self) -> Result<(Session, mpsc::Receiver<Arc<ServerEvent>>), SyncError> {
        if self.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }
        let (outbox, inbox) = mpsc::channel(self.config.server.outbox_capacity.max(1));
        let id = Uuid::new_v4();
        self.sessions().insert(id, outbox.clone());
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::debug!("Connection {id} registered");

        let session = Session {
            id,
            key: id.to_string(),
            outbox,
            membership: None,
            cooldown_pending: Arc::new(AtomicBool::new(false)),
        };
        Ok((session, inbox))
    }

    /// Process one inbound event. Failures are reported to the session only.
    pub async fn handle(&self, session: &mut Session, event: ClientEvent) {
        log::debug!("Connection {} sent {}", session.id, event.name());
        self.stats.total_events.fetch_add(1, Ordering::Relaxed);

        let result = if self.is_shutting_down() {
            Err(SyncError::ShuttingDown)
        } else {
            match event {
                ClientEvent::JoinRoom(req) => self.join(session, req).await,
                ClientEvent::CreateObject(data) => self.upsert_object(session, data, true).await,
                ClientEvent::UpdateObject(data) => self.upsert_object(session, data, false).await,
                ClientEvent::DeleteObject(req) => self.delete_object(session, req).await,
                ClientEvent::LockObject(req) => self.lock_object(session, req).await,
                ClientEvent::UnlockObject(req) => self.unlock_object(session, req).await,
                ClientEvent::SendMessage(req) => self.send_message(session, req).await,
            }
        };

        if let Err(e) = result {
            self.reject(session, &e);
        }
    }

    /// Report a failure to the originating session.
    pub fn reject(&self, session: &Session, err: &SyncError) {
        self.stats.rejected_events.fetch_add(1, Ordering::Relaxed);
        match err.kind() {
            ErrorKind::Adapter | ErrorKind::DataCorruption => {
                log::error!("Connection {}: {err}", session.id)
            }
            ErrorKind::LockConflict => log::info!("Connection {}: {err}", session.id),
            _ => log::warn!("Connection {}: {err}", session.id),
        }
        self.send_to(session, ServerEvent::error(err));
    }

    fn send_to(&self, session: &Session, event: ServerEvent) {
        if session.outbox.try_send(Arc::new(event)).is_err() {
            log::warn!("Outbound queue unavailable for connection {}, dropping event", session.id);
        }
    }

    async fn broadcast(&self, room_id: &str, origin: Option<&Uuid>, event: ServerEvent) {
        if let Some(group) = self.rooms.get(room_id).await {
            group.broadcast_except(origin, event).await;
        }
    }

    fn check_rate(&self, session: &Session) -> Result<(), SyncError> {
        if !self.limiter.is_limited(&session.key) {
            return Ok(());
        }
        if !session.cooldown_pending.swap(true, Ordering::SeqCst) {
            let limiter = self.limiter.clone();
            let key = session.key.clone();
            let outbox = session.outbox.clone();
            let pending = session.cooldown_pending.clone();
            let cooldown = self.config.rate_limit.cooldown;
            tokio::spawn(async move {
                tokio::time::sleep(cooldown).await;
                limiter.reset(&key);
                pending.store(false, Ordering::SeqCst);
                let notice = ServerEvent::RateLimitReset {
                    message: "Rate limit reset, you may continue".to_string(),
                };
                let _ = outbox.try_send(Arc::new(notice));
                log::debug!("Rate limit reset for connection {key}");
            });
        }
        Err(SyncError::RateLimited)
    }

    async fn join(&self, session: &mut Session, req: JoinRoom) -> Result<(), SyncError> {
        require("roomId", &req.room_id)?;
        require("displayName", &req.display_name)?;
        if let Some(current) = &session.membership {
            return Err(SyncError::validation(format!(
                "already joined room {}",
                current.room_id
            )));
        }
        self.check_rate(session)?;

        let room = self.cache.find_or_create_room(&req.room_id).await?;
        // register before the snapshot so no mutation falls between the two
        let group = self
            .rooms
            .join(&req.room_id, session.id, &req.display_name, session.outbox.clone())
            .await;
        let objects = match self.cache.get_objects(&req.room_id).await {
            Ok(objects) => objects,
            Err(e) => {
                self.rooms.leave(&req.room_id, &session.id).await;
                return Err(e);
            }
        };

        log::info!(
            "{} joined room {} ({} objects)",
            req.display_name,
            req.room_id,
            objects.len()
        );
        self.send_to(session, ServerEvent::InitialState { room, objects });
        group
            .broadcast_except(
                Some(&session.id),
                ServerEvent::UserJoined { display_name: req.display_name.clone() },
            )
            .await;
        session.membership = Some(Membership {
            room_id: req.room_id,
            display_name: req.display_name,
        });
        Ok(())
    }

    /// The lock on an object must be free or held by `display_name`.
    async fn ensure_lock_allows(&self, object_id: &str, display_name: &str) -> Result<(), SyncError> {
        match self.locks.holder(object_id).await? {
            Some(holder) if holder != display_name => Err(SyncError::ObjectAlreadyLocked { holder }),
            _ => Ok(()),
        }
    }

    /// An object id never moves between rooms.
    async fn ensure_in_room(&self, room_id: &str, object_id: &str) -> Result<(), SyncError> {
        if self.cache.has_object(room_id, object_id).await? {
            return Ok(());
        }
        match self.db.get_object(object_id).await? {
            Some(existing) if existing.room_id != room_id => Err(SyncError::validation(format!(
                "object {object_id} belongs to another room"
            ))),
            _ => Ok(()),
        }
    }

    async fn upsert_object(
        &self,
        session: &Session,
        data: ObjectData,
        created: bool,
    ) -> Result<(), SyncError> {
        let member = session.joined()?;
        require("id", &data.id)?;
        require("type", &data.object_type)?;
        if data.payload.is_null() {
            return Err(SyncError::validation("missing required field `payload`"));
        }
        self.check_rate(session)?;
        if !created {
            self.ensure_lock_allows(&data.id, &member.display_name).await?;
        }
        self.ensure_in_room(&member.room_id, &data.id).await?;

        let ticket = self.pipeline.admit()?;
        let write = StagedWrite::new(&member.room_id, data.clone());
        self.pipeline.stage(&write).await?;
        self.cache
            .upsert(&member.room_id, &data.id, &data.object_type, data.payload.clone())
            .await;
        ticket.queue(write);

        let event = if created {
            ServerEvent::ObjectCreated(data)
        } else {
            ServerEvent::ObjectUpdated(data)
        };
        self.broadcast(&member.room_id, Some(&session.id), event).await;
        Ok(())
    }

    async fn delete_object(&self, session: &Session, req: ObjectRef) -> Result<(), SyncError> {
        let member = session.joined()?;
        require("id", &req.id)?;
        self.check_rate(session)?;
        self.ensure_lock_allows(&req.id, &member.display_name).await?;
        self.ensure_in_room(&member.room_id, &req.id).await?;

        self.pipeline.delete(&req.id).await?;
        self.cache.remove(&member.room_id, &req.id).await;
        if let Some(holder) = self.locks.clear(&req.id).await? {
            log::info!("Lock on deleted object {} held by {holder} cleared", req.id);
        }

        log::info!("Object {} deleted from room {}", req.id, member.room_id);
        self.broadcast(
            &member.room_id,
            Some(&session.id),
            ServerEvent::ObjectDeleted { id: req.id },
        )
        .await;
        Ok(())
    }

    fn lock_request(session: &Session, req: &LockRequest) -> Result<Membership, SyncError> {
        let member = session.joined()?;
        require("id", &req.id)?;
        require("displayName", &req.display_name)?;
        if req.display_name != member.display_name {
            return Err(SyncError::validation("displayName does not match this connection"));
        }
        Ok(member)
    }

    async fn lock_object(&self, session: &Session, req: LockRequest) -> Result<(), SyncError> {
        let member = Self::lock_request(session, &req)?;
        self.check_rate(session)?;
        self.locks.acquire(&req.id, &member.display_name).await?;
        self.broadcast(
            &member.room_id,
            Some(&session.id),
            ServerEvent::ObjectLocked { id: req.id, display_name: member.display_name },
        )
        .await;
        Ok(())
    }

    async fn unlock_object(&self, session: &Session, req: LockRequest) -> Result<(), SyncError> {
        let member = Self::lock_request(session, &req)?;
        self.check_rate(session)?;
        if self.locks.release(&req.id, &member.display_name).await? == Release::Released {
            self.broadcast(
                &member.room_id,
                Some(&session.id),
                ServerEvent::ObjectUnlocked { id: req.id, display_name: member.display_name },
            )
            .await;
        }
        Ok(())
    }

    async fn send_message(&self, session: &Session, req: SendMessage) -> Result<(), SyncError> {
        let member = session.joined()?;
        require("author", &req.author)?;
        require("content", &req.content)?;
        self.check_rate(session)?;

        let message = ChatMessage::new(&member.room_id, req.author, req.content);
        self.db.append_message(&message).await?;
        self.broadcast(&member.room_id, Some(&session.id), ServerEvent::NewMessage(message))
            .await;
        Ok(())
    }

    /// Tear down a connection: leave its room, free its locks, and flush the
    /// room if it was the last member.
    pub async fn disconnect(&self, session: Session) {
        self.sessions().remove(&session.id);
        self.limiter.reset(&session.key);
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        let Some(member) = session.membership else {
            log::debug!("Connection {} closed before joining", session.id);
            return;
        };
        let remaining = match self.rooms.leave(&member.room_id, &session.id).await {
            Some((group, remaining)) => {
                group
                    .broadcast_except(
                        None,
                        ServerEvent::UserDisconnected { display_name: member.display_name.clone() },
                    )
                    .await;
                remaining
            }
            None => 0,
        };
        log::info!("{} left room {} ({remaining} remaining)", member.display_name, member.room_id);

        match self.locks.release_all_for(&member.display_name).await {
            Ok(released) => {
                for id in released {
                    // locks of this name may sit in other rooms
                    let room_id = self
                        .object_room(&id)
                        .await
                        .unwrap_or_else(|| member.room_id.clone());
                    self.broadcast(
                        &room_id,
                        None,
                        ServerEvent::ObjectUnlocked { id, display_name: member.display_name.clone() },
                    )
                    .await;
                }
            }
            Err(e) => log::error!("Failed to release locks of {}: {e}", member.display_name),
        }

        if remaining == 0 {
            if let Err(e) = self.pipeline.flush_room(&member.room_id).await {
                log::error!("Flush of room {} failed: {e}", member.room_id);
            }
        }
    }

    /// Room an object lives in, staged or committed.
    async fn object_room(&self, object_id: &str) -> Option<String> {
        if let Ok(Some(write)) = self.pipeline.staged(object_id).await {
            return Some(write.room_id);
        }
        match self.db.get_object(object_id).await {
            Ok(object) => object.map(|o| o.room_id),
            Err(e) => {
                log::warn!("Could not resolve room of object {object_id}: {e}");
                None
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flips to `true` when shutdown begins.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Graceful shutdown: notify every session, close connections, drain the
    /// pipeline, flush every known room, and release the background tasks.
    /// Later calls return an empty report.
    pub async fn shutdown(&self) -> FlushReport {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return FlushReport::default();
        }
        log::info!("Shutdown started");

        let outboxes: Vec<Outbox> = self.sessions().values().cloned().collect();
        let notice = Arc::new(ServerEvent::ServerShutdown {
            message: "Server is shutting down".to_string(),
        });
        for outbox in &outboxes {
            let _ = outbox.try_send(notice.clone());
        }
        self.shutdown_tx.send_replace(true);
        log::info!("Shutdown notice sent to {} connections", outboxes.len());

        self.pipeline.shutdown().await;

        let mut report = FlushReport::default();
        match self.kv.scan_prefix(ROOM_PREFIX).await {
            Ok(markers) => {
                for marker in markers {
                    let Some(room_id) = storage::key_suffix(&marker, ROOM_PREFIX) else {
                        continue;
                    };
                    match self.pipeline.flush_room(room_id).await {
                        Ok(room_report) => {
                            if room_report.failed.is_empty() {
                                let _ = self.kv.delete(&marker).await;
                            }
                            report.committed.extend(room_report.committed);
                            report.failed.extend(room_report.failed);
                            for key in room_report.corrupt {
                                if !report.corrupt.contains(&key) {
                                    report.corrupt.push(key);
                                }
                            }
                        }
                        Err(e) => log::error!("Shutdown flush of room {room_id} failed: {e}"),
                    }
                }
            }
            Err(e) => log::error!("Could not enumerate rooms for shutdown flush: {e}"),
        }

        self.cache.shutdown().await;
        self.limiter.shutdown();
        log::info!(
            "Shutdown complete: {} committed, {} failed",
            report.committed.len(),
            report.failed.len()
        );
        report
    }

    pub async fn stats(&self) -> ServerStats {
        let pipeline = self.pipeline.stats();
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_events: self.stats.total_events.load(Ordering::Relaxed),
            rejected_events: self.stats.rejected_events.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
            commits: pipeline.commits,
            failed_commits: pipeline.failed_commits,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &RoomCache {
        &self.cache
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn pipeline(&self) -> &WriteBehind {
        &self.pipeline
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }
}
