//! Per-room fan-out with backpressure.
//!
//! Each connection owns a bounded outbound queue. A room's broadcast group
//! holds a sender for every member and pushes events with `try_send`, so a
//! slow client never stalls the handler that produced the event: when its
//! queue is full the event is dropped for that client and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::ServerEvent;

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Arc<ServerEvent>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Lock-free counters updated on the send path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Member {
    display_name: String,
    outbox: Outbox,
}

/// The connections currently joined to one room.
#[derive(Default)]
pub struct BroadcastGroup {
    members: RwLock<HashMap<Uuid, Member>>,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_member(&self, id: Uuid, display_name: impl Into<String>, outbox: Outbox) {
        let member = Member { display_name: display_name.into(), outbox };
        self.members.write().await.insert(id, member);
    }

    /// Remove a member, returning its display name.
    pub async fn remove_member(&self, id: &Uuid) -> Option<String> {
        self.members.write().await.remove(id).map(|m| m.display_name)
    }

    /// Push an event to every member except `origin`. Returns how many
    /// members accepted it.
    pub async fn broadcast_except(&self, origin: Option<&Uuid>, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let members = self.members.read().await;
        let mut delivered = 0;
        for (id, member) in members.iter() {
            if Some(id) == origin {
                continue;
            }
            match member.outbox.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Outbound queue full for {} ({id}), dropping event", member.display_name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Connection {id} already closed, dropping event");
                }
            }
        }
        delivered
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, id: &Uuid) -> bool {
        self.members.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let members = self.members.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_members: members.len(),
        }
    }
}

/// Room id → broadcast group.
///
/// Joins and leaves go through the manager so that an empty group is
/// dropped atomically with its last member's departure.
#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Add a member to a room's group, creating the group if needed.
    pub async fn join(
        &self,
        room_id: &str,
        id: Uuid,
        display_name: &str,
        outbox: Outbox,
    ) -> Arc<BroadcastGroup> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new()))
            .clone();
        group.add_member(id, display_name, outbox).await;
        group
    }

    /// Remove a member. Returns the group and how many members remain; the
    /// group is dropped from the manager when none do.
    pub async fn leave(&self, room_id: &str, id: &Uuid) -> Option<(Arc<BroadcastGroup>, usize)> {
        let mut rooms = self.rooms.write().await;
        let group = rooms.get(room_id)?.clone();
        group.remove_member(id).await;
        let remaining = group.member_count().await;
        if remaining == 0 {
            rooms.remove(room_id);
        }
        Some((group, remaining))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
