//! # canvas-sync: room synchronization and persistence for a shared canvas
//!
//! Clients join rooms, create/move/delete canvas objects and chat. The core
//! keeps every member's view consistent and low latency while committing to
//! durable storage in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  JSON/WebSocket  ┌─────────────┐
//! │ client      │ ◄──────────────► │ SyncServer  │
//! └─────────────┘                  └──────┬──────┘
//!                                         ▼
//!                                  ┌─────────────┐   ┌───────────────┐
//!                                  │ Coordinator │──►│ BroadcastGroup│
//!                                  └──────┬──────┘   └───────────────┘
//!          ┌──────────────┬───────────────┼──────────────┐
//!          ▼              ▼               ▼              ▼
//!    ┌───────────┐  ┌───────────┐  ┌─────────────┐ ┌────────────┐
//!    │RateLimiter│  │LockManager│  │ WriteBehind │ │ RoomCache  │
//!    └───────────┘  └─────┬─────┘  └──┬───────┬──┘ └─────┬──────┘
//!                         ▼           ▼       ▼          ▼
//!                    ┌─────────────────┐  ┌──────────────────┐
//!                    │ EphemeralStore  │  │  DurableStore    │
//!                    │ (locks, staging)│  │ (rooms, objects, │
//!                    └─────────────────┘  │  messages)       │
//!                                         └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: per-event orchestration and session lifecycle
//! - [`cache`]: TTL/size-bounded read-through room cache
//! - [`locks`]: compare-and-set advisory object locks
//! - [`pipeline`]: debounced write-behind commits and forced flushes
//! - [`rate_limit`]: fixed-window per-connection limiter
//! - [`broadcast`]: room fan-out with backpressure
//! - [`storage`]: store traits plus in-memory and RocksDB adapters
//! - [`protocol`]: JSON wire events
//! - [`server`]: WebSocket transport

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod locks;
pub mod model;
pub mod pipeline;
pub mod protocol;
pub mod rate_limit;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbox, RoomManager};
pub use cache::{EvictReason, RoomCache};
pub use config::{CacheConfig, ConfigError, PipelineConfig, RateLimitConfig, ServerConfig, SyncConfig};
pub use coordinator::{Coordinator, Membership, ServerStats, Session};
pub use error::{ErrorKind, SyncError};
pub use locks::{LockManager, Release};
pub use model::{CanvasObject, ChatMessage, ObjectData, Room};
pub use pipeline::{FlushReport, PipelineStats, StagedWrite, WriteBehind, WriteTicket};
pub use protocol::{ClientEvent, ProtocolError, ServerEvent};
pub use rate_limit::RateLimiter;
pub use server::SyncServer;
pub use storage::{
    CasOutcome, DurableStore, EphemeralStore, MemoryDatabase, MemoryKv, RocksDatabase, RocksKv,
    StoreConfig, StoreError, UpsertOutcome,
};
