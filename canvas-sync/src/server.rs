//! WebSocket transport in front of the coordinator.
//!
//! ```text
//! Client A ──┐                       ┌── RoomCache ── DurableStore
//!            ├── SyncServer ── Coordinator ── LockManager ── EphemeralStore
//! Client B ──┘      │                └── WriteBehind ──┘
//!                   └── per-connection outbox (bounded mpsc)
//! ```
//!
//! Each connection runs one task that selects over its socket, its outbox
//! and the shutdown signal. Inbound frames are handled one at a time, which
//! gives the per-connection ordering the coordinator relies on.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, Session};
use crate::error::SyncError;
use crate::protocol::{ClientEvent, ServerEvent};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Resolves once shutdown has begun, including if it already had.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

pub struct SyncServer {
    config: ServerConfig,
    coordinator: Arc<Coordinator>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, coordinator: Arc<Coordinator>) -> Self {
        Self { config, coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and accept connections until shutdown begins.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the coordinator shuts down.
    /// The listener is dropped on return, so later connects are refused.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown = self.coordinator.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(coordinator, stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = stopped(&mut shutdown) => {
                    log::info!("Sync server stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        coordinator: Arc<Coordinator>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let mut ws = tokio_tungstenite::accept_async(stream).await?;

        let (mut session, outbox) = match coordinator.connect() {
            Ok(pair) => pair,
            Err(e) => {
                let text = ServerEvent::error(&e).encode()?;
                ws.send(Message::text(text)).await?;
                ws.close(None).await?;
                return Ok(());
            }
        };
        log::info!("WebSocket connection {} established from {addr}", session.id());

        let result = Self::pump(&coordinator, &mut session, ws, outbox).await;
        coordinator.disconnect(session).await;
        result
    }

    async fn pump(
        coordinator: &Coordinator,
        session: &mut Session,
        ws: WebSocketStream<TcpStream>,
        mut outbox: mpsc::Receiver<Arc<ServerEvent>>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let mut shutdown = coordinator.subscribe_shutdown();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match ClientEvent::decode(text.as_str()) {
                            Ok(event) => coordinator.handle(session, event).await,
                            Err(e) => coordinator.reject(session, &SyncError::validation(e.to_string())),
                        },
                        Some(Ok(Message::Binary(_))) => {
                            coordinator.reject(session, &SyncError::validation("binary frames are not supported"));
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        // ping/pong are answered by tungstenite
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error on connection {}: {e}", session.id());
                            break;
                        }
                    }
                }
                Some(event) = outbox.recv() => {
                    ws_sender.send(Message::text(event.encode()?)).await?;
                }
                _ = stopped(&mut shutdown) => {
                    while let Ok(event) = outbox.try_recv() {
                        ws_sender.send(Message::text(event.encode()?)).await?;
                    }
                    break;
                }
            }
        }

        let _ = ws_sender.close().await;
        log::info!("Connection {} closed", session.id());
        Ok(())
    }
}
