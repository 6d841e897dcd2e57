//! In-memory reference authority for the overlay.
//!
//! Architecture:
//! ```text
//! editor  ──┐
//! control ──┼── Authority (ItemCollection, version, checksum)
//! overlay ──┘        │
//!                    └── BroadcastGroup ──► every surface, originator included
//! ```
//!
//! The authority assigns ids, stamps every accepted mutation with a new
//! version and checksum, rebroadcasts it, then answers the originator with
//! `operation_response` when the request carried a `request_id`. New
//! connections get a `sync_state` snapshot first.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use overlay_core::{state_checksum, validate_property, ItemCollection, Mutation};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Surface};
use crate::protocol::{Envelope, OperationResponse, Request, ServerMessage, SnapshotState};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast frames buffered per client
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_frames: u64,
}

/// What the authority sends after handling one request.
#[derive(Debug, Default)]
pub struct Reply {
    /// Goes to every client.
    pub broadcast: Option<ServerMessage>,
    /// Goes to the requesting client only, after the broadcast.
    pub direct: Vec<ServerMessage>,
}

/// Authoritative overlay state.
#[derive(Debug, Clone)]
pub struct Authority {
    items: ItemCollection,
    version: u64,
    checksum: String,
}

impl Default for Authority {
    fn default() -> Self {
        let items = ItemCollection::new();
        let checksum = state_checksum(&items);
        Self {
            items,
            version: 0,
            checksum,
        }
    }
}

impl Authority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &ItemCollection {
        &self.items
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn snapshot(&self) -> ServerMessage {
        ServerMessage::SyncState {
            state: SnapshotState {
                items: self.items.clone(),
            },
            version: self.version,
            checksum: self.checksum.clone(),
        }
    }

    fn commit(&mut self) {
        self.version += 1;
        self.checksum = state_checksum(&self.items);
    }

    /// Handle one client request.
    pub fn handle(&mut self, envelope: Envelope) -> Reply {
        let Envelope {
            request,
            request_id,
        } = envelope;
        let action = request.action();

        let (broadcast, result) = match request {
            Request::AddMedia { mut media } => {
                media.id = Uuid::new_v4().to_string();
                self.items.apply(&Mutation::Add(media.clone()));
                self.commit();
                log::info!("Added {} {:?} (v{})", media.id, media.kind, self.version);
                let data = json!({ "media": media });
                let broadcast = ServerMessage::AddMedia {
                    media,
                    version: Some(self.version),
                    checksum: Some(self.checksum.clone()),
                };
                (Some(broadcast), Ok(Some(data)))
            }
            Request::RemoveMedia { media_id } => {
                if !self.items.contains(&media_id) {
                    (None, Err("item not found".to_string()))
                } else {
                    self.items.apply(&Mutation::Remove(media_id.clone()));
                    self.commit();
                    log::info!("Removed {media_id} (v{})", self.version);
                    let broadcast = ServerMessage::RemoveMedia {
                        media_id,
                        version: Some(self.version),
                        checksum: Some(self.checksum.clone()),
                    };
                    (Some(broadcast), Ok(None))
                }
            }
            Request::UpdateProperty {
                media_id,
                property,
                value,
            } => match self.items.get(&media_id) {
                None => (None, Err("item not found".to_string())),
                Some(item) => {
                    let mut updated = item.clone();
                    let checked = validate_property(item.kind, &property, &value)
                        .and_then(|()| updated.apply_property(&property, &value));
                    match checked {
                        Err(e) => (None, Err(e.to_string())),
                        Ok(()) => {
                            self.items.apply(&Mutation::Add(updated));
                            self.commit();
                            log::debug!("Updated {media_id}.{property} (v{})", self.version);
                            let broadcast = ServerMessage::UpdateProperty {
                                media_id,
                                property,
                                value,
                                version: Some(self.version),
                                checksum: Some(self.checksum.clone()),
                            };
                            (Some(broadcast), Ok(None))
                        }
                    }
                }
            },
            Request::ClearAll => {
                let cleared = self.items.len();
                self.items.apply(&Mutation::Clear);
                self.commit();
                log::info!("Cleared {cleared} items (v{})", self.version);
                let broadcast = ServerMessage::ClearAll {
                    version: Some(self.version),
                    checksum: Some(self.checksum.clone()),
                };
                (Some(broadcast), Ok(Some(json!({ "cleared_count": cleared }))))
            }
            Request::RequestSync => {
                return Reply {
                    broadcast: None,
                    direct: vec![self.snapshot()],
                };
            }
            Request::VerifyVersion {
                client_version,
                client_checksum,
            } => {
                let needs_sync =
                    client_version != self.version || client_checksum != self.checksum;
                if needs_sync {
                    log::warn!(
                        "Client drifted: v{client_version} ({client_checksum}) vs v{} ({})",
                        self.version,
                        self.checksum
                    );
                }
                let mut direct = vec![ServerMessage::VersionCheck {
                    needs_sync,
                    server_version: self.version,
                    server_checksum: self.checksum.clone(),
                }];
                if needs_sync {
                    direct.push(self.snapshot());
                }
                return Reply {
                    broadcast: None,
                    direct,
                };
            }
        };

        let mut reply = Reply {
            broadcast,
            direct: Vec::new(),
        };
        if let Some(request_id) = request_id {
            let (success, error, data) = match result {
                Ok(data) => (true, None, data),
                Err(error) => {
                    log::warn!("Rejected {action}: {error}");
                    (false, Some(error), None)
                }
            };
            reply.direct.push(ServerMessage::response(OperationResponse {
                request_id,
                success,
                action: Some(action.to_string()),
                version: Some(self.version),
                checksum: Some(self.checksum.clone()),
                error,
                data,
            }));
        }
        reply
    }
}

/// The reference authority server.
pub struct OverlayServer {
    config: ServerConfig,
    authority: Arc<RwLock<Authority>>,
    broadcast: Arc<BroadcastGroup>,
    stats: Arc<RwLock<ServerStats>>,
}

impl OverlayServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let broadcast = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        Self {
            config,
            authority: Arc::new(RwLock::new(Authority::new())),
            broadcast,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Overlay server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let authority = self.authority.clone();
            let broadcast = self.broadcast.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, authority, broadcast, stats.clone()).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        authority: Arc<RwLock<Authority>>,
        broadcast: Arc<BroadcastGroup>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &HandshakeRequest, response: HandshakeResponse| -> Result<HandshakeResponse, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await?;
        let surface = Surface::from_path(&path);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Subscribe under the authority lock so the snapshot and the
        // broadcast stream line up without gaps.
        let (client_id, mut broadcast_rx, snapshot) = {
            let authority = authority.read().await;
            let (client_id, rx) = broadcast.add_client(surface).await;
            (client_id, rx, authority.snapshot())
        };
        log::info!("{} connected from {addr} ({client_id})", surface.as_str());
        ws_sender.send(Message::Text(snapshot.encode()?.into())).await?;

        // Errors end the session; the client is always deregistered.
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.write().await.total_messages += 1;
                            let envelope = match Envelope::decode(text.as_str()) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    log::warn!("Dropping frame from {addr}: {e}");
                                    stats.write().await.rejected_frames += 1;
                                    continue;
                                }
                            };

                            let reply = {
                                let mut authority = authority.write().await;
                                let reply = authority.handle(envelope);
                                if let Some(msg) = &reply.broadcast {
                                    broadcast.broadcast(msg)?;
                                }
                                reply
                            };

                            // Our own copy of the broadcast goes out before the response.
                            loop {
                                match broadcast_rx.try_recv() {
                                    Ok(frame) => ws_sender.send(Message::Text(frame.to_string().into())).await?,
                                    Err(TryRecvError::Lagged(n)) => broadcast.record_lag(n),
                                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                                }
                            }
                            for msg in reply.direct {
                                ws_sender.send(Message::Text(msg.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        _ => {}
                    },

                    frame = broadcast_rx.recv() => match frame {
                        Ok(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                                break Err(e.into());
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Client {client_id} lagged by {n} messages");
                            broadcast.record_lag(n);
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    },
                }
            }
        }
        .await;

        broadcast.remove_client(&client_id).await;
        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Copy of the authoritative collection.
    pub async fn items(&self) -> ItemCollection {
        self.authority.read().await.items().clone()
    }

    pub async fn version(&self) -> u64 {
        self.authority.read().await.version()
    }

    pub fn broadcast_group(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_core::Item;

    fn confirmed(request: Request, id: &str) -> Envelope {
        Envelope::new(request, Some(id.to_string()))
    }

    fn response(reply: &Reply) -> OperationResponse {
        match reply.direct.last() {
            Some(ServerMessage::OperationResponse(frame)) => frame.clone().into_response(),
            other => panic!("expected operation_response, got {other:?}"),
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = OverlayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(server.version().await, 0);
        assert!(server.items().await.is_empty());
    }

    #[test]
    fn test_add_media_assigns_id_and_bumps_version() {
        let mut authority = Authority::new();
        let reply = authority.handle(confirmed(
            Request::AddMedia {
                media: Item::text("Hello"),
            },
            "r1",
        ));

        assert_eq!(authority.version(), 1);
        assert_eq!(authority.items().len(), 1);
        let Some(ServerMessage::AddMedia { media, version, .. }) = &reply.broadcast else {
            panic!("expected add_media broadcast");
        };
        assert!(!media.id.is_empty());
        assert_eq!(*version, Some(1));

        let response = response(&reply);
        assert!(response.success);
        assert_eq!(response.request_id, "r1");
        assert_eq!(response.created_item().unwrap().id, media.id);
        assert_eq!(response.checksum.as_deref(), Some(authority.checksum()));
    }

    #[test]
    fn test_remove_unknown_item_is_rejected() {
        let mut authority = Authority::new();
        let reply = authority.handle(confirmed(
            Request::RemoveMedia {
                media_id: "ghost".to_string(),
            },
            "r1",
        ));
        assert!(reply.broadcast.is_none());
        let response = response(&reply);
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("item not found"));
        assert_eq!(authority.version(), 0);
    }

    #[test]
    fn test_invalid_property_is_rejected() {
        let mut authority = Authority::new();
        authority.handle(Envelope::new(
            Request::AddMedia {
                media: Item::text("Hello"),
            },
            None,
        ));
        let id = authority.items().ids().next().unwrap().to_string();

        let reply = authority.handle(confirmed(Request::update(&id, "opacity", json!(2.0)), "r2"));
        assert!(!response(&reply).success);
        assert_eq!(authority.version(), 1);

        let reply = authority.handle(confirmed(Request::update(&id, "opacity", json!(0.25)), "r3"));
        assert!(response(&reply).success);
        assert_eq!(authority.items().get(&id).unwrap().opacity, 0.25);
        assert_eq!(authority.version(), 2);
    }

    #[test]
    fn test_fire_and_forget_gets_no_response() {
        let mut authority = Authority::new();
        let reply = authority.handle(Envelope::new(Request::ClearAll, None));
        assert!(reply.broadcast.is_some());
        assert!(reply.direct.is_empty());
    }

    #[test]
    fn test_clear_all_reports_count() {
        let mut authority = Authority::new();
        for text in ["a", "b"] {
            authority.handle(Envelope::new(
                Request::AddMedia {
                    media: Item::text(text),
                },
                None,
            ));
        }
        let reply = authority.handle(confirmed(Request::ClearAll, "r1"));
        assert_eq!(response(&reply).data, Some(json!({ "cleared_count": 2 })));
        assert!(authority.items().is_empty());
    }

    #[test]
    fn test_verify_version_drift_sends_snapshot() {
        let mut authority = Authority::new();
        authority.handle(Envelope::new(
            Request::AddMedia {
                media: Item::text("Hello"),
            },
            None,
        ));

        let reply = authority.handle(Envelope::new(
            Request::VerifyVersion {
                client_version: authority.version(),
                client_checksum: authority.checksum().to_string(),
            },
            None,
        ));
        assert_eq!(reply.direct.len(), 1);
        assert!(matches!(
            reply.direct[0],
            ServerMessage::VersionCheck {
                needs_sync: false,
                ..
            }
        ));

        let reply = authority.handle(Envelope::new(
            Request::VerifyVersion {
                client_version: 0,
                client_checksum: String::new(),
            },
            None,
        ));
        assert_eq!(reply.direct.len(), 2);
        assert!(matches!(
            reply.direct[0],
            ServerMessage::VersionCheck {
                needs_sync: true,
                server_version: 1,
                ..
            }
        ));
        assert!(matches!(reply.direct[1], ServerMessage::SyncState { version: 1, .. }));
    }
}
