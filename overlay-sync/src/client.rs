//! Sync client handle for editor, control panel and renderer surfaces.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, automatic reconnect)
//! - Confirmed requests with timeout, retry and offline queueing
//! - Optimistic edits with echo suppression
//! - A read-only view of the synchronized item collection
//!
//! All work happens on a background engine task; this handle only sends
//! commands and reads shared state. It must be created inside a Tokio
//! runtime.

use std::sync::Arc;
use std::time::Duration;

use overlay_core::{Item, ItemCollection};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::SyncConfig;
use crate::engine::{Command, Engine};
use crate::error::SyncError;
use crate::optimistic::Edit;
use crate::protocol::{OperationResponse, Request};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted. Only an explicit connect leaves this.
    Failed,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost or closed
    Disconnected,
    /// Reconnect ceiling reached; outstanding operations have failed
    ReconnectFailed,
    ItemAdded(Item),
    ItemRemoved(String),
    PropertyChanged {
        media_id: String,
        property: String,
        value: Value,
    },
    Cleared,
    /// The collection was replaced by an authority snapshot
    StateReplaced { count: usize, version: u64 },
    /// The authority reported that our version or checksum is off
    VersionDrift {
        server_version: u64,
        server_checksum: String,
    },
}

/// Snapshot of the engine's bookkeeping, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub connected: bool,
    pub version: u64,
    pub checksum: String,
    pub pending_operations: usize,
    pub retry_queue: usize,
    pub reconnect_attempts: u32,
}

/// The sync client.
pub struct SyncClient {
    /// Commands to the engine task
    commands: mpsc::UnboundedSender<Command>,

    /// Connection state, written by the engine
    state: Arc<RwLock<ConnectionState>>,

    /// Synchronized collection, written by the engine
    items: Arc<RwLock<ItemCollection>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    config: SyncConfig,
}

impl SyncClient {
    /// Create a client and start its engine task.
    pub fn new(config: SyncConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let items = Arc::new(RwLock::new(ItemCollection::new()));

        let engine = Engine::new(
            config.clone(),
            items.clone(),
            state.clone(),
            event_tx,
            input_tx,
        );
        tokio::spawn(engine.run(command_rx, input_rx));

        Self {
            commands: command_tx,
            state,
            items,
            event_rx: Some(event_rx),
            config,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn command(&self, command: Command) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::EngineStopped)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(make(reply_tx))?;
        reply_rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Connect to an authority endpoint such as `ws://host:8000/ws/editor`.
    ///
    /// Resolves once the link is open. A no-op while already connecting or
    /// connected. Fails with [`SyncError::ReconnectFailed`] if every attempt
    /// fails, or [`SyncError::Disconnected`] if [`Self::disconnect`] is
    /// called first.
    pub async fn connect(&self, endpoint: impl Into<String>) -> Result<(), SyncError> {
        let endpoint = endpoint.into();
        self.call(|reply| Command::Connect { endpoint, reply })
            .await?
    }

    /// Close the link without reconnecting. Outstanding operations fail
    /// with [`SyncError::Disconnected`].
    pub async fn disconnect(&self) {
        let _ = self.call(|reply| Command::Disconnect { reply }).await;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// Register a callback for open (`true`) and close (`false`).
    ///
    /// Callbacks run on the engine task and must not block. A panicking
    /// callback is logged and does not affect the others.
    pub fn on_connection_change(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        let _ = self.command(Command::OnConnectionChange(Box::new(listener)));
    }

    /// Send a request and wait for the authority's confirmation.
    ///
    /// Timeouts and lost links are retried up to the configured ceiling;
    /// while offline the request waits in the retry queue. `timeout`
    /// defaults to [`SyncConfig::operation_timeout`].
    pub async fn send_with_confirmation(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<OperationResponse, SyncError> {
        self.call(|reply| Command::SendConfirmed {
            request,
            timeout,
            reply,
        })
        .await?
    }

    /// Fire-and-forget send. Never queued or retried.
    pub async fn send(&self, request: Request) -> Result<(), SyncError> {
        if !self.is_connected().await {
            return Err(SyncError::NotConnected);
        }
        self.command(Command::Send { request })
    }

    async fn edit(&self, edit: Edit) -> Result<OperationResponse, SyncError> {
        self.call(|reply| Command::Edit { edit, reply }).await?
    }

    /// Create an item. A placeholder appears locally at once and is
    /// replaced by the authority's item on confirmation.
    pub async fn add_media(&self, draft: Item) -> Result<OperationResponse, SyncError> {
        self.edit(Edit::AddMedia(draft)).await
    }

    pub async fn remove_media(&self, media_id: impl Into<String>) -> Result<OperationResponse, SyncError> {
        self.edit(Edit::RemoveMedia(media_id.into())).await
    }

    /// Change one property locally and confirm it with the authority.
    ///
    /// Values outside their valid range are refused before sending.
    pub async fn set_property(
        &self,
        media_id: impl Into<String>,
        property: impl Into<String>,
        value: Value,
    ) -> Result<OperationResponse, SyncError> {
        self.edit(Edit::SetProperty {
            media_id: media_id.into(),
            property: property.into(),
            value,
        })
        .await
    }

    /// Live update during a drag or resize.
    ///
    /// Applied locally even when offline, in which case
    /// [`SyncError::NotConnected`] is returned. Finish the gesture with
    /// [`Self::set_property`] to get a confirmed final value.
    pub async fn stream_property(
        &self,
        media_id: impl Into<String>,
        property: impl Into<String>,
        value: Value,
    ) -> Result<(), SyncError> {
        self.command(Command::Stream {
            media_id: media_id.into(),
            property: property.into(),
            value,
        })?;
        if self.is_connected().await {
            Ok(())
        } else {
            Err(SyncError::NotConnected)
        }
    }

    pub async fn clear_all(&self) -> Result<OperationResponse, SyncError> {
        self.edit(Edit::ClearAll).await
    }

    /// Ask the authority for a full snapshot.
    pub fn request_sync(&self) {
        let _ = self.command(Command::RequestSync);
    }

    /// Compare the number of items a renderer shows with the collection.
    /// A mismatch requests a resync and returns `false`.
    pub async fn verify_item_count(&self, renderer_count: usize) -> Result<bool, SyncError> {
        self.call(|reply| Command::VerifyCount {
            renderer_count,
            reply,
        })
        .await
    }

    /// Copy of the current collection.
    pub async fn items(&self) -> ItemCollection {
        self.items.read().await.clone()
    }

    pub async fn item(&self, id: &str) -> Option<Item> {
        self.items.read().await.get(id).cloned()
    }

    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn debug_info(&self) -> Result<DebugInfo, SyncError> {
        self.call(Command::DebugInfo).await
    }
}
