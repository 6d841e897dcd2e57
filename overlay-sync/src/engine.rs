//! The sync engine task.
//!
//! ```text
//!  SyncClient ──Command──┐
//!                        ▼
//!  link task ──Event──► Engine ──► ItemCollection (Arc<RwLock>) ──► readers
//!  timers    ──Event──┘   │
//!                         └──► SyncEvent channel ──► renderers
//! ```
//!
//! One task owns every piece of mutable sync state: the link, the pending
//! table, the retry queue, the version stamp and the echo markers. Inputs
//! are handled one at a time and each handler runs to completion, so no
//! state is shared with the I/O tasks beyond the channels.
//!
//! Behavior is split by concern across `connection`, `reliability`,
//! `reconcile` and `optimistic`, each adding an `impl Engine` block.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use overlay_core::{ItemCollection, StateVersion};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::client::{ConnectionState, DebugInfo, SyncEvent};
use crate::config::SyncConfig;
use crate::connection::LinkEvent;
use crate::error::SyncError;
use crate::optimistic::{EchoGuard, Edit, Placeholders};
use crate::protocol::{Envelope, Request, ServerMessage};
use crate::reliability::{Completion, Outcome, PendingOperations, RetryQueue};

pub(crate) type ConnectionListener = Box<dyn Fn(bool) + Send + Sync>;

/// Requests from [`crate::SyncClient`] handles.
pub(crate) enum Command {
    Connect {
        endpoint: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendConfirmed {
        request: Request,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Outcome>,
    },
    Send {
        request: Request,
    },
    Edit {
        edit: Edit,
        reply: oneshot::Sender<Outcome>,
    },
    Stream {
        media_id: String,
        property: String,
        value: serde_json::Value,
    },
    RequestSync,
    VerifyCount {
        renderer_count: usize,
        reply: oneshot::Sender<bool>,
    },
    OnConnectionChange(ConnectionListener),
    DebugInfo(oneshot::Sender<DebugInfo>),
}

/// Inputs produced by the engine's own tasks.
pub(crate) enum Event {
    Link(LinkEvent),
    OperationTimeout { correlation_id: String },
    ReconnectDue { generation: u64 },
    VersionCheckDue,
}

/// State of the duplex link as the engine sees it.
pub(crate) enum Link {
    Idle,
    Connecting,
    Open(mpsc::UnboundedSender<String>),
}

pub(crate) struct Engine {
    pub(crate) config: SyncConfig,

    // Connection lifecycle
    pub(crate) endpoint: Option<String>,
    /// Bumped on every new link and on manual disconnect; events tagged
    /// with an older generation are ignored.
    pub(crate) generation: u64,
    pub(crate) link: Link,
    pub(crate) link_task: Option<JoinHandle<()>>,
    pub(crate) reconnect_attempts: u32,
    pub(crate) reconnect_timer: Option<JoinHandle<()>>,
    pub(crate) connect_waiters: Vec<oneshot::Sender<Result<(), SyncError>>>,
    pub(crate) listeners: Vec<ConnectionListener>,

    // Reliability
    pub(crate) pending: PendingOperations,
    pub(crate) retry_queue: RetryQueue,

    // Reconciliation
    pub(crate) version: StateVersion,
    pub(crate) version_timer: Option<JoinHandle<()>>,
    pub(crate) sync_requested_at: Option<Instant>,
    /// A sync was wanted while offline.
    pub(crate) resync_on_open: bool,

    // Optimistic apply
    pub(crate) echoes: EchoGuard,
    pub(crate) placeholders: Placeholders,

    pub(crate) items: Arc<RwLock<ItemCollection>>,
    pub(crate) state: Arc<RwLock<ConnectionState>>,
    pub(crate) events: mpsc::Sender<SyncEvent>,
    /// Sender half of the engine's own input channel, cloned into timers
    /// and link tasks.
    pub(crate) inputs: mpsc::UnboundedSender<Event>,
}

impl Engine {
    pub(crate) fn new(
        config: SyncConfig,
        items: Arc<RwLock<ItemCollection>>,
        state: Arc<RwLock<ConnectionState>>,
        events: mpsc::Sender<SyncEvent>,
        inputs: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let echoes = EchoGuard::new(config.echo_grace);
        Self {
            config,
            endpoint: None,
            generation: 0,
            link: Link::Idle,
            link_task: None,
            reconnect_attempts: 0,
            reconnect_timer: None,
            connect_waiters: Vec::new(),
            listeners: Vec::new(),
            pending: PendingOperations::default(),
            retry_queue: RetryQueue::default(),
            version: StateVersion::default(),
            version_timer: None,
            sync_requested_at: None,
            resync_on_open: false,
            echoes,
            placeholders: Placeholders::default(),
            items,
            state,
            events,
            inputs,
        }
    }

    /// Process inputs until every client handle is gone.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = inputs.recv() => self.handle_event(event).await,
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { endpoint, reply } => self.connect(endpoint, reply).await,
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::SendConfirmed {
                request,
                timeout,
                reply,
            } => {
                let timeout = timeout.unwrap_or(self.config.operation_timeout);
                self.submit(request, timeout, Completion::new(reply, None), 0)
                    .await;
            }
            Command::Send { request } => {
                self.send_unconfirmed(&request);
            }
            Command::Edit { edit, reply } => self.apply_edit(edit, reply).await,
            Command::Stream {
                media_id,
                property,
                value,
            } => self.stream_property(media_id, property, value).await,
            Command::RequestSync => {
                self.request_sync();
            }
            Command::VerifyCount {
                renderer_count,
                reply,
            } => {
                let matches = self.verify_item_count(renderer_count).await;
                let _ = reply.send(matches);
            }
            Command::OnConnectionChange(listener) => self.listeners.push(listener),
            Command::DebugInfo(reply) => {
                let _ = reply.send(self.debug_info());
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Link(LinkEvent::Opened { generation, writer }) => {
                self.link_opened(generation, writer).await;
            }
            Event::Link(LinkEvent::Frame { generation, text }) => {
                if generation == self.generation {
                    self.handle_frame(&text).await;
                }
            }
            Event::Link(LinkEvent::Closed { generation, reason }) => {
                self.link_closed(generation, reason).await;
            }
            Event::OperationTimeout { correlation_id } => {
                self.operation_timed_out(&correlation_id).await;
            }
            Event::ReconnectDue { generation } => self.reconnect_due(generation).await,
            Event::VersionCheckDue => self.verify_version(),
        }
    }

    /// Dispatch one inbound frame. Malformed frames never affect the link.
    pub(crate) async fn handle_frame(&mut self, text: &str) {
        let message = match ServerMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping inbound frame: {e}");
                return;
            }
        };

        match message {
            ServerMessage::OperationResponse(frame) => {
                self.handle_response(frame.into_response()).await;
            }
            ServerMessage::SyncState {
                state,
                version,
                checksum,
            } => self.apply_snapshot(state.items, version, checksum).await,
            ServerMessage::VersionCheck {
                needs_sync,
                server_version,
                server_checksum,
            } => self.version_checked(needs_sync, server_version, server_checksum),
            broadcast @ (ServerMessage::AddMedia { .. }
            | ServerMessage::RemoveMedia { .. }
            | ServerMessage::UpdateProperty { .. }
            | ServerMessage::ClearAll { .. }) => self.apply_broadcast(broadcast).await,
        }
    }

    /// Write one frame without correlation. Returns `false` when offline.
    pub(crate) fn send_unconfirmed(&self, request: &Request) -> bool {
        let Link::Open(writer) = &self.link else {
            log::warn!("Not connected, dropping {}", request.action());
            return false;
        };
        match Envelope::new(request.clone(), None).encode() {
            Ok(frame) => writer.send(frame).is_ok(),
            Err(e) => {
                log::error!("Failed to encode {}: {e}", request.action());
                false
            }
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.link, Link::Open(_))
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Deliver an event to the consumer; a full channel drops it.
    pub(crate) fn emit(&self, event: SyncEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("Event channel full, dropping {event:?}");
        }
    }

    /// Run connection listeners. A panicking listener is logged and skipped.
    pub(crate) fn notify_connection(&self, connected: bool) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(connected))).is_err() {
                log::error!("Connection listener panicked");
            }
        }
    }

    fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            connected: self.is_open(),
            version: self.version.version,
            checksum: self.version.checksum.clone(),
            pending_operations: self.pending.len(),
            retry_queue: self.retry_queue.len(),
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    async fn shutdown(&mut self) {
        log::debug!("Sync engine stopping");
        self.generation += 1;
        self.stop_version_check();
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.link = Link::Idle;
        self.fail_all(|| SyncError::EngineStopped).await;
    }
}
