//! Connection lifecycle: one link task per attempt, fixed-delay reconnect.
//!
//! The link task owns the socket. It reports `Opened` with a writer
//! channel, forwards every inbound text frame, and reports `Closed` once
//! when the socket ends for any reason. Each task carries the generation
//! it was spawned under so the engine can discard events from sockets it
//! has already abandoned.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::client::{ConnectionState, SyncEvent};
use crate::engine::{Engine, Event, Link};
use crate::error::SyncError;

/// What a link task reports back to the engine.
pub(crate) enum LinkEvent {
    Opened {
        generation: u64,
        writer: mpsc::UnboundedSender<String>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

/// Check that `endpoint` is a usable `ws://` or `wss://` URL.
pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), SyncError> {
    let invalid = |reason: String| SyncError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
        return Err(invalid("scheme must be ws or wss".to_string()));
    }
    endpoint
        .into_client_request()
        .map(|_| ())
        .map_err(|e| invalid(e.to_string()))
}

pub(crate) fn spawn_link(
    generation: u64,
    endpoint: String,
    inputs: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = match run_link(generation, &endpoint, &inputs).await {
            Ok(()) => "connection closed".to_string(),
            Err(e) => e.to_string(),
        };
        let _ = inputs.send(Event::Link(LinkEvent::Closed { generation, reason }));
    })
}

async fn run_link(
    generation: u64,
    endpoint: &str,
    inputs: &mpsc::UnboundedSender<Event>,
) -> Result<(), SyncError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let opened = LinkEvent::Opened {
        generation,
        writer: out_tx,
    };
    if inputs.send(Event::Link(opened)).is_err() {
        return Ok(());
    }

    let forward = |text: String| inputs.send(Event::Link(LinkEvent::Frame { generation, text }));

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(text) => ws_writer
                    .send(Message::Text(text.into()))
                    .await
                    .map_err(|e| SyncError::Transport(e.to_string()))?,
                None => {
                    // Engine dropped the writer: close politely.
                    let _ = ws_writer.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            inbound = ws_reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if forward(text.as_str().to_string()).is_err() {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        if forward(text).is_err() {
                            return Ok(());
                        }
                    }
                    Err(_) => log::warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SyncError::Transport(e.to_string())),
            }
        }
    }
}

impl Engine {
    pub(crate) async fn connect(
        &mut self,
        endpoint: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    ) {
        if let Err(e) = validate_endpoint(&endpoint) {
            let _ = reply.send(Err(e));
            return;
        }
        match self.link {
            Link::Open(_) | Link::Connecting => {
                let _ = reply.send(Ok(()));
                return;
            }
            Link::Idle => {}
        }

        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.endpoint = Some(endpoint);
        self.reconnect_attempts = 0;
        self.connect_waiters.push(reply);
        self.open_link().await;
    }

    async fn open_link(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        self.generation += 1;
        self.link = Link::Connecting;
        let state = if self.reconnect_attempts > 0 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        self.set_state(state).await;

        log::info!("Connecting to {endpoint}");
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        self.link_task = Some(spawn_link(self.generation, endpoint, self.inputs.clone()));
    }

    pub(crate) async fn link_opened(
        &mut self,
        generation: u64,
        writer: mpsc::UnboundedSender<String>,
    ) {
        if generation != self.generation {
            // Dropping the writer closes the abandoned socket.
            return;
        }
        log::info!(
            "Connected to {}",
            self.endpoint.as_deref().unwrap_or_default()
        );
        self.link = Link::Open(writer);
        self.reconnect_attempts = 0;
        self.set_state(ConnectionState::Connected).await;
        self.notify_connection(true);
        self.emit(SyncEvent::Connected);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        self.start_version_check();
        self.flush_retry_queue().await;
        let empty = self.items.read().await.is_empty();
        if self.resync_on_open || (self.config.request_sync_on_connect && empty) {
            self.request_sync();
        }
    }

    pub(crate) async fn link_closed(&mut self, generation: u64, reason: String) {
        if generation != self.generation || matches!(self.link, Link::Idle) {
            return;
        }
        let was_open = self.is_open();
        if was_open {
            log::warn!("Connection lost: {reason}");
        } else {
            log::warn!("Connection attempt failed: {reason}");
        }
        self.link = Link::Idle;
        self.link_task = None;
        self.stop_version_check();
        self.set_state(ConnectionState::Disconnected).await;
        // Listeners only hear about links they were told opened.
        if was_open {
            self.notify_connection(false);
            self.emit(SyncEvent::Disconnected);
        }

        self.requeue_pending().await;
        self.schedule_reconnect().await;
    }

    async fn schedule_reconnect(&mut self) {
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            log::error!(
                "Giving up after {} reconnect attempts",
                self.reconnect_attempts
            );
            self.set_state(ConnectionState::Failed).await;
            for waiter in self.connect_waiters.drain(..) {
                let _ = waiter.send(Err(SyncError::ReconnectFailed));
            }
            self.fail_all(|| SyncError::ReconnectFailed).await;
            self.emit(SyncEvent::ReconnectFailed);
            return;
        }

        self.reconnect_attempts += 1;
        let delay = self.config.reconnect_delay;
        log::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            self.reconnect_attempts,
            self.config.max_reconnect_attempts
        );
        let generation = self.generation;
        let inputs = self.inputs.clone();
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Event::ReconnectDue { generation });
        }));
    }

    pub(crate) async fn reconnect_due(&mut self, generation: u64) {
        if generation != self.generation || !matches!(self.link, Link::Idle) {
            return;
        }
        self.reconnect_timer = None;
        self.open_link().await;
    }

    /// Manual disconnect: no reconnect, everything outstanding fails.
    pub(crate) async fn disconnect(&mut self) {
        let was_open = self.is_open();
        self.generation += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.stop_version_check();
        match std::mem::replace(&mut self.link, Link::Idle) {
            // The link task closes the socket once its writer is dropped.
            Link::Open(_) => self.link_task = None,
            Link::Connecting | Link::Idle => {
                if let Some(task) = self.link_task.take() {
                    task.abort();
                }
            }
        }

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(SyncError::Disconnected));
        }
        self.fail_all(|| SyncError::Disconnected).await;
        self.set_state(ConnectionState::Disconnected).await;
        if was_open {
            log::info!("Disconnected");
            self.notify_connection(false);
            self.emit(SyncEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("ws://localhost:8000/ws/editor").is_ok());
        assert!(validate_endpoint("wss://example.com/ws/overlay").is_ok());
        assert!(matches!(
            validate_endpoint("http://localhost:8000"),
            Err(SyncError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            validate_endpoint("not a url"),
            Err(SyncError::InvalidEndpoint { .. })
        ));
        assert!(validate_endpoint("ws://bad host/").is_err());
    }
}
