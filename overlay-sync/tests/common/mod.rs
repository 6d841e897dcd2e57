//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use overlay_sync::server::{OverlayServer, ServerConfig};
use overlay_sync::{SyncConfig, SyncEvent};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a reference authority on a free port, return the port.
pub async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
    };
    let server = OverlayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Client settings scaled down so failure paths finish quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        operation_timeout: Duration::from_millis(150),
        interactive_timeout: Duration::from_millis(150),
        echo_grace: Duration::from_millis(50),
        request_sync_on_connect: false,
        ..SyncConfig::default()
    }
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn next_event_matching(
    events: &mut mpsc::Receiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// A bare WebSocket server whose every move is driven by the test.
pub struct ScriptedServer {
    pub port: u16,
    connections: mpsc::UnboundedReceiver<ScriptedConnection>,
    acceptor: JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ScriptedConnection { ws }).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            port,
            connections: rx,
            acceptor,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws/editor", self.port)
    }

    pub async fn accept(&mut self) -> ScriptedConnection {
        timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .expect("no client connected")
            .expect("acceptor stopped")
    }

    /// Stop accepting; later connection attempts are refused.
    pub fn stop(&self) {
        self.acceptor.abort();
    }
}

pub struct ScriptedConnection {
    ws: WebSocketStream<TcpStream>,
}

impl ScriptedConnection {
    /// Next JSON frame from the client, if one arrives within `within`.
    pub async fn try_next_frame(&mut self, within: Duration) -> Option<Value> {
        timeout(within, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str(text.as_str()).ok();
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn next_frame(&mut self) -> Value {
        self.try_next_frame(Duration::from_secs(2))
            .await
            .expect("expected a frame from the client")
    }

    /// Skip frames until one with the given action arrives.
    pub async fn next_action(&mut self, action: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["action"] == action {
                return frame;
            }
        }
    }

    pub async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    /// Answer a correlated request in the nested form the authority uses.
    pub async fn respond(&mut self, request: &Value, success: bool, version: u64) {
        let mut response = json!({
            "request_id": request["request_id"],
            "success": success,
            "action": request["action"],
            "version": version,
            "checksum": format!("{version:08x}"),
        });
        if !success {
            response["error"] = json!("item not found");
        }
        self.send(json!({ "action": "operation_response", "response": response }))
            .await;
    }

    pub async fn send_snapshot(&mut self, items: Value, version: u64) {
        self.send(json!({
            "action": "sync_state",
            "state": { "items": items },
            "version": version,
            "checksum": format!("{version:08x}"),
        }))
        .await;
    }
}
