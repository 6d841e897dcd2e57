//! Fan-out of authority broadcasts to every connected surface.
//!
//! Uses a tokio broadcast channel: each frame is encoded once and shared
//! as an `Arc<String>`. Every client, the originator of a mutation
//! included, gets its own receiver buffering up to `capacity` frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Which UI a connection belongs to, taken from its request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    Editor,
    Control,
    Overlay,
    Other,
}

impl Surface {
    pub fn from_path(path: &str) -> Self {
        match path.trim_end_matches('/') {
            "/ws/editor" => Self::Editor,
            "/ws/control" => Self::Control,
            "/ws/overlay" => Self::Overlay,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Editor => "editor",
            Self::Control => "control",
            Self::Overlay => "overlay",
            Self::Other => "other",
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_clients: usize,
}

/// Lock-free counters for the send path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<String>>,

    /// Connected clients and their surface
    clients: Arc<RwLock<HashMap<Uuid, Surface>>>,

    /// Frames buffered per receiver before it lags
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            clients: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a client. Returns its id and a receiver for its frames.
    pub async fn add_client(&self, surface: Surface) -> (Uuid, broadcast::Receiver<Arc<String>>) {
        let client_id = Uuid::new_v4();
        self.clients.write().await.insert(client_id, surface);
        (client_id, self.sender.subscribe())
    }

    pub async fn remove_client(&self, client_id: &Uuid) -> Option<Surface> {
        self.clients.write().await.remove(client_id)
    }

    /// Encode once and send to every client. Returns the receiver count.
    pub fn broadcast(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, encoded: Arc<String>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a slow receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.atomic_stats
            .messages_lagged
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Number of connected clients per surface.
    pub async fn surfaces(&self) -> HashMap<Surface, usize> {
        let mut counts = HashMap::new();
        for surface in self.clients.read().await.values() {
            *counts.entry(*surface).or_insert(0) += 1;
        }
        counts
    }

    pub async fn has_client(&self, client_id: &Uuid) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.atomic_stats.messages_lagged.load(Ordering::Relaxed),
            active_clients: self.clients.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_from_path() {
        assert_eq!(Surface::from_path("/ws/editor"), Surface::Editor);
        assert_eq!(Surface::from_path("/ws/control/"), Surface::Control);
        assert_eq!(Surface::from_path("/ws/overlay"), Surface::Overlay);
        assert_eq!(Surface::from_path("/"), Surface::Other);
        assert_eq!(Surface::Overlay.as_str(), "overlay");
    }

    #[tokio::test]
    async fn test_add_remove_client() {
        let group = BroadcastGroup::new(16);
        let (id, _rx) = group.add_client(Surface::Editor).await;
        assert_eq!(group.client_count().await, 1);
        assert!(group.has_client(&id).await);

        assert_eq!(group.remove_client(&id).await, Some(Surface::Editor));
        assert_eq!(group.client_count().await, 0);
        assert!(!group.has_client(&id).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_originator_too() {
        let group = BroadcastGroup::new(16);
        let (_, mut editor) = group.add_client(Surface::Editor).await;
        let (_, mut overlay) = group.add_client(Surface::Overlay).await;

        let msg = ServerMessage::ClearAll {
            version: Some(3),
            checksum: Some("abcd1234".to_string()),
        };
        assert_eq!(group.broadcast(&msg).unwrap(), 2);

        let a = editor.recv().await.unwrap();
        let b = overlay.recv().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ServerMessage::decode(&a).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let (_, mut rx) = group.add_client(Surface::Overlay).await;
        for i in 0..4 {
            group.broadcast_raw(Arc::new(format!("frame {i}")));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("expected lag, got {other:?}"),
        }

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 4);
        assert_eq!(stats.messages_lagged, 2);
        assert_eq!(stats.active_clients, 1);
    }

    #[tokio::test]
    async fn test_surface_counts() {
        let group = BroadcastGroup::new(8);
        let _a = group.add_client(Surface::Editor).await;
        let _b = group.add_client(Surface::Overlay).await;
        let _c = group.add_client(Surface::Overlay).await;

        let counts = group.surfaces().await;
        assert_eq!(counts.get(&Surface::Overlay), Some(&2));
        assert_eq!(counts.get(&Surface::Editor), Some(&1));
        assert_eq!(counts.get(&Surface::Control), None);
        assert_eq!(group.capacity(), 8);
    }
}
