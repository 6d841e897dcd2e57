//! # overlay-sync: reliable state synchronization for overlay surfaces
//!
//! Keeps the editor, control panel and display overlay showing the same
//! set of items while the link to the authority drops and recovers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌───────────────┐
//! │ SyncClient   │ ◄──────────────────► │ OverlayServer │
//! │ (per surface)│      JSON frames     │ (authority)   │
//! └──────┬───────┘                      └───────┬───────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────┐                      ┌───────────────┐
//! │ Engine task  │                      │ Authority     │
//! │  reliability │                      │ (items,       │
//! │  reconcile   │                      │  version)     │
//! │  optimistic  │                      └───────┬───────┘
//! └──────┬───────┘                              │
//!        ▼                              ┌───────┴───────┐
//! ┌──────────────┐                      │ BroadcastGroup│
//! │ItemCollection│                      │ (fan-out)     │
//! └──────────────┘                      └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire protocol (`action`-tagged frames)
//! - [`client`]: client handle, events and connection state
//! - [`config`]: client timeouts, retry and reconnect limits
//! - [`error`]: caller-visible failures
//! - [`broadcast`]: fan-out to every connected surface
//! - [`server`]: in-memory reference authority
//!
//! The engine internals (connection lifecycle, reliability layer, version
//! reconciliation, optimistic apply) live in private modules driven by
//! [`SyncClient`].

pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

mod connection;
mod engine;
mod optimistic;
mod reconcile;
mod reliability;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Surface};
pub use client::{ConnectionState, DebugInfo, SyncClient, SyncEvent};
pub use config::SyncConfig;
pub use error::SyncError;
pub use optimistic::Edit;
pub use protocol::{
    Envelope, OperationResponse, ProtocolError, Request, ResponseFrame, ServerMessage,
    SnapshotState,
};
pub use reliability::{correlation_id, Outcome};
pub use server::{Authority, OverlayServer, Reply, ServerConfig, ServerStats};
