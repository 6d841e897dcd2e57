//! Reconciliation with the authority: snapshots, drift checks, resync.

use std::time::Instant;

use overlay_core::{state_checksum, ItemCollection};

use crate::client::SyncEvent;
use crate::engine::{Engine, Event};
use crate::protocol::Request;

impl Engine {
    /// Replace local state wholesale. Snapshots always win over incremental
    /// messages, whatever version they carry.
    pub(crate) async fn apply_snapshot(&mut self, items: ItemCollection, version: u64, checksum: String) {
        let count = items.len();
        if !checksum.is_empty() && state_checksum(&items) != checksum {
            log::debug!("Snapshot v{version} checksum {checksum} differs from local digest");
        }
        self.items.write().await.replace_all(items);
        self.version.reset(version, checksum);
        self.sync_requested_at = None;
        log::info!("Applied snapshot v{version} with {count} items");
        self.emit(SyncEvent::StateReplaced { count, version });
    }

    /// Ask for a full snapshot. At most one request is outstanding within
    /// the cooldown; offline requests are deferred to the next open.
    pub(crate) fn request_sync(&mut self) -> bool {
        if !self.is_open() {
            log::debug!("Offline, deferring sync request");
            self.resync_on_open = true;
            return false;
        }
        if let Some(requested_at) = self.sync_requested_at {
            if requested_at.elapsed() < self.config.sync_request_cooldown {
                log::debug!("Sync already requested");
                return false;
            }
        }
        if !self.send_unconfirmed(&Request::RequestSync) {
            return false;
        }
        log::info!("Requested full state sync");
        self.sync_requested_at = Some(Instant::now());
        self.resync_on_open = false;
        true
    }

    /// Report drift. The authority follows up with `sync_state` itself, so
    /// local state is left alone here.
    pub(crate) fn version_checked(&mut self, needs_sync: bool, server_version: u64, server_checksum: String) {
        if !needs_sync {
            log::debug!("Version check ok at v{server_version}");
            return;
        }
        log::warn!(
            "Out of sync: local v{} ({}), server v{} ({})",
            self.version.version,
            self.version.checksum,
            server_version,
            server_checksum
        );
        self.emit(SyncEvent::VersionDrift {
            server_version,
            server_checksum,
        });
    }

    pub(crate) fn verify_version(&self) {
        if !self.is_open() {
            return;
        }
        self.send_unconfirmed(&Request::VerifyVersion {
            client_version: self.version.version,
            client_checksum: self.version.checksum.clone(),
        });
    }

    pub(crate) fn start_version_check(&mut self) {
        self.stop_version_check();
        let period = self.config.version_check_interval;
        let inputs = self.inputs.clone();
        self.version_timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if inputs.send(Event::VersionCheckDue).is_err() {
                    break;
                }
            }
        }));
    }

    pub(crate) fn stop_version_check(&mut self) {
        if let Some(timer) = self.version_timer.take() {
            timer.abort();
        }
    }

    /// Compare a renderer's item count against the collection; a mismatch
    /// triggers a resync.
    pub(crate) async fn verify_item_count(&mut self, renderer_count: usize) -> bool {
        let local = self.items.read().await.len();
        if local == renderer_count {
            return true;
        }
        log::warn!("Renderer shows {renderer_count} items, collection holds {local}");
        self.request_sync();
        false
    }
}
