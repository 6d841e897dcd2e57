//! Optimistic apply and echo suppression.
//!
//! Local edits land in the collection before the authority confirms them.
//! The authority then broadcasts the same change back to every client,
//! originator included. Until the echo of the latest local edit on a key
//! arrives, broadcasts for that key carrying a different value were
//! accepted before it and are skipped. The echo itself is applied (a no-op
//! on the collection) and releases the key, so anything the authority
//! accepts afterwards applies normally. A released marker lingers for a
//! short grace window for logging only.
//!
//! `add_media` drafts are shown under a `local-` placeholder id. The first
//! `add_media` broadcast whose content matches a draft replaces its
//! placeholder in one step, whichever of broadcast and response comes first.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use overlay_core::{validate_property, Applied, Item, Mutation};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::client::SyncEvent;
use crate::engine::Engine;
use crate::error::SyncError;
use crate::protocol::{Request, ServerMessage};
use crate::reliability::{Completion, Outcome};

/// A discrete local edit: applied at once, confirmed by the authority.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Create an item from a draft. The local copy gets a placeholder id
    /// until the authority assigns the real one.
    AddMedia(Item),
    RemoveMedia(String),
    SetProperty {
        media_id: String,
        property: String,
        value: Value,
    },
    ClearAll,
}

/// What an unconfirmed edit needs to undo or finalize once settled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Intent {
    AddMedia { placeholder_id: String },
    RemoveMedia { media_id: String },
    SetProperty { media_id: String, property: String },
    ClearAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum EchoKey {
    Item(String),
    Property(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EchoVerdict {
    /// No local edit on this key.
    Apply,
    /// Matches a local edit; applying it changes nothing.
    Echo,
    /// Older than an unconfirmed local edit.
    Superseded,
}

#[derive(Debug, Default)]
struct Marker {
    /// Local edits on this key whose echo has not arrived yet.
    in_flight: u32,
    latest: Option<Value>,
    grace_until: Option<Instant>,
}

/// Echo markers by key. Expired markers are pruned on lookup.
#[derive(Debug)]
pub(crate) struct EchoGuard {
    markers: HashMap<EchoKey, Marker>,
    grace: Duration,
}

impl EchoGuard {
    pub(crate) fn new(grace: Duration) -> Self {
        Self {
            markers: HashMap::new(),
            grace,
        }
    }

    pub(crate) fn begin(&mut self, key: EchoKey, value: Option<Value>) {
        let marker = self.markers.entry(key).or_default();
        marker.in_flight += 1;
        marker.latest = value;
        marker.grace_until = None;
    }

    pub(crate) fn finish(&mut self, key: &EchoKey, now: Instant) {
        if let Some(marker) = self.markers.get_mut(key) {
            marker.in_flight = marker.in_flight.saturating_sub(1);
            if marker.in_flight == 0 {
                marker.grace_until = Some(now + self.grace);
            }
        }
    }

    /// Classify a broadcast on `key`. The echo of the latest local edit
    /// releases the marker: the authority accepted every earlier edit on
    /// the key before it.
    pub(crate) fn verdict(&mut self, key: &EchoKey, value: Option<&Value>, now: Instant) -> EchoVerdict {
        self.prune(now);
        let Some(marker) = self.markers.get_mut(key) else {
            return EchoVerdict::Apply;
        };
        if marker.in_flight == 0 {
            return EchoVerdict::Echo;
        }
        match value {
            Some(value) if marker.latest.as_ref() != Some(value) => EchoVerdict::Superseded,
            _ => {
                marker.in_flight = 0;
                marker.grace_until = Some(now + self.grace);
                EchoVerdict::Echo
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        self.markers
            .retain(|_, m| m.in_flight > 0 || m.grace_until.is_some_and(|until| now < until));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.markers.len()
    }
}

/// Unconfirmed `add_media` drafts, oldest first.
#[derive(Debug, Default)]
pub(crate) struct Placeholders {
    drafts: Vec<(String, Item)>,
}

impl Placeholders {
    pub(crate) fn insert(&mut self, placeholder_id: String, draft: Item) {
        self.drafts.push((placeholder_id, draft));
    }

    /// Claim the oldest draft with the same content as `created`.
    pub(crate) fn claim(&mut self, created: &Item) -> Option<String> {
        let mut content = created.clone();
        content.id.clear();
        let index = self.drafts.iter().position(|(_, draft)| *draft == content)?;
        Some(self.drafts.remove(index).0)
    }

    pub(crate) fn forget(&mut self, placeholder_id: &str) {
        self.drafts.retain(|(id, _)| id != placeholder_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.drafts.len()
    }
}

fn mutation_event(mutation: Mutation) -> SyncEvent {
    match mutation {
        Mutation::Add(item) => SyncEvent::ItemAdded(item),
        Mutation::Remove(id) => SyncEvent::ItemRemoved(id),
        Mutation::Update {
            id,
            property,
            value,
        } => SyncEvent::PropertyChanged {
            media_id: id,
            property,
            value,
        },
        Mutation::Clear => SyncEvent::Cleared,
    }
}

impl Engine {
    /// Apply a mutation to the shared collection and report real changes.
    async fn apply_local(&self, mutation: Mutation) -> Applied {
        let applied = self.items.write().await.apply(&mutation);
        if applied == Applied::Changed {
            self.emit(mutation_event(mutation));
        }
        applied
    }

    /// Reject a property change the authority would refuse anyway.
    async fn check_property(&self, media_id: &str, property: &str, value: &Value) -> Result<(), SyncError> {
        let items = self.items.read().await;
        let item = items
            .get(media_id)
            .ok_or_else(|| SyncError::UnknownItem(media_id.to_string()))?;
        validate_property(item.kind, property, value)?;
        item.clone().apply_property(property, value)?;
        Ok(())
    }

    pub(crate) async fn apply_edit(&mut self, edit: Edit, reply: oneshot::Sender<Outcome>) {
        match edit {
            Edit::AddMedia(mut draft) => {
                draft.id.clear();
                if draft.z_index == 0 {
                    // Unplaced drafts go on top.
                    draft.z_index = self.items.read().await.next_z_index();
                }
                let placeholder_id = format!("local-{}", Uuid::new_v4().simple());
                self.apply_local(Mutation::Add(draft.clone().with_id(placeholder_id.clone())))
                    .await;
                self.placeholders.insert(placeholder_id.clone(), draft.clone());

                let intent = Intent::AddMedia { placeholder_id };
                let timeout = self.config.operation_timeout;
                self.submit(
                    Request::AddMedia { media: draft },
                    timeout,
                    Completion::new(reply, Some(intent)),
                    0,
                )
                .await;
            }
            Edit::RemoveMedia(media_id) => {
                self.apply_local(Mutation::Remove(media_id.clone())).await;
                self.echoes.begin(EchoKey::Item(media_id.clone()), None);

                let intent = Intent::RemoveMedia {
                    media_id: media_id.clone(),
                };
                let timeout = self.config.operation_timeout;
                self.submit(
                    Request::RemoveMedia { media_id },
                    timeout,
                    Completion::new(reply, Some(intent)),
                    0,
                )
                .await;
            }
            Edit::SetProperty {
                media_id,
                property,
                value,
            } => {
                if let Err(e) = self.check_property(&media_id, &property, &value).await {
                    log::warn!("Refusing {property} on {media_id}: {e}");
                    let _ = reply.send(Err(e));
                    return;
                }
                self.apply_local(Mutation::Update {
                    id: media_id.clone(),
                    property: property.clone(),
                    value: value.clone(),
                })
                .await;
                self.echoes.begin(
                    EchoKey::Property(media_id.clone(), property.clone()),
                    Some(value.clone()),
                );

                let intent = Intent::SetProperty {
                    media_id: media_id.clone(),
                    property: property.clone(),
                };
                let timeout = self.config.interactive_timeout;
                self.submit(
                    Request::update(media_id, property, value),
                    timeout,
                    Completion::new(reply, Some(intent)),
                    0,
                )
                .await;
            }
            Edit::ClearAll => {
                self.apply_local(Mutation::Clear).await;
                let timeout = self.config.operation_timeout;
                self.submit(
                    Request::ClearAll,
                    timeout,
                    Completion::new(reply, Some(Intent::ClearAll)),
                    0,
                )
                .await;
            }
        }
    }

    /// Live drag or resize frame: local apply plus an unconfirmed send.
    pub(crate) async fn stream_property(&mut self, media_id: String, property: String, value: Value) {
        if let Err(e) = self.check_property(&media_id, &property, &value).await {
            log::warn!("Dropping streamed {property} on {media_id}: {e}");
            return;
        }
        self.apply_local(Mutation::Update {
            id: media_id.clone(),
            property: property.clone(),
            value: value.clone(),
        })
        .await;
        self.send_unconfirmed(&Request::update(media_id, property, value));
    }

    /// Apply an authority broadcast, honoring version order and echo markers.
    ///
    /// A skipped broadcast does not advance the held version, so a later
    /// drift check still sees the gap if the local edit never lands.
    pub(crate) async fn apply_broadcast(&mut self, message: ServerMessage) {
        let stamp = message.stamp();
        if let Some((version, _)) = stamp {
            if self.version.is_stale(version) {
                log::debug!(
                    "Ignoring stale {} v{} (holding v{})",
                    message.action(),
                    version,
                    self.version.version
                );
                return;
            }
        }
        let Some(mutation) = message.mutation() else {
            return;
        };

        let now = Instant::now();
        let verdict = match &mutation {
            Mutation::Update {
                id,
                property,
                value,
            } => self.echoes.verdict(
                &EchoKey::Property(id.clone(), property.clone()),
                Some(value),
                now,
            ),
            Mutation::Remove(id) => self.echoes.verdict(&EchoKey::Item(id.clone()), None, now),
            Mutation::Add(_) | Mutation::Clear => EchoVerdict::Apply,
        };
        match verdict {
            EchoVerdict::Superseded => {
                log::debug!("Skipping {} superseded by a local edit", message.action());
                return;
            }
            EchoVerdict::Echo => log::debug!("Echo of local {}", message.action()),
            EchoVerdict::Apply => {}
        }

        let claimed = match &mutation {
            Mutation::Add(created) => self.placeholders.claim(created),
            _ => None,
        };
        match (claimed, mutation) {
            (Some(placeholder_id), Mutation::Add(created)) => {
                self.swap_placeholder(placeholder_id, created).await;
            }
            (_, mutation) => {
                if self.apply_local(mutation).await == Applied::Rejected {
                    log::warn!("Broadcast {} could not be applied", message.action());
                }
            }
        }
        if let Some((version, checksum)) = stamp {
            self.version.observe(version, checksum);
        }
    }

    /// Replace a placeholder with the authority's item in one write.
    async fn swap_placeholder(&self, placeholder_id: String, created: Item) {
        let (removed, added) = {
            let mut items = self.items.write().await;
            let removed = items.apply(&Mutation::Remove(placeholder_id.clone()));
            let added = items.apply(&Mutation::Add(created.clone()));
            (removed, added)
        };
        log::debug!("Placeholder {placeholder_id} confirmed as {}", created.id);
        if removed == Applied::Changed {
            self.emit(SyncEvent::ItemRemoved(placeholder_id));
        }
        if added == Applied::Changed {
            self.emit(SyncEvent::ItemAdded(created));
        }
    }

    /// Finalize the optimistic effect of a settled edit.
    pub(crate) async fn settle(&mut self, intent: Intent, outcome: &Outcome) {
        let now = Instant::now();
        match intent {
            Intent::AddMedia { placeholder_id } => {
                // Already swapped if the broadcast came first.
                self.placeholders.forget(&placeholder_id);
                let created = outcome.as_ref().ok().and_then(|response| {
                    let current = response
                        .version
                        .is_none_or(|version| !self.version.is_stale(version));
                    response
                        .created_item()
                        .filter(|item| current && !item.id.is_empty())
                });
                let known = match &created {
                    Some(item) => self.items.read().await.contains(&item.id),
                    None => true,
                };
                match created {
                    Some(created) if !known => self.swap_placeholder(placeholder_id, created).await,
                    _ => {
                        self.apply_local(Mutation::Remove(placeholder_id)).await;
                    }
                }
            }
            Intent::RemoveMedia { media_id } => {
                self.echoes.finish(&EchoKey::Item(media_id), now);
            }
            Intent::SetProperty { media_id, property } => {
                self.echoes.finish(&EchoKey::Property(media_id, property), now);
            }
            Intent::ClearAll => {}
        }

        if let Err(e) = outcome {
            log::warn!("Local edit failed ({e}), requesting resync");
            self.request_sync();
        }
    }
}
