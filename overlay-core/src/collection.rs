//! The item collection and the mutations applied to it.
//!
//! Keys are unique item ids. Iteration follows insertion order, which is
//! also the tie-breaker when two items share a `z_index`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::item::{Item, CANVAS_SIZE};

/// One change to the collection, as carried by a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert or replace an item. The item must carry its final id.
    Add(Item),
    Remove(String),
    Update {
        id: String,
        property: String,
        value: Value,
    },
    Clear,
}

/// Outcome of [`ItemCollection::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Valid, but the collection already had this state.
    Unchanged,
    /// The target id is not in the collection. Nothing was touched.
    MissingItem,
    /// The mutation was malformed (empty id, bad property value).
    Rejected,
}

/// Mapping of item id to item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemCollection {
    items: IndexMap<String, Item>,
}

impl ItemCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one mutation.
    ///
    /// Updates and removals aimed at unknown ids are no-ops; membership is
    /// corrected by the next snapshot, never by creating entries here.
    pub fn apply(&mut self, mutation: &Mutation) -> Applied {
        match mutation {
            Mutation::Add(item) => {
                if item.id.is_empty() {
                    log::warn!("Refusing to add item without id");
                    return Applied::Rejected;
                }
                match self.items.get_mut(&item.id) {
                    Some(existing) if existing == item => Applied::Unchanged,
                    Some(existing) => {
                        *existing = item.clone();
                        Applied::Changed
                    }
                    None => {
                        self.items.insert(item.id.clone(), item.clone());
                        Applied::Changed
                    }
                }
            }
            Mutation::Remove(id) => match self.items.shift_remove(id) {
                Some(_) => Applied::Changed,
                None => Applied::MissingItem,
            },
            Mutation::Update {
                id,
                property,
                value,
            } => {
                let Some(item) = self.items.get_mut(id) else {
                    log::debug!("Ignoring update of {id}.{property}: item not present");
                    return Applied::MissingItem;
                };
                let before = item.clone();
                match item.apply_property(property, value) {
                    Ok(()) if *item == before => Applied::Unchanged,
                    Ok(()) => Applied::Changed,
                    Err(e) => {
                        log::warn!("Ignoring update of {id}.{property}: {e}");
                        Applied::Rejected
                    }
                }
            }
            Mutation::Clear => {
                if self.items.is_empty() {
                    Applied::Unchanged
                } else {
                    self.items.clear();
                    Applied::Changed
                }
            }
        }
    }

    /// Replace the whole collection with a snapshot.
    ///
    /// Never merges with prior contents. Every item takes its map key as id.
    pub fn replace_all(&mut self, snapshot: ItemCollection) {
        self.items.clear();
        for (key, mut item) in snapshot.items {
            if !item.id.is_empty() && item.id != key {
                log::warn!("Snapshot item {} stored under key {key}, using the key", item.id);
            }
            item.id = key.clone();
            self.items.insert(key, item);
        }
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Items in paint order: ascending `z_index`, ties by insertion order.
    pub fn stacking_order(&self) -> Vec<&Item> {
        let mut ordered: Vec<&Item> = self.items.values().collect();
        ordered.sort_by_key(|item| item.z_index);
        ordered
    }

    /// `z_index` for a newly added item: the current item count.
    pub fn next_z_index(&self) -> i64 {
        self.items.len() as i64
    }

    /// Items that extend past the output canvas.
    pub fn out_of_bounds(&self) -> Vec<&Item> {
        self.items
            .values()
            .filter(|item| item.is_out_of_bounds(CANVAS_SIZE))
            .collect()
    }
}

impl FromIterator<Item> for ItemCollection {
    fn from_iter<I: IntoIterator<Item = Item>>(iter: I) -> Self {
        Self {
            items: iter
                .into_iter()
                .map(|item| (item.id.clone(), item))
                .collect(),
        }
    }
}
