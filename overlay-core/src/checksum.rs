//! Deterministic digest over a collection.
//!
//! Clients never compute this; they compare what the authority sends. The
//! reference authority uses it to stamp every accepted mutation.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::collection::ItemCollection;

/// Hex chars kept from the digest.
const CHECKSUM_LEN: usize = 8;

/// First eight hex chars of SHA-256 over the items as key-sorted JSON.
///
/// Insertion order does not affect the result.
pub fn state_checksum(items: &ItemCollection) -> String {
    let mut sorted: Vec<(&str, Value)> = items
        .iter()
        .map(|item| (item.id.as_str(), serde_json::to_value(item).unwrap_or(Value::Null)))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut doc = Map::new();
    for (id, item) in sorted {
        doc.insert(id.to_string(), item);
    }
    let canonical = Value::Object(doc).to_string();

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex.truncate(CHECKSUM_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Mutation;
    use crate::item::{Item, ItemKind};
    use serde_json::json;

    #[test]
    fn test_checksum_ignores_insertion_order() {
        let a = Item::new(ItemKind::Image).with_id("a");
        let b = Item::text("x").with_id("b");
        let forward: ItemCollection = [a.clone(), b.clone()].into_iter().collect();
        let reverse: ItemCollection = [b, a].into_iter().collect();

        assert_eq!(state_checksum(&forward), state_checksum(&reverse));
        assert_eq!(state_checksum(&forward).len(), 8);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut items: ItemCollection = [Item::new(ItemKind::Image).with_id("a")]
            .into_iter()
            .collect();
        let before = state_checksum(&items);
        items.apply(&Mutation::Update {
            id: "a".into(),
            property: "opacity".into(),
            value: json!(0.2),
        });
        assert_ne!(before, state_checksum(&items));
    }
}
