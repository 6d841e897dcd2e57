//! Overlay items: images, videos and text blocks.
//!
//! Field names match the JSON wire format (`type`, `z_index`, ...). Text
//! styling is flattened into the item and only meaningful for
//! [`ItemKind::Text`]; other kinds carry the defaults and ignore them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Output canvas used to flag out-of-bounds items.
pub const CANVAS_SIZE: Size = Size {
    width: 1920.0,
    height: 1080.0,
};

/// Kind of overlay element. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Image,
    Video,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self { x: 100.0, y: 100.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 200.0,
            height: 200.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowOffset {
    pub x: i32,
    pub y: i32,
}

impl Default for ShadowOffset {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Padding {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl Default for Padding {
    fn default() -> Self {
        Self {
            top: 10,
            right: 10,
            bottom: 10,
            left: 10,
        }
    }
}

/// Text block styling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextStyle {
    pub text_content: Option<String>,
    pub font_family: String,
    pub font_size: u32,
    pub font_weight: String,
    pub font_style: String,
    pub text_align: String,
    pub text_color: String,
    pub text_shadow: bool,
    pub text_shadow_color: String,
    pub text_shadow_blur: u32,
    pub text_shadow_offset: ShadowOffset,
    pub background_color: Option<String>,
    pub padding: Padding,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            text_content: None,
            font_family: "Arial".to_string(),
            font_size: 48,
            font_weight: "normal".to_string(),
            font_style: "normal".to_string(),
            text_align: "left".to_string(),
            text_color: "#ffffff".to_string(),
            text_shadow: false,
            text_shadow_color: "#000000".to_string(),
            text_shadow_blur: 2,
            text_shadow_offset: ShadowOffset::default(),
            background_color: None,
            padding: Padding::default(),
        }
    }
}

fn unit() -> f64 {
    1.0
}

fn visible_default() -> bool {
    true
}

/// One overlay element.
///
/// `id` is assigned by the authority on creation. Drafts sent with
/// `add_media` carry an empty id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub size: Size,
    #[serde(default = "unit")]
    pub opacity: f64,
    /// Only meaningful for video.
    #[serde(default = "unit")]
    pub volume: f64,
    #[serde(default = "visible_default")]
    pub visible: bool,
    /// Stacking order. Not required to be unique.
    #[serde(default)]
    pub z_index: i64,
    #[serde(flatten)]
    pub text: TextStyle,
}

impl Item {
    /// Create a draft item of the given kind with default geometry.
    pub fn new(kind: ItemKind) -> Self {
        Self {
            id: String::new(),
            kind,
            filename: String::new(),
            url: String::new(),
            position: Position::default(),
            size: Size::default(),
            opacity: 1.0,
            volume: 1.0,
            visible: true,
            z_index: 0,
            text: TextStyle::default(),
        }
    }

    /// Create a text block draft.
    pub fn text(content: impl Into<String>) -> Self {
        let mut item = Self::new(ItemKind::Text);
        item.text.text_content = Some(content.into());
        item
    }

    /// Create an image or video draft pointing at a media file.
    pub fn media(kind: ItemKind, filename: impl Into<String>, url: impl Into<String>) -> Self {
        let mut item = Self::new(kind);
        item.filename = filename.into();
        item.url = url.into();
        item
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = z_index;
        self
    }

    /// Whether any part of the item falls outside `canvas`.
    ///
    /// Out-of-bounds items are valid; renderers only flag them.
    pub fn is_out_of_bounds(&self, canvas: Size) -> bool {
        self.position.x < 0.0
            || self.position.y < 0.0
            || self.position.x + self.size.width > canvas.width
            || self.position.y + self.size.height > canvas.height
    }

    /// Set one top-level field from its JSON value.
    ///
    /// Atomic: on error the item is left untouched. Nested values such as
    /// `position` are replaced whole.
    pub fn apply_property(&mut self, property: &str, value: &Value) -> Result<(), ItemError> {
        if property == "id" || property == "type" {
            return Err(ItemError::Immutable(property.to_string()));
        }

        let mut doc = serde_json::to_value(&*self).map_err(|source| ItemError::InvalidValue {
            property: property.to_string(),
            source,
        })?;
        let Some(fields) = doc.as_object_mut() else {
            return Err(ItemError::UnknownProperty(property.to_string()));
        };
        match fields.get_mut(property) {
            Some(slot) => *slot = value.clone(),
            None => return Err(ItemError::UnknownProperty(property.to_string())),
        }

        let updated: Item = serde_json::from_value(doc).map_err(|source| ItemError::InvalidValue {
            property: property.to_string(),
            source,
        })?;
        *self = updated;
        Ok(())
    }

    /// Read one top-level field as JSON.
    pub fn property(&self, property: &str) -> Option<Value> {
        serde_json::to_value(self)
            .ok()
            .and_then(|doc| doc.get(property).cloned())
    }
}

/// Check an intended property change before it leaves the client.
///
/// Only ranges and immutability are checked here; unknown names are
/// reported by [`Item::apply_property`].
pub fn validate_property(kind: ItemKind, property: &str, value: &Value) -> Result<(), ItemError> {
    match property {
        "id" | "type" => Err(ItemError::Immutable(property.to_string())),
        "volume" if kind != ItemKind::Video => Err(ItemError::NotApplicable {
            property: property.to_string(),
            kind,
        }),
        "opacity" | "volume" => match value.as_f64() {
            Some(v) if (0.0..=1.0).contains(&v) => Ok(()),
            _ => Err(ItemError::OutOfRange {
                property: property.to_string(),
                value: value.clone(),
            }),
        },
        _ => Ok(()),
    }
}

/// Item field errors.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("property `{0}` is immutable")]
    Immutable(String),
    #[error("unknown property `{0}`")]
    UnknownProperty(String),
    #[error("value {value} out of range for `{property}`")]
    OutOfRange { property: String, value: Value },
    #[error("property `{property}` does not apply to {kind:?} items")]
    NotApplicable { property: String, kind: ItemKind },
    #[error("invalid value for `{property}`: {source}")]
    InvalidValue {
        property: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_sparse_json() {
        let item: Item = serde_json::from_value(json!({
            "id": "t1",
            "type": "text",
            "text_content": "Hello"
        }))
        .unwrap();

        assert_eq!(item.kind, ItemKind::Text);
        assert_eq!(item.position, Position::new(100.0, 100.0));
        assert_eq!(item.size, Size::new(200.0, 200.0));
        assert_eq!(item.opacity, 1.0);
        assert!(item.visible);
        assert_eq!(item.text.text_content.as_deref(), Some("Hello"));
        assert_eq!(item.text.font_family, "Arial");
        assert_eq!(item.text.font_size, 48);
    }

    #[test]
    fn test_wire_names() {
        let item = Item::text("Hi").with_id("a").with_z_index(3);
        let doc = serde_json::to_value(&item).unwrap();
        assert_eq!(doc["type"], "text");
        assert_eq!(doc["z_index"], 3);
        assert_eq!(doc["text_content"], "Hi");
        assert!(doc.get("kind").is_none());
    }

    #[test]
    fn test_server_extra_fields_ignored() {
        let item: Item = serde_json::from_value(json!({
            "id": "v1",
            "type": "video",
            "created_at": "2024-01-01T00:00:00",
            "volume": 0.25
        }))
        .unwrap();
        assert_eq!(item.kind, ItemKind::Video);
        assert_eq!(item.volume, 0.25);
    }

    #[test]
    fn test_apply_property() {
        let mut item = Item::new(ItemKind::Image).with_id("i1");
        item.apply_property("opacity", &json!(0.5)).unwrap();
        assert_eq!(item.opacity, 0.5);

        item.apply_property("position", &json!({"x": 10, "y": 20.5}))
            .unwrap();
        assert_eq!(item.position, Position::new(10.0, 20.5));

        item.apply_property("text_color", &json!("#ff0000")).unwrap();
        assert_eq!(item.text.text_color, "#ff0000");
    }

    #[test]
    fn test_apply_property_rejects_identity_changes() {
        let mut item = Item::new(ItemKind::Image).with_id("i1");
        assert!(matches!(
            item.apply_property("id", &json!("other")),
            Err(ItemError::Immutable(_))
        ));
        assert!(matches!(
            item.apply_property("type", &json!("video")),
            Err(ItemError::Immutable(_))
        ));
        assert_eq!(item.id, "i1");
        assert_eq!(item.kind, ItemKind::Image);
    }

    #[test]
    fn test_apply_property_is_atomic_on_bad_value() {
        let mut item = Item::new(ItemKind::Image).with_id("i1");
        let before = item.clone();
        assert!(matches!(
            item.apply_property("position", &json!("nowhere")),
            Err(ItemError::InvalidValue { .. })
        ));
        assert!(matches!(
            item.apply_property("sparkle", &json!(1)),
            Err(ItemError::UnknownProperty(_))
        ));
        assert_eq!(item, before);
    }

    #[test]
    fn test_validate_property() {
        assert!(validate_property(ItemKind::Image, "opacity", &json!(0.3)).is_ok());
        assert!(validate_property(ItemKind::Image, "opacity", &json!(1.3)).is_err());
        assert!(validate_property(ItemKind::Video, "volume", &json!(0.0)).is_ok());
        assert!(matches!(
            validate_property(ItemKind::Text, "volume", &json!(0.5)),
            Err(ItemError::NotApplicable { .. })
        ));
        assert!(validate_property(ItemKind::Text, "id", &json!("x")).is_err());
        assert!(validate_property(ItemKind::Text, "text_content", &json!("ok")).is_ok());
    }

    #[test]
    fn test_out_of_bounds_flag() {
        let inside = Item::new(ItemKind::Image).with_position(0.0, 0.0);
        assert!(!inside.is_out_of_bounds(CANVAS_SIZE));

        let past_edge = Item::new(ItemKind::Image).with_position(1800.0, 100.0);
        assert!(past_edge.is_out_of_bounds(CANVAS_SIZE));

        let negative = Item::new(ItemKind::Image).with_position(-5.0, 100.0);
        assert!(negative.is_out_of_bounds(CANVAS_SIZE));
    }

    #[test]
    fn test_property_read() {
        let item = Item::text("Hello").with_id("t1");
        assert_eq!(item.property("text_content"), Some(json!("Hello")));
        assert_eq!(item.property("missing"), None);
    }
}
