//! JSON wire protocol.
//!
//! Every frame is a flat JSON object with an `action` field:
//! ```text
//! client → server   add_media | remove_media | update_property | clear_all
//!                   request_sync | verify_version           (+ request_id?)
//! server → client   add_media | remove_media | update_property | clear_all
//!                   sync_state | version_check | operation_response
//! ```
//!
//! Requests sent through the confirmable path carry a `request_id`; the
//! authority echoes it back in `operation_response`. Broadcasts carry the
//! authority's `version` and `checksum` after the mutation was accepted.

use overlay_core::{Item, ItemCollection, Mutation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Client → server request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Create an item. The draft's id is ignored; the authority assigns one.
    AddMedia { media: Item },
    RemoveMedia { media_id: String },
    UpdateProperty {
        media_id: String,
        property: String,
        value: Value,
    },
    ClearAll,
    RequestSync,
    VerifyVersion {
        client_version: u64,
        client_checksum: String,
    },
}

impl Request {
    pub fn update(media_id: impl Into<String>, property: impl Into<String>, value: Value) -> Self {
        Self::UpdateProperty {
            media_id: media_id.into(),
            property: property.into(),
            value,
        }
    }

    /// Wire name of the action.
    pub fn action(&self) -> &'static str {
        match self {
            Self::AddMedia { .. } => "add_media",
            Self::RemoveMedia { .. } => "remove_media",
            Self::UpdateProperty { .. } => "update_property",
            Self::ClearAll => "clear_all",
            Self::RequestSync => "request_sync",
            Self::VerifyVersion { .. } => "verify_version",
        }
    }
}

/// A request plus its optional correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub request: Request,
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn new(request: Request, request_id: Option<String>) -> Self {
        Self {
            request,
            request_id,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut doc = serde_json::to_value(&self.request)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        if let (Some(id), Some(fields)) = (&self.request_id, doc.as_object_mut()) {
            fields.insert("request_id".to_string(), Value::String(id.clone()));
        }
        Ok(doc.to_string())
    }

    /// Parse a text frame received by the authority.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let doc = parse_frame(text, Self::ACTIONS)?;
        let request_id = doc
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let request = serde_json::from_value(doc)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(Self {
            request,
            request_id,
        })
    }

    const ACTIONS: &'static [&'static str] = &[
        "add_media",
        "remove_media",
        "update_property",
        "clear_all",
        "request_sync",
        "verify_version",
    ];
}

/// Body of a full snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotState {
    #[serde(default)]
    pub items: ItemCollection,
}

/// Result of one correlated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OperationResponse {
    /// The created item carried by a successful `add_media` response.
    pub fn created_item(&self) -> Option<Item> {
        let media = self.data.as_ref()?.get("media")?.clone();
        serde_json::from_value(media).ok()
    }
}

/// `operation_response` arrives either nested under `response` or flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseFrame {
    Nested { response: OperationResponse },
    Flat(OperationResponse),
}

impl ResponseFrame {
    pub fn into_response(self) -> OperationResponse {
        match self {
            Self::Nested { response } | Self::Flat(response) => response,
        }
    }
}

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerMessage {
    AddMedia {
        media: Item,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    RemoveMedia {
        media_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    UpdateProperty {
        media_id: String,
        property: String,
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    ClearAll {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    SyncState {
        #[serde(default)]
        state: SnapshotState,
        version: u64,
        #[serde(default)]
        checksum: String,
    },
    VersionCheck {
        needs_sync: bool,
        server_version: u64,
        #[serde(default)]
        server_checksum: String,
    },
    OperationResponse(ResponseFrame),
}

impl ServerMessage {
    const ACTIONS: &'static [&'static str] = &[
        "add_media",
        "remove_media",
        "update_property",
        "clear_all",
        "sync_state",
        "version_check",
        "operation_response",
    ];

    /// Parse a text frame. Unknown actions are an error, not a panic.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let doc = parse_frame(text, Self::ACTIONS)?;
        serde_json::from_value(doc).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Wrap a response in the nested form the authority sends.
    pub fn response(response: OperationResponse) -> Self {
        Self::OperationResponse(ResponseFrame::Nested { response })
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::AddMedia { .. } => "add_media",
            Self::RemoveMedia { .. } => "remove_media",
            Self::UpdateProperty { .. } => "update_property",
            Self::ClearAll { .. } => "clear_all",
            Self::SyncState { .. } => "sync_state",
            Self::VersionCheck { .. } => "version_check",
            Self::OperationResponse(_) => "operation_response",
        }
    }

    /// Version stamp of a broadcast mutation, if present.
    pub fn stamp(&self) -> Option<(u64, Option<&str>)> {
        match self {
            Self::AddMedia {
                version, checksum, ..
            }
            | Self::RemoveMedia {
                version, checksum, ..
            }
            | Self::UpdateProperty {
                version, checksum, ..
            }
            | Self::ClearAll { version, checksum } => {
                version.map(|v| (v, checksum.as_deref()))
            }
            _ => None,
        }
    }

    /// The collection change a broadcast describes.
    pub fn mutation(&self) -> Option<Mutation> {
        match self {
            Self::AddMedia { media, .. } => Some(Mutation::Add(media.clone())),
            Self::RemoveMedia { media_id, .. } => Some(Mutation::Remove(media_id.clone())),
            Self::UpdateProperty {
                media_id,
                property,
                value,
                ..
            } => Some(Mutation::Update {
                id: media_id.clone(),
                property: property.clone(),
                value: value.clone(),
            }),
            Self::ClearAll { .. } => Some(Mutation::Clear),
            _ => None,
        }
    }
}

fn parse_frame(text: &str, known: &[&str]) -> Result<Value, ProtocolError> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    let action = doc
        .get("action")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingAction)?;
    if !known.contains(&action) {
        return Err(ProtocolError::UnknownAction(action.to_string()));
    }
    Ok(doc)
}

/// Frame-level errors. Malformed frames are logged and dropped.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("frame has no action")]
    MissingAction,
    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_core::ItemKind;
    use serde_json::json;

    #[test]
    fn test_confirmable_request_carries_request_id() {
        let envelope = Envelope::new(
            Request::update("t1", "opacity", json!(0.5)),
            Some("1700000000000_abc".into()),
        );
        let doc: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            doc,
            json!({
                "action": "update_property",
                "media_id": "t1",
                "property": "opacity",
                "value": 0.5,
                "request_id": "1700000000000_abc"
            })
        );
    }

    #[test]
    fn test_fire_and_forget_has_no_request_id() {
        let envelope = Envelope::new(Request::RequestSync, None);
        let doc: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert_eq!(doc, json!({"action": "request_sync"}));
    }

    #[test]
    fn test_add_media_draft_omits_id() {
        let envelope = Envelope::new(
            Request::AddMedia {
                media: Item::text("Hello"),
            },
            None,
        );
        let doc: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();
        assert!(doc["media"].get("id").is_none());
        assert_eq!(doc["media"]["type"], "text");
    }

    #[test]
    fn test_envelope_decode() {
        let envelope = Envelope::decode(
            r#"{"action":"verify_version","client_version":4,"client_checksum":"abcd1234","request_id":"r1"}"#,
        )
        .unwrap();
        assert_eq!(envelope.request_id.as_deref(), Some("r1"));
        assert_eq!(
            envelope.request,
            Request::VerifyVersion {
                client_version: 4,
                client_checksum: "abcd1234".into()
            }
        );
    }

    #[test]
    fn test_nested_operation_response() {
        let msg = ServerMessage::decode(
            r#"{"action":"operation_response","response":{"request_id":"r1","success":true,"action":"add_media","version":5,"checksum":"0badf00d","data":{"media":{"id":"t1","type":"text","text_content":"Hello"}}}}"#,
        )
        .unwrap();
        let ServerMessage::OperationResponse(frame) = msg else {
            panic!("expected operation_response");
        };
        let response = frame.into_response();
        assert!(response.success);
        assert_eq!(response.version, Some(5));
        let created = response.created_item().unwrap();
        assert_eq!(created.id, "t1");
        assert_eq!(created.kind, ItemKind::Text);
    }

    #[test]
    fn test_flat_operation_response() {
        let msg = ServerMessage::decode(
            r#"{"action":"operation_response","request_id":"r2","success":false,"error":"Media no encontrada","version":7,"checksum":"aa"}"#,
        )
        .unwrap();
        let ServerMessage::OperationResponse(frame) = msg else {
            panic!("expected operation_response");
        };
        let response = frame.into_response();
        assert_eq!(response.request_id, "r2");
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Media no encontrada"));
    }

    #[test]
    fn test_sync_state_decode() {
        let msg = ServerMessage::decode(
            r#"{"action":"sync_state","state":{"items":{"a":{"id":"a","type":"image"}},"version":3,"last_modified":null},"version":3,"checksum":"12345678"}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::SyncState {
                state,
                version,
                checksum,
            } => {
                assert_eq!(version, 3);
                assert_eq!(checksum, "12345678");
                assert!(state.items.contains("a"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_stamp_and_mutation() {
        let msg = ServerMessage::decode(
            r#"{"action":"update_property","media_id":"t1","property":"opacity","value":0.5,"version":9,"checksum":"c0ffee00"}"#,
        )
        .unwrap();
        assert_eq!(msg.stamp(), Some((9, Some("c0ffee00"))));
        assert_eq!(
            msg.mutation(),
            Some(Mutation::Update {
                id: "t1".into(),
                property: "opacity".into(),
                value: json!(0.5),
            })
        );

        let unstamped = ServerMessage::decode(r#"{"action":"clear_all"}"#).unwrap();
        assert_eq!(unstamped.stamp(), None);
        assert_eq!(unstamped.mutation(), Some(Mutation::Clear));
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        assert!(matches!(
            ServerMessage::decode(r#"{"action":"media_added","media":{}}"#),
            Err(ProtocolError::UnknownAction(a)) if a == "media_added"
        ));
        assert!(matches!(
            ServerMessage::decode(r#"{"media_id":"x"}"#),
            Err(ProtocolError::MissingAction)
        ));
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(ProtocolError::DeserializationError(_))
        ));
        assert!(matches!(
            ServerMessage::decode(r#"{"action":"remove_media"}"#),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_server_message_encode_nested_response() {
        let msg = ServerMessage::response(OperationResponse {
            request_id: "r1".into(),
            success: true,
            action: Some("clear_all".into()),
            version: Some(2),
            checksum: Some("ffffffff".into()),
            error: None,
            data: Some(json!({"cleared_count": 3})),
        });
        let doc: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(doc["action"], "operation_response");
        assert_eq!(doc["response"]["request_id"], "r1");
        assert_eq!(doc["response"]["data"]["cleared_count"], 3);
    }
}
