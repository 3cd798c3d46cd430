//! Records shared by the stores, the cache and the wire protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::time::SystemTime;
use uuid::Uuid;

/// Payload field used to order objects on initial load.
pub const ORDERING_KEY: &str = "z";

/// A collaboration namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
}

impl Room {
    /// Room with the generated default name used on first join.
    pub fn with_default_name(id: impl Into<String>) -> Self {
        let id = id.into();
        let name = format!("Room {id}");
        Self { id, name }
    }
}

/// A persisted visual element. `data` is opaque to the core apart from the
/// optional ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasObject {
    pub id: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub data: Value,
}

impl CanvasObject {
    pub fn ordering_key(&self) -> Option<i64> {
        ordering_key(&self.data)
    }
}

/// Object body as carried by create/update events.
///
/// Fields default to empty so that a missing field surfaces as a validation
/// error naming it rather than as a decode failure.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectData {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub object_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl ObjectData {
    pub fn new(id: impl Into<String>, object_type: impl Into<String>, payload: Value) -> Self {
        Self { id: id.into(), object_type: object_type.into(), payload }
    }

    pub fn into_object(self, room_id: impl Into<String>) -> CanvasObject {
        CanvasObject {
            id: self.id,
            room_id: room_id.into(),
            object_type: self.object_type,
            data: self.payload,
        }
    }
}

impl From<CanvasObject> for ObjectData {
    fn from(object: CanvasObject) -> Self {
        Self { id: object.id, object_type: object.object_type, payload: object.data }
    }
}

/// Append-only chat record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: String,
    pub author: String,
    pub body: String,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

impl ChatMessage {
    pub fn new(room_id: impl Into<String>, author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.into(),
            author: author.into(),
            body: body.into(),
            created_at: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Integer ordering key of a payload, if it has one.
///
/// Accepts integral numbers and numeric strings, mirroring an integer cast of
/// the stored JSON field.
pub fn ordering_key(data: &Value) -> Option<i64> {
    match data.get(ORDERING_KEY)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Stable sort by ordering key ascending; objects without a key go last.
pub fn sort_by_ordering_key(objects: &mut [CanvasObject]) {
    objects.sort_by(|a, b| match (a.ordering_key(), b.ordering_key()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(id: &str, data: Value) -> CanvasObject {
        ObjectData::new(id, "rect", data).into_object("r1")
    }

    #[test]
    fn test_default_room_name() {
        let room = Room::with_default_name("board-42");
        assert_eq!(room.name, "Room board-42");
    }

    #[test]
    fn test_ordering_key_variants() {
        assert_eq!(ordering_key(&json!({"z": 3})), Some(3));
        assert_eq!(ordering_key(&json!({"z": "7"})), Some(7));
        assert_eq!(ordering_key(&json!({"z": 2.0})), Some(2));
        assert_eq!(ordering_key(&json!({"z": 2.5})), None);
        assert_eq!(ordering_key(&json!({"x": 1})), None);
        assert_eq!(ordering_key(&json!("not an object")), None);
    }

    #[test]
    fn test_sort_unkeyed_last_and_stable() {
        let mut objects = vec![
            obj("a", json!({})),
            obj("b", json!({"z": 5})),
            obj("c", json!({"z": 1})),
            obj("d", json!({})),
        ];
        sort_by_ordering_key(&mut objects);
        let ids: Vec<&str> = objects.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_object_wire_shape() {
        let value = serde_json::to_value(obj("o1", json!({"x": 0}))).unwrap();
        assert_eq!(value, json!({"id": "o1", "roomId": "r1", "type": "rect", "data": {"x": 0}}));
    }

    #[test]
    fn test_object_data_missing_fields_default() {
        let data: ObjectData = serde_json::from_value(json!({"id": "o1"})).unwrap();
        assert_eq!(data.id, "o1");
        assert!(data.object_type.is_empty());
        assert!(data.payload.is_null());
    }
}
