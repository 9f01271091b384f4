//! JSON request paths and bodies.
//!
//! Records travel as the collection's data object plus an `"id"` field holding
//! the server identifier (string or number). Every id the server sends, in the
//! `"id"` field or in a reference field, is a server id, even when numeric.

use serde_json::Value;

use crate::{
    entity::{BookingData, EntityData, EntityPatch, EventData, UserData},
    types::{Collection, RemoteId},
};

use super::RemoteError;

/// `/{collection}`.
pub fn collection_path(collection: Collection) -> String {
    format!("/{}", collection.as_str())
}

/// `/{collection}/{remote}`.
pub fn entity_path(collection: Collection, remote: &RemoteId) -> String {
    format!("/{}/{}", collection.as_str(), remote.as_str())
}

/// Request body for a creation.
pub fn encode_data(data: &EntityData) -> Result<Value, RemoteError> {
    let value = match data {
        EntityData::Event(event) => serde_json::to_value(event),
        EntityData::Booking(booking) => serde_json::to_value(booking),
        EntityData::User(user) => serde_json::to_value(user),
    };
    value.map_err(|e| RemoteError::Decode(e.to_string()))
}

/// Request body for a sparse update.
pub fn encode_patch(patch: &EntityPatch) -> Result<Value, RemoteError> {
    let value = match patch {
        EntityPatch::Event(p) => serde_json::to_value(p),
        EntityPatch::Booking(p) => serde_json::to_value(p),
        EntityPatch::User(p) => serde_json::to_value(p),
    };
    value.map_err(|e| RemoteError::Decode(e.to_string()))
}

/// The `"id"` field, numeric or string.
pub fn decode_remote_id(body: &Value) -> Option<RemoteId> {
    id_value(body.get("id")?)
}

fn id_value(value: &Value) -> Option<RemoteId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(RemoteId::new(s.clone())),
        Value::Number(n) => Some(RemoteId::new(n.to_string())),
        _ => None,
    }
}

/// Rewrites numeric reference fields of a server record as strings, so they
/// decode as remote ids rather than local ones.
pub fn normalize_server_refs(collection: Collection, body: &mut Value) {
    let Value::Object(map) = body else {
        return;
    };
    match collection {
        Collection::Bookings => {
            for key in ["event_id", "user_id"] {
                if let Some(value) = map.get_mut(key) {
                    stringify_id(value);
                }
            }
        }
        Collection::Events => {
            if let Some(Value::Array(participants)) = map.get_mut("participants") {
                for participant in participants {
                    if let Some(value) = participant.get_mut("user_id") {
                        stringify_id(value);
                    }
                }
            }
        }
        Collection::Users => {}
    }
}

fn stringify_id(value: &mut Value) {
    if let Some(remote) = id_value(value) {
        *value = Value::String(remote.0);
    }
}

/// Decodes a data object whose references are already in local form.
pub fn decode_data(collection: Collection, body: &Value) -> Result<EntityData, RemoteError> {
    let decoded = match collection {
        Collection::Events => serde_json::from_value::<EventData>(body.clone()).map(EntityData::Event),
        Collection::Bookings => {
            serde_json::from_value::<BookingData>(body.clone()).map(EntityData::Booking)
        }
        Collection::Users => serde_json::from_value::<UserData>(body.clone()).map(EntityData::User),
    };
    decoded.map_err(|e| RemoteError::Decode(format!("{collection}: {e}")))
}

/// Decodes a server record into its id and data.
pub fn decode_record(
    collection: Collection,
    body: &Value,
) -> Result<(RemoteId, EntityData), RemoteError> {
    let id = decode_remote_id(body)
        .ok_or_else(|| RemoteError::Decode(format!("{collection}: record without id")))?;
    let mut body = body.clone();
    normalize_server_refs(collection, &mut body);
    Ok((id, decode_data(collection, &body)?))
}

/// Accepts a bare array or an object with an `"items"` array.
pub fn decode_list(body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(RemoteError::Decode("list body without items".to_string())),
        },
        _ => Err(RemoteError::Decode("list body is not an array".to_string())),
    }
}
