//! Builders for raw Debezium change events.
//!
//! Produces bytes exactly as the MongoDB connector publishes them: an outer `payload`
//! envelope whose `after`/`before` snapshots are string-encoded JSON documents.

use serde_json::{Value, json};
use user_sync_core::User;

/// Serialize `user` as the source document (`_id.$oid`, capitalized field names).
#[must_use]
pub fn user_document(user: &User) -> String {
    json!({
        "_id": { "$oid": user.id },
        "Name": user.name,
        "Email": user.email,
        "Age": user.age,
    })
    .to_string()
}

/// Serialize a document carrying only an identifier.
#[must_use]
pub fn id_document(id: &str) -> String {
    json!({ "_id": { "$oid": id } }).to_string()
}

/// Build an envelope with an arbitrary operation code and snapshots.
#[must_use]
pub fn envelope(op: &str, after: Option<&str>, before: Option<&str>) -> Vec<u8> {
    json!({
        "schema": { "type": "struct", "optional": false },
        "payload": {
            "op": op,
            "after": after,
            "before": before,
            "source": { "connector": "mongodb", "db": "productionData", "collection": "users" },
        }
    })
    .to_string()
    .into_bytes()
}

/// A `c` event inserting `user`.
#[must_use]
pub fn create_event(user: &User) -> Vec<u8> {
    envelope("c", Some(&user_document(user)), None)
}

/// A `u` event carrying the full post-image of `user`.
#[must_use]
pub fn update_event(user: &User) -> Vec<u8> {
    envelope("u", Some(&user_document(user)), None)
}

/// An `r` event emitted during the connector's initial snapshot.
#[must_use]
pub fn read_event(user: &User) -> Vec<u8> {
    envelope("r", Some(&user_document(user)), None)
}

/// A `d` event whose pre-image carries only the id.
#[must_use]
pub fn delete_event(id: &str) -> Vec<u8> {
    envelope("d", None, Some(&id_document(id)))
}

/// An envelope whose `payload` is `null`.
#[must_use]
pub fn null_payload() -> Vec<u8> {
    json!({ "schema": Value::Null, "payload": Value::Null })
        .to_string()
        .into_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use user_sync_core::{ChangeEnvelope, Operation};

    #[test]
    fn create_event_round_trips_through_both_decode_stages() {
        let user = User::new("abc123").with_name("Alice").with_age(30);

        let envelope = ChangeEnvelope::decode(&create_event(&user)).unwrap().unwrap();

        assert_eq!(envelope.operation, Operation::Create);
        assert_eq!(User::from_json(envelope.image().unwrap()).unwrap(), user);
    }

    #[test]
    fn null_payload_decodes_as_empty() {
        assert_eq!(ChangeEnvelope::decode(&null_payload()).unwrap(), None);
    }
}
