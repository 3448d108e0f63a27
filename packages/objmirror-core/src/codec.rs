//! Conversion between in-memory [`Value`]s and the backend's JSON wire format.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value as JsonValue};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::value::{Attributes, FileRef, GeoPoint, Number, RelationValue, Value};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Always emit references as pointers, never as full nested objects.
    pub force_pointers: bool,
    /// Emit unsaved references as local-id pointers instead of failing.
    pub offline: bool,
}

impl EncodeOptions {
    pub fn pointers() -> Self {
        Self {
            force_pointers: true,
            offline: false,
        }
    }
}

pub fn encode(value: &Value, options: EncodeOptions) -> Result<JsonValue> {
    encode_inner(value, options, None)
}

/// `seen` holds the objects already emitted in full on the current path; revisiting one of
/// them degrades to a pointer.
pub(crate) fn encode_inner(
    value: &Value,
    options: EncodeOptions,
    seen: Option<&[String]>,
) -> Result<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(n) => n.to_json(),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Date(date) => encode_date(date),
        Value::GeoPoint(point) => json!({
            "__type": "GeoPoint",
            "latitude": point.latitude,
            "longitude": point.longitude,
        }),
        Value::File(file) => {
            let Some(url) = &file.url else {
                return Err(Error::UnsavedReference(format!(
                    "tried to encode unsaved file {}",
                    file.name
                )));
            };
            json!({"__type": "File", "name": file.name, "url": url})
        }
        Value::Relation(relation) => json!({
            "__type": "Relation",
            "className": relation.target_class_name,
        }),
        Value::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| encode_inner(item, options, seen))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), encode_inner(item, options, seen)?);
            }
            JsonValue::Object(out)
        }
        Value::Pointer(object) => {
            let entry = object.seen_entry();
            let as_pointer = options.force_pointers
                || seen.map_or(true, |seen| seen.contains(&entry))
                || object.dirty(None)?
                || object.server_data()?.is_empty();
            if as_pointer {
                if options.offline && object.id().is_none() {
                    object.to_offline_pointer()
                } else {
                    object.to_pointer()?
                }
            } else {
                let mut path = seen.map(<[String]>::to_vec).unwrap_or_default();
                path.push(entry);
                object.to_full_json_inner(Some(&path), options.offline)?
            }
        }
    })
}

pub fn encode_date(date: &DateTime<Utc>) -> JsonValue {
    json!({"__type": "Date", "iso": date.to_rfc3339_opts(SecondsFormat::Millis, true)})
}

pub fn parse_date(iso: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(iso)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|err| Error::InvalidJson(format!("invalid date {iso:?}: {err}")))
}

/// Decode wire JSON into a value. References become object handles owned by `client`.
pub fn decode(json: &JsonValue, client: &Client) -> Result<Value> {
    Ok(match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => Value::Number(Number::from_json(n)),
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| decode(item, client))
                .collect::<Result<Vec<_>>>()?,
        ),
        JsonValue::Object(map) => match map.get("__type").and_then(JsonValue::as_str) {
            Some("Pointer") => {
                let class_name = required_str(map, "className")?;
                let object_id = required_str(map, "objectId")?;
                Value::Pointer(client.create_without_data(class_name, object_id))
            }
            Some("Object") if map.contains_key("className") => {
                Value::Pointer(client.object_from_json(json, false)?)
            }
            Some("Date") => Value::Date(parse_date(required_str(map, "iso")?)?),
            Some("GeoPoint") => Value::GeoPoint(GeoPoint {
                latitude: required_f64(map, "latitude")?,
                longitude: required_f64(map, "longitude")?,
            }),
            Some("File") => Value::File(FileRef::new(
                required_str(map, "name")?,
                map.get("url").and_then(JsonValue::as_str).map(str::to_string),
            )),
            Some("Relation") => Value::Relation(RelationValue {
                target_class_name: map
                    .get("className")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                parent: None,
                key: None,
            }),
            _ => {
                let mut out = Attributes::new();
                for (key, item) in map {
                    out.insert(key.clone(), decode(item, client)?);
                }
                Value::Object(out)
            }
        },
    })
}

/// Stable digest of a container value, used to notice edits made without an operation.
pub fn fingerprint(value: &Value) -> Result<blake3::Hash> {
    let json = encode(value, EncodeOptions::pointers())?;
    let bytes = serde_json::to_vec(&json)?;
    Ok(blake3::hash(&bytes))
}

fn required_str<'a>(map: &'a Map<String, JsonValue>, key: &str) -> Result<&'a str> {
    map.get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| Error::InvalidJson(format!("expected string field {key:?}")))
}

fn required_f64(map: &Map<String, JsonValue>, key: &str) -> Result<f64> {
    map.get(key)
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| Error::InvalidJson(format!("expected numeric field {key:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::traits::NoopRestController;
    use chrono::TimeZone;

    fn client() -> Client {
        Client::new(ClientConfig::default(), NoopRestController)
    }

    #[test]
    fn dates_use_millisecond_iso_strings() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let json = encode(&Value::Date(date), EncodeOptions::default()).unwrap();
        assert_eq!(json, json!({"__type": "Date", "iso": "2024-03-01T12:30:00.000Z"}));
        assert_eq!(decode(&json, &client()).unwrap(), Value::Date(date));
    }

    #[test]
    fn saved_pointer_encodes_as_pointer() {
        let client = client();
        let post = client.create_without_data("Post", "p1");
        let json = encode(&Value::Pointer(post), EncodeOptions::pointers()).unwrap();
        assert_eq!(
            json,
            json!({"__type": "Pointer", "className": "Post", "objectId": "p1"})
        );
    }

    #[test]
    fn unsaved_pointer_is_rejected_unless_offline() {
        let client = client();
        let draft = client.create("Post");
        let err = encode(&Value::Pointer(draft.clone()), EncodeOptions::pointers()).unwrap_err();
        assert!(matches!(err, Error::UnsavedReference(_)));

        let offline = EncodeOptions {
            force_pointers: true,
            offline: true,
        };
        let json = encode(&Value::Pointer(draft.clone()), offline).unwrap();
        assert_eq!(json["_localId"], json!(draft.state_id()));
        assert_eq!(json["__type"], json!("Object"));
    }

    #[test]
    fn unsaved_file_cannot_be_encoded() {
        let file = Value::File(FileRef::new("photo.png", None));
        assert!(matches!(
            encode(&file, EncodeOptions::default()),
            Err(Error::UnsavedReference(_))
        ));
    }

    #[test]
    fn decode_handles_typed_payloads_and_plain_maps() {
        let client = client();
        let json = json!({
            "where": {"__type": "GeoPoint", "latitude": 1.5, "longitude": -2.0},
            "doc": {"__type": "File", "name": "a.txt", "url": "http://files/a.txt"},
            "friends": {"__type": "Relation", "className": "_User"},
            "nested": {"count": 3},
        });
        let Value::Object(map) = decode(&json, &client).unwrap() else {
            panic!("expected map");
        };
        assert_eq!(
            map["where"],
            Value::GeoPoint(GeoPoint {
                latitude: 1.5,
                longitude: -2.0
            })
        );
        assert_eq!(map["doc"].clone(), Value::File(FileRef::new("a.txt", Some("http://files/a.txt".into()))));
        assert_eq!(
            map["friends"].as_relation().unwrap().target_class_name.as_deref(),
            Some("_User")
        );
        assert_eq!(map["nested"].as_object().unwrap()["count"], Value::from(3));
    }

    #[test]
    fn malformed_date_is_invalid_json() {
        let err = decode(&json!({"__type": "Date", "iso": "yesterday"}), &client()).unwrap_err();
        assert!(matches!(err, Error::InvalidJson(_)));
    }

    #[test]
    fn fingerprint_tracks_content_not_identity() {
        let a = Value::from(vec![1, 2, 3]);
        let b = Value::from(vec![1, 2, 3]);
        let c = Value::from(vec![1, 2]);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&c).unwrap());
    }
}
