//! Note schema validation.
//!
//! Extractors hand the core raw JSON. Each document is checked on its own so
//! that one malformed note is rejected without affecting its neighbours.
//!
//! Accepted shape:
//!
//! ```json
//! {
//!   "id": "bear-7F3A",
//!   "title": "Deploy checklist",
//!   "content": "…",
//!   "tags": ["ops"],
//!   "created_at": "2024-03-01T09:00:00Z",
//!   "updated_at": "2024-03-02T10:30:00Z",
//!   "metadata": { "source": "bear" }
//! }
//! ```
//!
//! `tags`, `metadata`, and the timestamps are optional. A missing timestamp
//! falls back to the other one, or to the Unix epoch when both are absent.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ValidationError;
use crate::models::Note;

/// A note that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    /// Position of the document in the input batch.
    pub index: usize,
    /// The document's id, when it had a readable one.
    pub note_id: Option<String>,
    pub error: ValidationError,
}

/// Outcome of validating a batch of raw documents.
#[derive(Debug, Default)]
pub struct ValidatedBatch {
    pub notes: Vec<Note>,
    pub rejected: Vec<Rejected>,
}

/// Split a notes file into individual documents.
///
/// Accepts either a top-level array or an object with a `notes` array.
pub fn split_documents(value: Value) -> Result<Vec<Value>, ValidationError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("notes") {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(ValidationError::WrongType {
                field: "notes",
                expected: "an array",
            }),
            None => Err(ValidationError::MissingField("notes")),
        },
        _ => Err(ValidationError::WrongType {
            field: "notes",
            expected: "an array",
        }),
    }
}

/// Validate every document in `raw`, keeping input order.
///
/// The first occurrence of an id wins; later duplicates are rejected.
pub fn validate_notes(raw: Vec<Value>) -> ValidatedBatch {
    let mut batch = ValidatedBatch::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (index, doc) in raw.into_iter().enumerate() {
        let note_id = doc
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        match validate_note(doc) {
            Ok(note) => {
                if !seen.insert(note.id.clone()) {
                    batch.rejected.push(Rejected {
                        index,
                        note_id: Some(note.id.clone()),
                        error: ValidationError::DuplicateId(note.id),
                    });
                    continue;
                }
                batch.notes.push(note);
            }
            Err(error) => {
                tracing::debug!(index, note_id = ?note_id, %error, "rejected note");
                batch.rejected.push(Rejected {
                    index,
                    note_id,
                    error,
                });
            }
        }
    }

    batch
}

/// Validate a single document against the note schema.
pub fn validate_note(doc: Value) -> Result<Note, ValidationError> {
    let mut obj = match doc {
        Value::Object(map) => map,
        _ => return Err(ValidationError::NotAnObject),
    };

    let id = required_string(&obj, "id")?;
    if id.trim().is_empty() {
        return Err(ValidationError::Empty("id"));
    }
    let title = required_string(&obj, "title")?;
    let content = required_string(&obj, "content")?;
    if content.trim().is_empty() {
        return Err(ValidationError::Empty("content"));
    }

    let tags = match obj.get("tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|t| {
                t.as_str()
                    .map(|s| s.to_string())
                    .ok_or(ValidationError::WrongType {
                        field: "tags",
                        expected: "an array of strings",
                    })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "tags",
                expected: "an array of strings",
            })
        }
    };

    let created = optional_timestamp(&obj, "created_at")?;
    let updated = optional_timestamp(&obj, "updated_at")?;
    let epoch = DateTime::<Utc>::default();
    let created_at = created.or(updated).unwrap_or(epoch);
    let updated_at = updated.or(created).unwrap_or(epoch);

    let metadata = match obj.remove("metadata") {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field: "metadata",
                expected: "an object",
            })
        }
    };

    Ok(Note {
        id,
        title,
        content,
        tags,
        created_at,
        updated_at,
        metadata,
    })
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn optional_timestamp(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ValidationError::BadTimestamp {
                field,
                value: s.clone(),
            }),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "an RFC 3339 string",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn good(id: &str) -> Value {
        json!({
            "id": id,
            "title": "Title",
            "content": "Some content.",
            "tags": ["a", "b"],
            "created_at": "2024-03-01T09:00:00Z",
            "updated_at": "2024-03-02T10:30:00+02:00",
            "metadata": { "source": "bear" }
        })
    }

    #[test]
    fn test_valid_note() {
        let note = validate_note(good("n1")).unwrap();
        assert_eq!(note.id, "n1");
        assert_eq!(note.tags, vec!["a", "b"]);
        assert_eq!(note.updated_at.to_rfc3339(), "2024-03-02T08:30:00+00:00");
        assert_eq!(note.metadata["source"], "bear");
    }

    #[test]
    fn test_optional_fields_default() {
        let note = validate_note(json!({
            "id": "n1",
            "title": "",
            "content": "body",
            "updated_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(note.tags.is_empty());
        assert!(note.metadata.is_empty());
        assert_eq!(note.created_at, note.updated_at);
    }

    #[test]
    fn test_rejections() {
        assert_eq!(
            validate_note(json!("text")),
            Err(ValidationError::NotAnObject)
        );
        assert_eq!(
            validate_note(json!({"title": "t", "content": "c"})),
            Err(ValidationError::MissingField("id"))
        );
        assert_eq!(
            validate_note(json!({"id": 7, "title": "t", "content": "c"})),
            Err(ValidationError::WrongType {
                field: "id",
                expected: "a string"
            })
        );
        assert_eq!(
            validate_note(json!({"id": "n", "title": "t", "content": "  \n "})),
            Err(ValidationError::Empty("content"))
        );
        assert!(matches!(
            validate_note(json!({"id": "n", "title": "t", "content": "c", "tags": [1]})),
            Err(ValidationError::WrongType { field: "tags", .. })
        ));
        assert!(matches!(
            validate_note(json!({"id": "n", "title": "t", "content": "c", "updated_at": "yesterday"})),
            Err(ValidationError::BadTimestamp { .. })
        ));
    }

    #[test]
    fn test_batch_isolates_failures_and_duplicates() {
        let batch = validate_notes(vec![
            good("n1"),
            json!({"id": "bad"}),
            good("n2"),
            good("n1"),
        ]);
        let ids: Vec<&str> = batch.notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert_eq!(batch.rejected.len(), 2);
        assert_eq!(batch.rejected[0].index, 1);
        assert_eq!(batch.rejected[0].note_id.as_deref(), Some("bad"));
        assert_eq!(
            batch.rejected[1].error,
            ValidationError::DuplicateId("n1".into())
        );
    }

    #[test]
    fn test_split_documents() {
        assert_eq!(split_documents(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(split_documents(json!({"notes": [1]})).unwrap().len(), 1);
        assert!(split_documents(json!({"items": []})).is_err());
        assert!(split_documents(json!(3)).is_err());
    }
}
