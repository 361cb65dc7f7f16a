//! Queued action records and their persisted JSON shape.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

/// Payload of a benefit application submitted from a chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPayload {
  pub turn_id: String,
  /// `None` when absent, `Some(None)` for an explicit `null`
  #[serde(
    default,
    deserialize_with = "present",
    skip_serializing_if = "Option::is_none"
  )]
  pub scheme_id: Option<Option<String>>,
  /// Fields this version does not know about, kept for the backend
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Payload of a document upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload {
  pub file_name: String,
  #[serde(
    default,
    deserialize_with = "present",
    skip_serializing_if = "Option::is_none"
  )]
  pub content_type: Option<Option<String>>,
  #[serde(
    default,
    deserialize_with = "present",
    skip_serializing_if = "Option::is_none"
  )]
  pub document_type: Option<Option<String>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Only called for keys that are present, so an explicit null stays distinguishable.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Option<String>>, D::Error> {
  Option::<String>::deserialize(deserializer).map(Some)
}

/// Action payload, tagged by the action type.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
  Apply(ApplyPayload),
  Upload(UploadPayload),
  /// A type this version doesn't model, or a known type whose payload doesn't fit.
  /// Kept verbatim so nothing is lost on rewrite.
  Other { kind: String, payload: Value },
}

impl ActionPayload {
  /// The `type` string persisted alongside the payload.
  pub fn kind(&self) -> &str {
    match self {
      Self::Apply(_) => "apply",
      Self::Upload(_) => "upload",
      Self::Other { kind, .. } => kind.as_str(),
    }
  }

  /// Payload as a JSON request body.
  pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
    match self {
      Self::Apply(p) => serde_json::to_vec(p),
      Self::Upload(p) => serde_json::to_vec(p),
      Self::Other { payload, .. } => serde_json::to_vec(payload),
    }
  }

  /// Resolve a persisted `(type, payload)` pair.
  pub fn from_parts(kind: String, payload: Value) -> Self {
    match kind.as_str() {
      "apply" => match serde_json::from_value(payload.clone()) {
        Ok(p) => Self::Apply(p),
        Err(e) => {
          warn!(error = %e, "Apply payload has unexpected shape, keeping it opaque");
          Self::Other { kind, payload }
        }
      },
      "upload" => match serde_json::from_value(payload.clone()) {
        Ok(p) => Self::Upload(p),
        Err(e) => {
          warn!(error = %e, "Upload payload has unexpected shape, keeping it opaque");
          Self::Other { kind, payload }
        }
      },
      _ => Self::Other { kind, payload },
    }
  }
}

/// A pending mutation waiting to be replayed against the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "WireAction")]
pub struct QueuedAction {
  /// `{type}-{created millis}-{random}`; unique within the store
  pub id: String,
  pub payload: ActionPayload,
  pub created_at: DateTime<Utc>,
  pub retries: u32,
}

impl QueuedAction {
  /// Build a fresh record with no retries.
  pub fn new(payload: ActionPayload) -> Self {
    let millis = Utc::now().timestamp_millis();
    // Persisted with millisecond precision; truncate now so reads compare equal.
    let created_at = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();
    let id = format!("{}-{}-{}", payload.kind(), millis, random_suffix());

    Self {
      id,
      payload,
      created_at,
      retries: 0,
    }
  }

  pub fn kind(&self) -> &str {
    self.payload.kind()
  }
}

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn random_suffix() -> String {
  let mut rng = rand::rng();
  (0..9)
    .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
    .collect()
}

impl Serialize for QueuedAction {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut state = serializer.serialize_struct("QueuedAction", 5)?;
    state.serialize_field("id", &self.id)?;
    state.serialize_field("type", self.payload.kind())?;
    match &self.payload {
      ActionPayload::Apply(p) => state.serialize_field("payload", p)?,
      ActionPayload::Upload(p) => state.serialize_field("payload", p)?,
      ActionPayload::Other { payload, .. } => state.serialize_field("payload", payload)?,
    }
    state.serialize_field("createdAt", &self.created_at.timestamp_millis())?;
    state.serialize_field("retries", &self.retries)?;
    state.end()
  }
}

/// Persisted shape: `{id, type, payload, createdAt, retries}`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAction {
  id: String,
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  payload: Value,
  created_at: WireTimestamp,
  #[serde(default)]
  retries: u32,
}

/// Older writers stored RFC 3339 strings or fractional millis; current ones
/// store integer epoch millis.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
  Millis(i64),
  FractionalMillis(f64),
  Text(String),
}

impl WireTimestamp {
  fn into_datetime(self) -> DateTime<Utc> {
    match self {
      Self::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default(),
      Self::FractionalMillis(ms) => {
        DateTime::<Utc>::from_timestamp_millis(ms.trunc() as i64).unwrap_or_default()
      }
      Self::Text(s) => DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
          warn!(value = %s, error = %e, "Unparseable createdAt, using epoch");
          DateTime::<Utc>::default()
        }),
    }
  }
}

impl From<WireAction> for QueuedAction {
  fn from(wire: WireAction) -> Self {
    Self {
      id: wire.id,
      payload: ActionPayload::from_parts(wire.kind, wire.payload),
      created_at: wire.created_at.into_datetime(),
      retries: wire.retries,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn apply(turn_id: &str) -> ActionPayload {
    ActionPayload::Apply(ApplyPayload {
      turn_id: turn_id.to_string(),
      scheme_id: None,
      extra: Map::new(),
    })
  }

  #[test]
  fn test_new_action_id_format() {
    let action = QueuedAction::new(apply("t1"));
    let parts: Vec<&str> = action.id.splitn(3, '-').collect();

    assert_eq!(parts[0], "apply");
    assert_eq!(parts[1], action.created_at.timestamp_millis().to_string());
    assert_eq!(parts[2].len(), 9);
    assert!(parts[2]
      .chars()
      .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    assert_eq!(action.retries, 0);
  }

  #[test]
  fn test_ids_are_unique() {
    let a = QueuedAction::new(apply("t1"));
    let b = QueuedAction::new(apply("t1"));
    assert_ne!(a.id, b.id);
  }

  #[test]
  fn test_persisted_shape() {
    let mut action = QueuedAction::new(apply("t1"));
    action.retries = 2;

    let value = serde_json::to_value(&action).unwrap();

    assert_eq!(value["type"], "apply");
    assert_eq!(value["payload"], json!({ "turnId": "t1" }));
    assert_eq!(value["retries"], 2);
    assert_eq!(value["createdAt"], action.created_at.timestamp_millis());
  }

  #[test]
  fn test_queue_round_trip() {
    let mut upload = QueuedAction::new(ActionPayload::Upload(UploadPayload {
      file_name: "आधार-कार्ड.pdf".to_string(),
      content_type: Some(Some("application/pdf".to_string())),
      document_type: None,
      extra: Map::new(),
    }));
    upload.retries = 1;

    let other = QueuedAction::new(ActionPayload::Other {
      kind: "feedback".to_string(),
      payload: json!({ "rating": 5, "comment": "très bien 👍" }),
    });

    let queue = vec![QueuedAction::new(apply("t1")), upload, other];

    let text = serde_json::to_string(&queue).unwrap();
    let back: Vec<QueuedAction> = serde_json::from_str(&text).unwrap();

    assert_eq!(back, queue);
    assert_eq!(back[2].kind(), "feedback");
  }

  #[test]
  fn test_unknown_payload_fields_preserved() {
    let text = r#"{"id":"apply-1-abc","type":"apply","payload":{"turnId":"t9","locale":"hi-IN"},"createdAt":1700000000000,"retries":0}"#;

    let action: QueuedAction = serde_json::from_str(text).unwrap();
    match &action.payload {
      ActionPayload::Apply(p) => {
        assert_eq!(p.turn_id, "t9");
        assert_eq!(p.extra["locale"], "hi-IN");
      }
      other => panic!("unexpected payload {:?}", other),
    }

    let value = serde_json::to_value(&action).unwrap();
    assert_eq!(value["payload"]["locale"], "hi-IN");
  }

  #[test]
  fn test_explicit_nulls_survive_round_trip() {
    let text = r#"{"id":"upload-1-abc","type":"upload","payload":{"fileName":"ration.jpg","contentType":null},"createdAt":1,"retries":0}"#;

    let action: QueuedAction = serde_json::from_str(text).unwrap();
    match &action.payload {
      ActionPayload::Upload(p) => {
        assert_eq!(p.content_type, Some(None));
        assert_eq!(p.document_type, None);
      }
      other => panic!("unexpected payload {:?}", other),
    }

    let payload = &serde_json::to_value(&action).unwrap()["payload"];
    assert_eq!(payload, &json!({ "fileName": "ration.jpg", "contentType": null }));
    assert!(payload.get("documentType").is_none());

    let apply = r#"{"id":"apply-1-abc","type":"apply","payload":{"turnId":"t1","schemeId":null},"createdAt":1}"#;
    let action: QueuedAction = serde_json::from_str(apply).unwrap();
    assert_eq!(
      serde_json::to_value(&action).unwrap()["payload"],
      json!({ "turnId": "t1", "schemeId": null })
    );
  }

  #[test]
  fn test_malformed_known_payload_kept_opaque() {
    let text = r#"{"id":"apply-1-abc","type":"apply","payload":{"scheme":7},"createdAt":1,"retries":3}"#;

    let action: QueuedAction = serde_json::from_str(text).unwrap();

    assert_eq!(action.kind(), "apply");
    assert_eq!(
      action.payload,
      ActionPayload::Other {
        kind: "apply".to_string(),
        payload: json!({ "scheme": 7 }),
      }
    );
    assert_eq!(action.retries, 3);
    assert_eq!(
      serde_json::to_value(&action).unwrap()["payload"],
      json!({ "scheme": 7 })
    );
  }

  #[test]
  fn test_reads_rfc3339_created_at() {
    let text = r#"{"id":"x","type":"upload","payload":{"fileName":"a.png"},"createdAt":"2024-05-01T10:00:00Z"}"#;

    let action: QueuedAction = serde_json::from_str(text).unwrap();

    assert_eq!(action.created_at.timestamp(), 1714557600);
    assert_eq!(action.retries, 0);
  }

  #[test]
  fn test_reads_fractional_millis_created_at() {
    let text = r#"{"id":"x","type":"apply","payload":{"turnId":"t1"},"createdAt":1714557600000.75,"retries":2}"#;

    let action: QueuedAction = serde_json::from_str(text).unwrap();

    assert_eq!(action.created_at.timestamp_millis(), 1714557600000);
    assert_eq!(action.retries, 2);
  }
}
