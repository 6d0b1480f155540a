//! The cached entity and the shape check applied to fetched payloads.
//!
//! [`is_record`] is a key allowlist, not a schema: an object passes when
//! every key it carries is one of the six [`RECORD_FIELDS`]. Value types are
//! never checked. Missing keys materialize as empty strings in [`Record`],
//! `null` becomes `""` and any other non-string value is kept as its JSON text.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Field names a record may carry, in serialization order.
pub const RECORD_FIELDS: [&str; 6] = ["first", "last", "email", "address", "created", "balance"];

/// One person entry of the cached dataset.
///
/// # Examples
///
/// ```
/// use slotfetch::record::Record;
///
/// let ann = Record::new("Ann", "Lee", "ann@example.com", "1 Main St", "2024-01-01", "$10.00");
/// let json = serde_json::to_string(&ann).unwrap();
/// assert!(json.starts_with(r#"{"first":"Ann","last":"Lee""#));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    #[serde(deserialize_with = "lenient_string")]
    pub first: String,
    #[serde(deserialize_with = "lenient_string")]
    pub last: String,
    #[serde(deserialize_with = "lenient_string")]
    pub email: String,
    #[serde(deserialize_with = "lenient_string")]
    pub address: String,
    #[serde(deserialize_with = "lenient_string")]
    pub created: String,
    #[serde(deserialize_with = "lenient_string")]
    pub balance: String,
    /// Keys outside [`RECORD_FIELDS`]. Always empty after [`filter_records`];
    /// populated only by an installed handoff payload, and written back out
    /// unchanged by serialization.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    /// Builds a record from its six fields, in [`RECORD_FIELDS`] order.
    pub fn new(
        first: impl Into<String>,
        last: impl Into<String>,
        email: impl Into<String>,
        address: impl Into<String>,
        created: impl Into<String>,
        balance: impl Into<String>,
    ) -> Self {
        Self {
            first: first.into(),
            last: last.into(),
            email: email.into(),
            address: address.into(),
            created: created.into(),
            balance: balance.into(),
            extra: Map::new(),
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// Returns `true` iff `value` is an object whose keys are all recognized field names.
///
/// Arrays, scalars and `null` are never records. Value types are not checked.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use slotfetch::record::is_record;
///
/// assert!(is_record(&json!({"first": "Ann", "balance": "$1"})));
/// assert!(!is_record(&json!({"first": "Ann", "extraField": 1})));
/// assert!(!is_record(&json!(["first"])));
/// ```
pub fn is_record(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.keys().all(|key| RECORD_FIELDS.contains(&key.as_str())),
        _ => false,
    }
}

/// Keeps the elements of `values` that pass [`is_record`], in input order.
///
/// Rejected elements are dropped without error. Every element that passes
/// the key check is kept, whatever its value types.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use slotfetch::record::filter_records;
///
/// let kept = filter_records(vec![json!({"first": "Ann", "balance": 12.5}), json!("Bob")]);
/// assert_eq!(kept.len(), 1);
/// assert_eq!(kept[0].balance, "12.5");
/// ```
pub fn filter_records(values: Vec<Value>) -> Vec<Record> {
    let total = values.len();
    let records: Vec<Record> = values
        .into_iter()
        .filter(is_record)
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(error = %e, "dropping record that failed to decode");
                None
            }
        })
        .collect();

    if records.len() < total {
        tracing::debug!(
            kept = records.len(),
            dropped = total - records.len(),
            "filtered non-conforming elements"
        );
    }
    records
}
