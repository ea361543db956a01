use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use serde_with::serde_as;

/// Columns of every record, in output order. Responses never set attributes of these names.
pub const RESERVED_FIELDS: [&str; 5] =
    ["parcel_id", "latitude", "longitude", "rule_index", "api_status"];

/// Attribute holding a response or list element that is not a JSON object.
pub const VALUE_FIELD: &str = "value";

/// A scalar attribute value. Nested objects and arrays are kept as compact JSON text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Missing or JSON `null`.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number, kept in its original precision.
    Number(Number),
    /// JSON string, or nested JSON rendered as text.
    String(String),
}

impl FieldValue {
    /// Converts a JSON value, flattening anything nested into text.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(v) => Self::Bool(*v),
            Value::Number(v) => Self::Number(v.clone()),
            Value::String(v) => Self::String(v.clone()),
            Value::Array(_) | Value::Object(_) => Self::String(value.to_string()),
        }
    }

    /// Text of a CSV cell. Null is the empty string.
    #[must_use]
    pub fn as_cell(&self) -> Cow<'_, str> {
        match self {
            Self::Null => Cow::Borrowed(""),
            Self::Bool(v) => Cow::Borrowed(if *v { "true" } else { "false" }),
            Self::Number(v) => Cow::Owned(v.to_string()),
            Self::String(v) => Cow::Borrowed(v),
        }
    }
}

/// How the attribute request of a parcel ended. Every outcome but
/// [`ApiStatus::FailedAfterRetries`] is final and journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiStatus {
    /// One record per element of a non-empty list field.
    #[default]
    Success,
    /// The response has no list field, or an empty one.
    NoDataInList,
    /// The API answered 404.
    NotFound,
    /// The response body is not JSON.
    JsonError,
    /// Every attempt failed. The parcel is requested again by the next run.
    FailedAfterRetries,
}

impl ApiStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::NoDataInList => "NO_DATA_IN_LIST",
            Self::NotFound => "NOT_FOUND",
            Self::JsonError => "JSON_ERROR",
            Self::FailedAfterRetries => "FAILED_AFTER_RETRIES",
        }
    }
}

impl std::fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output row: a parcel, or one rule of a parcel with several.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    /// The parcel the response was fetched for.
    pub parcel_id: String,
    /// Position in the response's list field, 0 when there is none.
    pub rule_index: u32,
    #[serde(default)]
    pub api_status: ApiStatus,
    /// Attributes in response order.
    #[serde_as(as = "serde_with::Map<_, _>")]
    pub attributes: Vec<(String, FieldValue)>,
}

impl EnrichmentRecord {
    fn new(parcel_id: &str, rule_index: u32) -> Self {
        Self {
            parcel_id: parcel_id.to_string(),
            rule_index,
            api_status: ApiStatus::Success,
            attributes: Vec::new(),
        }
    }

    /// The single attribute-less record of a parcel without a usable response.
    #[must_use]
    pub fn without_response(parcel_id: &str, api_status: ApiStatus) -> Self {
        Self {
            api_status,
            ..Self::new(parcel_id, 0)
        }
    }

    /// Value of one attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Sets an attribute, keeping the position of an existing one.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        if RESERVED_FIELDS.contains(&name) {
            return;
        }
        match self.attributes.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    fn set_all(&mut self, fields: &Map<String, Value>, skip: Option<&str>) {
        for (name, value) in fields {
            if Some(name.as_str()) != skip {
                self.set(name, FieldValue::from_json(value));
            }
        }
    }
}

/// A response did not have the expected shape. The records are still produced, holding the
/// offending value in a [`VALUE_FIELD`] attribute.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The response is a scalar or `null`.
    #[error("response for parcel {parcel_id} is {kind}, not an object")]
    NotAnObject {
        /// The parcel.
        parcel_id: String,
        /// JSON type of the response.
        kind: &'static str,
    },

    /// An element of the list field is not an object.
    #[error("element {index} of the list for parcel {parcel_id} is {kind}, not an object")]
    ElementNotAnObject {
        /// The parcel.
        parcel_id: String,
        /// Position of the element.
        index: usize,
        /// JSON type of the element.
        kind: &'static str,
    },
}

/// Records made from one response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normalized {
    /// At least one record, ordered by `rule_index`.
    pub records: Vec<EnrichmentRecord>,
    /// Shape problems worked around.
    pub warnings: Vec<SchemaError>,
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Flattens the response fetched for one parcel into records.
///
/// If `list_field` holds a non-empty array, every element becomes one record carrying the
/// response's other fields plus the element's own; the element wins when both have a field.
/// A response that is itself an array is treated as that list without other fields. Anything
/// else becomes a single [`ApiStatus::NoDataInList`] record.
#[must_use]
pub fn normalize_response(parcel_id: &str, response: &Value, list_field: &str) -> Normalized {
    let mut normalized = Normalized::default();
    let (siblings, list) = match response {
        Value::Object(fields) => match fields.get(list_field) {
            Some(Value::Array(list)) => (Some(fields), list.as_slice()),
            _ => (Some(fields), &[][..]),
        },
        Value::Array(list) => (None, list.as_slice()),
        scalar => {
            let mut record = EnrichmentRecord::without_response(parcel_id, ApiStatus::NoDataInList);
            record.set(VALUE_FIELD, FieldValue::from_json(scalar));
            normalized.records.push(record);
            normalized.warnings.push(SchemaError::NotAnObject {
                parcel_id: parcel_id.to_string(),
                kind: kind(scalar),
            });
            return normalized;
        }
    };

    let mut base = EnrichmentRecord::new(parcel_id, 0);
    if let Some(fields) = siblings {
        let skip = fields
            .get(list_field)
            .is_some_and(Value::is_array)
            .then_some(list_field);
        base.set_all(fields, skip);
    }
    if list.is_empty() {
        base.api_status = ApiStatus::NoDataInList;
        normalized.records.push(base);
        return normalized;
    }

    for (index, element) in list.iter().enumerate() {
        let mut record = base.clone();
        record.rule_index = u32::try_from(index).unwrap_or(u32::MAX);
        match element {
            Value::Object(fields) => record.set_all(fields, None),
            other => {
                record.set(VALUE_FIELD, FieldValue::from_json(other));
                normalized.warnings.push(SchemaError::ElementNotAnObject {
                    parcel_id: parcel_id.to_string(),
                    index,
                    kind: kind(other),
                });
            }
        }
        normalized.records.push(record);
    }
    normalized
}
