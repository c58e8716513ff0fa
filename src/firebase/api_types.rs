//! Serde-deserializable types matching the storage and document REST APIs.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use std::collections::HashMap;

use super::types::{OrderBy, Record};

// ============================================================================
// Storage object metadata
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiObjectMetadata {
  pub name: String,
  /// Comma-separated list; absent when the object has no download token
  #[serde(rename = "downloadTokens")]
  pub download_tokens: Option<String>,
}

impl ApiObjectMetadata {
  /// First usable download token.
  pub fn first_token(&self) -> Option<&str> {
    self
      .download_tokens
      .as_deref()
      .and_then(|tokens| tokens.split(',').map(str::trim).find(|t| !t.is_empty()))
  }
}

// ============================================================================
// Typed document values
// ============================================================================

/// One typed value as the document API encodes it, e.g. `{"stringValue": "x"}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiValue {
  NullValue(()),
  BooleanValue(bool),
  /// int64 travels as a decimal string
  IntegerValue(String),
  DoubleValue(f64),
  TimestampValue(String),
  StringValue(String),
  BytesValue(String),
  ReferenceValue(String),
  GeoPointValue(ApiLatLng),
  ArrayValue(ApiArrayValue),
  MapValue(ApiMapValue),
}

#[derive(Debug, Deserialize)]
pub struct ApiLatLng {
  #[serde(default)]
  pub latitude: f64,
  #[serde(default)]
  pub longitude: f64,
}

#[derive(Debug, Deserialize)]
pub struct ApiArrayValue {
  #[serde(default)]
  pub values: Vec<ApiValue>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMapValue {
  #[serde(default)]
  pub fields: HashMap<String, ApiValue>,
}

impl ApiValue {
  /// Convert to plain JSON, dropping the type wrappers.
  pub fn into_json(self) -> Value {
    match self {
      ApiValue::NullValue(()) => Value::Null,
      ApiValue::BooleanValue(b) => Value::Bool(b),
      ApiValue::IntegerValue(s) => match s.parse::<i64>() {
        Ok(n) => Value::from(n),
        Err(_) => Value::String(s),
      },
      ApiValue::DoubleValue(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
      ApiValue::TimestampValue(s)
      | ApiValue::StringValue(s)
      | ApiValue::BytesValue(s)
      | ApiValue::ReferenceValue(s) => Value::String(s),
      ApiValue::GeoPointValue(p) => json!({ "latitude": p.latitude, "longitude": p.longitude }),
      ApiValue::ArrayValue(a) => Value::Array(a.values.into_iter().map(ApiValue::into_json).collect()),
      ApiValue::MapValue(m) => Value::Object(decode_fields(m.fields)),
    }
  }
}

fn decode_fields(fields: HashMap<String, ApiValue>) -> Map<String, Value> {
  fields
    .into_iter()
    .map(|(name, value)| (name, value.into_json()))
    .collect()
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiDocument {
  /// Full resource name ending in `/documents/{collection}/{id}`
  pub name: String,
  #[serde(default)]
  pub fields: HashMap<String, ApiValue>,
}

impl ApiDocument {
  pub fn into_record(self) -> Record {
    let doc_id = self.name.rsplit('/').next().unwrap_or_default().to_string();
    let mut fields = decode_fields(self.fields);

    // Document data may carry its own id, which wins over the document name
    let id = match fields.remove("id") {
      Some(Value::String(id)) => id,
      Some(Value::Null) | None => doc_id,
      Some(other) => other.to_string(),
    };

    Record { id, fields }
  }
}

/// One element of a `runQuery` response stream.
#[derive(Debug, Deserialize)]
pub struct ApiRunQueryItem {
  pub document: Option<ApiDocument>,
}

/// Body for a `runQuery` request listing a whole collection.
pub fn structured_query(collection: &str, order: &OrderBy) -> Value {
  json!({
    "structuredQuery": {
      "from": [{ "collectionId": collection }],
      "orderBy": [{
        "field": { "fieldPath": order.field },
        "direction": order.direction.as_api_str(),
      }],
    }
  })
}

/// Records of a `runQuery` response, in response order.
pub fn records_from_run_query(items: Vec<ApiRunQueryItem>) -> Vec<Record> {
  items
    .into_iter()
    .filter_map(|item| item.document)
    .map(ApiDocument::into_record)
    .collect()
}
