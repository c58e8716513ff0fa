use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A document from the database: its id plus whatever fields it carries.
///
/// Blog posts use `title`, `date`, `category`, `excerpt`, `content` and
/// `image`; gallery sections use `title`, `order` and `images`. Nothing is
/// required beyond the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub id: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl Record {
  #[cfg(test)]
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      fields: Map::new(),
    }
  }

  /// Builder-style field setter.
  #[cfg(test)]
  pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
    self.fields.insert(name.to_string(), value.into());
    self
  }

  /// String field, if present and a string
  pub fn str_field(&self, name: &str) -> Option<&str> {
    self.fields.get(name).and_then(Value::as_str)
  }

  pub fn title(&self) -> Option<&str> {
    self.str_field("title")
  }

  /// Publication date as stored (ISO 8601 for timestamp fields)
  pub fn date(&self) -> Option<&str> {
    self.str_field("date")
  }

  pub fn category(&self) -> Option<&str> {
    self.str_field("category")
  }

  pub fn excerpt(&self) -> Option<&str> {
    self.str_field("excerpt")
  }

  pub fn content(&self) -> Option<&str> {
    self.str_field("content")
  }

  /// Ordering hint for gallery sections
  pub fn order(&self) -> Option<f64> {
    self.fields.get("order").and_then(Value::as_f64)
  }

  /// Image file names or storage paths listed on the record
  pub fn images(&self) -> Vec<&str> {
    self
      .fields
      .get("images")
      .and_then(Value::as_array)
      .map(|images| images.iter().filter_map(Value::as_str).collect())
      .unwrap_or_default()
  }
}

/// A download URL for an object in the storage bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadUrl(pub String);

/// Sort direction for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Ascending,
  Descending,
}

impl Direction {
  /// Wire name used by the document database
  pub fn as_api_str(self) -> &'static str {
    match self {
      Direction::Ascending => "ASCENDING",
      Direction::Descending => "DESCENDING",
    }
  }
}

/// Ordering of a collection listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
  pub field: String,
  pub direction: Direction,
}

impl OrderBy {
  pub fn asc(field: &str) -> Self {
    Self {
      field: field.to_string(),
      direction: Direction::Ascending,
    }
  }

  pub fn desc(field: &str) -> Self {
    Self {
      field: field.to_string(),
      direction: Direction::Descending,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_record_flattens_fields() {
    let record = Record::new("post-1")
      .with("title", "Hello")
      .with("order", 2);

    assert_eq!(
      serde_json::to_value(&record).unwrap(),
      json!({ "id": "post-1", "title": "Hello", "order": 2 })
    );

    let back: Record = serde_json::from_value(json!({ "id": "x", "images": ["a.png", 3, "b.png"] })).unwrap();
    assert_eq!(back.id, "x");
    assert_eq!(back.images(), vec!["a.png", "b.png"]);
  }

  #[test]
  fn test_accessors_ignore_wrong_types() {
    let record = Record::new("s").with("title", 5).with("order", "first");
    assert_eq!(record.title(), None);
    assert_eq!(record.order(), None);
    assert!(record.images().is_empty());
  }
}
