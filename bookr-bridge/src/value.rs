//! Protocol values exchanged with the child process.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Field name to value mapping. Keeps wire order; lookup is by key.
pub type Record = IndexMap<String, Value>;

/// A value on the wire: a bare line, a `{ ... }` record or a `[ ... ]` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(String),
    Record(Record),
    List(Vec<Value>),
}

impl Value {
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Scalar(_))
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Self::Record(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Variant name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scalar(_) => "scalar",
            Self::Record(_) => "record",
            Self::List(_) => "list",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Scalar(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Scalar(s)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Self {
        Self::Record(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_inspection() {
        let scalar = Value::from("1");
        assert!(scalar.is_scalar());
        assert_eq!(scalar.as_scalar(), Some("1"));
        assert!(scalar.as_record().is_none());
        assert_eq!(scalar.kind(), "scalar");

        let list = Value::from(vec![Value::from("a")]);
        assert!(list.is_list());
        assert_eq!(list.as_list().map(<[Value]>::len), Some(1));

        let record = Value::from(Record::from([("a".to_string(), Value::from("1"))]));
        assert!(record.is_record());
        assert_eq!(
            record.into_record().and_then(|r| r.get("a").cloned()),
            Some(Value::from("1"))
        );
    }

    #[test]
    fn record_keeps_insertion_order() {
        let mut record = Record::new();
        record.insert("zeta".to_string(), Value::from("1"));
        record.insert("alpha".to_string(), Value::from("2"));

        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "alpha"]);
    }

    #[test]
    fn serializes_as_plain_json() {
        let mut nested = Record::new();
        nested.insert("title".to_string(), Value::from("Dune"));
        let mut record = Record::new();
        record.insert("book".to_string(), Value::from(nested));
        record.insert(
            "tags".to_string(),
            Value::from(vec![Value::from("scifi"), Value::from("classic")]),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"book": {"title": "Dune"}, "tags": ["scifi", "classic"]})
        );

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
