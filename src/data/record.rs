use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

use crate::data::{parse_timestamp, Timestamp};
use crate::{Error, Result};

/// A server row as delivered by snapshots and change events.
///
/// The field map sits behind an `Arc`, so handing a record to a notification
/// item or to a derived list shares the cached row instead of copying it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record(Arc<Map<String, JsonValue>>);

impl Record {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Record(Arc::new(fields))
    }

    /// Build a record from a JSON object. Rows without an `id` are rejected.
    pub fn from_value(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(fields) => {
                let record = Record::new(fields);
                if record.id().is_none() {
                    return Err(Error::InvalidRecord("missing 'id' column".to_string()));
                }
                Ok(record)
            }
            other => Err(Error::InvalidRecord(format!("expected object, got {}", other))),
        }
    }

    /// Primary key as a string. Numeric ids are rendered in decimal.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(JsonValue::as_str)
    }

    /// Follow a path through joined objects, e.g. `["autor", "nome"]`.
    pub fn get_path(&self, path: &[&str]) -> Option<&JsonValue> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for key in rest {
            current = current.get(*key)?;
        }
        Some(current)
    }

    /// Read a column as a timestamp. Accepts RFC 3339 strings and epoch millis.
    pub fn timestamp(&self, field: &str) -> Option<Timestamp> {
        match self.0.get(field)? {
            JsonValue::String(s) => parse_timestamp(s),
            JsonValue::Number(n) => n
                .as_u64()
                .map(crate::data::millis_to_timestamp),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }

    /// Copy of this record with `patch` columns layered on top.
    pub fn merged(&self, patch: &Record) -> Record {
        let mut fields = (*self.0).clone();
        for (key, value) in patch.fields() {
            fields.insert(key.clone(), value.clone());
        }
        Record::new(fields)
    }

    /// True when both handles point at the same cached row.
    pub fn ptr_eq(&self, other: &Record) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn sort_value(&self, field: &str) -> Option<SortValue> {
        match self.0.get(field)? {
            JsonValue::Number(n) => n.as_f64().map(SortValue::Number),
            JsonValue::String(s) => Some(match parse_timestamp(s) {
                Some(ts) => SortValue::Time(ts),
                None => SortValue::Text(s.clone()),
            }),
            JsonValue::Bool(b) => Some(SortValue::Number(if *b { 1.0 } else { 0.0 })),
            _ => None,
        }
    }
}

impl From<Map<String, JsonValue>> for Record {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Record::new(fields)
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fields = Map::<String, JsonValue>::deserialize(deserializer)?;
        Ok(Record::new(fields))
    }
}

/// Comparable projection of a column used for ordering derived lists.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SortValue {
    Number(f64),
    Time(Timestamp),
    Text(String),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Number(_) => 0,
            SortValue::Time(_) => 1,
            SortValue::Text(_) => 2,
        }
    }

    pub(crate) fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Number(a), SortValue::Number(b)) => a.total_cmp(b),
            (SortValue::Time(a), SortValue::Time(b)) => a.cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Build a [`Record`] from `key => value` pairs.
///
/// # Example
///
/// ```
/// let row = escola_sync::record! { "id" => "a", "ts" => 1 };
/// assert_eq!(row.id().as_deref(), Some("a"));
/// ```
#[macro_export]
macro_rules! record {
    () => {
        $crate::Record::new($crate::__json::Map::new())
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        {
            let mut fields = $crate::__json::Map::new();
            $(
                fields.insert($key.to_string(), $crate::__json::json!($value));
            )+
            $crate::Record::new(fields)
        }
    };
}
