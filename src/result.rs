//! Typed, append-only scan result documents.
//!
//! A [`ScanResult`] maps unique string keys to [`ResultValue`]s. Scans build
//! one incrementally while they run; the worker attaches it to the task once
//! and it is not touched afterwards.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

/// Key under which every task result records the id of the task it belongs to.
pub const RESULT_ID_KEY: &str = "_result_id";

/// Key under which a failed scan records its error message.
pub const ERROR_KEY: &str = "_error";

/// Keys starting with `_` belong to the crawler, not to scans. The empty key is never valid.
pub fn is_reserved_key(key: &str) -> bool {
    key.is_empty() || key.starts_with('_')
}

/// One value stored in a [`ScanResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ResultValue {
    String(String),
    Integer(i64),
    Float(f64),
    Timestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    Binary(Vec<u8>),
    Array(ResultArray),
    Nested(ScanResult),
}

/// Homogeneous arrays; mixing element types is unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "of", content = "items", rename_all = "snake_case")]
pub enum ResultArray {
    Strings(Vec<String>),
    Integers(Vec<i64>),
    Floats(Vec<f64>),
    Timestamps(#[serde(with = "timestamp_vec")] Vec<OffsetDateTime>),
    Binaries(Vec<Vec<u8>>),
    Nested(Vec<ScanResult>),
}

mod timestamp_vec {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(v: &[OffsetDateTime], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(v.len()))?;
        for ts in v {
            let text = ts.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
            seq.serialize_element(&text)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<OffsetDateTime>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|text| OffsetDateTime::parse(text, &Rfc3339).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Insertion-ordered mapping with unique, non-empty keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    entries: Vec<(String, ResultValue)>,
}

impl ScanResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// A result pre-tagged with [`RESULT_ID_KEY`].
    pub fn with_identifier(id: impl Into<String>) -> Self {
        let mut r = Self::new();
        r.insert(RESULT_ID_KEY, ResultValue::String(id.into()));
        r
    }

    /// Append `key -> value`.
    ///
    /// # Panics
    /// Panics if `key` is empty or already present. Both are bugs in the
    /// scan producing the result, not conditions to recover from.
    pub fn insert(&mut self, key: impl Into<String>, value: ResultValue) {
        let key = key.into();
        assert!(!key.is_empty(), "scan result key must not be empty");
        assert!(
            !self.contains_key(&key),
            "duplicate scan result key: {key}"
        );
        self.entries.push((key, value));
    }

    pub fn add_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.insert(key, ResultValue::String(value.into()));
    }

    pub fn add_integer(&mut self, key: impl Into<String>, value: i64) {
        self.insert(key, ResultValue::Integer(value));
    }

    pub fn add_float(&mut self, key: impl Into<String>, value: f64) {
        self.insert(key, ResultValue::Float(value));
    }

    pub fn add_timestamp(&mut self, key: impl Into<String>, value: OffsetDateTime) {
        self.insert(key, ResultValue::Timestamp(value));
    }

    pub fn add_binary(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.insert(key, ResultValue::Binary(value));
    }

    pub fn add_array(&mut self, key: impl Into<String>, value: ResultArray) {
        self.insert(key, ResultValue::Array(value));
    }

    pub fn add_nested(&mut self, key: impl Into<String>, value: ScanResult) {
        self.insert(key, ResultValue::Nested(value));
    }

    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ScanResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Rejects empty and repeated keys instead of panicking like [`ScanResult::insert`].
impl<'de> Deserialize<'de> for ScanResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScanResultVisitor;

        impl<'de> Visitor<'de> for ScanResultVisitor {
            type Value = ScanResult;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of unique, non-empty keys to typed values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ScanResult, A::Error> {
                let mut result = ScanResult::new();
                while let Some((key, value)) = map.next_entry::<String, ResultValue>()? {
                    if key.is_empty() {
                        return Err(de::Error::custom("scan result key must not be empty"));
                    }
                    if result.contains_key(&key) {
                        return Err(de::Error::custom(format!("duplicate scan result key: {key}")));
                    }
                    result.entries.push((key, value));
                }
                Ok(result)
            }
        }

        deserializer.deserialize_map(ScanResultVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let mut r = ScanResult::with_identifier("abc");
        r.add_integer("latency_ms", 12);
        r.add_array("ports", ResultArray::Integers(vec![22, 443]));
        let keys: Vec<_> = r.keys().collect();
        assert_eq!(keys, vec![RESULT_ID_KEY, "latency_ms", "ports"]);
        assert_eq!(r.get("latency_ms"), Some(&ResultValue::Integer(12)));
    }

    #[test]
    #[should_panic(expected = "duplicate scan result key")]
    fn duplicate_key_panics() {
        let mut r = ScanResult::new();
        r.add_string("banner", "ssh");
        r.add_string("banner", "http");
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_key_panics() {
        ScanResult::new().add_float("", 1.0);
    }

    #[test]
    fn nested_keys_do_not_collide_with_parent() {
        let mut inner = ScanResult::new();
        inner.add_string("banner", "x");
        let mut outer = ScanResult::new();
        outer.add_string("banner", "y");
        outer.add_nested("tcp_connect", inner);
        assert_eq!(outer.len(), 2);
    }

    #[test]
    fn serializes_as_json_object() {
        let mut r = ScanResult::new();
        r.add_string("state", "open");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["state"]["type"], "string");
        assert_eq!(json["state"]["value"], "open");
    }

    #[test]
    fn stored_documents_are_read_back_with_unique_keys() {
        let json = r#"{"_result_id":{"type":"string","value":"t1"},
                       "tcp_connect":{"type":"nested","value":{
                           "open_ports":{"type":"array","value":{"of":"integers","items":[22]}},
                           "seen":{"type":"array","value":{"of":"timestamps","items":["2024-05-01T10:00:00Z"]}}}}}"#;
        let r: ScanResult = serde_json::from_str(json).unwrap();
        assert_eq!(r.keys().collect::<Vec<_>>(), vec![RESULT_ID_KEY, "tcp_connect"]);
        match r.get("tcp_connect") {
            Some(ResultValue::Nested(inner)) => assert_eq!(
                inner.get("open_ports"),
                Some(&ResultValue::Array(ResultArray::Integers(vec![22])))
            ),
            other => panic!("unexpected entry: {other:?}"),
        }

        let dup = r#"{"a":{"type":"integer","value":1},"a":{"type":"integer","value":2}}"#;
        let err = serde_json::from_str::<ScanResult>(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate scan result key"));
        let empty = r#"{"":{"type":"integer","value":1}}"#;
        assert!(serde_json::from_str::<ScanResult>(empty).is_err());
    }
}
