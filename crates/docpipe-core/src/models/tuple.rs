use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

/// A single metadata record produced by a parse. Keys are ordered so that
/// serialized output is stable.
pub type Metadata = BTreeMap<String, String>;

/// Addresses a source to fetch: an opaque fetcher id plus a key the fetcher
/// understands (a path, an object key, a URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchKey {
    pub fetcher_id: String,
    pub key: String,
}

impl FetchKey {
    pub fn new(fetcher_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            fetcher_id: fetcher_id.into(),
            key: key.into(),
        }
    }
}

impl Display for FetchKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.fetcher_id, self.key)
    }
}

/// Addresses an emit destination: an opaque emitter id plus a key the emitter
/// understands.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitKey {
    pub emitter_id: String,
    pub key: String,
}

impl EmitKey {
    pub fn new(emitter_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            emitter_id: emitter_id.into(),
            key: key.into(),
        }
    }
}

impl Display for EmitKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}", self.emitter_id, self.key)
    }
}

/// What the worker does when the parser raises for a tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseExceptionPolicy {
    /// Log the failure and drop the task. Nothing is emitted.
    #[serde(rename = "SKIP")]
    #[default]
    Skip,
    /// Emit a payload with an empty metadata list so downstream sinks still
    /// observe the key.
    #[serde(rename = "EMIT_EMPTY")]
    EmitEmpty,
}

/// One unit of work: fetch a source, parse it, emit the result.
///
/// The dispatcher treats the tuple as opaque except for `emit_key.emitter_id`
/// (used to group emissions) and `on_parse_exception`. The tuple is persisted
/// as a single JSON string on the task row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEmitTuple {
    pub fetch_key: FetchKey,
    pub emit_key: EmitKey,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub on_parse_exception: ParseExceptionPolicy,
}

impl FetchEmitTuple {
    pub fn new(fetch_key: FetchKey, emit_key: EmitKey) -> Self {
        Self {
            fetch_key,
            emit_key,
            metadata: Metadata::new(),
            on_parse_exception: ParseExceptionPolicy::default(),
        }
    }

    /// Serialize to the persisted wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from the persisted wire form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tuple() -> FetchEmitTuple {
        let mut tuple = FetchEmitTuple::new(
            FetchKey::new("fs", "docs/a.txt"),
            EmitKey::new("stdout", "a.txt"),
        );
        tuple
            .metadata
            .insert("source".to_string(), "crawl-7".to_string());
        tuple.on_parse_exception = ParseExceptionPolicy::EmitEmpty;
        tuple
    }

    #[test]
    fn tuple_round_trip() {
        let tuple = sample_tuple();
        let json = tuple.to_json().unwrap();
        let parsed = FetchEmitTuple::from_json(&json).unwrap();
        assert_eq!(parsed, tuple);
    }

    #[test]
    fn wire_field_names() {
        let json = sample_tuple().to_json().unwrap();
        assert!(json.contains("\"fetchKey\""));
        assert!(json.contains("\"fetcherId\":\"fs\""));
        assert!(json.contains("\"emitKey\""));
        assert!(json.contains("\"emitterId\":\"stdout\""));
        assert!(json.contains("\"onParseException\":\"EMIT_EMPTY\""));
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{
            "fetchKey": {"fetcherId": "fs", "key": "a.txt"},
            "emitKey": {"emitterId": "stdout", "key": "a.txt"}
        }"#;
        let tuple = FetchEmitTuple::from_json(json).unwrap();
        assert!(tuple.metadata.is_empty());
        assert_eq!(tuple.on_parse_exception, ParseExceptionPolicy::Skip);
    }

    #[test]
    fn policy_wire_names() {
        assert_eq!(
            serde_json::to_string(&ParseExceptionPolicy::Skip).unwrap(),
            "\"SKIP\""
        );
        assert_eq!(
            serde_json::to_string(&ParseExceptionPolicy::EmitEmpty).unwrap(),
            "\"EMIT_EMPTY\""
        );
    }

    #[test]
    fn key_display_includes_id_and_key() {
        assert_eq!(FetchKey::new("s3", "bucket/a").to_string(), "s3:bucket/a");
        assert_eq!(EmitKey::new("index", "a").to_string(), "index:a");
    }
}
