//! Parser abstraction.
//!
//! The worker hands the fetched bytes plus the tuple's metadata to the
//! parser and receives a list of metadata records. Document-format handling
//! lives entirely behind this trait; the dispatcher never inspects content.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use docpipe_core::models::Metadata;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed content: {0}")]
    Malformed(String),

    #[error("unsupported content: {0}")]
    Unsupported(String),
}

pub type ParseResult<T> = Result<T, ParseError>;

#[async_trait]
pub trait Parser: Send + Sync {
    /// Parse the fetched bytes into metadata records. `metadata` is the
    /// tuple's caller-supplied map, merged into each produced record.
    async fn parse(&self, data: &[u8], metadata: &Metadata) -> ParseResult<Vec<Metadata>>;
}

/// Settings for the reference parser, loadable from the config file passed
/// to worker children.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Longest content excerpt recorded per document, in bytes.
    pub max_text_length: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_text_length: 4096,
        }
    }
}

impl ParserConfig {
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let body = std::fs::read_to_string(path)?;
        serde_json::from_str(&body)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

/// Treats the document as UTF-8 text and produces a single metadata record
/// with the content excerpt and length.
pub struct PlainTextParser {
    config: ParserConfig,
}

impl PlainTextParser {
    pub fn new(config: ParserConfig) -> Self {
        Self { config }
    }
}

impl Default for PlainTextParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

#[async_trait]
impl Parser for PlainTextParser {
    async fn parse(&self, data: &[u8], metadata: &Metadata) -> ParseResult<Vec<Metadata>> {
        let text = std::str::from_utf8(data)
            .map_err(|err| ParseError::Malformed(format!("not utf-8: {err}")))?;

        let mut record = metadata.clone();
        let mut excerpt = text;
        if excerpt.len() > self.config.max_text_length {
            let mut end = self.config.max_text_length;
            while !excerpt.is_char_boundary(end) {
                end -= 1;
            }
            excerpt = &excerpt[..end];
        }
        record.insert("content".to_string(), excerpt.to_string());
        record.insert("content_length".to_string(), data.len().to_string());
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_one_record_with_content() {
        let parser = PlainTextParser::default();
        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), "crawl".to_string());

        let records = parser.parse(b"hello world", &metadata).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["content"], "hello world");
        assert_eq!(records[0]["content_length"], "11");
        assert_eq!(records[0]["source"], "crawl");
    }

    #[tokio::test]
    async fn truncates_on_char_boundary() {
        let parser = PlainTextParser::new(ParserConfig { max_text_length: 5 });
        // 'é' is two bytes; a naive byte cut at 5 would split it.
        let records = parser.parse("aaaaé".as_bytes(), &Metadata::new()).await.unwrap();
        assert_eq!(records[0]["content"], "aaaa");
    }

    #[tokio::test]
    async fn rejects_binary_content() {
        let parser = PlainTextParser::default();
        assert!(matches!(
            parser.parse(&[0xff, 0xfe, 0x00], &Metadata::new()).await,
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parser.json");
        std::fs::write(&path, r#"{"max_text_length": 9}"#).unwrap();
        let config = ParserConfig::from_file(&path).unwrap();
        assert_eq!(config.max_text_length, 9);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parser.json");
        std::fs::write(&path, "{}").unwrap();
        let config = ParserConfig::from_file(&path).unwrap();
        assert_eq!(config.max_text_length, ParserConfig::default().max_text_length);
    }
}
