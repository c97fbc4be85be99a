//! Content codecs.
//!
//! The store never looks inside a snapshot. A [`ContentCodec`] turns the
//! editor's document into the opaque bytes that get versioned, and projects
//! it to and from the plain-text mirror file.

use crate::error::{Result, StoreError};
use serde_json::{json, Value};

/// Converts between the editor's document model and stored bytes.
pub trait ContentCodec: Send + Sync + 'static {
    /// The editor-side document.
    type Document: Clone + Send + 'static;

    /// Serialize a document into a snapshot payload.
    fn encode(&self, document: &Self::Document) -> Result<Vec<u8>>;

    /// Deserialize a snapshot payload.
    fn decode(&self, blob: &[u8]) -> Result<Self::Document>;

    /// Render the document as mirror-file text.
    fn to_mirror_text(&self, document: &Self::Document) -> Result<String>;

    /// Build a document from mirror-file text.
    fn from_mirror_text(&self, text: &str) -> Result<Self::Document>;

    /// The document a branch with no snapshot loads as.
    fn empty_document(&self) -> Self::Document;
}

/// Documents are plain UTF-8 strings; the mirror is the text itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainTextCodec;

impl ContentCodec for PlainTextCodec {
    type Document = String;

    fn encode(&self, document: &String) -> Result<Vec<u8>> {
        Ok(document.as_bytes().to_vec())
    }

    fn decode(&self, blob: &[u8]) -> Result<String> {
        String::from_utf8(blob.to_vec()).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn to_mirror_text(&self, document: &String) -> Result<String> {
        Ok(document.clone())
    }

    fn from_mirror_text(&self, text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    fn empty_document(&self) -> String {
        String::new()
    }
}

/// Rich-text trees in the usual `{"type": ..., "content": [...]}` JSON
/// shape, mirrored as one line per block.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonTreeCodec;

impl JsonTreeCodec {
    fn extract_text(node: &Value) -> String {
        if let Some(text) = node.get("text").and_then(Value::as_str) {
            return text.to_string();
        }
        match node.get("content").and_then(Value::as_array) {
            Some(children) => children
                .iter()
                .map(Self::extract_text)
                .collect::<Vec<_>>()
                .join("\n"),
            None => String::new(),
        }
    }

    fn paragraph(line: &str) -> Value {
        if line.is_empty() {
            json!({ "type": "paragraph", "content": [] })
        } else {
            json!({
                "type": "paragraph",
                "content": [{ "type": "text", "text": line }]
            })
        }
    }
}

impl ContentCodec for JsonTreeCodec {
    type Document = Value;

    fn encode(&self, document: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(document).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn decode(&self, blob: &[u8]) -> Result<Value> {
        serde_json::from_slice(blob).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn to_mirror_text(&self, document: &Value) -> Result<String> {
        Ok(Self::extract_text(document))
    }

    fn from_mirror_text(&self, text: &str) -> Result<Value> {
        let blocks: Vec<Value> = if text.is_empty() {
            vec![Self::paragraph("")]
        } else {
            text.split('\n').map(Self::paragraph).collect()
        };
        Ok(json!({ "type": "doc", "content": blocks }))
    }

    fn empty_document(&self) -> Value {
        json!({ "type": "doc", "content": [Self::paragraph("")] })
    }
}
