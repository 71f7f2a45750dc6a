//! # capsule-ir
//!
//! The intermediate representation (IR) that export handlers convert a
//! Bible module through on the way between source and target formats: a
//! [`Corpus`] of [`Document`]s (books), each made of [`ContentBlock`]s
//! (verses or verse groups) carrying [`Anchor`] cross-references back to
//! book/chapter/verse.
//!
//! Every structured type carries a free-form attribute bag
//! (`BTreeMap<String, serde_json::Value>`) for handler-specific state that
//! doesn't fit the common model. Keys starting with `_` are reserved for a
//! handler's own round-trip bookkeeping (e.g. `_osis_raw` holding a verbatim
//! fragment a handler couldn't losslessly model) and are never interpreted
//! by generic IR consumers. Serialization omits empty collections so a
//! minimal document round-trips to minimal JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use capsule_manifest::LossClass;

#[derive(Error, Debug)]
pub enum IrError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("invalid attribute key {0:?}: reserved keys may only be set via set_reserved_attribute")]
    ReservedKey(String),
}

pub type Result<T> = std::result::Result<T, IrError>;

type Attributes = BTreeMap<String, serde_json::Value>;

/// True if `key` is one of the `_`-prefixed keys reserved for a handler's
/// own round-trip state.
pub fn is_reserved_attribute_key(key: &str) -> bool {
    key.starts_with('_')
}

/// The kind of module a [`Corpus`] represents.
#[derive(Debug, Clone)]
pub enum ModuleType {
    Bible,
    Commentary,
    Dictionary,
    Maps,
    Other(String),
}

impl PartialEq for ModuleType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ModuleType::Bible, ModuleType::Bible) => true,
            (ModuleType::Commentary, ModuleType::Commentary) => true,
            (ModuleType::Dictionary, ModuleType::Dictionary) => true,
            (ModuleType::Maps, ModuleType::Maps) => true,
            (ModuleType::Other(a), ModuleType::Other(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for ModuleType {}

impl Serialize for ModuleType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let s = match self {
            ModuleType::Bible => "bible",
            ModuleType::Commentary => "commentary",
            ModuleType::Dictionary => "dictionary",
            ModuleType::Maps => "maps",
            ModuleType::Other(s) => s,
        };
        serializer.serialize_str(s)
    }
}

impl<'de> Deserialize<'de> for ModuleType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "bible" => ModuleType::Bible,
            "commentary" => ModuleType::Commentary,
            "dictionary" => ModuleType::Dictionary,
            "maps" => ModuleType::Maps,
            other => ModuleType::Other(other.to_string()),
        })
    }
}

/// A book/chapter/verse reference plus the OSIS-style ID it corresponds to
/// (e.g. `"Gen.1.1"`, or a range like `"Jhn.3.16-Jhn.3.17"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerseRef {
    pub book: String,
    pub chapter: u32,
    pub verse: u32,
    pub osis_id: String,
}

/// A span of a block's text associated with a single verse reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    #[serde(rename = "ref")]
    pub verse_ref: VerseRef,
}

/// A cross-reference point within a block, carrying the verse-tagged spans
/// of text it covers (footnote targets, cross-references, parallel
/// passages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: String,
    pub spans: Vec<Span>,
}

/// A single verse or verse group within a [`Document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: String,
    pub sequence_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchors: Option<Vec<Anchor>>,
    pub self_hash: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

impl ContentBlock {
    /// Build a block, computing `self_hash` over `text` at construction
    /// time.
    pub fn new(id: impl Into<String>, sequence_number: u32, text: Option<String>) -> Self {
        let self_hash = text_hash(text.as_deref());
        Self {
            id: id.into(),
            sequence_number,
            text,
            tokens: None,
            anchors: None,
            self_hash,
            attributes: BTreeMap::new(),
        }
    }

    /// Set `text` and recompute `self_hash` to match.
    pub fn set_text(&mut self, text: Option<String>) {
        self.self_hash = text_hash(text.as_deref());
        self.text = text;
    }

    /// True if `self_hash` still matches the canonical hash of `text`;
    /// false if the block was deserialized with a stale or tampered hash.
    pub fn self_hash_is_valid(&self) -> bool {
        self.self_hash == text_hash(self.text.as_deref())
    }

    /// Set a reserved (`_`-prefixed) attribute holding handler-private
    /// round-trip state.
    pub fn set_reserved_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let key = key.into();
        if !is_reserved_attribute_key(&key) {
            return Err(IrError::ReservedKey(key));
        }
        self.attributes.insert(key, value);
        Ok(())
    }

    /// Set a regular (non-reserved) attribute.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        let key = key.into();
        if is_reserved_attribute_key(&key) {
            return Err(IrError::ReservedKey(key));
        }
        self.attributes.insert(key, value);
        Ok(())
    }
}

/// Canonical self-hash over a block's text: SHA-256 of the UTF-8 bytes, or
/// of the empty string when `text` is absent.
fn text_hash(text: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

/// A single book within a [`Corpus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub order: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

impl Document {
    pub fn new(id: impl Into<String>, order: u32) -> Self {
        Self {
            id: id.into(),
            title: None,
            order,
            blocks: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn get_block(&self, id: &str) -> Result<&ContentBlock> {
        self.blocks
            .iter()
            .find(|b| b.id == id)
            .ok_or_else(|| IrError::BlockNotFound(id.to_string()))
    }
}

/// The root IR container extracted from a source Bible module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Corpus {
    pub id: String,
    pub ir_format: String,
    pub ir_version: String,
    pub module_type: ModuleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rights: Option<String>,
    pub source_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_class: Option<LossClass>,
    pub source_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<Document>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

impl Corpus {
    pub fn new(
        id: impl Into<String>,
        ir_format: impl Into<String>,
        ir_version: impl Into<String>,
        module_type: ModuleType,
        source_format: impl Into<String>,
        source_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ir_format: ir_format.into(),
            ir_version: ir_version.into(),
            module_type,
            versification: None,
            language: None,
            title: None,
            description: None,
            publisher: None,
            rights: None,
            source_format: source_format.into(),
            loss_class: None,
            source_hash: source_hash.into(),
            documents: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Serialize to indented (two-space) JSON, the on-disk form of an IR
    /// artifact's blob.
    pub fn to_json_pretty(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        serde::Serialize::serialize(self, &mut ser)?;
        Ok(String::from_utf8(buf).expect("serde_json always emits valid utf-8"))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn get_document(&self, id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_verse_ref(osis_id: &str, chapter: u32, verse: u32) -> VerseRef {
        VerseRef {
            book: "Gen".to_string(),
            chapter,
            verse,
            osis_id: osis_id.to_string(),
        }
    }

    #[test]
    fn minimal_document_serializes_without_empty_collections() {
        let doc = Document::new("Gen", 1);
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("blocks"));
        assert!(!json.contains("attributes"));
        assert!(!json.contains("title"));
        assert!(json.contains("\"order\":1"));
    }

    #[test]
    fn reserved_attribute_rejected_via_set_attribute() {
        let mut block = ContentBlock::new("Gen.1.1", 1, Some("In the beginning".to_string()));
        let result = block.set_attribute("_osis_raw", serde_json::json!("x"));
        assert!(matches!(result, Err(IrError::ReservedKey(_))));
        assert!(block.set_reserved_attribute("_osis_raw", serde_json::json!("x")).is_ok());
    }

    #[test]
    fn self_hash_is_stable_for_equal_text() {
        let a = ContentBlock::new("Gen.1.1", 1, Some("hello".to_string()));
        let b = ContentBlock::new("Gen.1.1", 1, Some("hello".to_string()));
        assert_eq!(a.self_hash, b.self_hash);
    }

    #[test]
    fn self_hash_differs_for_different_text() {
        let a = ContentBlock::new("Gen.1.1", 1, Some("hello".to_string()));
        let b = ContentBlock::new("Gen.1.1", 1, Some("goodbye".to_string()));
        assert_ne!(a.self_hash, b.self_hash);
    }

    #[test]
    fn set_text_recomputes_self_hash() {
        let mut block = ContentBlock::new("Gen.1.1", 1, Some("hello".to_string()));
        let original_hash = block.self_hash.clone();
        block.set_text(Some("goodbye".to_string()));
        assert_ne!(block.self_hash, original_hash);
        assert!(block.self_hash_is_valid());
    }

    #[test]
    fn tampered_self_hash_fails_validation() {
        let mut block = ContentBlock::new("Gen.1.1", 1, Some("hello".to_string()));
        block.self_hash = "0".repeat(64);
        assert!(!block.self_hash_is_valid());
    }

    #[test]
    fn corpus_json_roundtrip() {
        let mut corpus = Corpus::new(
            "c1",
            "capsule-bible-ir",
            "1",
            ModuleType::Bible,
            "osis",
            "a".repeat(64),
        );
        corpus.language = Some("eng".to_string());
        corpus.versification = Some("KJV".to_string());
        let mut doc = Document::new("Gen", 1);
        let mut block = ContentBlock::new("Gen.1.1", 1, Some("In the beginning".to_string()));
        block.anchors = Some(vec![Anchor {
            id: "anchor-1".to_string(),
            spans: vec![Span {
                start: 0,
                end: 17,
                verse_ref: sample_verse_ref("Gen.1.1", 1, 1),
            }],
        }]);
        doc.blocks.push(block);
        corpus.documents.push(doc);

        let json = corpus.to_json_pretty().unwrap();
        let parsed = Corpus::from_json_str(&json).unwrap();
        assert_eq!(parsed.documents.len(), 1);
        assert_eq!(parsed.module_type, ModuleType::Bible);
        assert_eq!(
            parsed.documents[0].get_block("Gen.1.1").unwrap().text.as_deref(),
            Some("In the beginning")
        );
        assert_eq!(
            parsed.documents[0].get_block("Gen.1.1").unwrap().anchors.as_ref().unwrap()[0]
                .spans[0]
                .verse_ref
                .osis_id,
            "Gen.1.1"
        );
    }

    #[test]
    fn get_block_reports_missing_block() {
        let doc = Document::new("Gen", 1);
        assert!(matches!(doc.get_block("missing"), Err(IrError::BlockNotFound(_))));
    }

    #[test]
    fn module_type_other_roundtrips_its_name() {
        let json = serde_json::to_string(&ModuleType::Other("glossary".to_string())).unwrap();
        assert_eq!(json, "\"glossary\"");
        let parsed: ModuleType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ModuleType::Other("glossary".to_string()));
    }
}
