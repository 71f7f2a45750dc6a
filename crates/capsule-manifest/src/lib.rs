//! # capsule-manifest
//!
//! Schema, serialization, and invariants of a capsule's manifest: the single
//! JSON index that ties together blobs, artifacts, tool-invocation runs, IR
//! extractions, plans, and their recorded results.
//!
//! The manifest is serialized as indented (two-space) JSON. Field order
//! within a struct follows declaration order; map-valued collections use
//! `BTreeMap` so key order is deterministic across processes, satisfying the
//! capsule's determinism requirement (equal manifests hash identically).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use capsule_cas::{hash_to_hex, HashPair};

/// Current manifest schema version.
pub const CAPSULE_VERSION: &str = "1";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("manifest invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Record of a blob's size and secondary hash, keyed by SHA-256 hex in
/// [`Manifest::blobs`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobRecord {
    pub size_bytes: u64,
    pub blake3_hex: String,
}

/// Kind of a logical unit an [`Artifact`] points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    File,
    Dir,
    Ir,
    Other(String),
}

impl ArtifactKind {
    fn as_str(&self) -> &str {
        match self {
            ArtifactKind::File => "file",
            ArtifactKind::Dir => "dir",
            ArtifactKind::Ir => "ir",
            ArtifactKind::Other(s) => s,
        }
    }
}

impl Serialize for ArtifactKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ArtifactKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "file" => ArtifactKind::File,
            "dir" => ArtifactKind::Dir,
            "ir" => ArtifactKind::Ir,
            _ => ArtifactKind::Other(s),
        })
    }
}

/// Both digests recorded for an artifact's primary blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hashes {
    pub sha256: String,
    pub blake3: String,
}

/// A named logical unit within a capsule, pointing at a primary blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub original_filename: Option<String>,
    pub source_path: Option<String>,
    pub size_bytes: u64,
    pub primary_blob_sha256: String,
    pub hashes: Hashes,
    pub detected_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<String>>,
}

/// Severity of information loss during a format conversion step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LossClass {
    L0,
    L1,
    L2,
    L3,
    L4,
}

impl LossClass {
    /// Ordinal level, L0 = 0 .. L4 = 4.
    pub fn level(self) -> u8 {
        match self {
            LossClass::L0 => 0,
            LossClass::L1 => 1,
            LossClass::L2 => 2,
            LossClass::L3 => 3,
            LossClass::L4 => 4,
        }
    }

    /// Parse from a wire string, falling back to `L0` for unknown values
    /// (fail-open for loss-class accounting; see `combine_loss_classes`).
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "L1" => LossClass::L1,
            "L2" => LossClass::L2,
            "L3" => LossClass::L3,
            "L4" => LossClass::L4,
            _ => LossClass::L0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LossClass::L0 => "L0",
            LossClass::L1 => "L1",
            LossClass::L2 => "L2",
            LossClass::L3 => "L3",
            LossClass::L4 => "L4",
        }
    }
}

impl Serialize for LossClass {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LossClass {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(LossClass::parse_lenient(&s))
    }
}

/// A single element of content dropped or altered during a conversion step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LostElement {
    pub path: String,
    pub element_type: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_value: Option<String>,
}

/// Structured account of what a single conversion step lost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LossReport {
    pub source_format: String,
    pub target_format: String,
    pub loss_class: LossClass,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lost_elements: Vec<LostElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Associates an IR artifact with the source artifact it was extracted from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IrExtraction {
    pub id: String,
    pub source_artifact_id: String,
    pub ir_artifact_id: String,
    pub ir_format: String,
    pub ir_version: String,
    pub loss_class: LossClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_report: Option<LossReport>,
}

/// Disposition of a recorded tool [`Run`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// An artifact consumed by a [`Run`], tagged with its role (e.g. `source`,
/// `reference`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunInput {
    pub artifact_id: String,
    pub role: String,
}

/// The command line a [`Run`] was invoked with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunCommand {
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// The outputs a [`Run`] produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_blob_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_blob_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_blob_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_artifact_ids: Vec<String>,
}

/// A recorded invocation of a reference tool, witnessed by a hashed
/// transcript blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    pub id: String,
    pub engine: String,
    pub handler_id: String,
    pub handler_version: String,
    pub inputs: Vec<RunInput>,
    pub command: RunCommand,
    pub outputs: RunOutputs,
    pub status: RunStatus,
}

/// Export mode: exact bytes, or a converted representation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    Identity,
    Derived,
}

/// A persisted export result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportRecord {
    pub id: String,
    pub artifact_id: String,
    pub mode: ExportMode,
    pub dest_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_blob_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loss_reports: Vec<LossReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_loss_class: Option<LossClass>,
}

/// An equality check node in a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckNode {
    ByteEqual { a: String, b: String },
    TranscriptEqual { run_a: String, run_b: String },
}

/// One step of a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStep {
    Export {
        artifact_id: String,
        mode: ExportMode,
        dest_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_format: Option<String>,
    },
    RunTool {
        plugin_id: String,
        input_artifact_ids: Vec<String>,
    },
    Check(CheckNode),
}

/// A declarative, offline-executable sequence of export/tool/check steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: String,
    pub steps: Vec<PlanStep>,
}

/// Outcome of evaluating a single [`CheckNode`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub description: String,
    pub passed: bool,
}

/// The persisted outcome of executing a [`Plan`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelfCheck {
    pub id: String,
    pub plan_id: String,
    pub created_at: String,
    pub passed: bool,
    pub check_results: Vec<CheckResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_blob_sha256: Option<String>,
}

/// The top-level manifest object persisted as `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub capsule_version: String,
    pub created_at: String,
    pub tool_name: String,
    pub tool_version: String,
    /// Blob index keyed by SHA-256 hex.
    pub blobs: BTreeMap<String, BlobRecord>,
    /// BLAKE3 hex → SHA-256 hex, populated alongside every `blobs` entry.
    pub blake3_index: BTreeMap<String, String>,
    pub artifacts: BTreeMap<String, Artifact>,
    pub runs: BTreeMap<String, Run>,
    pub ir_extractions: BTreeMap<String, IrExtraction>,
    pub plans: BTreeMap<String, Plan>,
    pub self_checks: BTreeMap<String, SelfCheck>,
    pub exports: BTreeMap<String, ExportRecord>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Unknown top-level fields, preserved verbatim for forward compatibility.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn new(tool_name: impl Into<String>, tool_version: impl Into<String>) -> Self {
        let created_at = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        Self {
            capsule_version: CAPSULE_VERSION.to_string(),
            created_at,
            tool_name: tool_name.into(),
            tool_version: tool_version.into(),
            blobs: BTreeMap::new(),
            blake3_index: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            runs: BTreeMap::new(),
            ir_extractions: BTreeMap::new(),
            plans: BTreeMap::new(),
            self_checks: BTreeMap::new(),
            exports: BTreeMap::new(),
            attributes: serde_json::Map::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Record a blob's hash pair and size in the index. Idempotent; a
    /// duplicate `store()` of identical bytes merely overwrites with the
    /// same values.
    pub fn record_blob(&mut self, hashes: HashPair, size_bytes: u64) {
        let sha_hex = hash_to_hex(&hashes.sha256);
        let blake3_hex = hash_to_hex(&hashes.blake3);
        self.blake3_index.insert(blake3_hex.clone(), sha_hex.clone());
        self.blobs.insert(
            sha_hex,
            BlobRecord {
                size_bytes,
                blake3_hex,
            },
        );
    }

    /// Sanitize a candidate artifact ID: keep `[A-Za-z0-9._:-]`, substitute
    /// `_` elsewhere, and append `_1`, `_2`, … on collision with an existing
    /// ID in this manifest.
    pub fn sanitize_artifact_id(&self, candidate: &str) -> String {
        let base: String = candidate
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let base = if base.is_empty() {
            "artifact".to_string()
        } else {
            base
        };

        if !self.artifacts.contains_key(&base) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}_{n}");
            if !self.artifacts.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn add_artifact(&mut self, artifact: Artifact) -> Result<()> {
        if !self.blobs.contains_key(&artifact.primary_blob_sha256) {
            return Err(ManifestError::Invariant(format!(
                "artifact {} references unknown blob {}",
                artifact.id, artifact.primary_blob_sha256
            )));
        }
        if artifact.hashes.sha256 != artifact.primary_blob_sha256 {
            return Err(ManifestError::Invariant(format!(
                "artifact {} hashes.sha256 does not match primary_blob_sha256",
                artifact.id
            )));
        }
        self.artifacts.insert(artifact.id.clone(), artifact);
        Ok(())
    }

    pub fn get_artifact(&self, id: &str) -> Result<&Artifact> {
        self.artifacts
            .get(id)
            .ok_or_else(|| ManifestError::ArtifactNotFound(id.to_string()))
    }

    pub fn add_run(&mut self, run: Run) {
        self.runs.insert(run.id.clone(), run);
    }

    pub fn get_run(&self, id: &str) -> Result<&Run> {
        self.runs
            .get(id)
            .ok_or_else(|| ManifestError::RunNotFound(id.to_string()))
    }

    pub fn add_ir_extraction(&mut self, extraction: IrExtraction) -> Result<()> {
        let ir_artifact = self.get_artifact(&extraction.ir_artifact_id)?;
        if ir_artifact.kind != ArtifactKind::Ir {
            return Err(ManifestError::Invariant(format!(
                "ir extraction {} points at artifact {} which is not kind=ir",
                extraction.id, extraction.ir_artifact_id
            )));
        }
        self.ir_extractions.insert(extraction.id.clone(), extraction);
        Ok(())
    }

    pub fn add_plan(&mut self, plan: Plan) {
        self.plans.insert(plan.id.clone(), plan);
    }

    pub fn add_self_check(&mut self, check: SelfCheck) {
        self.self_checks.insert(check.id.clone(), check);
    }

    pub fn add_export(&mut self, export: ExportRecord) {
        self.exports.insert(export.id.clone(), export);
    }

    /// Serialize to indented (two-space) JSON, matching the on-disk schema.
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_one(manifest: &mut Manifest, data: &[u8]) -> String {
        let temp = tempfile::tempdir().unwrap();
        let cas = capsule_cas::CasStore::new(temp.path()).unwrap();
        let hashes = cas.store(data).unwrap();
        manifest.record_blob(hashes, data.len() as u64);
        hash_to_hex(&hashes.sha256)
    }

    #[test]
    fn new_manifest_has_current_version() {
        let manifest = Manifest::new("capsule-test", "0.1.0");
        assert_eq!(manifest.capsule_version, CAPSULE_VERSION);
        assert!(manifest.artifacts.is_empty());
    }

    #[test]
    fn sanitize_artifact_id_replaces_invalid_chars() {
        let manifest = Manifest::new("t", "0");
        assert_eq!(manifest.sanitize_artifact_id("a b/c.txt"), "a_b_c.txt");
    }

    #[test]
    fn sanitize_artifact_id_dedupes_with_suffix() {
        let mut manifest = Manifest::new("t", "0");
        let sha = store_one(&mut manifest, b"content-a");
        manifest
            .add_artifact(Artifact {
                id: "name.txt".to_string(),
                kind: ArtifactKind::File,
                original_filename: Some("name.txt".to_string()),
                source_path: None,
                size_bytes: 9,
                primary_blob_sha256: sha.clone(),
                hashes: Hashes {
                    sha256: sha,
                    blake3: "ignored".to_string(),
                },
                detected_format: None,
                components: None,
            })
            .unwrap();

        assert_eq!(manifest.sanitize_artifact_id("name.txt"), "name.txt_1");
    }

    #[test]
    fn add_artifact_rejects_unknown_blob() {
        let mut manifest = Manifest::new("t", "0");
        let result = manifest.add_artifact(Artifact {
            id: "x".to_string(),
            kind: ArtifactKind::File,
            original_filename: None,
            source_path: None,
            size_bytes: 0,
            primary_blob_sha256: "deadbeef".to_string(),
            hashes: Hashes {
                sha256: "deadbeef".to_string(),
                blake3: "deadbeef".to_string(),
            },
            detected_format: None,
            components: None,
        });
        assert!(matches!(result, Err(ManifestError::Invariant(_))));
    }

    #[test]
    fn json_roundtrip_preserves_unknown_fields() {
        let mut manifest = Manifest::new("t", "0");
        manifest
            .extra
            .insert("future_field".to_string(), serde_json::json!(42));
        let json = manifest.to_json_pretty().unwrap();
        assert!(json.contains("  \"capsule_version\""));
        let parsed = Manifest::from_json_str(&json).unwrap();
        assert_eq!(parsed.extra.get("future_field"), Some(&serde_json::json!(42)));
    }

    #[test]
    fn loss_class_parse_lenient_fails_open() {
        assert_eq!(LossClass::parse_lenient("L3").level(), 3);
        assert_eq!(LossClass::parse_lenient("bogus").level(), 0);
    }

    #[test]
    fn blake3_index_populated_alongside_blobs() {
        let mut manifest = Manifest::new("t", "0");
        let temp = tempfile::tempdir().unwrap();
        let cas = capsule_cas::CasStore::new(temp.path()).unwrap();
        let hashes = cas.store(b"indexed").unwrap();
        manifest.record_blob(hashes, 7);

        let sha_hex = hash_to_hex(&hashes.sha256);
        let blake3_hex = hash_to_hex(&hashes.blake3);
        assert_eq!(manifest.blake3_index.get(&blake3_hex), Some(&sha_hex));
    }
}
