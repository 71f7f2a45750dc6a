//! # capsule-engine
//!
//! The export and conversion engine: turning an ingested artifact back into
//! bytes on disk, either byte-for-byte (`IDENTITY` mode) or through a
//! source→IR→target conversion pipeline (`DERIVED` mode), plus offline
//! execution of declarative [`Plan`]s that check recorded exports and runs
//! against one another.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::instrument;

use capsule_cas::CasError;
use capsule_container::{CapsuleContainer, ContainerError};
use capsule_ir::{Corpus, IrError};
use capsule_manifest::{
    CheckNode, CheckResult, ExportMode, ExportRecord, LossClass, LossReport, LostElement,
    ManifestError, Plan, PlanStep, Run, RunCommand, RunInput, RunOutputs, RunStatus, SelfCheck,
};
use capsule_plugin::{PluginError, PluginRegistry, PluginRequest};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Export an artifact's exact bytes to `dest_path`, recording an
/// [`ExportRecord`] with `mode: Identity`.
#[instrument(skip(capsule), fields(artifact_id = %artifact_id))]
pub fn export(capsule: &mut CapsuleContainer, artifact_id: &str, dest_path: &Path) -> Result<String> {
    let artifact = capsule.manifest.get_artifact(artifact_id)?.clone();
    let sha256 = capsule_cas::hex_to_hash(&artifact.primary_blob_sha256)
        .ok_or_else(|| EngineError::Validation(format!("malformed blob hash on artifact {artifact_id}")))?;

    let cas = capsule_cas::CasStore::new(capsule.root())?;
    let data = cas.retrieve(&sha256)?;
    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest_path, &data)?;

    let export_id = capsule
        .manifest
        .sanitize_artifact_id(&format!("export-{artifact_id}"));
    capsule.manifest.add_export(ExportRecord {
        id: export_id.clone(),
        artifact_id: artifact_id.to_string(),
        mode: ExportMode::Identity,
        dest_path: dest_path.display().to_string(),
        result_blob_sha256: Some(artifact.primary_blob_sha256),
        loss_reports: Vec::new(),
        combined_loss_class: Some(LossClass::L0),
    });

    Ok(export_id)
}

/// Export an artifact through a source→IR→target conversion pipeline,
/// resolving plugins for `source_format` and `target_format` from
/// `registry`. Intermediate bytes are materialized in a scoped temp
/// directory that is cleaned up when this function returns.
#[instrument(skip(capsule, registry), fields(artifact_id = %artifact_id, source_format, target_format))]
pub fn export_derived(
    capsule: &mut CapsuleContainer,
    registry: &PluginRegistry,
    artifact_id: &str,
    source_format: &str,
    target_format: &str,
    dest_path: &Path,
) -> Result<String> {
    let artifact = capsule.manifest.get_artifact(artifact_id)?.clone();
    let sha256 = capsule_cas::hex_to_hash(&artifact.primary_blob_sha256)
        .ok_or_else(|| EngineError::Validation(format!("malformed blob hash on artifact {artifact_id}")))?;
    let cas = capsule_cas::CasStore::new(capsule.root())?;
    let source_bytes = cas.retrieve(&sha256)?;

    let workdir = tempfile::tempdir()?;
    let source_path = workdir.path().join("source.bin");
    fs::write(&source_path, &source_bytes)?;
    let ir_dir = workdir.path().join("ir");
    fs::create_dir_all(&ir_dir)?;
    let emit_dir = workdir.path().join("emit");
    fs::create_dir_all(&emit_dir)?;

    let source_plugin = registry.by_format(source_format).map_err(|e| match e {
        PluginError::NoHandlerForFormat(format) => PluginError::NoSourceHandlerForFormat(format),
        other => other,
    })?;
    let extract_request = PluginRequest::new(
        "extract-ir",
        serde_json::json!({
            "path": source_path.display().to_string(),
            "output_dir": ir_dir.display().to_string(),
        }),
    );
    let extract_response = capsule_plugin::invoke(source_plugin, &extract_request, capsule_plugin::DEFAULT_TIMEOUT)?;
    let extract_result: capsule_plugin::ExtractIRResult = extract_response.into_result(source_plugin.id())?;

    let ir_json = fs::read_to_string(&extract_result.ir_path)?;
    let corpus = Corpus::from_json_str(&ir_json)?;

    let target_plugin = registry.by_format(target_format)?;
    let emit_request = PluginRequest::new(
        "emit-native",
        serde_json::json!({
            "ir_path": extract_result.ir_path,
            "output_dir": emit_dir.display().to_string(),
        }),
    );
    let emit_response = capsule_plugin::invoke(target_plugin, &emit_request, capsule_plugin::DEFAULT_TIMEOUT)?;
    let emit_result: capsule_plugin::EmitNativeResult = emit_response.into_result(target_plugin.id())?;

    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let emitted_bytes = fs::read(&emit_result.output_path)?;
    fs::write(dest_path, &emitted_bytes)?;

    let extract_report = extract_result.loss_report.unwrap_or_else(|| LossReport {
        source_format: source_format.to_string(),
        target_format: corpus.ir_format.clone(),
        loss_class: extract_result.loss_class,
        lost_elements: Vec::new(),
        warnings: Vec::new(),
    });
    let emit_report = emit_result.loss_report.unwrap_or_else(|| LossReport {
        source_format: corpus.ir_format.clone(),
        target_format: target_format.to_string(),
        loss_class: emit_result.loss_class,
        lost_elements: Vec::new(),
        warnings: Vec::new(),
    });
    let combined = combined_loss_report(source_format, target_format, &extract_report, &emit_report);

    let result_hashes = cas.store(&emitted_bytes)?;
    capsule
        .manifest
        .record_blob(result_hashes, emitted_bytes.len() as u64);

    let export_id = capsule
        .manifest
        .sanitize_artifact_id(&format!("export-{artifact_id}"));
    capsule.manifest.add_export(ExportRecord {
        id: export_id.clone(),
        artifact_id: artifact_id.to_string(),
        mode: ExportMode::Derived,
        dest_path: dest_path.display().to_string(),
        result_blob_sha256: Some(capsule_cas::hash_to_hex(&result_hashes.sha256)),
        loss_reports: vec![extract_report, emit_report],
        combined_loss_class: Some(combined.loss_class),
    });

    Ok(export_id)
}

/// Combine two conversion steps' loss classes, taking the worse (higher
/// ordinal) of the two. Unknown classes already fail open to `L0` at
/// [`LossClass::parse_lenient`], so this never needs its own fallback.
pub fn combine_loss_classes(a: LossClass, b: LossClass) -> LossClass {
    if a.level() >= b.level() {
        a
    } else {
        b
    }
}

/// Merge two steps' loss reports into a single report describing the whole
/// `source_format -> target_format` pipeline.
pub fn combined_loss_report(
    source_format: &str,
    target_format: &str,
    a: &LossReport,
    b: &LossReport,
) -> LossReport {
    let mut lost_elements: Vec<LostElement> = Vec::with_capacity(a.lost_elements.len() + b.lost_elements.len());
    lost_elements.extend(a.lost_elements.iter().cloned());
    lost_elements.extend(b.lost_elements.iter().cloned());

    let mut warnings: Vec<String> = Vec::with_capacity(a.warnings.len() + b.warnings.len());
    warnings.extend(a.warnings.iter().cloned());
    warnings.extend(b.warnings.iter().cloned());

    LossReport {
        source_format: source_format.to_string(),
        target_format: target_format.to_string(),
        loss_class: combine_loss_classes(a.loss_class, b.loss_class),
        lost_elements,
        warnings,
    }
}

/// Invoke a tool-kind plugin against a set of input artifacts, capture its
/// transcript as a blob, and record the resulting [`Run`] in the manifest.
/// Returns the new run's ID.
fn run_tool(
    capsule: &mut CapsuleContainer,
    registry: &PluginRegistry,
    plugin_id: &str,
    input_artifact_ids: &[String],
) -> Result<String> {
    let plugin = registry.by_id(plugin_id)?;
    let cas = capsule_cas::CasStore::new(capsule.root())?;

    let workdir = tempfile::tempdir()?;
    let mut input_paths = Vec::with_capacity(input_artifact_ids.len());
    for artifact_id in input_artifact_ids {
        let artifact = capsule.manifest.get_artifact(artifact_id)?.clone();
        let sha256 = capsule_cas::hex_to_hash(&artifact.primary_blob_sha256)
            .ok_or_else(|| EngineError::Validation(format!("malformed blob hash on artifact {artifact_id}")))?;
        let data = cas.retrieve(&sha256)?;
        let input_path = workdir.path().join(artifact_id.replace(['/', '\\'], "_"));
        fs::write(&input_path, &data)?;
        input_paths.push(input_path.display().to_string());
    }
    let output_dir = workdir.path().join("run-output");
    fs::create_dir_all(&output_dir)?;

    let request = PluginRequest::new(
        "run",
        serde_json::json!({
            "input_paths": input_paths,
            "output_dir": output_dir.display().to_string(),
        }),
    );
    let response = capsule_plugin::invoke(plugin, &request, capsule_plugin::DEFAULT_TIMEOUT)?;
    let result: capsule_plugin::RunResult = response.into_result(plugin.id())?;

    let transcript_bytes = fs::read(&result.transcript_path)?;
    let transcript_hashes = cas.store(&transcript_bytes)?;
    capsule
        .manifest
        .record_blob(transcript_hashes, transcript_bytes.len() as u64);
    let transcript_sha256 = Some(capsule_cas::hash_to_hex(&transcript_hashes.sha256));

    let mut store_optional_blob = |path: &Option<String>| -> Result<Option<String>> {
        match path {
            Some(p) => {
                let bytes = fs::read(p)?;
                let hashes = cas.store(&bytes)?;
                capsule.manifest.record_blob(hashes, bytes.len() as u64);
                Ok(Some(capsule_cas::hash_to_hex(&hashes.sha256)))
            }
            None => Ok(None),
        }
    };
    let stdout_blob_sha256 = store_optional_blob(&result.stdout_path)?;
    let stderr_blob_sha256 = store_optional_blob(&result.stderr_path)?;

    let status = if result.status == "success" {
        RunStatus::Success
    } else {
        RunStatus::Failed
    };

    let run_id = capsule
        .manifest
        .sanitize_artifact_id(&format!("run-{plugin_id}"));
    let run = Run {
        id: run_id.clone(),
        engine: "capsule-engine".to_string(),
        handler_id: plugin_id.to_string(),
        handler_version: plugin.info().version.clone(),
        inputs: input_artifact_ids
            .iter()
            .map(|id| RunInput {
                artifact_id: id.clone(),
                role: "input".to_string(),
            })
            .collect(),
        command: RunCommand::default(),
        outputs: RunOutputs {
            transcript_blob_sha256: transcript_sha256,
            stdout_blob_sha256,
            stderr_blob_sha256,
            output_artifact_ids: result.output_artifact_ids,
        },
        status,
    };
    capsule.manifest.add_run(run);

    Ok(run_id)
}

/// Evaluate a single [`CheckNode`] against the capsule's recorded state.
fn evaluate_check(capsule: &CapsuleContainer, node: &CheckNode) -> Result<CheckResult> {
    match node {
        CheckNode::ByteEqual { a, b } => {
            let artifact_a = capsule.manifest.get_artifact(a)?;
            let artifact_b = capsule.manifest.get_artifact(b)?;
            let passed = artifact_a.primary_blob_sha256 == artifact_b.primary_blob_sha256;
            Ok(CheckResult {
                description: format!("byte_equal({a}, {b})"),
                passed,
            })
        }
        CheckNode::TranscriptEqual { run_a, run_b } => {
            let a = capsule.manifest.get_run(run_a)?;
            let b = capsule.manifest.get_run(run_b)?;
            let passed = a.outputs.transcript_blob_sha256.is_some()
                && a.outputs.transcript_blob_sha256 == b.outputs.transcript_blob_sha256;
            Ok(CheckResult {
                description: format!("transcript_equal({run_a}, {run_b})"),
                passed,
            })
        }
    }
}

/// Execute every step of a [`Plan`] in order: `Export` steps perform an
/// IDENTITY or DERIVED export, `RunTool` steps invoke the named plugin and
/// record a `Run`, and `Check` steps evaluate `ByteEqual`/`TranscriptEqual`
/// against whatever artifacts and runs exist by that point (including ones
/// produced earlier in the same plan). Returns a [`SelfCheck`] that is also
/// added to the capsule's manifest. A failing check does not abort later
/// steps; it only marks the overall self-check failed.
#[instrument(skip(capsule, registry, plan), fields(plan_id = %plan.id))]
pub fn run_plan(capsule: &mut CapsuleContainer, registry: &PluginRegistry, plan: &Plan) -> Result<SelfCheck> {
    let mut check_results = Vec::new();

    for step in &plan.steps {
        match step {
            PlanStep::Export {
                artifact_id,
                mode,
                dest_path,
                target_format,
            } => {
                let dest = Path::new(dest_path);
                match mode {
                    ExportMode::Identity => {
                        export(capsule, artifact_id, dest)?;
                    }
                    ExportMode::Derived => {
                        let artifact = capsule.manifest.get_artifact(artifact_id)?.clone();
                        let source_format = artifact
                            .detected_format
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string());
                        let target_format = target_format.clone().ok_or_else(|| {
                            EngineError::Validation(format!(
                                "plan {} step exporting {artifact_id} in derived mode needs a target_format",
                                plan.id
                            ))
                        })?;
                        export_derived(capsule, registry, artifact_id, &source_format, &target_format, dest)?;
                    }
                }
            }
            PlanStep::RunTool {
                plugin_id,
                input_artifact_ids,
            } => {
                run_tool(capsule, registry, plugin_id, input_artifact_ids)?;
            }
            PlanStep::Check(node) => {
                check_results.push(evaluate_check(capsule, node)?);
            }
        }
    }

    let passed = check_results.iter().all(|c| c.passed);
    let created_at = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());

    let self_check = SelfCheck {
        id: capsule.manifest.sanitize_artifact_id(&format!("selfcheck-{}", plan.id)),
        plan_id: plan.id.clone(),
        created_at,
        passed,
        check_results,
        result_blob_sha256: None,
    };
    capsule.manifest.add_self_check(self_check.clone());
    Ok(self_check)
}
