//! # capsule-plugin
//!
//! The plugin host protocol: a JSON-over-stdio request/response contract
//! between the export engine and out-of-process format handlers, plus a
//! registry for discovering and looking up installed plugins.
//!
//! A plugin is any executable that reads a single [`PluginRequest`] as a
//! line of JSON on stdin and writes a single [`PluginResponse`] as a line of
//! JSON on stdout, then exits. Plugins are invoked one request at a time;
//! there is no persistent session.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capsule_manifest::{LossClass, LossReport};

/// Default time a plugin invocation is allowed to run before being killed.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plugin not found for id {0:?}")]
    NotFound(String),

    #[error("no plugin registered for format {0:?}")]
    NoHandlerForFormat(String),

    #[error("no source plugin registered for format {0:?}")]
    NoSourceHandlerForFormat(String),

    #[error("plugin {plugin_id} exceeded its {timeout:?} timeout and was killed")]
    Timeout {
        plugin_id: String,
        timeout: Duration,
    },

    #[error("plugin {plugin_id} returned an error: {message}")]
    PluginReportedError { plugin_id: String, message: String },

    #[error("plugin {plugin_id} produced malformed output: {reason}")]
    MalformedOutput { plugin_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// A request sent to a plugin on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    pub command: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl PluginRequest {
    pub fn new(command: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

/// A response read from a plugin's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Deserialize `result` into `T`, or surface the plugin's reported error.
    pub fn into_result<T: for<'de> Deserialize<'de>>(self, plugin_id: &str) -> Result<T> {
        if !self.is_ok() {
            return Err(PluginError::PluginReportedError {
                plugin_id: plugin_id.to_string(),
                message: self.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        let value = self.result.ok_or_else(|| PluginError::MalformedOutput {
            plugin_id: plugin_id.to_string(),
            reason: "status ok but result missing".to_string(),
        })?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Result of a `detect` command: does this plugin recognize the given bytes,
/// and as what format? An empty file always detects as `{detected: true,
/// reason: "empty"}` regardless of plugin, independent of format-specific
/// sniffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResult {
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DetectResult {
    pub fn empty_file() -> Self {
        Self {
            detected: true,
            format: None,
            reason: Some("empty".to_string()),
        }
    }
}

/// Result of an `ingest` command: the artifact a plugin produced from a
/// source path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub artifact_id: String,
    pub blob_sha256: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One entry in an [`EnumerateResult`]: a path discovered inside a source
/// artifact (e.g. an archive or directory), with its size and kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumerateEntry {
    pub path: String,
    pub size_bytes: u64,
    pub is_dir: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Result of an `enumerate` command: the members of a container-kind
/// artifact, without ingesting any of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumerateResult {
    pub entries: Vec<EnumerateEntry>,
}

/// Result of an `extract-ir` command: `ir_path` names a file the host should
/// read and parse as a [`capsule_ir`]-shaped `Corpus`, which is itself
/// self-describing (it carries its own `ir_format`/`ir_version`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractIRResult {
    pub ir_path: String,
    pub loss_class: LossClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_report: Option<LossReport>,
}

/// Result of an `emit-native` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitNativeResult {
    pub output_path: String,
    pub format: String,
    pub loss_class: LossClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_report: Option<LossReport>,
}

/// Result of a `run` command: invocation of a tool-kind plugin against a set
/// of input artifacts, outside the format-conversion pipeline. `transcript_path`
/// names a newline-delimited JSON file the host reads and stores as the
/// recorded `Run`'s transcript blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub transcript_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_artifact_ids: Vec<String>,
    pub status: String,
}

/// Whether a plugin converts formats or runs a reference tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Format,
    Tool,
}

/// Static description of an installed plugin, read from its `plugin.json`.
/// `entrypoint` is an executable path, resolved relative to the plugin's
/// directory at discovery time. Unused (and meaningless) for an
/// [`Handler::Internal`] registration, where it's left empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(rename = "plugin_id")]
    pub id: String,
    pub version: String,
    pub kind: PluginKind,
    #[serde(default)]
    pub entrypoint: String,
}

/// A Rust function implementing a plugin's command dispatch in-process, used
/// by [`Handler::Internal`] instead of a subprocess round trip.
pub type InternalHandlerFn = fn(&PluginRequest) -> Result<PluginResponse>;

/// A registered plugin: either an external executable invoked over stdio, or
/// a Rust function dispatched in-process without spawning anything. The
/// in-process path is the fast path for handlers built into the host binary.
#[derive(Clone)]
pub enum Handler {
    External(PluginInfo),
    Internal {
        info: PluginInfo,
        handler: InternalHandlerFn,
    },
}

impl Handler {
    pub fn info(&self) -> &PluginInfo {
        match self {
            Handler::External(info) => info,
            Handler::Internal { info, .. } => info,
        }
    }

    pub fn id(&self) -> &str {
        &self.info().id
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::External(info) => f.debug_tuple("External").field(info).finish(),
            Handler::Internal { info, .. } => f.debug_struct("Internal").field("info", info).finish(),
        }
    }
}

/// In-memory registry of known plugins, keyed by ID and by format.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    by_id: HashMap<String, Handler>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    /// Register an external (subprocess) plugin, e.g. one read from a
    /// `plugin.json` that wasn't picked up by [`discover`](Self::discover).
    pub fn register(&mut self, info: PluginInfo) {
        self.by_id.insert(info.id.clone(), Handler::External(info));
    }

    /// Register an in-process handler: `handler` is called directly rather
    /// than spawned, the fast path for formats or tools built into the host.
    pub fn register_internal(&mut self, info: PluginInfo, handler: InternalHandlerFn) {
        self.by_id.insert(info.id.clone(), Handler::Internal { info, handler });
    }

    /// Scan `root` for one level of subdirectories containing a
    /// `plugin.json`, registering each one found as an external plugin.
    pub fn discover(&mut self, root: &Path) -> Result<usize> {
        if !root.exists() {
            return Ok(0);
        }
        let mut found = 0;
        let mut entries: Vec<_> = fs::read_dir(root)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let manifest_path = entry.path().join("plugin.json");
            if manifest_path.is_file() {
                let contents = fs::read_to_string(&manifest_path)?;
                let mut info: PluginInfo = serde_json::from_str(&contents)?;
                info.entrypoint = entry.path().join(&info.entrypoint).display().to_string();
                self.register(info);
                found += 1;
            }
        }
        Ok(found)
    }

    pub fn by_id(&self, id: &str) -> Result<&Handler> {
        self.by_id.get(id).ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Look up a handler for `format`, preferring a plugin registered as
    /// `format-<format>` over one registered under `<format>` bare.
    pub fn by_format(&self, format: &str) -> Result<&Handler> {
        let prefixed = format!("format-{format}");
        if let Some(handler) = self.by_id.get(&prefixed) {
            return Ok(handler);
        }
        self.by_id
            .get(format)
            .ok_or_else(|| PluginError::NoHandlerForFormat(format.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Invoke a plugin with `request`. [`Handler::Internal`] handlers are called
/// directly, with no process spawned and no timeout applied. External
/// handlers are run as a subprocess, with `timeout` enforced via a watcher
/// thread that kills the child if it hasn't exited in time.
pub fn invoke(handler: &Handler, request: &PluginRequest, timeout: Duration) -> Result<PluginResponse> {
    match handler {
        Handler::Internal { info, handler } => {
            tracing::debug!(plugin = %info.id, command = %request.command, "invoking in-process plugin");
            handler(request)
        }
        Handler::External(info) => invoke_external(info, request, timeout),
    }
}

/// Invoke an external plugin subprocess with `request`, enforcing `timeout`
/// via a watcher thread that kills the child if it hasn't exited in time.
fn invoke_external(info: &PluginInfo, request: &PluginRequest, timeout: Duration) -> Result<PluginResponse> {
    tracing::debug!(plugin = %info.id, command = %request.command, "invoking plugin");

    let mut child = Command::new(&info.entrypoint)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let payload = serde_json::to_vec(request)?;
    stdin.write_all(&payload)?;
    stdin.write_all(b"\n")?;
    drop(stdin);

    let child = Arc::new(Mutex::new(child));
    let timed_out = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let watcher = {
        let child = Arc::clone(&child);
        let timed_out = Arc::clone(&timed_out);
        thread::spawn(move || {
            if done_rx.recv_timeout(timeout).is_err() {
                timed_out.store(true, Ordering::SeqCst);
                if let Ok(mut guard) = child.lock() {
                    let _ = guard.kill();
                }
            }
        })
    };

    let mut stdout_buf = Vec::new();
    let read_result = stdout.read_to_end(&mut stdout_buf);
    let mut stderr_buf = Vec::new();
    let _ = stderr.read_to_end(&mut stderr_buf);

    let wait_result = child.lock().expect("child mutex poisoned").wait();
    let _ = done_tx.send(());
    let _ = watcher.join();

    if timed_out.load(Ordering::SeqCst) {
        return Err(PluginError::Timeout {
            plugin_id: info.id.clone(),
            timeout,
        });
    }

    read_result?;
    wait_result?;

    serde_json::from_slice(&stdout_buf).map_err(|e| PluginError::MalformedOutput {
        plugin_id: info.id.clone(),
        reason: format!("{e}: stderr was {:?}", String::from_utf8_lossy(&stderr_buf)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn echo_plugin_script(dir: &Path) -> PathBuf {
        let script_path = dir.join("echo_plugin.sh");
        let mut file = fs::File::create(&script_path).unwrap();
        writeln!(
            file,
            "#!/bin/sh\nread line\necho '{{\"status\":\"ok\",\"result\":{{\"echoed\":true}}}}'"
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    fn test_plugin_info(id: &str, kind: PluginKind, entrypoint: String) -> PluginInfo {
        PluginInfo {
            id: id.to_string(),
            version: "0.1.0".to_string(),
            kind,
            entrypoint,
        }
    }

    #[test]
    #[cfg(unix)]
    fn invoke_roundtrips_through_stdio() {
        let temp = TempDir::new().unwrap();
        let script = echo_plugin_script(temp.path());
        let info = test_plugin_info("echo", PluginKind::Tool, script.display().to_string());
        let request = PluginRequest::new("detect", serde_json::json!({}));
        let response = invoke(&Handler::External(info), &request, Duration::from_secs(5)).unwrap();
        assert!(response.is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn invoke_times_out_on_slow_plugin() {
        let temp = TempDir::new().unwrap();
        let script_path = temp.path().join("sleeper.sh");
        fs::write(&script_path, "#!/bin/sh\nsleep 5\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        let info = test_plugin_info("sleeper", PluginKind::Tool, script_path.display().to_string());
        let request = PluginRequest::new("detect", serde_json::json!({}));
        let result = invoke(&Handler::External(info), &request, Duration::from_millis(50));
        assert!(matches!(result, Err(PluginError::Timeout { .. })));
    }

    #[test]
    fn invoke_dispatches_internal_handler_without_spawning() {
        fn handler(request: &PluginRequest) -> Result<PluginResponse> {
            assert_eq!(request.command, "detect");
            Ok(PluginResponse {
                status: "ok".to_string(),
                result: Some(serde_json::json!({"detected": true})),
                error: None,
            })
        }

        let info = test_plugin_info("format-builtin", PluginKind::Format, String::new());
        let mut registry = PluginRegistry::new();
        registry.register_internal(info, handler);

        let resolved = registry.by_id("format-builtin").unwrap();
        let request = PluginRequest::new("detect", serde_json::json!({}));
        let response = invoke(resolved, &request, Duration::from_secs(5)).unwrap();
        assert!(response.is_ok());
    }

    #[test]
    fn registry_discovers_plugins_with_manifest() {
        let temp = TempDir::new().unwrap();
        let plugin_dir = temp.path().join("format-markdown");
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(plugin_dir.join("markdown-plugin"), "").unwrap();
        fs::write(
            plugin_dir.join("plugin.json"),
            serde_json::json!({
                "plugin_id": "format-markdown",
                "version": "1.0.0",
                "kind": "format",
                "entrypoint": "markdown-plugin"
            })
            .to_string(),
        )
        .unwrap();

        let mut registry = PluginRegistry::new();
        let found = registry.discover(temp.path()).unwrap();
        assert_eq!(found, 1);
        let handler = registry.by_id("format-markdown").unwrap();
        assert_eq!(handler.id(), "format-markdown");
        assert_eq!(
            handler.info().entrypoint,
            plugin_dir.join("markdown-plugin").display().to_string()
        );
    }

    #[test]
    fn by_format_prefers_format_prefixed_id() {
        let mut registry = PluginRegistry::new();
        registry.register(test_plugin_info(
            "markdown",
            PluginKind::Format,
            "generic-markdown".to_string(),
        ));
        registry.register(test_plugin_info(
            "format-markdown",
            PluginKind::Format,
            "dedicated-markdown".to_string(),
        ));

        let resolved = registry.by_format("markdown").unwrap();
        assert_eq!(resolved.id(), "format-markdown");
    }

    #[test]
    fn by_format_falls_back_to_bare_id() {
        let mut registry = PluginRegistry::new();
        registry.register(test_plugin_info(
            "markdown",
            PluginKind::Format,
            "generic-markdown".to_string(),
        ));
        assert_eq!(registry.by_format("markdown").unwrap().id(), "markdown");
    }

    #[test]
    fn by_format_reports_missing_handler() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.by_format("unknown"),
            Err(PluginError::NoHandlerForFormat(_))
        ));
    }
}
