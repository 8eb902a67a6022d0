//! The code sandbox capability.
//!
//! Untrusted python programs run in a subprocess harness with a JSON
//! contract: the request carries the code, input variables, decoded
//! images, tool names, and the declared output variables; the outcome
//! carries captured stdout, collected outputs, and error details. Images
//! cross the boundary as `{"__image_b64__": ...}` objects; values with
//! only a string form come back as `{"__repr__": ...}`.

use crate::config::EXECUTION_TIMEOUT_SECS;
use crate::error::{Result, SandboxError};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::process::Stdio;

/// One sandbox invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub code: String,
    /// Input variables bound into the execution environment.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Base64 image payloads bound by key.
    #[serde(default)]
    pub images: HashMap<String, String>,
    /// Tool names the harness binds from its tool module.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Variable names to collect after execution.
    #[serde(default)]
    pub output_variables: Vec<String>,
}

/// What came back from one sandbox invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub success: bool,
    /// Captured stdout.
    #[serde(default)]
    pub output: String,
    /// Collected output variables, JSON-encoded by the harness.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

impl SandboxOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Static trait for sandbox implementations.
pub trait Sandbox: Send + Sync + 'static {
    fn execute(
        &self,
        request: SandboxRequest,
    ) -> impl std::future::Future<Output = Result<SandboxOutcome>> + Send;
}

/// Dynamic companion trait for `Arc<dyn SandboxDyn>` storage.
pub trait SandboxDyn: Send + Sync + 'static {
    fn execute<'a>(
        &'a self,
        request: SandboxRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<SandboxOutcome>> + Send + 'a>>;
}

impl<T: Sandbox> SandboxDyn for T {
    fn execute<'a>(
        &'a self,
        request: SandboxRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<SandboxOutcome>> + Send + 'a>> {
        Box::pin(Sandbox::execute(self, request))
    }
}

/// If the value is an image marker, its base64 payload.
pub fn image_b64(value: &Value) -> Option<&str> {
    value.get("__image_b64__").and_then(Value::as_str)
}

/// If the value is a repr marker (non-serialisable, stringable), the
/// string form.
pub fn repr_string(value: &Value) -> Option<&str> {
    value.get("__repr__").and_then(Value::as_str)
}

/// Subprocess python sandbox.
pub struct PythonSandbox {
    python_bin: String,
    timeout_secs: u64,
}

impl Default for PythonSandbox {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
            timeout_secs: EXECUTION_TIMEOUT_SECS,
        }
    }
}

impl PythonSandbox {
    pub fn new(python_bin: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            python_bin: python_bin.into(),
            timeout_secs,
        }
    }
}

impl Sandbox for PythonSandbox {
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxOutcome> {
        let scratch = tempfile::tempdir().context("failed to create sandbox scratch dir")?;
        let harness_path = scratch.path().join("harness.py");
        let request_path = scratch.path().join("request.json");
        let outcome_path = scratch.path().join("outcome.json");

        std::fs::write(&harness_path, HARNESS_PY).context("failed to write sandbox harness")?;
        std::fs::write(
            &request_path,
            serde_json::to_vec(&request).context("failed to serialise sandbox request")?,
        )
        .context("failed to write sandbox request")?;

        let mut child = tokio::process::Command::new(&self.python_bin)
            .arg(&harness_path)
            .arg(&request_path)
            .arg(&outcome_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| SandboxError::Spawn(error.to_string()))?;

        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            child.wait(),
        )
        .await;

        let exit = match waited {
            Ok(result) => result.context("failed to wait for sandbox process")?,
            Err(_) => {
                let _ = child.kill().await;
                return Ok(SandboxOutcome::failure(format!(
                    "TimeoutError: execution exceeded {}s",
                    self.timeout_secs
                )));
            }
        };

        let outcome_bytes = match std::fs::read(&outcome_path) {
            Ok(bytes) => bytes,
            Err(_) => {
                // The harness died before writing its outcome.
                return Err(SandboxError::Harness(format!(
                    "harness exited with {exit} and produced no outcome"
                ))
                .into());
            }
        };

        let outcome: SandboxOutcome = serde_json::from_slice(&outcome_bytes)
            .map_err(|error| SandboxError::Harness(error.to_string()))?;
        Ok(outcome)
    }
}

/// The python-side half of the contract.
const HARNESS_PY: &str = r#"
import base64
import contextlib
import io
import json
import sys
import traceback


def encode_value(value):
    try:
        from PIL import Image
        if isinstance(value, Image.Image):
            buffer = io.BytesIO()
            value.save(buffer, format="PNG")
            return {"__image_b64__": base64.b64encode(buffer.getvalue()).decode()}
    except ImportError:
        pass
    if isinstance(value, list):
        return [encode_value(item) for item in value]
    if isinstance(value, dict):
        return {key: encode_value(item) for key, item in value.items()}
    try:
        json.dumps(value)
        return value
    except (TypeError, ValueError):
        return {"__repr__": repr(value)}


def bind_tool(name):
    try:
        import taskforce_tools
        return getattr(taskforce_tools, name)
    except (ImportError, AttributeError):
        def missing(*args, **kwargs):
            raise NameError(f"tool {name} is not available")
        return missing


def main():
    with open(sys.argv[1]) as handle:
        request = json.load(handle)

    env = {}
    env.update(request.get("variables", {}))
    env.update(request.get("images", {}))
    for name in request.get("tools", []):
        env[name] = bind_tool(name)

    result = {"success": False, "output": "", "variables": {}, "error": None, "stack_trace": None}
    stdout = io.StringIO()
    try:
        with contextlib.redirect_stdout(stdout):
            exec(request.get("code", ""), env)
        result["success"] = True
        for name in request.get("output_variables", []):
            result["variables"][name] = encode_value(env.get(name))
    except BaseException as exc:
        result["error"] = f"{type(exc).__name__}: {exc}"
        result["stack_trace"] = traceback.format_exc()
    result["output"] = stdout.getvalue()

    with open(sys.argv[2], "w") as handle:
        json.dump(result, handle, default=str)


if __name__ == "__main__":
    main()
"#;

/// Scripted sandbox double for tests.
#[derive(Default)]
pub struct FakeSandbox {
    outcomes: std::sync::Mutex<std::collections::VecDeque<SandboxOutcome>>,
    executed: std::sync::Mutex<Vec<SandboxRequest>>,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: SandboxOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Requests seen so far, in order.
    pub fn executions(&self) -> Vec<SandboxRequest> {
        self.executed.lock().unwrap().clone()
    }
}

impl Sandbox for FakeSandbox {
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxOutcome> {
        self.executed.lock().unwrap().push(request);
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SandboxError::Harness("fake has no outcome queued".to_string()).into())
    }
}
