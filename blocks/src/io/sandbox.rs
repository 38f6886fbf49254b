//! Sandboxed execution of generated fetch logic.
//!
//! The [`Sandbox`] trait decouples the iteration controller from the process
//! backend. The real backend wraps the candidate in a Python harness that
//! enforces the import allow-list and the payload contract, then runs it in a
//! separate interpreter process with a hard wall-clock timeout. Tests use
//! scripted sandboxes that return predetermined results without spawning
//! processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::{ExecutionResult, FailureKind, Payload};
use crate::io::process::run_command_with_timeout;

/// Packages generated code may import, plus their transitive dependencies.
/// Standard library modules are always importable; anything else fails at
/// load time inside the harness.
pub const ALLOWED_PACKAGES: &[&str] = &[
    "requests",
    "httpx",
    "bs4",
    "beautifulsoup4",
    "pandas",
    "numpy",
    "dateutil",
    "jmespath",
    // transitive dependencies of the above
    "urllib3",
    "certifi",
    "idna",
    "charset_normalizer",
    "chardet",
    "soupsieve",
    "httpcore",
    "anyio",
    "sniffio",
    "h11",
    "six",
    "pytz",
    "tzdata",
];

/// File the harness is written to inside the sandbox directory.
const ENTRY_FILE: &str = "execute.py";

/// Parameters for one sandbox invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the candidate; the only place it may write.
    pub workdir: PathBuf,
    /// Generated fetch source to execute.
    pub fetch_source: String,
    /// Hard wall-clock budget; the process is killed on expiry.
    pub timeout: Duration,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Abstraction over candidate execution backends.
pub trait Sandbox {
    /// Run the candidate. Must return a well-formed result for every
    /// invocation; candidate misbehavior is data, not an `Err`.
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult>;
}

/// Sandbox that runs candidates under a separate interpreter process.
pub struct ProcessSandbox {
    command: Vec<String>,
}

impl ProcessSandbox {
    /// `command` is the interpreter argv prefix, e.g. `["python3"]`; the
    /// harness file path is appended.
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Sandbox for ProcessSandbox {
    #[instrument(skip_all, fields(workdir = %request.workdir.display(), timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionResult> {
        let start = Instant::now();

        // A vanished working directory (block deleted mid-cycle) is an
        // execution failure, not an engine fault.
        if let Err(err) = write_harness(&request.workdir, &request.fetch_source) {
            warn!(err = %err, "sandbox setup failed");
            return Ok(setup_failure(
                format!("sandbox setup failed: {err:#}"),
                start.elapsed(),
            ));
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(ENTRY_FILE)
            .current_dir(&request.workdir);

        let output = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %err, "sandbox spawn failed");
                return Ok(setup_failure(
                    format!("sandbox spawn failed: {err:#}"),
                    start.elapsed(),
                ));
            }
        };

        let result = map_outcome(
            output.status.code(),
            output.timed_out,
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
            start.elapsed(),
            request.timeout,
        );
        debug!(success = result.success, exit_code = ?result.exit_code, "candidate finished");
        Ok(result)
    }
}

/// Write the harness file into the sandbox directory.
fn write_harness(workdir: &Path, fetch_source: &str) -> Result<()> {
    fs::create_dir_all(workdir)
        .with_context(|| format!("create sandbox dir {}", workdir.display()))?;
    let path = workdir.join(ENTRY_FILE);
    fs::write(&path, wrap_candidate(fetch_source))
        .with_context(|| format!("write {}", path.display()))
}

/// Wrap a candidate in the execution harness.
///
/// The harness installs the import allow-list hook before the candidate's
/// first line runs, drives `BlockExecutor.fetch_data()` then `process_data()`,
/// prints exactly one JSON document to stdout, and reports any exception
/// through the error envelope with exit status 1.
pub fn wrap_candidate(fetch_source: &str) -> String {
    let allowed = ALLOWED_PACKAGES
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"import builtins
import json
import sys

ALLOWED_PACKAGES = {{{allowed}}}

_original_import = builtins.__import__


def _restricted_import(name, globals=None, locals=None, fromlist=(), level=0):
    base = name.split(".")[0]
    if (
        level == 0
        and base
        and not base.startswith("_")
        and base not in ALLOWED_PACKAGES
        and base not in sys.stdlib_module_names
    ):
        raise ImportError(f"import of '{{name}}' is not allowed")
    return _original_import(name, globals, locals, fromlist, level)


builtins.__import__ = _restricted_import


def _fail(exc):
    print(json.dumps({{"error": True, "message": str(exc), "type": type(exc).__name__}}, default=str))
    sys.exit(1)


# --- generated fetch logic ---
{fetch_source}
# --- end generated fetch logic ---


async def _main():
    executor = BlockExecutor()
    raw = await executor.fetch_data()
    data = await executor.process_data(raw)
    print(json.dumps(data, default=str))


if __name__ == "__main__":
    import asyncio

    try:
        asyncio.run(_main())
    except BaseException as exc:  # noqa: BLE001
        _fail(exc)
"#
    )
}

/// Map raw process output onto an [`ExecutionResult`].
///
/// - timeout -> `timeout`, no payload trusted;
/// - non-zero exit with an import-failure envelope -> `import_error`;
/// - other non-zero exit -> `execution_error` with stderr verbatim;
/// - zero exit, unparsable stdout -> `output_format_error`;
/// - zero exit, envelope with an embedded error field -> `logical_error`;
/// - otherwise success with the parsed payload attached.
pub fn map_outcome(
    exit_code: Option<i32>,
    timed_out: bool,
    stdout: &str,
    stderr: &str,
    elapsed: Duration,
    timeout: Duration,
) -> ExecutionResult {
    let duration_ms = elapsed.as_millis() as u64;
    let base = |success: bool, payload: Payload| ExecutionResult {
        success,
        exit_code,
        timed_out,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration_ms,
        payload,
    };

    if timed_out {
        return base(
            false,
            Payload::Failure {
                kind: FailureKind::Timeout,
                message: format!("execution timed out after {}s", timeout.as_secs()),
            },
        );
    }

    let envelope = parse_envelope(stdout);

    if exit_code != Some(0) {
        if let Some((error_type, message)) = &envelope {
            if error_type.contains("Import") {
                return base(
                    false,
                    Payload::Failure {
                        kind: FailureKind::ImportError,
                        message: message.clone(),
                    },
                );
            }
        }
        let message = if !stderr.trim().is_empty() {
            stderr.to_string()
        } else if let Some((_, message)) = envelope {
            message
        } else {
            format!("process exited with status {exit_code:?}")
        };
        return base(
            false,
            Payload::Failure {
                kind: FailureKind::ExecutionError,
                message,
            },
        );
    }

    let value: Value = match serde_json::from_str(stdout.trim()) {
        Ok(value) => value,
        Err(err) => {
            return base(
                false,
                Payload::Failure {
                    kind: FailureKind::OutputFormatError,
                    message: format!("stdout is not a structured payload: {err}"),
                },
            );
        }
    };

    if let Some((_, message)) = embedded_error(&value) {
        return base(
            false,
            Payload::Failure {
                kind: FailureKind::LogicalError,
                message,
            },
        );
    }

    base(true, Payload::Success { value })
}

/// Parse the harness error envelope `{"error": true, "message": ..., "type": ...}`.
fn parse_envelope(stdout: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(stdout.trim()).ok()?;
    let (error_type, message) = embedded_error(&value)?;
    Some((error_type, message))
}

/// An embedded error field in a parsed payload, if present and truthy.
fn embedded_error(value: &Value) -> Option<(String, String)> {
    let object = value.as_object()?;
    let error = object.get("error")?;
    let truthy = match error {
        Value::Bool(flag) => *flag,
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        _ => true,
    };
    if !truthy {
        return None;
    }
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    let error_type = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Some((error_type, message))
}

fn setup_failure(message: String, elapsed: Duration) -> ExecutionResult {
    ExecutionResult {
        success: false,
        exit_code: None,
        timed_out: false,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: elapsed.as_millis() as u64,
        payload: Payload::Failure {
            kind: FailureKind::ExecutionError,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELAPSED: Duration = Duration::from_millis(25);
    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn wrap_installs_allow_list_before_candidate() {
        let wrapped = wrap_candidate("class BlockExecutor:\n    pass\n");
        let hook_pos = wrapped.find("_restricted_import").expect("hook");
        let candidate_pos = wrapped.find("class BlockExecutor").expect("candidate");
        assert!(hook_pos < candidate_pos);
        assert!(wrapped.contains("\"requests\""));
        assert!(wrapped.contains("\"jmespath\""));
        assert!(wrapped.contains("asyncio.run(_main())"));
    }

    #[test]
    fn timeout_yields_timeout_kind_without_payload() {
        let result = map_outcome(None, true, "{\"value\": 1}", "", ELAPSED, TIMEOUT);
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
        assert!(result.failure_message().contains("timed out after 30s"));
    }

    #[test]
    fn import_envelope_yields_import_error() {
        let stdout =
            r#"{"error": true, "message": "import of 'selenium' is not allowed", "type": "ImportError"}"#;
        let result = map_outcome(Some(1), false, stdout, "", ELAPSED, TIMEOUT);
        assert_eq!(result.failure_kind(), Some(FailureKind::ImportError));
        assert!(result.failure_message().contains("selenium"));
    }

    #[test]
    fn nonzero_exit_yields_execution_error_with_stderr_verbatim() {
        let stderr = "Traceback (most recent call last):\nModuleNotFoundError: No module named 'foo'\n";
        let result = map_outcome(Some(1), false, "", stderr, ELAPSED, TIMEOUT);
        assert_eq!(result.failure_kind(), Some(FailureKind::ExecutionError));
        assert_eq!(result.failure_message(), stderr);
    }

    #[test]
    fn unparsable_stdout_yields_output_format_error() {
        let result = map_outcome(Some(0), false, "<html>not json</html>", "", ELAPSED, TIMEOUT);
        assert_eq!(result.failure_kind(), Some(FailureKind::OutputFormatError));
    }

    #[test]
    fn embedded_error_field_yields_logical_error_with_that_message() {
        let stdout = r#"{"error": true, "message": "feed returned no entries", "type": "ValueError"}"#;
        let result = map_outcome(Some(0), false, stdout, "", ELAPSED, TIMEOUT);
        assert_eq!(result.failure_kind(), Some(FailureKind::LogicalError));
        assert_eq!(result.failure_message(), "feed returned no entries");
    }

    #[test]
    fn well_formed_payload_is_a_success() {
        let result = map_outcome(Some(0), false, r#"{"value": 42}"#, "", ELAPSED, TIMEOUT);
        assert!(result.success);
        match &result.payload {
            Payload::Success { value } => assert_eq!(value["value"], 42),
            Payload::Failure { .. } => panic!("expected success payload"),
        }
    }

    #[test]
    fn false_error_field_is_not_a_failure() {
        let result = map_outcome(Some(0), false, r#"{"error": false, "value": 7}"#, "", ELAPSED, TIMEOUT);
        assert!(result.success);
    }

    #[test]
    fn spawn_failure_reports_execution_error() {
        use crate::io::sandbox::{ExecRequest, ProcessSandbox, Sandbox};
        let temp = tempfile::tempdir().expect("tempdir");
        // Interpreter that cannot exist; setup succeeds but spawn fails.
        let sandbox = ProcessSandbox::new(vec!["definitely-not-an-interpreter".to_string()]);
        let request = ExecRequest {
            workdir: temp.path().join("sandbox"),
            fetch_source: "class BlockExecutor:\n    pass\n".to_string(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 10_000,
        };
        let result = sandbox.execute(&request).expect("well-formed result");
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(FailureKind::ExecutionError));
    }

    /// End-to-end check of the harness contract using `sh` as a stand-in
    /// interpreter: the sandbox appends the entry file to the configured
    /// command, so a shell that prints JSON exercises the full path.
    #[test]
    fn configured_interpreter_command_receives_entry_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = ProcessSandbox::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo '{\"value\": 42}' #".to_string(),
        ]);
        let request = ExecRequest {
            workdir: temp.path().join("sandbox"),
            fetch_source: "class BlockExecutor:\n    pass\n".to_string(),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        };
        let result = sandbox.execute(&request).expect("result");
        assert!(result.success);
        assert!(request.workdir.join("execute.py").is_file());
    }
}
