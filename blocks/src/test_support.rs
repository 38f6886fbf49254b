//! Test-only fakes and fixtures for the engine.
//!
//! Scripted implementations return predetermined results without spawning
//! processes, so loop behavior is testable deterministically.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::core::types::{ExecutionResult, FailureKind, Payload};
use crate::io::generator::{GenerateRequest, Generator};
use crate::io::sandbox::{ExecRequest, Sandbox};
use crate::io::store::BlockStore;

/// Generator returning scripted responses in order. Prompts are captured for
/// assertions on context assembly.
pub struct ScriptedGenerator {
    responses: RefCell<VecDeque<std::result::Result<String, String>>>,
    fallback: Option<String>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedGenerator {
    /// Queue of responses, consumed front to back. `Err` simulates a backend
    /// failure.
    pub fn new(responses: Vec<std::result::Result<String, String>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            fallback: None,
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Return the same response for every call.
    pub fn always(response: String) -> Self {
        Self {
            responses: RefCell::new(VecDeque::new()),
            fallback: Some(response),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.borrow().len()
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        if let Some(scripted) = self.responses.borrow_mut().pop_front() {
            return scripted.map_err(|message| anyhow!(message));
        }
        match &self.fallback {
            Some(response) => Ok(response.clone()),
            None => Err(anyhow!("scripted generator exhausted")),
        }
    }
}

/// Sandbox returning scripted execution results in order.
pub struct ScriptedSandbox {
    results: RefCell<VecDeque<ExecutionResult>>,
    fallback: Option<ExecutionResult>,
    executions: Cell<usize>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            fallback: None,
            executions: Cell::new(0),
        }
    }

    /// Return the same result for every execution.
    pub fn always(result: ExecutionResult) -> Self {
        Self {
            results: RefCell::new(VecDeque::new()),
            fallback: Some(result),
            executions: Cell::new(0),
        }
    }

    /// Number of executions performed so far.
    pub fn executions(&self) -> usize {
        self.executions.get()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(&self, _request: &ExecRequest) -> Result<ExecutionResult> {
        self.executions.set(self.executions.get() + 1);
        if let Some(result) = self.results.borrow_mut().pop_front() {
            return Ok(result);
        }
        match &self.fallback {
            Some(result) => Ok(result.clone()),
            None => Err(anyhow!("scripted sandbox exhausted")),
        }
    }
}

/// A valid candidate response, tagged so versions are distinguishable.
pub fn candidate_json(tag: &str) -> String {
    serde_json::json!({
        "fetch_source": format!("class BlockExecutor:  # {tag}\n    async def fetch_data(self):\n        return {{}}\n    async def process_data(self, raw):\n        return raw\n"),
        "render_source": format!("// {tag}\nexport function GeneratedBlock() {{ return null; }}\n"),
        "explanation": format!("candidate {tag}"),
    })
    .to_string()
}

/// A successful execution result carrying `value` as its payload.
pub fn succeeding(value: Value) -> ExecutionResult {
    ExecutionResult {
        success: true,
        exit_code: Some(0),
        timed_out: false,
        stdout: value.to_string(),
        stderr: String::new(),
        duration_ms: 5,
        payload: Payload::Success { value },
    }
}

/// A failed execution result with the given kind and message. The message is
/// mirrored into stderr the way a crashing candidate would.
pub fn failing(kind: FailureKind, message: &str) -> ExecutionResult {
    ExecutionResult {
        success: false,
        exit_code: Some(1),
        timed_out: kind == FailureKind::Timeout,
        stdout: String::new(),
        stderr: message.to_string(),
        duration_ms: 5,
        payload: Payload::Failure {
            kind,
            message: message.to_string(),
        },
    }
}

/// Tempdir-backed store with scaffolding in place.
pub fn test_store() -> (tempfile::TempDir, BlockStore) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = BlockStore::new(temp.path());
    store.init().expect("init store");
    (temp, store)
}
