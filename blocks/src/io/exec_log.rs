//! Append-only execution audit log.
//!
//! One JSONL row per sandbox execution, under `blocks/<id>/executions.jsonl`.
//! Rows are never mutated. Raw failure detail lives here; user-facing surfaces
//! only show the classified summary.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::ExecutionKind;

/// One audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLogRow {
    pub block_id: i64,
    pub version: u32,
    pub execution_type: ExecutionKind,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Append one row to the log file, creating it if needed.
pub fn append_row(path: &Path, row: &ExecutionLogRow) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(row).context("serialize execution log row")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open execution log {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append execution log {}", path.display()))
}

/// Read all rows, oldest first. A missing file is an empty log.
pub fn read_rows(path: &Path) -> Result<Vec<ExecutionLogRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read execution log {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("parse execution log row in {}", path.display()))
        })
        .collect()
}

/// The most recent failed row, if any.
pub fn last_failure(path: &Path) -> Result<Option<ExecutionLogRow>> {
    let rows = read_rows(path)?;
    Ok(rows.into_iter().rev().find(|row| !row.success))
}
