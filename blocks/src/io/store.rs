//! Block and version persistence.
//!
//! Records are JSON files under the engine data directory:
//!
//! ```text
//! <data_dir>/
//!   config.toml
//!   blocks/<id>/
//!     block.json            # block record, atomic rename on update
//!     executions.jsonl      # append-only audit log
//!     payload.json          # cache of the last successful payload
//!     v<version>/           # write-once version artifacts
//!       version.json
//!       fetch.py
//!       render.tsx
//!       sandbox/            # working area for executions of this version
//! ```
//!
//! Version sources are write-once: a new candidate is always a new `v<n>`
//! directory, never an edit in place. `promote` demotes the previous active
//! version before the new one is written, so "at most one active version per
//! block" holds at every intermediate state.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{BlockStatus, Candidate, Diagnosis, VersionStatus};

/// Persistence failure. Fatal to the current cycle; callers must not retry.
#[derive(Debug)]
pub struct StorageError {
    pub message: String,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error: {}", self.message)
    }
}

impl std::error::Error for StorageError {}

/// The referenced block does not exist (or was deleted mid-flight).
#[derive(Debug)]
pub struct BlockNotFoundError {
    pub block_id: i64,
}

impl fmt::Display for BlockNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} not found", self.block_id)
    }
}

impl std::error::Error for BlockNotFoundError {}

/// A cycle or refresh is already in flight for this block.
#[derive(Debug)]
pub struct BlockBusyError {
    pub block_id: i64,
}

impl fmt::Display for BlockBusyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {} already has a cycle in flight", self.block_id)
    }
}

impl std::error::Error for BlockBusyError {}

/// Persisted block record (`block.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: i64,
    /// Current task description.
    pub prompt: String,
    /// Prior prompts, oldest first. Appended on every edit.
    pub prompt_history: Vec<String>,
    pub title: String,
    /// Version the block currently points at. With status `error` this may
    /// reference a failed version carrying the terminal explanation.
    pub current_version: Option<u32>,
    pub refresh_interval_secs: u64,
    /// Opaque layout metadata, passed through untouched.
    pub layout: Value,
    pub status: BlockStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted version record (`version.json`). Sources live next to it and are
/// write-once; only `status` transitions after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: u32,
    pub status: VersionStatus,
    pub explanation: String,
    pub created_at: DateTime<Utc>,
}

/// An active version together with its sources.
#[derive(Debug, Clone)]
pub struct ActiveVersion {
    pub record: VersionRecord,
    pub fetch_source: String,
    pub render_source: String,
}

/// Single-flight registry: at most one in-flight cycle per block id.
///
/// Cloning shares the registry. Guards release on drop.
#[derive(Clone, Default)]
pub struct BlockLocks {
    inner: Arc<Mutex<HashSet<i64>>>,
}

impl BlockLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the per-block guard, or fail with [`BlockBusyError`] when a
    /// cycle for this block is already in flight.
    pub fn try_acquire(&self, block_id: i64) -> Result<BlockGuard> {
        let mut held = self.inner.lock().expect("block lock registry poisoned");
        if !held.insert(block_id) {
            return Err(anyhow::Error::new(BlockBusyError { block_id }));
        }
        Ok(BlockGuard {
            registry: self.inner.clone(),
            block_id,
        })
    }
}

/// Held while a cycle or refresh owns a block. Released on drop.
#[derive(Debug)]
pub struct BlockGuard {
    registry: Arc<Mutex<HashSet<i64>>>,
    block_id: i64,
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.registry.lock() {
            held.remove(&self.block_id);
        }
    }
}

/// Filesystem-backed block/version store.
#[derive(Debug, Clone)]
pub struct BlockStore {
    data_dir: PathBuf,
}

impl BlockStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn block_dir(&self, block_id: i64) -> PathBuf {
        self.blocks_dir().join(block_id.to_string())
    }

    fn block_json(&self, block_id: i64) -> PathBuf {
        self.block_dir(block_id).join("block.json")
    }

    pub fn exec_log_path(&self, block_id: i64) -> PathBuf {
        self.block_dir(block_id).join("executions.jsonl")
    }

    fn payload_cache_path(&self, block_id: i64) -> PathBuf {
        self.block_dir(block_id).join("payload.json")
    }

    pub fn version_dir(&self, block_id: i64, version: u32) -> PathBuf {
        self.block_dir(block_id).join(format!("v{version}"))
    }

    /// Working area for sandbox executions of one version.
    pub fn sandbox_dir(&self, block_id: i64, version: u32) -> PathBuf {
        self.version_dir(block_id, version).join("sandbox")
    }

    /// Create the data directory scaffolding.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.blocks_dir())
            .with_context(|| format!("create blocks dir {}", self.blocks_dir().display()))
            .map_err(storage)
    }

    /// Create a new block record with the next free id. Runs no generation.
    pub fn create_block(
        &self,
        prompt: &str,
        title: &str,
        refresh_interval_secs: u64,
        layout: Value,
    ) -> Result<BlockRecord> {
        self.init()?;
        let id = self.next_block_id().map_err(storage)?;
        let now = Utc::now();
        let record = BlockRecord {
            id,
            prompt: prompt.to_string(),
            prompt_history: Vec::new(),
            title: title.to_string(),
            current_version: None,
            refresh_interval_secs,
            layout,
            status: BlockStatus::Error,
            created_at: now,
            updated_at: now,
        };
        self.write_block(&record)?;
        debug!(block_id = id, "created block record");
        Ok(record)
    }

    fn next_block_id(&self) -> Result<i64> {
        let mut max = 0i64;
        if self.blocks_dir().exists() {
            for entry in fs::read_dir(self.blocks_dir())
                .with_context(|| format!("read {}", self.blocks_dir().display()))?
            {
                let entry = entry.context("read blocks dir entry")?;
                if let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<i64>().ok())
                {
                    max = max.max(id);
                }
            }
        }
        Ok(max + 1)
    }

    pub fn load_block(&self, block_id: i64) -> Result<BlockRecord> {
        let path = self.block_json(block_id);
        if !path.exists() {
            return Err(anyhow::Error::new(BlockNotFoundError { block_id }));
        }
        let read = || -> Result<BlockRecord> {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
        };
        read().map_err(storage)
    }

    /// All block records, ordered by id.
    pub fn list_blocks(&self) -> Result<Vec<BlockRecord>> {
        let list = || -> Result<Vec<BlockRecord>> {
            let mut blocks = Vec::new();
            if !self.blocks_dir().exists() {
                return Ok(blocks);
            }
            for entry in fs::read_dir(self.blocks_dir())
                .with_context(|| format!("read {}", self.blocks_dir().display()))?
            {
                let entry = entry.context("read blocks dir entry")?;
                let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<i64>().ok())
                else {
                    continue;
                };
                if self.block_json(id).exists() {
                    blocks.push(self.load_block(id)?);
                }
            }
            blocks.sort_by_key(|block| block.id);
            Ok(blocks)
        };
        list().map_err(storage)
    }

    /// Atomically replace the block record, stamping `updated_at`.
    pub fn write_block(&self, record: &BlockRecord) -> Result<()> {
        let mut stamped = record.clone();
        stamped.updated_at = Utc::now();
        let path = self.block_json(record.id);
        write_json_atomic(&path, &stamped).map_err(storage)
    }

    pub fn set_status(&self, block_id: i64, status: BlockStatus) -> Result<BlockRecord> {
        let mut record = self.load_block(block_id)?;
        record.status = status;
        self.write_block(&record)?;
        Ok(record)
    }

    /// Replace the prompt, keeping the old one in history (oldest first).
    pub fn append_prompt(&self, block_id: i64, new_prompt: &str) -> Result<BlockRecord> {
        let mut record = self.load_block(block_id)?;
        let old = std::mem::replace(&mut record.prompt, new_prompt.to_string());
        record.prompt_history.push(old);
        self.write_block(&record)?;
        Ok(record)
    }

    /// Replace layout metadata. The value is opaque to the engine.
    pub fn update_layout(&self, block_id: i64, layout: Value) -> Result<BlockRecord> {
        let mut record = self.load_block(block_id)?;
        record.layout = layout;
        self.write_block(&record)?;
        Ok(record)
    }

    /// Next version number for this block. Monotonic: scans recorded
    /// versions, and cleanup always retains the newest ones.
    ///
    /// A version counts once its `version.json` exists. The sandbox working
    /// area for the upcoming version is created before the record, so a bare
    /// `v<n>/sandbox/` does not claim the number.
    pub fn next_version(&self, block_id: i64) -> Result<u32> {
        Ok(self
            .version_numbers(block_id)
            .map_err(storage)?
            .into_iter()
            .max()
            .unwrap_or(0)
            + 1)
    }

    /// Recorded version numbers, ascending.
    fn version_numbers(&self, block_id: i64) -> Result<Vec<u32>> {
        let dir = self.block_dir(block_id);
        let mut versions = Vec::new();
        if !dir.exists() {
            return Ok(versions);
        }
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.context("read block dir entry")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(number) = name.strip_prefix('v').and_then(|n| n.parse::<u32>().ok()) {
                if entry.path().join("version.json").exists() {
                    versions.push(number);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// All version records, ordered by version number.
    pub fn list_versions(&self, block_id: i64) -> Result<Vec<VersionRecord>> {
        let numbers = self.version_numbers(block_id).map_err(storage)?;
        numbers
            .into_iter()
            .map(|version| self.load_version(block_id, version))
            .collect()
    }

    pub fn load_version(&self, block_id: i64, version: u32) -> Result<VersionRecord> {
        let path = self.version_dir(block_id, version).join("version.json");
        let read = || -> Result<VersionRecord> {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
        };
        read().map_err(storage)
    }

    pub fn read_fetch_source(&self, block_id: i64, version: u32) -> Result<String> {
        let path = self.version_dir(block_id, version).join("fetch.py");
        fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .map_err(storage)
    }

    pub fn read_render_source(&self, block_id: i64, version: u32) -> Result<String> {
        let path = self.version_dir(block_id, version).join("render.tsx");
        fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .map_err(storage)
    }

    /// Write a new version's artifacts. Write-once: refuses to overwrite a
    /// recorded version. The version directory itself may already exist with
    /// only a `sandbox/` working area, created when the candidate ran.
    fn write_version(
        &self,
        block_id: i64,
        candidate: &Candidate,
        status: VersionStatus,
        explanation: &str,
    ) -> Result<VersionRecord> {
        let write = || -> Result<VersionRecord> {
            let version = self.next_version(block_id)?;
            let dir = self.version_dir(block_id, version);
            if dir.join("version.json").exists() {
                return Err(anyhow!("version {} already recorded", dir.display()));
            }
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            fs::write(dir.join("fetch.py"), &candidate.fetch_source)
                .with_context(|| format!("write {}", dir.join("fetch.py").display()))?;
            fs::write(dir.join("render.tsx"), &candidate.render_source)
                .with_context(|| format!("write {}", dir.join("render.tsx").display()))?;
            let record = VersionRecord {
                version,
                status,
                explanation: explanation.to_string(),
                created_at: Utc::now(),
            };
            write_json_atomic(&dir.join("version.json"), &record)?;
            Ok(record)
        };
        write().map_err(storage)
    }

    fn set_version_status(
        &self,
        block_id: i64,
        version: u32,
        status: VersionStatus,
    ) -> Result<()> {
        let mut record = self.load_version(block_id, version)?;
        record.status = status;
        let path = self.version_dir(block_id, version).join("version.json");
        write_json_atomic(&path, &record).map_err(storage)
    }

    /// Promote a candidate: demote the current active version (if any) to
    /// deprecated, insert the candidate as the new active version, and point
    /// the block at it with status `active`.
    ///
    /// Demotion happens before the new version is written so that no
    /// intermediate state ever holds two active versions.
    pub fn promote(&self, block_id: i64, candidate: &Candidate) -> Result<VersionRecord> {
        let mut block = self.load_block(block_id)?;
        if let Some(current) = block.current_version {
            let record = self.load_version(block_id, current)?;
            if record.status == VersionStatus::Active {
                self.set_version_status(block_id, current, VersionStatus::Deprecated)?;
            }
        }
        let record = self.write_version(
            block_id,
            candidate,
            VersionStatus::Active,
            &candidate.explanation,
        )?;
        block.current_version = Some(record.version);
        block.status = BlockStatus::Active;
        self.write_block(&block)?;
        debug!(block_id, version = record.version, "promoted version");
        Ok(record)
    }

    /// Record a non-terminal failed attempt as a deprecated version. The
    /// block's pointer and status are untouched.
    pub fn record_deprecated(
        &self,
        block_id: i64,
        candidate: &Candidate,
        diagnosis: &Diagnosis,
    ) -> Result<VersionRecord> {
        // Ensure the block still exists before writing artifacts under it.
        self.load_block(block_id)?;
        self.write_version(
            block_id,
            candidate,
            VersionStatus::Deprecated,
            &explanation_for(diagnosis),
        )
    }

    /// Record the terminal attempt of an exhausted cycle: insert a failed
    /// version carrying the diagnosis as its explanation and transition the
    /// block to `error`, pointing at the failed version.
    pub fn record_failed(
        &self,
        block_id: i64,
        candidate: &Candidate,
        diagnosis: &Diagnosis,
    ) -> Result<VersionRecord> {
        let mut block = self.load_block(block_id)?;
        let record = self.write_version(
            block_id,
            candidate,
            VersionStatus::Failed,
            &explanation_for(diagnosis),
        )?;
        block.current_version = Some(record.version);
        block.status = BlockStatus::Error;
        self.write_block(&block)?;
        debug!(block_id, version = record.version, "recorded failed version");
        Ok(record)
    }

    /// The block's active version with its sources, if it has one.
    pub fn get_active(&self, block_id: i64) -> Result<Option<ActiveVersion>> {
        let block = self.load_block(block_id)?;
        let Some(version) = block.current_version else {
            return Ok(None);
        };
        let record = self.load_version(block_id, version)?;
        if record.status != VersionStatus::Active {
            return Ok(None);
        }
        Ok(Some(ActiveVersion {
            fetch_source: self.read_fetch_source(block_id, version)?,
            render_source: self.read_render_source(block_id, version)?,
            record,
        }))
    }

    /// Cache the last successful payload for serving without re-execution.
    pub fn write_payload_cache(&self, block_id: i64, value: &Value) -> Result<()> {
        let cache = CachedPayload {
            value: value.clone(),
            fetched_at: Utc::now(),
        };
        write_json_atomic(&self.payload_cache_path(block_id), &cache).map_err(storage)
    }

    pub fn read_payload_cache(&self, block_id: i64) -> Result<Option<CachedPayload>> {
        let path = self.payload_cache_path(block_id);
        if !path.exists() {
            return Ok(None);
        }
        let read = || -> Result<CachedPayload> {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
        };
        read().map(Some).map_err(storage)
    }

    /// Remove old version directories, keeping the `keep` most recent. The
    /// block's current version is always retained.
    pub fn cleanup_old_versions(&self, block_id: i64, keep: usize) -> Result<()> {
        let block = self.load_block(block_id)?;
        let mut numbers = self.version_numbers(block_id).map_err(storage)?;
        numbers.sort_unstable_by(|a, b| b.cmp(a));
        for &version in numbers.iter().skip(keep) {
            if Some(version) == block.current_version {
                continue;
            }
            let dir = self.version_dir(block_id, version);
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(block_id, version, err = %err, "failed to remove old version dir");
            }
        }
        Ok(())
    }

    /// Lineage of `(version, status)` pairs, ordered, for invariant checks.
    pub fn lineage(&self, block_id: i64) -> Result<Vec<(u32, VersionStatus)>> {
        Ok(self
            .list_versions(block_id)?
            .into_iter()
            .map(|record| (record.version, record.status))
            .collect())
    }
}

/// Cached payload with its fetch time (`payload.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPayload {
    pub value: Value,
    pub fetched_at: DateTime<Utc>,
}

fn explanation_for(diagnosis: &Diagnosis) -> String {
    format!("{} {}", diagnosis.summary, diagnosis.remediation_hint)
}

fn storage(err: anyhow::Error) -> anyhow::Error {
    // Preserve not-found as its own type so callers can branch on it.
    if err.downcast_ref::<BlockNotFoundError>().is_some()
        || err.downcast_ref::<StorageError>().is_some()
    {
        return err;
    }
    anyhow::Error::new(StorageError {
        message: format!("{err:#}"),
    })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
