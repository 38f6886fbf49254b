//! Engine-level lifecycle tests for full generation cycle scenarios.
//!
//! These drive `create`/`refresh`/`heal` through scripted generators and
//! sandboxes against a real tempdir store to verify end-to-end behavior:
//! version lineage, status transitions, audit rows, and loop termination.

use std::time::{Duration, Instant};

use blocks::core::classifier::classify_message;
use blocks::core::lineage::validate_lineage;
use blocks::core::types::{
    BlockStatus, ExecutionKind, FailureKind, FinalStatus, Payload, VersionStatus,
};
use blocks::io::config::EngineConfig;
use blocks::io::exec_log::read_rows;
use blocks::io::sandbox::{ExecRequest, ProcessSandbox, Sandbox};
use blocks::io::store::BlockLocks;
use blocks::ops::{CreateBlockRequest, create_block, refresh_block};
use blocks::test_support::{
    ScriptedGenerator, ScriptedSandbox, candidate_json, failing, succeeding, test_store,
};
use serde_json::json;

/// Scenario: the first candidate returns `{"value": 42}`.
///
/// Expect: block active, version 1 active, one successful audit row.
#[test]
fn first_attempt_success_promotes_version_one() {
    let (_temp, store) = test_store();
    let config = EngineConfig::default();
    let locks = BlockLocks::new();
    let generator = ScriptedGenerator::new(vec![Ok(candidate_json("v1"))]);
    let sandbox = ScriptedSandbox::new(vec![succeeding(json!({"value": 42}))]);

    let (block, outcome) = create_block(
        &store,
        &generator,
        &sandbox,
        &config,
        &locks,
        &CreateBlockRequest {
            prompt: "show the answer".to_string(),
            title: None,
            refresh_interval_secs: None,
        },
        |_| {},
    )
    .expect("create");

    assert_eq!(block.status, BlockStatus::Active);
    assert_eq!(block.current_version, Some(1));
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);
    assert_eq!(outcome.attempts.len(), 1);

    let lineage = store.lineage(block.id).expect("lineage");
    assert_eq!(lineage, vec![(1, VersionStatus::Active)]);
    assert!(validate_lineage(&lineage).is_empty());

    let rows = read_rows(&store.exec_log_path(block.id)).expect("rows");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
    assert_eq!(rows[0].execution_type, ExecutionKind::Fetch);
    assert_eq!(rows[0].version, 1);
}

/// Scenario: candidate 1 exits non-zero with a ModuleNotFoundError on stderr;
/// candidate 2, regenerated with that context, succeeds.
///
/// Expect: two versions (1 deprecated, 2 active), two audit rows, block
/// active at version 2, and the second prompt carrying the failure context.
#[test]
fn failed_attempt_feeds_context_into_the_regeneration() {
    let (_temp, store) = test_store();
    let config = EngineConfig::default();
    let locks = BlockLocks::new();
    let stderr = "Traceback (most recent call last):\nModuleNotFoundError: No module named 'lxml'";
    let generator = ScriptedGenerator::new(vec![
        Ok(candidate_json("broken")),
        Ok(candidate_json("fixed")),
    ]);
    let sandbox = ScriptedSandbox::new(vec![
        failing(FailureKind::ExecutionError, stderr),
        succeeding(json!({"items": []})),
    ]);

    let (block, outcome) = create_block(
        &store,
        &generator,
        &sandbox,
        &config,
        &locks,
        &CreateBlockRequest {
            prompt: "latest rust blog posts".to_string(),
            title: None,
            refresh_interval_secs: None,
        },
        |_| {},
    )
    .expect("create");

    assert_eq!(block.status, BlockStatus::Active);
    assert_eq!(block.current_version, Some(2));
    assert_eq!(outcome.final_status, FinalStatus::Succeeded);

    let lineage = store.lineage(block.id).expect("lineage");
    assert_eq!(
        lineage,
        vec![(1, VersionStatus::Deprecated), (2, VersionStatus::Active)]
    );
    assert!(validate_lineage(&lineage).is_empty());

    let rows = read_rows(&store.exec_log_path(block.id)).expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(!rows[0].success);
    assert!(
        rows[0]
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("ModuleNotFoundError"),
        "raw stderr is retained in the audit log"
    );
    assert!(rows[1].success);

    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("Previous attempts"));
    assert!(prompts[1].contains("Previous attempts"));
    assert!(prompts[1].contains("ModuleNotFoundError"));
    assert!(prompts[1].contains("allow-listed packages"));
}

/// Scenario: three consecutive failures with a budget of three.
///
/// Expect: block error, version 3 failed, explanation carrying the final
/// remediation hint, three audit rows.
#[test]
fn exhausted_cycle_persists_the_terminal_failure() {
    let (_temp, store) = test_store();
    let config = EngineConfig::default();
    let locks = BlockLocks::new();
    let generator = ScriptedGenerator::always(candidate_json("still-broken"));
    let sandbox = ScriptedSandbox::always(failing(
        FailureKind::ExecutionError,
        "requests.exceptions.HTTPError: 403 Forbidden for url",
    ));

    let (block, outcome) = create_block(
        &store,
        &generator,
        &sandbox,
        &config,
        &locks,
        &CreateBlockRequest {
            prompt: "scrape a stubborn site".to_string(),
            title: None,
            refresh_interval_secs: None,
        },
        |_| {},
    )
    .expect("create");

    assert_eq!(block.status, BlockStatus::Error);
    assert_eq!(outcome.final_status, FinalStatus::Exhausted);
    assert_eq!(outcome.attempts.len(), 3);

    let lineage = store.lineage(block.id).expect("lineage");
    assert_eq!(
        lineage,
        vec![
            (1, VersionStatus::Deprecated),
            (2, VersionStatus::Deprecated),
            (3, VersionStatus::Failed),
        ]
    );
    assert!(validate_lineage(&lineage).is_empty());

    let terminal = store.load_version(block.id, 3).expect("version");
    assert!(
        terminal.explanation.contains("official API"),
        "terminal explanation carries the remediation hint: {}",
        terminal.explanation
    );

    let rows = read_rows(&store.exec_log_path(block.id)).expect("rows");
    assert_eq!(rows.len(), 3, "one audit row per attempt, bounded by budget");
}

/// Scenario: the classifier's table maps a 403 to an official-API hint,
/// independent of the loop.
#[test]
fn classifier_table_lookup_for_forbidden_responses() {
    let diagnosis = classify_message(
        FailureKind::ExecutionError,
        "HTTP error 403 Forbidden while fetching page",
    );
    assert!(diagnosis.remediation_hint.contains("official API"));
}

/// Boundary: a candidate that blocks past the timeout yields `timeout`
/// within timeout plus bounded overhead; the controller never hangs.
#[test]
fn blocking_candidate_times_out_and_exhausts() {
    let (_temp, store) = test_store();
    let mut config = EngineConfig::default();
    config.max_iterations = 1;
    config.sandbox.timeout_secs = 1;
    // Stand-in interpreter that ignores the harness file and blocks.
    config.sandbox.command = vec!["sh".to_string(), "-c".to_string(), "sleep 30 #".to_string()];
    let locks = BlockLocks::new();
    let generator = ScriptedGenerator::always(candidate_json("sleepy"));
    let sandbox = ProcessSandbox::new(config.sandbox.command.clone());

    let started = Instant::now();
    let (block, outcome) = create_block(
        &store,
        &generator,
        &sandbox,
        &config,
        &locks,
        &CreateBlockRequest {
            prompt: "a block that hangs".to_string(),
            title: None,
            refresh_interval_secs: None,
        },
        |_| {},
    )
    .expect("create");

    assert!(
        started.elapsed() < Duration::from_secs(10),
        "controller must not hang: {:?}",
        started.elapsed()
    );
    assert_eq!(block.status, BlockStatus::Error);
    assert_eq!(outcome.final_status, FinalStatus::Exhausted);
    let diagnosis = outcome.attempts[0].diagnosis.as_ref().expect("diagnosis");
    assert_eq!(diagnosis.kind, FailureKind::Timeout);
}

/// Idempotence: repeated refreshes of a stable active version yield payloads
/// of identical shape.
#[test]
fn repeated_refresh_keeps_the_payload_shape() {
    let (_temp, store) = test_store();
    let config = EngineConfig::default();
    let locks = BlockLocks::new();
    let generator = ScriptedGenerator::always(candidate_json("stable"));
    let sandbox = ScriptedSandbox::always(succeeding(json!({"value": 1, "label": "a"})));

    let (block, _) = create_block(
        &store,
        &generator,
        &sandbox,
        &config,
        &locks,
        &CreateBlockRequest {
            prompt: "a stable metric".to_string(),
            title: None,
            refresh_interval_secs: None,
        },
        |_| {},
    )
    .expect("create");

    let refresh_generator = ScriptedGenerator::new(Vec::new());
    let first_sandbox = ScriptedSandbox::always(succeeding(json!({"value": 7, "label": "b"})));
    let first = refresh_block(
        &store,
        &refresh_generator,
        &first_sandbox,
        &config,
        &locks,
        block.id,
        |_| {},
    )
    .expect("refresh");
    let second_sandbox = ScriptedSandbox::always(succeeding(json!({"value": 9, "label": "c"})));
    let second = refresh_block(
        &store,
        &refresh_generator,
        &second_sandbox,
        &config,
        &locks,
        block.id,
        |_| {},
    )
    .expect("refresh");

    let keys = |payload: &Payload| match payload {
        Payload::Success { value } => {
            let mut keys: Vec<String> = value.as_object().expect("object").keys().cloned().collect();
            keys.sort();
            keys
        }
        Payload::Failure { .. } => panic!("expected success"),
    };
    assert_eq!(keys(&first.result.payload), keys(&second.result.payload));
    assert_eq!(refresh_generator.calls(), 0, "refresh never invokes generation");
}

/// The sandbox harness rejects imports outside the allow-list at load time,
/// mapping them to `import_error`. Exercised through outcome mapping with the
/// envelope the harness emits.
#[test]
fn disallowed_import_maps_to_import_error() {
    use blocks::io::sandbox::map_outcome;

    let stdout =
        r#"{"error": true, "message": "import of 'selenium' is not allowed", "type": "ImportError"}"#;
    let result = map_outcome(
        Some(1),
        false,
        stdout,
        "",
        Duration::from_millis(10),
        Duration::from_secs(30),
    );
    assert_eq!(result.failure_kind(), Some(FailureKind::ImportError));
}

/// Cancellation: the block's storage area vanishing mid-cycle surfaces as an
/// execution failure, not a crash.
#[test]
fn vanished_storage_area_is_an_execution_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = temp.path().join("gone");
    std::fs::create_dir_all(&missing).expect("mkdir");
    let sandbox = ProcessSandbox::new(vec!["python3".to_string()]);
    // Remove the parent after choosing a workdir beneath it, simulating block
    // deletion while a cycle is in flight, with a read-only ancestor standing
    // in for the unreachable path.
    let workdir = missing.join("blocks").join("1").join("v1").join("sandbox");
    std::fs::remove_dir_all(&missing).expect("rm");
    // Make the ancestor unreachable for creation by using a file in its place.
    std::fs::write(&missing, b"").expect("file");

    let result = sandbox
        .execute(&ExecRequest {
            workdir,
            fetch_source: "class BlockExecutor:\n    pass\n".to_string(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 10_000,
        })
        .expect("well-formed result");
    assert!(!result.success);
    assert_eq!(result.failure_kind(), Some(FailureKind::ExecutionError));
}
