//! CLI for the self-healing block engine.
//!
//! Blocks live under a data directory (`--data-dir`). `create`/`edit`/`heal`
//! drive the bounded generation loop; `refresh` runs the active version
//! without generation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use blocks::core::types::{CycleEvent, FinalStatus, Payload};
use blocks::cycle::CycleOutcome;
use blocks::exit_codes;
use blocks::io::config::{EngineConfig, load_config, write_config};
use blocks::io::generator::CommandGenerator;
use blocks::io::sandbox::ProcessSandbox;
use blocks::io::store::{BlockLocks, BlockStore};
use blocks::logging;
use blocks::ops::{self, CreateBlockRequest};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "blocks",
    version,
    about = "Self-healing engine for AI-generated dashboard blocks"
)]
struct Cli {
    /// Engine data directory.
    #[arg(long, default_value = ".blocks")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory and a default config file if missing.
    Init,
    /// Create a block and run its first generation cycle.
    Create {
        /// Natural-language description of the block.
        prompt: String,
        /// Block title (derived from the prompt if omitted).
        #[arg(long)]
        title: Option<String>,
        /// Refresh interval in seconds (config default if omitted).
        #[arg(long)]
        refresh_interval_secs: Option<u64>,
    },
    /// Replace a block's prompt and regenerate, seeded with the current code.
    Edit { id: i64, prompt: String },
    /// Regenerate a failing block from its most recent runtime failure.
    Heal { id: i64 },
    /// Run the active version and print its payload. No generation.
    Refresh { id: i64 },
    /// Print a block record with its version lineage.
    Show { id: i64 },
    /// List all blocks.
    List,
    /// Check a block's version lineage invariants.
    Validate { id: i64 },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let store = BlockStore::new(&cli.data_dir);
    let config = load_config(&store.config_path())?;
    let locks = BlockLocks::new();

    match cli.command {
        Command::Init => {
            store.init()?;
            if !store.config_path().exists() {
                write_config(&store.config_path(), &EngineConfig::default())?;
            }
            println!("initialized {}", cli.data_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Create {
            prompt,
            title,
            refresh_interval_secs,
        } => {
            let generator = CommandGenerator::new(config.generator.command.clone());
            let sandbox = ProcessSandbox::new(config.sandbox.command.clone());
            let (block, outcome) = ops::create_block(
                &store,
                &generator,
                &sandbox,
                &config,
                &locks,
                &CreateBlockRequest {
                    prompt,
                    title,
                    refresh_interval_secs,
                },
                print_event,
            )?;
            println!("{}", serde_json::to_string_pretty(&block)?);
            Ok(cycle_exit_code(&outcome))
        }
        Command::Edit { id, prompt } => {
            let generator = CommandGenerator::new(config.generator.command.clone());
            let sandbox = ProcessSandbox::new(config.sandbox.command.clone());
            let (block, outcome) = ops::edit_block(
                &store,
                &generator,
                &sandbox,
                &config,
                &locks,
                id,
                &prompt,
                print_event,
            )?;
            println!("{}", serde_json::to_string_pretty(&block)?);
            Ok(cycle_exit_code(&outcome))
        }
        Command::Heal { id } => {
            let generator = CommandGenerator::new(config.generator.command.clone());
            let sandbox = ProcessSandbox::new(config.sandbox.command.clone());
            let (block, outcome) = ops::heal_block(
                &store,
                &generator,
                &sandbox,
                &config,
                &locks,
                id,
                print_event,
            )?;
            println!("{}", serde_json::to_string_pretty(&block)?);
            Ok(cycle_exit_code(&outcome))
        }
        Command::Refresh { id } => {
            let generator = CommandGenerator::new(config.generator.command.clone());
            let sandbox = ProcessSandbox::new(config.sandbox.command.clone());
            let outcome = ops::refresh_block(
                &store,
                &generator,
                &sandbox,
                &config,
                &locks,
                id,
                print_event,
            )?;
            match &outcome.result.payload {
                Payload::Success { value } => {
                    println!("{}", serde_json::to_string_pretty(value)?);
                    Ok(exit_codes::OK)
                }
                Payload::Failure { kind, message } => {
                    eprintln!("refresh failed ({}): {}", kind.as_str(), message);
                    Ok(exit_codes::REFRESH_FAILED)
                }
            }
        }
        Command::Show { id } => {
            let block = store.load_block(id)?;
            let versions = store.list_versions(id)?;
            let doc = serde_json::json!({ "block": block, "versions": versions });
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(exit_codes::OK)
        }
        Command::List => {
            for block in store.list_blocks().context("list blocks")? {
                println!(
                    "{:>4}  {:<10}  v{:<3}  {}",
                    block.id,
                    format!("{:?}", block.status).to_lowercase(),
                    block.current_version.unwrap_or(0),
                    block.title
                );
            }
            Ok(exit_codes::OK)
        }
        Command::Validate { id } => {
            store.load_block(id)?;
            let lineage = store.lineage(id)?;
            let errors = blocks::core::lineage::validate_lineage(&lineage);
            if errors.is_empty() {
                println!("block {id}: lineage ok ({} versions)", lineage.len());
                Ok(exit_codes::OK)
            } else {
                for error in &errors {
                    eprintln!("block {id}: {error}");
                }
                Ok(exit_codes::INVALID)
            }
        }
    }
}

fn cycle_exit_code(outcome: &CycleOutcome) -> i32 {
    match outcome.final_status {
        FinalStatus::Succeeded => exit_codes::OK,
        FinalStatus::Exhausted => exit_codes::EXHAUSTED,
    }
}

/// Render cycle progress to stderr, keeping stdout for command output.
fn print_event(event: &CycleEvent) {
    match event {
        CycleEvent::AttemptStarted { attempt, .. } => {
            eprintln!("attempt {attempt}: generating candidate");
        }
        CycleEvent::AttemptFailed {
            attempt,
            kind,
            summary,
            ..
        } => {
            eprintln!("attempt {attempt}: failed ({}) {}", kind.as_str(), summary);
        }
        CycleEvent::Succeeded { version, .. } => {
            eprintln!("promoted version {version}");
        }
        CycleEvent::Exhausted { attempts, .. } => {
            eprintln!("exhausted after {attempts} attempts");
        }
    }
}
