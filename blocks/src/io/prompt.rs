//! Prompt rendering for generator invocations.
//!
//! Templates are embedded at compile time and rendered from a cycle's
//! accumulated context. The builder template is used for create/edit cycles;
//! the healer template when a runtime failure seeds the cycle.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::context::CycleContext;
use crate::io::sandbox::ALLOWED_PACKAGES;

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const HEAL_TEMPLATE: &str = include_str!("prompts/heal.md");

/// Failure note shaped for template rendering.
#[derive(Debug, Clone, Serialize)]
struct FailureContext {
    attempt: u32,
    kind: &'static str,
    summary: String,
    remediation_hint: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("generate", GENERATE_TEMPLATE)
            .expect("generate template should be valid");
        env.add_template("heal", HEAL_TEMPLATE)
            .expect("heal template should be valid");
        Self { env }
    }

    /// Render the prompt for the given cycle context. The healer template is
    /// selected when the context carries a runtime failure to repair.
    pub fn render(&self, cycle: &CycleContext) -> Result<String> {
        match cycle.seed.runtime_failure.as_deref() {
            Some(runtime_failure) => self.render_heal(cycle, runtime_failure),
            None => self.render_generate(cycle),
        }
    }

    fn render_generate(&self, cycle: &CycleContext) -> Result<String> {
        let template = self.env.get_template("generate")?;
        let rendered = template.render(context! {
            allowed_packages => package_list(),
            task => cycle.task.trim(),
            previous_source => cycle.seed.previous_fetch_source.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            failures => failure_contexts(cycle),
        })?;
        Ok(rendered)
    }

    fn render_heal(&self, cycle: &CycleContext, runtime_failure: &str) -> Result<String> {
        let template = self.env.get_template("heal")?;
        let rendered = template.render(context! {
            allowed_packages => package_list(),
            task => cycle.task.trim(),
            failed_source => cycle.seed.previous_fetch_source.as_deref().unwrap_or("# (source unavailable)"),
            runtime_failure => runtime_failure.trim(),
            failures => failure_contexts(cycle),
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn package_list() -> String {
    ALLOWED_PACKAGES.join(", ")
}

fn failure_contexts(cycle: &CycleContext) -> Vec<FailureContext> {
    cycle
        .failures()
        .iter()
        .map(|failure| FailureContext {
            attempt: failure.attempt,
            kind: failure.kind.as_str(),
            summary: failure.summary.clone(),
            remediation_hint: failure.remediation_hint.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::{FailureNote, SeedContext};
    use crate::core::types::FailureKind;

    #[test]
    fn generate_prompt_carries_task_and_allow_list() {
        let engine = PromptEngine::new();
        let cycle = CycleContext::new("show BTC price", SeedContext::default());
        let prompt = engine.render(&cycle).expect("render");

        assert!(prompt.contains("Block Builder Contract"));
        assert!(prompt.contains("show BTC price"));
        assert!(prompt.contains("requests"));
        assert!(prompt.contains("jmespath"));
        assert!(!prompt.contains("Previous attempts"));
    }

    #[test]
    fn failures_render_oldest_first_with_hints() {
        let engine = PromptEngine::new();
        let mut cycle = CycleContext::new("show BTC price", SeedContext::default());
        cycle.push_failure(FailureNote {
            attempt: 1,
            kind: FailureKind::ExecutionError,
            summary: "first failure".to_string(),
            remediation_hint: "first hint".to_string(),
        });
        cycle.push_failure(FailureNote {
            attempt: 2,
            kind: FailureKind::Timeout,
            summary: "second failure".to_string(),
            remediation_hint: "second hint".to_string(),
        });

        let prompt = engine.render(&cycle).expect("render");
        let first = prompt.find("first failure").expect("first");
        let second = prompt.find("second failure").expect("second");
        assert!(first < second, "failure context must be oldest first");
        assert!(prompt.contains("Hint: first hint"));
        assert!(prompt.contains("Attempt 2 (timeout)"));
    }

    #[test]
    fn edit_cycles_include_the_current_source() {
        let engine = PromptEngine::new();
        let cycle = CycleContext::new(
            "also show the 24h change",
            SeedContext {
                previous_fetch_source: Some("class BlockExecutor: ...".to_string()),
                runtime_failure: None,
            },
        );
        let prompt = engine.render(&cycle).expect("render");
        assert!(prompt.contains("Current implementation"));
        assert!(prompt.contains("class BlockExecutor: ..."));
    }

    #[test]
    fn runtime_failure_selects_the_healer_template() {
        let engine = PromptEngine::new();
        let cycle = CycleContext::new(
            "show BTC price",
            SeedContext {
                previous_fetch_source: Some("class BlockExecutor: ...".to_string()),
                runtime_failure: Some("requests.exceptions.HTTPError: 403".to_string()),
            },
        );
        let prompt = engine.render(&cycle).expect("render");
        assert!(prompt.contains("Block Healer Contract"));
        assert!(prompt.contains("403"));
        assert!(prompt.contains("class BlockExecutor: ..."));
    }
}
