//! LLM planner: turns a goal and the tool registry into a [`Plan`].

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;

use super::executor::{ReplanRequest, Replanner, StepStatus};
use super::plan::{admit, parse_plan, Plan};
use crate::error::{Error, Result};
use crate::models::ToolDescriptor;
use crate::orchestrator::Orchestrator;
use crate::provider::{assistant_message, system_message, user_message, ChatMessage, GenerateOptions};
use crate::scope::Scope;

const PLAN_FORMAT: &str = r#"Reply with a single JSON object and nothing else:
{"goal": "<goal>", "steps": [
  {"id": "s1", "tool": "<tool name>", "description": "<why>",
   "arguments": {...}, "depends_on": [], "on_error": "fail_plan"}
]}
Rules:
- Use only the tools listed above, by their exact names.
- Step ids are unique. depends_on lists ids of earlier steps.
- To pass one step's result to another, write "{{steps.<id>.output}}"
  (optionally followed by .<field> to select a field) inside an argument.
- on_error is one of "fail_plan", "continue", "replan".
- Prefer independent steps where possible; they run in parallel."#;

pub struct Planner {
    orchestrator: Orchestrator,
    options: GenerateOptions,
}

impl Planner {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            options: GenerateOptions {
                temperature: Some(0.0),
                ..GenerateOptions::default()
            },
        }
    }

    /// Ask the model for a plan for `goal`. The returned plan is admitted
    /// against the current tool registry; one repair round is attempted
    /// when the first answer is unusable.
    pub async fn plan(&self, goal: &str, scope: &Scope) -> Result<Plan> {
        let tools = self.orchestrator.tools().tools();
        let messages = vec![
            system_message(&planner_prompt(&tools)),
            user_message(&format!("Goal: {}", goal)),
        ];
        self.request(messages, &tools, &HashSet::new(), scope).await
    }

    async fn request(
        &self,
        mut messages: Vec<ChatMessage>,
        tools: &[ToolDescriptor],
        external: &HashSet<String>,
        scope: &Scope,
    ) -> Result<Plan> {
        let known: HashSet<String> = tools.iter().map(|t| t.qualified_name()).collect();
        let mut repaired = false;
        loop {
            let completion = self
                .orchestrator
                .generate(scope, &messages, &self.options)
                .await?;
            match parse_plan(&completion.content).and_then(|p| admit(p, &known, external)) {
                Ok(plan) => {
                    tracing::info!(steps = plan.steps.len(), repaired, "plan accepted");
                    return Ok(plan);
                }
                Err(Error::Plan(reason)) if !repaired => {
                    tracing::info!(reason = %reason, "plan rejected, asking for a repair");
                    repaired = true;
                    messages.push(assistant_message(&completion.content, Vec::new()));
                    messages.push(user_message(&format!(
                        "That plan was rejected: {}. Reply with a corrected plan as a single JSON object.",
                        reason
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Replanner for Planner {
    async fn replan(&self, request: ReplanRequest<'_>, scope: &Scope) -> Result<Plan> {
        let tools = self.orchestrator.tools().tools();
        let done: Vec<_> = request
            .results
            .iter()
            .filter(|r| r.status == StepStatus::Completed)
            .map(|r| json!({"id": r.step_id, "tool": r.tool, "output": r.output}))
            .collect();
        let available: HashSet<String> = request
            .results
            .iter()
            .filter(|r| matches!(r.status, StepStatus::Completed | StepStatus::Running))
            .map(|r| r.step_id.clone())
            .collect();
        let taken: Vec<&str> = request.plan.steps.iter().map(|s| s.id.as_str()).collect();

        let prompt = format!(
            "Goal: {goal}\n\nStep '{id}' ({tool}) failed: {error}\n\n\
             Completed steps and their outputs:\n{done}\n\n\
             Plan the remaining work. You may reference completed steps with \
             {{{{steps.<id>.output}}}}. Do not reuse these step ids: {taken}.",
            goal = request.plan.goal,
            id = request.failed_step.id,
            tool = request.failed_step.tool,
            error = request.error,
            done = serde_json::to_string_pretty(&done).unwrap_or_default(),
            taken = taken.join(", "),
        );
        let messages = vec![system_message(&planner_prompt(&tools)), user_message(&prompt)];
        self.request(messages, &tools, &available, scope).await
    }
}

fn planner_prompt(tools: &[ToolDescriptor]) -> String {
    let mut out = String::from(
        "You are a planner. Break the user's goal into tool invocations.\n\nAvailable tools:\n",
    );
    for t in tools {
        out.push_str(&format!(
            "- {}: {}\n  arguments schema: {}\n",
            t.qualified_name(),
            t.description,
            t.input_schema
        ));
    }
    if tools.is_empty() {
        out.push_str("(none)\n");
    }
    out.push('\n');
    out.push_str(PLAN_FORMAT);
    out
}
