//! Plan-and-execute agent.
//!
//! ```text
//! goal ──▶ Planner (LLM, no tool execution) ──▶ Plan
//!      ──▶ admit (tools known, deps exist, acyclic)
//!      ──▶ Executor (ready-set, parallel, per-step error policy)
//!      ──▶ PlanRun
//! ```

pub mod executor;
pub mod plan;
pub mod planner;
pub mod template;

use std::sync::Arc;

use crate::broker::ToolInvoker;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::scope::Scope;

pub use executor::{Executor, PlanRun, PlanStatus, ReplanRequest, Replanner, StepResult, StepStatus};
pub use plan::{admit, parse_plan, ErrorPolicy, Plan, Step};
pub use planner::Planner;

pub struct Agent {
    planner: Planner,
    executor: Executor,
}

/// A goal's plan and how its execution went.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentRun {
    pub plan: Plan,
    pub run: PlanRun,
}

impl Agent {
    pub fn new(orchestrator: Orchestrator, config: &AgentConfig) -> Self {
        let tools: Arc<dyn ToolInvoker> = Arc::clone(orchestrator.tools());
        Self {
            executor: Executor::new(tools, config),
            planner: Planner::new(orchestrator),
        }
    }

    pub async fn run(&self, goal: &str, scope: &Scope) -> Result<AgentRun> {
        let plan = self.planner.plan(goal, scope).await?;
        let run = self
            .executor
            .execute(plan.clone(), scope, Some(&self.planner))
            .await?;
        Ok(AgentRun { plan, run })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::tests::FakeTools;
    use crate::orchestrator::tests::{orchestrator, text, ScriptedClient};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_goal_runs_to_completion() {
        let client = ScriptedClient::new(|_, _| {
            text(
                r#"{"goal": "shout", "steps": [
                    {"id": "a", "tool": "demo_echo", "arguments": {"text": "hi"}},
                    {"id": "b", "tool": "demo_upper", "arguments": {"text": "{{steps.a.output.text}}"}}
                ]}"#,
            )
        });
        let tools = Arc::new(FakeTools::new(&["demo_echo", "demo_upper"], |name, args| {
            if name == "demo_upper" {
                Ok(json!(args["text"].as_str().unwrap_or_default().to_uppercase()))
            } else {
                Ok(args.clone())
            }
        }));
        let agent = Agent::new(orchestrator(client, tools), &AgentConfig::default());
        let out = agent.run("shout", &Scope::new(Duration::from_secs(10))).await.unwrap();
        assert_eq!(out.run.status, PlanStatus::Completed);
        assert_eq!(out.run.step("b").unwrap().output, Some(json!("HI")));
    }
}
