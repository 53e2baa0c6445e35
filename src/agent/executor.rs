//! DAG executor for admitted plans.
//!
//! A step is considered once all of its dependencies are terminal. It is
//! launched in plan order, up to the parallelism cap, with its own deadline
//! only if every dependency completed; otherwise it fails without running,
//! and that failure carries on to its own dependents. Failures of launched
//! steps are handled per the step's [`ErrorPolicy`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};

use super::plan::{admit, ErrorPolicy, Plan, Step};
use super::template;
use crate::broker::ToolInvoker;
use crate::config::AgentConfig;
use crate::error::{Result, ToolError};
use crate::scope::Scope;

const MAX_PARALLELISM: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Never started: the plan failed or a replan superseded it.
    Skipped,
}

impl StepStatus {
    fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Completed,
    /// Finished with some steps failed under the `continue` policy.
    PartiallyCompleted,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub tool: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Summary of one plan execution.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRun {
    pub goal: String,
    pub status: PlanStatus,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub replans: u32,
}

impl PlanRun {
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == id)
    }
}

/// What the planner gets when a `replan` step fails.
pub struct ReplanRequest<'a> {
    pub plan: &'a Plan,
    pub results: &'a [StepResult],
    pub failed_step: &'a Step,
    pub error: &'a str,
}

#[async_trait]
pub trait Replanner: Send + Sync {
    /// Produce a sub-plan for the remaining work.
    async fn replan(&self, request: ReplanRequest<'_>, scope: &Scope) -> Result<Plan>;
}

pub struct Executor {
    tools: Arc<dyn ToolInvoker>,
    parallelism: usize,
    step_timeout: Duration,
    replan_budget: u32,
}

type Joined = (usize, std::result::Result<Value, ToolError>, DateTime<Utc>);

struct Slot {
    step: Step,
    result: StepResult,
}

impl Slot {
    fn new(step: Step) -> Self {
        let result = StepResult {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
        };
        Self { step, result }
    }

    fn fail(&mut self, message: String) {
        self.result.status = StepStatus::Failed;
        self.result.error = Some(message);
        if self.result.finished_at.is_none() {
            self.result.finished_at = Some(Utc::now());
        }
    }
}

enum Prepared {
    Run(Value),
    /// A dependency ended without completing.
    Blocked(String),
    Invalid(String),
}

struct Run<'a> {
    tools: Arc<dyn ToolInvoker>,
    known: HashSet<String>,
    step_timeout: Duration,
    replan_budget: u32,
    replanner: Option<&'a dyn Replanner>,
    goal: String,
    scope: Scope,
    slots: Vec<Slot>,
    outputs: HashMap<String, Value>,
    join: JoinSet<Joined>,
    errors: Vec<String>,
    replans: u32,
    failed: bool,
}

impl Executor {
    pub fn new(tools: Arc<dyn ToolInvoker>, config: &AgentConfig) -> Self {
        Self {
            tools,
            parallelism: config.parallelism,
            step_timeout: Duration::from_secs(config.step_timeout_secs),
            replan_budget: config.replan_budget,
        }
    }

    /// Admit and run `plan`. Errors only on admission; step failures and
    /// cancellation are reported in the returned [`PlanRun`].
    pub async fn execute(
        &self,
        plan: Plan,
        scope: &Scope,
        replanner: Option<&dyn Replanner>,
    ) -> Result<PlanRun> {
        let known: HashSet<String> = self.tools.tools().iter().map(|d| d.qualified_name()).collect();
        let plan = admit(plan, &known, &HashSet::new())?;
        let cap = self
            .parallelism
            .clamp(1, MAX_PARALLELISM)
            .min(plan.steps.len().max(1));

        tracing::info!(goal = %plan.goal, steps = plan.steps.len(), parallelism = cap, "executing plan");
        let mut run = Run {
            tools: Arc::clone(&self.tools),
            known,
            step_timeout: self.step_timeout,
            replan_budget: self.replan_budget,
            replanner,
            goal: plan.goal,
            scope: scope.child(),
            slots: plan.steps.into_iter().map(Slot::new).collect(),
            outputs: HashMap::new(),
            join: JoinSet::new(),
            errors: Vec::new(),
            replans: 0,
            failed: false,
        };

        loop {
            let mut progressed = false;
            while !run.failed && !scope.is_cancelled() && run.join.len() < cap {
                let Some(i) = run.next_ready() else {
                    break;
                };
                progressed = true;
                match run.prepare(i) {
                    Prepared::Run(args) => run.launch(i, args),
                    Prepared::Blocked(msg) => {
                        tracing::info!(step = %run.slots[i].step.id, reason = %msg, "step blocked");
                        run.errors.push(format!("step '{}': {}", run.slots[i].step.id, msg));
                        run.slots[i].fail(msg);
                    }
                    Prepared::Invalid(msg) => {
                        run.slots[i].fail(msg.clone());
                        run.on_failure(i, msg).await;
                    }
                }
            }
            if run.failed {
                break;
            }
            if run.join.is_empty() {
                if progressed && !scope.is_cancelled() {
                    continue;
                }
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = scope.token().cancelled() => None,
                res = run.join.join_next() => res,
            };
            match joined {
                Some(res) => run.on_joined(res).await,
                None => break,
            }
        }

        if scope.is_cancelled() {
            tracing::info!(goal = %run.goal, "plan cancelled");
            run.abort().await;
            return Ok(run.finish(PlanStatus::Cancelled));
        }
        let status = if run.failed {
            PlanStatus::Failed
        } else if run
            .slots
            .iter()
            .all(|s| s.result.status == StepStatus::Completed)
        {
            PlanStatus::Completed
        } else {
            PlanStatus::PartiallyCompleted
        };
        Ok(run.finish(status))
    }
}

impl Run<'_> {
    fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.slots
            .iter()
            .find(|s| s.step.id == id)
            .map(|s| s.result.status)
    }

    fn next_ready(&self) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.result.status == StepStatus::Pending
                && s.step
                    .depends_on
                    .iter()
                    .all(|d| self.status_of(d).map_or(true, StepStatus::is_terminal))
        })
    }

    fn prepare(&self, i: usize) -> Prepared {
        let step = &self.slots[i].step;
        if let Some(dep) = step
            .depends_on
            .iter()
            .find(|d| self.status_of(d).is_some_and(|s| s != StepStatus::Completed))
        {
            return Prepared::Blocked(format!("dependency '{}' did not complete", dep));
        }
        match template::resolve(&step.arguments, &self.outputs) {
            Ok(args) => Prepared::Run(args),
            Err(e) => Prepared::Invalid(e),
        }
    }

    fn launch(&mut self, i: usize, args: Value) {
        let slot = &mut self.slots[i];
        slot.result.status = StepStatus::Running;
        slot.result.started_at = Some(Utc::now());
        tracing::debug!(step = %slot.step.id, tool = %slot.step.tool, "step started");

        let tools = Arc::clone(&self.tools);
        let tool = slot.step.tool.clone();
        let step_scope = self.scope.child_with_timeout(self.step_timeout);
        self.join.spawn(async move {
            let outcome = tools.call(&tool, args, &step_scope).await;
            (i, outcome, Utc::now())
        });
    }

    async fn on_joined(&mut self, res: std::result::Result<Joined, JoinError>) {
        let (i, outcome, finished_at) = match res {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(error = %e, "step task aborted");
                return;
            }
        };
        self.slots[i].result.finished_at = Some(finished_at);
        let id = self.slots[i].step.id.clone();
        match outcome {
            Ok(output) => {
                tracing::debug!(step = %id, "step completed");
                self.outputs.insert(id, output.clone());
                let slot = &mut self.slots[i];
                slot.result.status = StepStatus::Completed;
                slot.result.output = Some(output);
            }
            Err(ToolError::Cancelled) if self.scope.is_cancelled() => {
                self.slots[i].result.status = StepStatus::Cancelled;
            }
            Err(e) => {
                let msg = e.to_string();
                tracing::info!(step = %id, error = %msg, "step failed");
                self.slots[i].fail(msg.clone());
                self.on_failure(i, msg).await;
            }
        }
    }

    async fn on_failure(&mut self, i: usize, msg: String) {
        let id = self.slots[i].step.id.clone();
        match self.slots[i].step.on_error {
            ErrorPolicy::Continue => {
                self.errors.push(format!("step '{}' failed: {}", id, msg));
            }
            ErrorPolicy::FailPlan => {
                self.fail_plan(format!("step '{}' failed: {}", id, msg)).await;
            }
            ErrorPolicy::Replan => {
                self.errors.push(format!("step '{}' failed: {}", id, msg));
                if let Err(reason) = self.try_replan(i, &msg).await {
                    self.fail_plan(reason).await;
                }
            }
        }
    }

    async fn fail_plan(&mut self, cause: String) {
        tracing::warn!(goal = %self.goal, cause = %cause, "plan failed");
        self.errors.push(cause);
        self.failed = true;
        self.abort().await;
    }

    /// Cancel in-flight steps, collect them, and skip what never started.
    async fn abort(&mut self) {
        self.scope.cancel();
        while let Some(res) = self.join.join_next().await {
            let Ok((i, outcome, finished_at)) = res else {
                continue;
            };
            let slot = &mut self.slots[i];
            slot.result.finished_at = Some(finished_at);
            match outcome {
                Ok(output) => {
                    slot.result.status = StepStatus::Completed;
                    slot.result.output = Some(output);
                }
                Err(ToolError::Cancelled) => slot.result.status = StepStatus::Cancelled,
                Err(e) => slot.fail(e.to_string()),
            }
        }
        for slot in &mut self.slots {
            match slot.result.status {
                StepStatus::Pending => slot.result.status = StepStatus::Skipped,
                StepStatus::Running => slot.result.status = StepStatus::Cancelled,
                _ => {}
            }
        }
    }

    async fn try_replan(&mut self, i: usize, msg: &str) -> std::result::Result<(), String> {
        let Some(replanner) = self.replanner else {
            return Err(format!("step '{}' requested a replan but no planner is attached", self.slots[i].step.id));
        };
        if self.replans >= self.replan_budget {
            return Err(format!("replan budget of {} exhausted", self.replan_budget));
        }
        self.replans += 1;

        let current = Plan {
            goal: self.goal.clone(),
            steps: self.slots.iter().map(|s| s.step.clone()).collect(),
        };
        let results: Vec<StepResult> = self.slots.iter().map(|s| s.result.clone()).collect();
        let failed_step = self.slots[i].step.clone();
        let request = ReplanRequest {
            plan: &current,
            results: &results,
            failed_step: &failed_step,
            error: msg,
        };
        let sub = replanner
            .replan(request, &self.scope)
            .await
            .map_err(|e| format!("replan failed: {}", e))?;

        let available: HashSet<String> = self
            .slots
            .iter()
            .filter(|s| matches!(s.result.status, StepStatus::Completed | StepStatus::Running))
            .map(|s| s.step.id.clone())
            .collect();
        let sub = admit(sub, &self.known, &available)
            .map_err(|e| format!("replanned steps rejected: {}", e))?;
        if let Some(dup) = sub
            .steps
            .iter()
            .find(|s| self.slots.iter().any(|x| x.step.id == s.id))
        {
            return Err(format!("replanned step id '{}' collides with an existing step", dup.id));
        }

        for slot in &mut self.slots {
            if slot.result.status == StepStatus::Pending {
                slot.result.status = StepStatus::Skipped;
                slot.result.error = Some("superseded by replan".into());
            }
        }
        tracing::info!(replan = self.replans, steps = sub.steps.len(), "spliced replanned steps");
        self.slots.extend(sub.steps.into_iter().map(Slot::new));
        Ok(())
    }

    fn finish(mut self, status: PlanStatus) -> PlanRun {
        for slot in &mut self.slots {
            if slot.result.status == StepStatus::Running {
                slot.fail("step task ended unexpectedly".into());
            }
        }
        tracing::info!(goal = %self.goal, status = ?status, replans = self.replans, "plan finished");
        PlanRun {
            goal: self.goal,
            status,
            steps: self.slots.into_iter().map(|s| s.result).collect(),
            errors: self.errors,
            replans: self.replans,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::parse_plan;
    use crate::models::ToolDescriptor;
    use crate::scope::Interrupted;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// `fetch(url, delay_ms)` returns `"content of <url>"` after the delay
    /// and fails for URLs containing "fail"; `combine(a, b)` joins with `+`.
    #[derive(Default)]
    struct DemoTools {
        active: AtomicUsize,
        peak: AtomicUsize,
        invoked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolInvoker for DemoTools {
        fn tools(&self) -> Vec<ToolDescriptor> {
            ["fetch", "combine"]
                .iter()
                .map(|t| ToolDescriptor {
                    server_name: "demo".into(),
                    tool_name: t.to_string(),
                    description: String::new(),
                    input_schema: json!({"type": "object"}),
                })
                .collect()
        }

        async fn call(&self, tool: &str, args: Value, scope: &Scope) -> std::result::Result<Value, ToolError> {
            self.invoked.lock().unwrap().push(tool.to_string());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = Duration::from_millis(args["delay_ms"].as_u64().unwrap_or(50));
            let slept = scope.run(tokio::time::sleep(delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            match slept {
                Err(Interrupted::Cancelled) => return Err(ToolError::Cancelled),
                Err(Interrupted::DeadlineExceeded) => return Err(ToolError::Timeout { tool: tool.into() }),
                Ok(()) => {}
            }
            match tool {
                "demo_fetch" => {
                    let url = args["url"].as_str().unwrap_or_default();
                    if url.contains("fail") {
                        Err(ToolError::ExecutionFailed {
                            code: -32000,
                            message: format!("cannot fetch {}", url),
                        })
                    } else {
                        Ok(json!(format!("content of {}", url)))
                    }
                }
                "demo_combine" => Ok(json!(format!(
                    "{}+{}",
                    args["a"].as_str().unwrap_or_default(),
                    args["b"].as_str().unwrap_or_default()
                ))),
                other => Err(ToolError::UnknownTool(other.into())),
            }
        }
    }

    fn executor(tools: Arc<DemoTools>, parallelism: usize) -> Executor {
        let config = AgentConfig {
            parallelism,
            ..AgentConfig::default()
        };
        Executor::new(tools, &config)
    }

    fn dag(s1_url: &str, s1_policy: &str) -> Plan {
        parse_plan(&format!(
            r#"{{"goal": "combine two pages", "steps": [
                {{"id": "s1", "tool": "demo_fetch", "arguments": {{"url": "{}", "delay_ms": 10}}, "on_error": "{}"}},
                {{"id": "s2", "tool": "demo_fetch", "arguments": {{"url": "http://x/b", "delay_ms": 500}}}},
                {{"id": "s3", "tool": "demo_combine",
                  "arguments": {{"a": "{{{{steps.s1.output}}}}", "b": "{{{{steps.s2.output}}}}"}}}}
            ]}}"#,
            s1_url, s1_policy
        ))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_dag_runs_dependencies_first() {
        let tools = Arc::new(DemoTools::default());
        let run = executor(tools.clone(), 8)
            .execute(dag("http://x/a", "fail_plan"), &Scope::new(Duration::from_secs(60)), None)
            .await
            .unwrap();

        assert_eq!(run.status, PlanStatus::Completed);
        let s1 = run.step("s1").unwrap();
        let s2 = run.step("s2").unwrap();
        let s3 = run.step("s3").unwrap();
        // s1 and s2 overlapped.
        assert!(s1.started_at.unwrap() <= s2.finished_at.unwrap());
        assert!(s2.started_at.unwrap() <= s1.finished_at.unwrap());
        assert_eq!(tools.peak.load(Ordering::SeqCst), 2);
        // s3 waited for both.
        assert!(s3.started_at.unwrap() >= s1.finished_at.unwrap());
        assert!(s3.started_at.unwrap() >= s2.finished_at.unwrap());
        assert_eq!(
            s3.output.as_ref().unwrap(),
            &json!("content of http://x/a+content of http://x/b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_plan_cancels_in_flight_and_skips_dependents() {
        let tools = Arc::new(DemoTools::default());
        let run = executor(tools.clone(), 8)
            .execute(dag("http://x/fail", "fail_plan"), &Scope::new(Duration::from_secs(60)), None)
            .await
            .unwrap();

        assert_eq!(run.status, PlanStatus::Failed);
        assert_eq!(run.step("s1").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("s2").unwrap().status, StepStatus::Cancelled);
        let s3 = run.step("s3").unwrap();
        assert_eq!(s3.status, StepStatus::Skipped);
        assert!(s3.started_at.is_none());
        assert!(!tools.invoked.lock().unwrap().contains(&"demo_combine".to_string()));
        assert!(run.errors[0].contains("cannot fetch http://x/fail"));
    }

    /// Every completed step started no earlier than its dependencies finished.
    fn assert_started_after_dependencies(run: &PlanRun, deps: &[(&str, &[&str])]) {
        for (id, ds) in deps {
            let step = run.step(id).unwrap();
            if step.status != StepStatus::Completed {
                continue;
            }
            for d in ds.iter() {
                let dep = run.step(d).unwrap();
                assert_eq!(dep.status, StepStatus::Completed, "{} ran although {} did not complete", id, d);
                assert!(step.started_at.unwrap() >= dep.finished_at.unwrap(), "{} started before {} finished", id, d);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_fails_dependents_transitively() {
        let plan = parse_plan(
            r#"{"goal": "g", "steps": [
                {"id": "s1", "tool": "demo_fetch", "arguments": {"url": "http://x/fail"}, "on_error": "continue"},
                {"id": "s2", "tool": "demo_fetch", "arguments": {"url": "http://x/b"}},
                {"id": "s3", "tool": "demo_combine", "arguments": {"a": "{{steps.s1.output}}", "b": "{{steps.s2.output}}"}},
                {"id": "s4", "tool": "demo_fetch", "arguments": {"url": "http://x/after"}, "depends_on": ["s1"]},
                {"id": "s5", "tool": "demo_fetch", "arguments": {"url": "http://x/later"}, "depends_on": ["s4"]},
                {"id": "s6", "tool": "demo_fetch", "arguments": {"url": "http://x/c"}, "depends_on": ["s2"]}
            ]}"#,
        )
        .unwrap();
        let tools = Arc::new(DemoTools::default());
        let run = executor(tools.clone(), 8)
            .execute(plan, &Scope::new(Duration::from_secs(60)), None)
            .await
            .unwrap();

        assert_eq!(run.status, PlanStatus::PartiallyCompleted);
        assert_eq!(run.step("s1").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("s2").unwrap().status, StepStatus::Completed);
        assert_eq!(run.step("s6").unwrap().status, StepStatus::Completed);
        for (id, dep) in [("s3", "s1"), ("s4", "s1"), ("s5", "s4")] {
            let step = run.step(id).unwrap();
            assert_eq!(step.status, StepStatus::Failed, "{}", id);
            assert!(step.started_at.is_none(), "{} ran", id);
            assert!(step.error.as_deref().unwrap().contains(&format!("dependency '{}'", dep)));
        }

        let invoked = tools.invoked.lock().unwrap().clone();
        assert!(!invoked.contains(&"demo_combine".to_string()));
        // s1, s2 and s6 only.
        assert_eq!(invoked.len(), 3);
        assert_started_after_dependencies(
            &run,
            &[("s3", &["s1", "s2"]), ("s4", &["s1"]), ("s5", &["s4"]), ("s6", &["s2"])],
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_chain_waits_for_each_dependency() {
        let plan = parse_plan(
            r#"{"goal": "g", "steps": [
                {"id": "a", "tool": "demo_fetch", "arguments": {"url": "http://x/a", "delay_ms": 300}, "on_error": "continue"},
                {"id": "b", "tool": "demo_fetch", "arguments": {"url": "http://x/fail", "delay_ms": 10}, "on_error": "continue"},
                {"id": "c", "tool": "demo_fetch", "arguments": {"url": "http://x/c", "delay_ms": 20}, "depends_on": ["a"], "on_error": "continue"},
                {"id": "d", "tool": "demo_combine", "arguments": {"a": "{{steps.a.output}}", "b": "{{steps.c.output}}"}, "on_error": "continue"}
            ]}"#,
        )
        .unwrap();
        let tools = Arc::new(DemoTools::default());
        let run = executor(tools, 8)
            .execute(plan, &Scope::new(Duration::from_secs(60)), None)
            .await
            .unwrap();

        assert_eq!(run.status, PlanStatus::PartiallyCompleted);
        assert_eq!(run.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("c").unwrap().status, StepStatus::Completed);
        assert_eq!(
            run.step("d").unwrap().output.as_ref().unwrap(),
            &json!("content of http://x/a+content of http://x/c")
        );
        assert_started_after_dependencies(&run, &[("c", &["a"]), ("d", &["a", "c"])]);
    }

    struct MirrorPlanner {
        calls: AtomicUsize,
        url: String,
    }

    #[async_trait]
    impl Replanner for MirrorPlanner {
        async fn replan(&self, request: ReplanRequest<'_>, _scope: &Scope) -> Result<Plan> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(request.failed_step.tool, "demo_fetch");
            assert!(request.error.contains("cannot fetch"));
            parse_plan(&format!(
                r#"{{"goal": "retry", "steps": [
                    {{"id": "m{n}", "tool": "demo_fetch", "arguments": {{"url": "{url}"}}, "on_error": "replan"}},
                    {{"id": "c{n}", "tool": "demo_combine",
                      "arguments": {{"a": "{{{{steps.m{n}.output}}}}", "b": "{{{{steps.s2.output}}}}"}}}}
                ]}}"#,
                n = n,
                url = self.url
            ))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replan_splices_sub_plan() {
        let tools = Arc::new(DemoTools::default());
        let planner = MirrorPlanner {
            calls: AtomicUsize::new(0),
            url: "http://mirror/a".into(),
        };
        let run = executor(tools, 8)
            .execute(dag("http://x/fail", "replan"), &Scope::new(Duration::from_secs(60)), Some(&planner))
            .await
            .unwrap();

        assert_eq!(run.replans, 1);
        assert_eq!(run.step("s1").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("s3").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            run.step("c1").unwrap().output.as_ref().unwrap(),
            &json!("content of http://mirror/a+content of http://x/b")
        );
        assert_eq!(run.status, PlanStatus::PartiallyCompleted);
        assert_started_after_dependencies(&run, &[("s3", &["s1", "s2"]), ("c1", &["m1", "s2"])]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replan_budget_bounds_retries() {
        let tools = Arc::new(DemoTools::default());
        let planner = MirrorPlanner {
            calls: AtomicUsize::new(0),
            url: "http://mirror/fail".into(),
        };
        let run = executor(tools, 8)
            .execute(dag("http://x/fail", "replan"), &Scope::new(Duration::from_secs(60)), Some(&planner))
            .await
            .unwrap();
        assert_eq!(run.replans, 2);
        assert_eq!(planner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.status, PlanStatus::Failed);
        assert!(run.errors.iter().any(|e| e.contains("budget")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallelism_cap() {
        let steps: Vec<String> = (0..5)
            .map(|i| {
                format!(
                    r#"{{"id": "f{}", "tool": "demo_fetch", "arguments": {{"url": "http://x/{}"}}}}"#,
                    i, i
                )
            })
            .collect();
        let plan = parse_plan(&format!(r#"{{"goal": "g", "steps": [{}]}}"#, steps.join(","))).unwrap();
        let tools = Arc::new(DemoTools::default());
        let run = executor(tools.clone(), 2)
            .execute(plan, &Scope::new(Duration::from_secs(60)), None)
            .await
            .unwrap();
        assert_eq!(run.status, PlanStatus::Completed);
        assert_eq!(tools.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cancel_marks_running_cancelled() {
        let tools = Arc::new(DemoTools::default());
        let scope = Scope::new(Duration::from_secs(60));
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let run = executor(tools, 8)
            .execute(dag("http://x/a", "fail_plan"), &scope, None)
            .await
            .unwrap();
        assert_eq!(run.status, PlanStatus::Cancelled);
        assert_eq!(run.step("s1").unwrap().status, StepStatus::Completed);
        assert_eq!(run.step("s2").unwrap().status, StepStatus::Cancelled);
        assert_eq!(run.step("s3").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_admission_failure_is_an_error() {
        let plan = parse_plan(r#"{"goal": "g", "steps": [{"id": "a", "tool": "demo_launch"}]}"#).unwrap();
        let tools = Arc::new(DemoTools::default());
        assert!(executor(tools, 8)
            .execute(plan, &Scope::new(Duration::from_secs(5)), None)
            .await
            .is_err());
    }
}
