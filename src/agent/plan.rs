//! Plans, steps and plan admission.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use super::template;
use crate::error::{Error, Result};

/// What the executor does when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the whole plan and cancel outstanding steps.
    #[default]
    FailPlan,
    /// Mark the step failed; dependents that reference it fail too.
    Continue,
    /// Ask the planner for a replacement of the remaining work.
    Replan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    /// Qualified tool name (`<server>_<tool>`).
    pub tool: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Parse a plan out of model output, tolerating code fences and prose
/// around the JSON object.
pub fn parse_plan(text: &str) -> Result<Plan> {
    let body = extract_json_object(text)
        .ok_or_else(|| Error::Plan("planner output contains no JSON object".into()))?;
    serde_json::from_str(body).map_err(|e| Error::Plan(format!("malformed plan: {}", e)))
}

pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let text = text.trim();
    let text = match text.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
            rest.rsplit_once("```").map_or(rest, |(body, _)| body)
        }
        None => text,
    };
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Validate `plan` and normalise its dependencies.
///
/// Rejects duplicate step ids, unknown tools, `depends_on` or template
/// references naming steps that neither exist in the plan nor appear in
/// `external` (outputs already available, used when splicing a replan),
/// and cycles. Template references are merged into `depends_on`.
pub fn admit(mut plan: Plan, known_tools: &HashSet<String>, external: &HashSet<String>) -> Result<Plan> {
    let mut ids = HashSet::new();
    for step in &plan.steps {
        if step.id.trim().is_empty() {
            return Err(Error::Plan("step with empty id".into()));
        }
        if !ids.insert(step.id.clone()) || external.contains(&step.id) {
            return Err(Error::Plan(format!("duplicate step id '{}'", step.id)));
        }
    }

    for step in &mut plan.steps {
        if !known_tools.contains(&step.tool) {
            return Err(Error::Plan(format!(
                "step '{}' uses unknown tool '{}'",
                step.id, step.tool
            )));
        }
        let refs = template::references(&step.arguments)
            .map_err(|e| Error::Plan(format!("step '{}': {}", step.id, e)))?;
        for r in refs {
            if !step.depends_on.contains(&r.step) {
                step.depends_on.push(r.step);
            }
        }
        for dep in &step.depends_on {
            if !ids.contains(dep) && !external.contains(dep) {
                return Err(Error::Plan(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    topological_order(&plan.steps)?;
    Ok(plan)
}

/// Kahn's algorithm over in-plan dependencies. Returns step indices in an
/// order where every step follows its dependencies.
pub fn topological_order(steps: &[Step]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let mut indegree = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                queue.push_back(j);
            }
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<&str> = (0..steps.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| steps[i].id.as_str())
            .collect();
        return Err(Error::Plan(format!(
            "dependency cycle among steps: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools() -> HashSet<String> {
        ["demo_fetch", "demo_combine"].iter().map(|s| s.to_string()).collect()
    }

    fn dag_plan() -> Plan {
        parse_plan(
            r#"```json
            {"goal": "combine", "steps": [
              {"id": "s1", "tool": "demo_fetch", "arguments": {"url": "http://x/a"}},
              {"id": "s2", "tool": "demo_fetch", "arguments": {"url": "http://x/b"}},
              {"id": "s3", "tool": "demo_combine",
               "arguments": {"a": "{{steps.s1.output}}", "b": "{{steps.s2.output}}"}}
            ]}
            ```"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_admit_infers_dependencies() {
        let plan = admit(dag_plan(), &tools(), &HashSet::new()).unwrap();
        assert_eq!(plan.step("s3").unwrap().depends_on, vec!["s1", "s2"]);
        assert_eq!(plan.step("s1").unwrap().on_error, ErrorPolicy::FailPlan);
        let order = topological_order(&plan.steps).unwrap();
        assert_eq!(order.last(), Some(&2));
    }

    #[test]
    fn test_parse_tolerates_prose() {
        let p = parse_plan("Here is the plan: {\"goal\": \"g\", \"steps\": []} Done.").unwrap();
        assert!(p.steps.is_empty());
        assert!(matches!(parse_plan("no json here"), Err(Error::Plan(_))));
    }

    #[test]
    fn test_rejects_unknown_tool() {
        let mut plan = dag_plan();
        plan.steps[0].tool = "demo_launch".into();
        let err = admit(plan, &tools(), &HashSet::new()).unwrap_err();
        assert!(err.to_string().contains("unknown tool 'demo_launch'"));
    }

    #[test]
    fn test_rejects_missing_dependency() {
        let mut plan = dag_plan();
        plan.steps[0].depends_on = vec!["s0".into()];
        let err = admit(plan, &tools(), &HashSet::new()).unwrap_err();
        assert!(err.to_string().contains("unknown step 's0'"));

        let mut plan = dag_plan();
        plan.steps[2].arguments = json!({"a": "{{steps.s7.output}}"});
        assert!(admit(plan, &tools(), &HashSet::new()).is_err());
    }

    #[test]
    fn test_rejects_cycles() {
        let mut plan = dag_plan();
        plan.steps[0].depends_on = vec!["s3".into()];
        let err = admit(plan, &tools(), &HashSet::new()).unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let mut plan = dag_plan();
        plan.steps[1].depends_on = vec!["s2".into()];
        assert!(admit(plan, &tools(), &HashSet::new()).is_err());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut plan = dag_plan();
        plan.steps[1].id = "s1".into();
        assert!(admit(plan, &tools(), &HashSet::new()).is_err());
    }

    #[test]
    fn test_external_references_allowed_for_splices() {
        let sub = Plan {
            goal: "retry".into(),
            steps: vec![Step {
                id: "r1".into(),
                tool: "demo_combine".into(),
                description: String::new(),
                arguments: json!({"a": "{{steps.s2.output}}", "b": "fallback"}),
                depends_on: Vec::new(),
                on_error: ErrorPolicy::FailPlan,
            }],
        };
        let external: HashSet<String> = ["s2".to_string()].into_iter().collect();
        let admitted = admit(sub.clone(), &tools(), &external).unwrap();
        assert_eq!(admitted.steps[0].depends_on, vec!["s2"]);
        assert!(admit(sub, &tools(), &HashSet::new()).is_err());
    }
}
