use crate::types::{GraphState, Task, TaskOutcome, TaskSpec, TaskState};
use chrono::Utc;
use paperflow_core::{PaperflowError, PaperflowResult};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Retries granted to tasks that set no budget of their own.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Collects task specs and validates them into a [`TaskGraph`].
#[derive(Debug, Default)]
pub struct TaskGraphBuilder {
    correlation_id: Option<Uuid>,
    specs: Vec<TaskSpec>,
}

impl TaskGraphBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-chosen correlation id instead of a fresh one.
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Append a task spec.
    pub fn add_task(&mut self, spec: TaskSpec) -> &mut Self {
        self.specs.push(spec);
        self
    }

    /// Chaining form of [`add_task`](Self::add_task).
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Validate and freeze the graph.
    ///
    /// Rejects duplicate ids, edges to unknown tasks and cycles (self-loops
    /// included). Tasks are stored in a topological order; ties keep
    /// insertion order.
    pub fn build(self) -> PaperflowResult<TaskGraph> {
        let mut position: HashMap<&str, usize> = HashMap::with_capacity(self.specs.len());
        for (i, spec) in self.specs.iter().enumerate() {
            if position.insert(spec.id.as_str(), i).is_some() {
                return Err(PaperflowError::DuplicateTask(spec.id.clone()));
            }
        }

        let n = self.specs.len();
        let mut in_degree = vec![0usize; n];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, spec) in self.specs.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in spec.depends_on.iter().chain(&spec.optional_depends_on) {
                let Some(&j) = position.get(dep.as_str()) else {
                    return Err(PaperflowError::UnknownDependency {
                        task: spec.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if seen.insert(j) {
                    in_degree[i] += 1;
                    downstream[j].push(i);
                }
            }
        }

        // Kahn: whatever is never released sits on or behind a cycle
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &downstream[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        if order.len() < n {
            let stuck = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.specs[i].id.clone())
                .collect();
            return Err(PaperflowError::CyclicDependency(stuck));
        }

        let mut slots: Vec<Option<TaskSpec>> = self.specs.into_iter().map(Some).collect();
        let tasks: Vec<Task> = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .map(Task::from)
            .collect();
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let mut graph = TaskGraph {
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            tasks,
            index,
            default_max_retries: DEFAULT_MAX_RETRIES,
        };
        graph.refresh_readiness();
        Ok(graph)
    }
}

/// A validated task DAG and its state machine.
///
/// Only the orchestrator driving a run mutates the graph; every transition
/// goes through [`mark_running`](Self::mark_running),
/// [`advance`](Self::advance) or [`skip_unfinished`](Self::skip_unfinished).
#[derive(Debug, Clone)]
pub struct TaskGraph {
    correlation_id: Uuid,
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    default_max_retries: u32,
}

impl TaskGraph {
    /// Start building a graph.
    pub fn builder() -> TaskGraphBuilder {
        TaskGraphBuilder::new()
    }

    /// Id shared by every log line and usage record of this run.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Retry budget for tasks that do not set their own.
    pub fn set_default_max_retries(&mut self, retries: u32) {
        self.default_max_retries = retries;
    }

    /// Retries `task` may consume before it is marked failed.
    pub fn retry_budget(&self, task: &Task) -> u32 {
        task.max_retries.unwrap_or(self.default_max_retries)
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Look up a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Tasks in topological order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Task ids in topological order.
    pub fn order(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    /// Current state of a task, `None` for unknown ids.
    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        self.get(id).map(|t| t.state)
    }

    fn is_dispatchable(&self, task: &Task) -> bool {
        let hard_ok = task
            .depends_on
            .iter()
            .all(|d| self.state_of(d) == Some(TaskState::Succeeded));
        let optional_ok = task
            .optional_depends_on
            .iter()
            .all(|d| self.state_of(d).is_some_and(|s| s.is_terminal()));
        hard_ok && optional_ok
    }

    fn refresh_readiness(&mut self) {
        let promote: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TaskState::Pending && self.is_dispatchable(t))
            .map(|(i, _)| i)
            .collect();
        for i in promote {
            self.tasks[i].state = TaskState::Ready;
        }
    }

    /// Ids of tasks whose dependencies allow dispatch now, in topological order.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| {
                matches!(t.state, TaskState::Pending | TaskState::Ready) && self.is_dispatchable(t)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// `Ready | Retrying -> Running`. Returns false when the transition is invalid.
    pub fn mark_running(&mut self, id: &str) -> bool {
        let Some(&i) = self.index.get(id) else {
            return false;
        };
        let ready = matches!(self.tasks[i].state, TaskState::Pending | TaskState::Ready)
            && self.is_dispatchable(&self.tasks[i]);
        let task = &mut self.tasks[i];
        if !(ready || task.state == TaskState::Retrying) {
            return false;
        }
        task.state = TaskState::Running;
        task.attempts += 1;
        if task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        true
    }

    /// Apply the outcome of a running task's attempt and return its new state.
    ///
    /// A failure that exhausts the retry budget (or is not retryable) marks
    /// the task `Failed` and skips everything downstream of it through hard
    /// edges. Returns `None` if the task is unknown or not running.
    pub fn advance(&mut self, id: &str, outcome: TaskOutcome) -> Option<TaskState> {
        let &i = self.index.get(id)?;
        if self.tasks[i].state != TaskState::Running {
            return None;
        }
        let budget = self.retry_budget(&self.tasks[i]);
        let task = &mut self.tasks[i];
        let new_state = match outcome {
            TaskOutcome::Succeeded(payload) => {
                task.result = Some(payload);
                task.failure = None;
                task.finished_at = Some(Utc::now());
                TaskState::Succeeded
            }
            TaskOutcome::Failed { reason, retryable } => {
                task.failure = Some(reason);
                if retryable && task.retry_count < budget {
                    task.retry_count += 1;
                    TaskState::Retrying
                } else {
                    task.finished_at = Some(Utc::now());
                    TaskState::Failed
                }
            }
        };
        task.state = new_state;

        if new_state == TaskState::Failed {
            self.skip_downstream(i);
        }
        self.refresh_readiness();
        Some(new_state)
    }

    fn skip_downstream(&mut self, failed: usize) {
        let origin = self.tasks[failed].id.clone();
        let mut frontier = vec![origin.clone()];
        while let Some(upstream) = frontier.pop() {
            for task in &mut self.tasks {
                if !task.state.is_terminal() && task.depends_on.contains(&upstream) {
                    task.state = TaskState::Skipped;
                    task.failure = Some(format!("upstream task '{origin}' failed"));
                    task.finished_at = Some(Utc::now());
                    frontier.push(task.id.clone());
                }
            }
        }
    }

    /// Mark every non-terminal task `Skipped`. Returns the affected ids.
    pub fn skip_unfinished(&mut self, reason: &str) -> Vec<String> {
        let now = Utc::now();
        let mut skipped = Vec::new();
        for task in &mut self.tasks {
            if !task.state.is_terminal() {
                task.state = TaskState::Skipped;
                task.failure = Some(reason.to_string());
                task.finished_at = Some(now);
                skipped.push(task.id.clone());
            }
        }
        skipped
    }

    /// Outputs of succeeded upstream tasks (hard and optional), keyed by id.
    pub fn upstream_outputs(&self, id: &str) -> BTreeMap<String, Value> {
        let Some(task) = self.get(id) else {
            return BTreeMap::new();
        };
        task.upstream_ids()
            .filter_map(|dep| {
                let up = self.get(dep)?;
                match (&up.state, &up.result) {
                    (TaskState::Succeeded, Some(result)) => Some((dep.clone(), result.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    /// Whether every task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.state.is_terminal())
    }

    /// Aggregate state: running until every task is terminal, then
    /// partially failed if any task failed.
    pub fn state(&self) -> GraphState {
        if !self.is_terminal() {
            GraphState::Running
        } else if self.tasks.iter().any(|t| t.state == TaskState::Failed) {
            GraphState::PartiallyFailed
        } else {
            GraphState::Completed
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use paperflow_core::Capability;
    use serde_json::json;

    fn spec(id: &str) -> TaskSpec {
        TaskSpec::new(id, Capability::Summarization)
    }

    fn linear() -> TaskGraph {
        TaskGraph::builder()
            .task(spec("extract"))
            .task(spec("summarize").after(["extract"]))
            .task(spec("store").after(["summarize"]))
            .build()
            .unwrap()
    }

    fn run(graph: &mut TaskGraph, id: &str, outcome: TaskOutcome) -> TaskState {
        assert!(graph.mark_running(id), "{id} should be dispatchable");
        graph.advance(id, outcome).unwrap()
    }

    #[test]
    fn test_empty_graph_is_completed() {
        let graph = TaskGraphBuilder::new().build().unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.state(), GraphState::Completed);
    }

    #[test]
    fn test_topological_order_stored() {
        let graph = TaskGraph::builder()
            .task(spec("store").after(["summarize"]))
            .task(spec("summarize").after(["extract"]))
            .task(spec("extract"))
            .build()
            .unwrap();
        assert_eq!(graph.order(), vec!["extract", "summarize", "store"]);
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let err = TaskGraph::builder()
            .task(spec("a"))
            .task(spec("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, PaperflowError::DuplicateTask(id) if id == "a"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = TaskGraph::builder()
            .task(spec("a").optionally_after(["ghost"]))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            PaperflowError::UnknownDependency { ref task, ref dependency }
                if task == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_self_loop_rejected() {
        let err = TaskGraph::builder()
            .task(spec("a").after(["a"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, PaperflowError::CyclicDependency(ids) if ids == vec!["a"]));
    }

    #[test]
    fn test_longer_cycle_rejected() {
        let err = TaskGraph::builder()
            .task(spec("root"))
            .task(spec("a").after(["root", "c"]))
            .task(spec("b").after(["a"]))
            .task(spec("c").after(["b"]))
            .task(spec("tail").after(["c"]))
            .build()
            .unwrap_err();
        match err {
            PaperflowError::CyclicDependency(ids) => {
                assert_eq!(ids, vec!["a", "b", "c", "tail"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_ready_set_follows_dependencies() {
        let mut graph = linear();
        assert_eq!(graph.ready_tasks(), vec!["extract"]);
        assert_eq!(graph.state_of("extract"), Some(TaskState::Ready));
        assert_eq!(graph.state_of("summarize"), Some(TaskState::Pending));

        assert!(!graph.mark_running("summarize"));
        run(&mut graph, "extract", TaskOutcome::Succeeded(json!({"text": "t"})));
        assert_eq!(graph.ready_tasks(), vec!["summarize"]);
        assert_eq!(graph.state(), GraphState::Running);
    }

    #[test]
    fn test_running_task_not_ready() {
        let mut graph = linear();
        assert!(graph.mark_running("extract"));
        assert!(graph.ready_tasks().is_empty());
        assert!(!graph.mark_running("extract"));
        assert!(graph.get("extract").unwrap().started_at.is_some());
    }

    #[test]
    fn test_retry_budget() {
        let mut graph = TaskGraph::builder()
            .task(spec("flaky").max_retries(2))
            .build()
            .unwrap();
        assert_eq!(run(&mut graph, "flaky", TaskOutcome::transient("503")), TaskState::Retrying);
        assert_eq!(run(&mut graph, "flaky", TaskOutcome::transient("503")), TaskState::Retrying);
        assert_eq!(run(&mut graph, "flaky", TaskOutcome::transient("503")), TaskState::Failed);
        let task = graph.get("flaky").unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.failure.as_deref(), Some("503"));
    }

    #[test]
    fn test_retrying_task_not_in_ready_set() {
        let mut graph = TaskGraph::builder().task(spec("a")).build().unwrap();
        run(&mut graph, "a", TaskOutcome::transient("reset"));
        assert!(graph.ready_tasks().is_empty());
        assert!(graph.mark_running("a"));
        assert_eq!(
            graph.advance("a", TaskOutcome::Succeeded(json!(1))),
            Some(TaskState::Succeeded)
        );
    }

    #[test]
    fn test_permanent_failure_skips_downstream() {
        let mut graph = linear();
        assert_eq!(run(&mut graph, "extract", TaskOutcome::permanent("bad pdf")), TaskState::Failed);
        assert_eq!(graph.state_of("summarize"), Some(TaskState::Skipped));
        assert_eq!(graph.state_of("store"), Some(TaskState::Skipped));
        assert_eq!(
            graph.get("store").unwrap().failure.as_deref(),
            Some("upstream task 'extract' failed")
        );
        assert!(graph.ready_tasks().is_empty());
        assert_eq!(graph.state(), GraphState::PartiallyFailed);
    }

    #[test]
    fn test_optional_dependency_tolerates_failure() {
        let mut graph = TaskGraph::builder()
            .task(spec("summarize"))
            .task(spec("enrich"))
            .task(spec("store").after(["summarize"]).optionally_after(["enrich"]))
            .build()
            .unwrap();
        run(&mut graph, "summarize", TaskOutcome::Succeeded(json!("s")));
        // enrich still open: store waits
        assert_eq!(graph.ready_tasks(), vec!["enrich"]);

        run(&mut graph, "enrich", TaskOutcome::permanent("404"));
        assert_eq!(graph.ready_tasks(), vec!["store"]);
        let upstream = graph.upstream_outputs("store");
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream["summarize"], json!("s"));

        run(&mut graph, "store", TaskOutcome::Succeeded(json!({})));
        assert_eq!(graph.state(), GraphState::PartiallyFailed);
    }

    #[test]
    fn test_diamond_waits_for_both_branches() {
        let mut graph = TaskGraph::builder()
            .task(spec("crossref"))
            .task(spec("s2"))
            .task(spec("merge").after(["crossref", "s2"]))
            .build()
            .unwrap();
        assert_eq!(graph.ready_tasks(), vec!["crossref", "s2"]);
        run(&mut graph, "s2", TaskOutcome::Succeeded(json!(2)));
        assert_eq!(graph.ready_tasks(), vec!["crossref"]);
        run(&mut graph, "crossref", TaskOutcome::Succeeded(json!(1)));
        assert_eq!(graph.ready_tasks(), vec!["merge"]);
        run(&mut graph, "merge", TaskOutcome::Succeeded(json!(3)));
        assert_eq!(graph.state(), GraphState::Completed);
    }

    #[test]
    fn test_skip_unfinished() {
        let mut graph = linear();
        run(&mut graph, "extract", TaskOutcome::Succeeded(json!(1)));
        let skipped = graph.skip_unfinished("deadline");
        assert_eq!(skipped, vec!["summarize", "store"]);
        assert!(graph.is_terminal());
        assert_eq!(graph.state(), GraphState::Completed);
    }

    #[test]
    fn test_advance_requires_running() {
        let mut graph = linear();
        assert_eq!(graph.advance("extract", TaskOutcome::Succeeded(json!(1))), None);
        assert_eq!(graph.advance("ghost", TaskOutcome::Succeeded(json!(1))), None);
    }
}
