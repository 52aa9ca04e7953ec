use crate::{Context, DefinitionError, Value};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

pub type StepId = String;

/// Serialized authoring form of a process definition.
///
/// Turned into an immutable [`ProcessDefinition`] by
/// [`ProcessDefinition::from_spec`], which rejects invalid graphs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSpec {
    /// Process type id the definition is loaded under
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub start: StepId,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
}

impl DefinitionSpec {
    pub fn new(id: impl Into<String>, start: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            start: start.into(),
            steps: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn add_step(&mut self, step: StepSpec) -> StepId {
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    /// Unconditional transition
    pub fn connect(&mut self, from: impl Into<StepId>, to: impl Into<StepId>) {
        self.connect_when(from, to, Condition::Always);
    }

    pub fn connect_when(
        &mut self,
        from: impl Into<StepId>,
        to: impl Into<StepId>,
        condition: Condition,
    ) {
        self.transitions.push(TransitionSpec {
            from: from.into(),
            to: to.into(),
            condition,
        });
    }

    pub fn find_step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn validate(self) -> Result<ProcessDefinition, DefinitionError> {
        ProcessDefinition::from_spec(self)
    }
}

/// Step specification in a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    /// Task reference resolved through the task registry
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default)]
    pub reentrant: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Failure-transition target taken once retries are exhausted
    #[serde(default)]
    pub on_failure: Option<StepId>,
}

impl StepSpec {
    pub fn new(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            task: None,
            config: BTreeMap::new(),
            kind: StepKind::Task,
            reentrant: false,
            retry: None,
            timeout_ms: None,
            on_failure: None,
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn split(mut self) -> Self {
        self.kind = StepKind::Split;
        self
    }

    pub fn join(mut self) -> Self {
        self.kind = StepKind::Join;
        self
    }

    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn on_failure(mut self, target: impl Into<StepId>) -> Self {
        self.on_failure = Some(target.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Task,
    /// Parallel fan-out point: every matching transition fires
    Split,
    /// Fan-in point where the branches of a split wait for each other
    Join,
}

/// Transition between steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub from: StepId,
    pub to: StepId,
    #[serde(default)]
    pub condition: Condition,
}

/// Predicate over the instance context, kept as data so definitions
/// round-trip through JSON. Keys are dotted paths.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Always,
    Equals { key: String, value: Value },
    NotEquals { key: String, value: Value },
    Exists { key: String },
    Missing { key: String },
    GreaterThan { key: String, value: f64 },
    LessThan { key: String, value: f64 },
    Truthy { key: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn not_equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::NotEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Condition::Exists { key: key.into() }
    }

    pub fn missing(key: impl Into<String>) -> Self {
        Condition::Missing { key: key.into() }
    }

    pub fn greater_than(key: impl Into<String>, value: f64) -> Self {
        Condition::GreaterThan {
            key: key.into(),
            value,
        }
    }

    pub fn less_than(key: impl Into<String>, value: f64) -> Self {
        Condition::LessThan {
            key: key.into(),
            value,
        }
    }

    pub fn truthy(key: impl Into<String>) -> Self {
        Condition::Truthy { key: key.into() }
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not {
            condition: Box::new(condition),
        }
    }

    pub fn evaluate(&self, context: &Context) -> bool {
        match self {
            Condition::Always => true,
            Condition::Equals { key, value } => context
                .get_path(key)
                .is_some_and(|v| v.loosely_equals(value)),
            Condition::NotEquals { key, value } => !context
                .get_path(key)
                .is_some_and(|v| v.loosely_equals(value)),
            Condition::Exists { key } => context.get_path(key).is_some_and(|v| !v.is_null()),
            Condition::Missing { key } => context.get_path(key).map_or(true, Value::is_null),
            Condition::GreaterThan { key, value } => context
                .get_path(key)
                .and_then(Value::as_f64)
                .is_some_and(|v| v > *value),
            Condition::LessThan { key, value } => context
                .get_path(key)
                .and_then(Value::as_f64)
                .is_some_and(|v| v < *value),
            Condition::Truthy { key } => context.get_path(key).is_some_and(Value::is_truthy),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(context)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(context)),
            Condition::Not { condition } => !condition.evaluate(context),
        }
    }

    /// Conservative static check: true when the two conditions are certain
    /// to hold together whenever one of them holds.
    pub fn overlaps(&self, other: &Condition) -> bool {
        matches!(self, Condition::Always) || matches!(other, Condition::Always) || self == other
    }
}

/// Retry policy for step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms },
        }
    }

    pub fn exponential(max_attempts: u32, initial_ms: u64, multiplier: f64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            },
        }
    }

    /// Attempts allowed; a zero in the definition still runs the task once.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given (1-based) attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let raw = *initial_ms as f64 * multiplier.powi(exponent);
                let millis = if raw.is_finite() {
                    raw.min(*max_ms as f64).max(0.0) as u64
                } else {
                    *max_ms
                };
                Duration::from_millis(millis)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        multiplier: f64,
        max_ms: u64,
    },
}

/// Validated step. Indices refer to [`ProcessDefinition::steps`].
#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    pub name: Option<String>,
    pub task: Option<String>,
    pub config: BTreeMap<String, Value>,
    pub kind: StepKind,
    pub reentrant: bool,
    pub retry: Option<RetryPolicy>,
    pub timeout_ms: Option<u64>,
    pub on_failure: Option<usize>,
}

impl Step {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: usize,
    pub to: usize,
    pub condition: Condition,
}

/// Immutable, validated process graph.
///
/// Steps live in a stable array and transitions reference them by index,
/// so one definition is shared read-only (behind an `Arc`) by every
/// instance built from it.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    id: String,
    name: Option<String>,
    description: Option<String>,
    start: usize,
    steps: Vec<Step>,
    transitions: Vec<Transition>,
    /// Transition indices per step, in declared order
    outgoing: Vec<Vec<usize>>,
    index: HashMap<StepId, usize>,
    /// Join step for every split; `None` when its branches end at terminals
    joins: HashMap<usize, Option<usize>>,
}

impl ProcessDefinition {
    pub fn from_spec(spec: DefinitionSpec) -> Result<Self, DefinitionError> {
        if spec.steps.is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "definition '{}' has no steps",
                spec.id
            )));
        }

        let mut index = HashMap::with_capacity(spec.steps.len());
        for (i, step) in spec.steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateStep(step.id.clone()));
            }
        }
        let lookup = |id: &str| {
            index
                .get(id)
                .copied()
                .ok_or_else(|| DefinitionError::StepNotFound(id.to_string()))
        };

        let start = index
            .get(&spec.start)
            .copied()
            .ok_or_else(|| DefinitionError::UnknownStart(spec.start.clone()))?;

        let mut transitions = Vec::with_capacity(spec.transitions.len());
        let mut outgoing = vec![Vec::new(); spec.steps.len()];
        for transition in spec.transitions {
            let from = lookup(&transition.from)?;
            let to = lookup(&transition.to)?;
            outgoing[from].push(transitions.len());
            transitions.push(Transition {
                from,
                to,
                condition: transition.condition,
            });
        }

        let mut steps = Vec::with_capacity(spec.steps.len());
        for step in spec.steps {
            let on_failure = step.on_failure.as_deref().map(lookup).transpose()?;
            steps.push(Step {
                id: step.id,
                name: step.name,
                task: step.task,
                config: step.config,
                kind: step.kind,
                reentrant: step.reentrant,
                retry: step.retry,
                timeout_ms: step.timeout_ms,
                on_failure,
            });
        }

        let mut definition = ProcessDefinition {
            id: spec.id,
            name: spec.name,
            description: spec.description,
            start,
            steps,
            transitions,
            outgoing,
            index,
            joins: HashMap::new(),
        };

        definition.check_terminals()?;
        let graph = definition.graph();
        definition.check_reachability(&graph)?;
        definition.check_cycles(&graph)?;
        definition.check_conditions()?;
        definition.joins = definition.resolve_joins()?;

        tracing::debug!(
            process_type = %definition.id,
            steps = definition.steps.len(),
            transitions = definition.transitions.len(),
            "process definition validated"
        );

        Ok(definition)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> &Step {
        &self.steps[index]
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn find_step(&self, id: &str) -> Option<&Step> {
        self.step_index(id).map(|i| &self.steps[i])
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Outgoing transitions of a step in declared order
    pub fn transitions_from(&self, index: usize) -> impl Iterator<Item = &Transition> + '_ {
        self.outgoing[index].iter().map(move |&t| &self.transitions[t])
    }

    /// A step with no outgoing transitions is terminal
    pub fn is_terminal(&self, index: usize) -> bool {
        self.outgoing[index].is_empty()
    }

    pub fn join_for(&self, split: usize) -> Option<usize> {
        self.joins.get(&split).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn successors(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.transitions_from(index)
            .map(|t| t.to)
            .chain(self.steps[index].on_failure)
    }

    fn graph(&self) -> DiGraph<usize, ()> {
        let mut graph = DiGraph::with_capacity(self.steps.len(), self.transitions.len());
        for i in 0..self.steps.len() {
            graph.add_node(i);
        }
        for transition in &self.transitions {
            graph.add_edge(
                NodeIndex::new(transition.from),
                NodeIndex::new(transition.to),
                (),
            );
        }
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(target) = step.on_failure {
                graph.add_edge(NodeIndex::new(i), NodeIndex::new(target), ());
            }
        }
        graph
    }

    fn check_terminals(&self) -> Result<(), DefinitionError> {
        for (i, step) in self.steps.iter().enumerate() {
            if !self.is_terminal(i) {
                continue;
            }
            if step.kind == StepKind::Split {
                return Err(DefinitionError::SplitWithoutBranches(step.id.clone()));
            }
            if step.task.is_some() {
                return Err(DefinitionError::TerminalTask(step.id.clone()));
            }
            if step.on_failure.is_some() {
                return Err(DefinitionError::Invalid(format!(
                    "terminal step '{}' declares a failure transition",
                    step.id
                )));
            }
        }
        Ok(())
    }

    fn check_reachability(&self, graph: &DiGraph<usize, ()>) -> Result<(), DefinitionError> {
        let mut reached = vec![false; self.steps.len()];
        let mut dfs = Dfs::new(graph, NodeIndex::new(self.start));
        while let Some(node) = dfs.next(graph) {
            reached[node.index()] = true;
        }
        if let Some(i) = reached.iter().position(|r| !r) {
            return Err(DefinitionError::UnreachableStep(self.steps[i].id.clone()));
        }

        // Every step must have some path to a terminal step.
        let reversed = Reversed(graph);
        let mut finishes = vec![false; self.steps.len()];
        let mut dfs = Dfs::empty(reversed);
        for terminal in (0..self.steps.len()).filter(|&i| self.is_terminal(i)) {
            dfs.move_to(NodeIndex::new(terminal));
            while let Some(node) = dfs.next(reversed) {
                finishes[node.index()] = true;
            }
        }
        if let Some(i) = finishes.iter().position(|f| !f) {
            return Err(DefinitionError::DeadEnd(self.steps[i].id.clone()));
        }
        Ok(())
    }

    fn check_cycles(&self, graph: &DiGraph<usize, ()>) -> Result<(), DefinitionError> {
        for component in tarjan_scc(graph) {
            let cyclic = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&n| graph.contains_edge(n, n));
            if !cyclic {
                continue;
            }
            if component.iter().any(|n| self.steps[n.index()].reentrant) {
                continue;
            }
            let mut members: Vec<usize> = component.iter().map(|n| n.index()).collect();
            members.sort_unstable();
            return Err(DefinitionError::UnmarkedCycle(
                members.into_iter().map(|i| self.steps[i].id.clone()).collect(),
            ));
        }
        Ok(())
    }

    fn check_conditions(&self) -> Result<(), DefinitionError> {
        for (i, step) in self.steps.iter().enumerate() {
            if step.kind == StepKind::Split {
                continue;
            }
            let outgoing = &self.outgoing[i];
            for (pos, &a) in outgoing.iter().enumerate() {
                for &b in &outgoing[pos + 1..] {
                    let (first, second) = (&self.transitions[a], &self.transitions[b]);
                    if first.condition.overlaps(&second.condition) {
                        return Err(DefinitionError::OverlappingConditions {
                            step: step.id.clone(),
                            first: self.steps[first.to].id.clone(),
                            second: self.steps[second.to].id.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_joins(&self) -> Result<HashMap<usize, Option<usize>>, DefinitionError> {
        let mut joins = HashMap::new();
        let mut in_progress = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.kind == StepKind::Split {
                self.join_of(i, &mut joins, &mut in_progress)?;
            }
        }

        let claimed: HashSet<usize> = joins.values().flatten().copied().collect();
        for (i, step) in self.steps.iter().enumerate() {
            if step.kind == StepKind::Join && !claimed.contains(&i) {
                return Err(DefinitionError::OrphanJoin(step.id.clone()));
            }
        }
        Ok(joins)
    }

    /// Walk every branch of `split` until it meets a join, stepping over
    /// nested splits by continuing after their own join.
    fn join_of(
        &self,
        split: usize,
        memo: &mut HashMap<usize, Option<usize>>,
        in_progress: &mut HashSet<usize>,
    ) -> Result<Option<usize>, DefinitionError> {
        if let Some(join) = memo.get(&split) {
            return Ok(*join);
        }
        if !in_progress.insert(split) {
            return Err(DefinitionError::Invalid(format!(
                "split '{}' is reachable from its own branches before their join",
                self.steps[split].id
            )));
        }

        let mut found = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<usize> = self.transitions_from(split).map(|t| t.to).collect();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            let step = &self.steps[node];
            match step.kind {
                StepKind::Join => {
                    found.insert(node);
                }
                StepKind::Split => {
                    if let Some(inner) = self.join_of(node, memo, in_progress)? {
                        stack.extend(self.successors(inner));
                    }
                    stack.extend(step.on_failure);
                }
                StepKind::Task => stack.extend(self.successors(node)),
            }
        }
        in_progress.remove(&split);

        let join = match found.len() {
            0 => None,
            1 => found.into_iter().next(),
            _ => {
                return Err(DefinitionError::MismatchedJoin {
                    split: self.steps[split].id.clone(),
                    joins: found.into_iter().map(|j| self.steps[j].id.clone()).collect(),
                })
            }
        };
        memo.insert(split, join);
        Ok(join)
    }
}
