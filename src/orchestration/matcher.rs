//! Capability scoring: picks a registered worker type for each task.

use std::collections::{HashMap, HashSet};

use crate::config::FallbackPolicy;
use crate::core::{Complexity, Task, TaskId};
use crate::orchestration::decomposer::tokenize;
use crate::registry::{AgentRegistry, AgentType};
use crate::clog_debug;

const CATEGORY_WEIGHT: f64 = 0.3;
const KEYWORD_WEIGHT: f64 = 0.2;
const COMPLEXITY_BONUS: f64 = 0.2;
const WORKLOAD_WEIGHT: f64 = 0.2;
const MAX_WORKLOAD_PENALTY: f64 = 0.5;

/// Intent categories: words that signal the category in task text, and the
/// agent tags that cover it.
const CATEGORIES: &[(&[&str], &[&str])] = &[
    (
        &["architecture", "design", "system", "structure", "boundaries"],
        &["architecture", "design"],
    ),
    (
        &["api", "server", "backend", "database", "endpoint", "service"],
        &["backend", "api", "database"],
    ),
    (
        &["ui", "frontend", "interface", "form", "page", "component", "components", "css", "layout"],
        &["frontend", "ui", "components"],
    ),
    (
        &["test", "tests", "testing", "verify", "coverage", "qa", "regression"],
        &["testing", "verification", "qa"],
    ),
    (
        &["bug", "fix", "crash", "error", "debug", "reproduce", "cause"],
        &["debugging", "fix"],
    ),
    (
        &["research", "investigate", "analyze", "summarize", "document"],
        &["research", "analysis", "documentation"],
    ),
];

const STOP_WORDS: &[&str] = &[
    "that", "this", "with", "from", "have", "will", "should", "would", "could", "into", "when",
    "then", "than", "them", "they", "their", "there", "what", "which", "while", "about", "after",
    "before", "each", "every", "some", "also", "just", "only", "make", "sure", "code", "the",
];

/// The worker type chosen for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_type: String,
    pub score: f64,
    /// True when no type scored above zero and the fallback policy decided.
    pub fallback: bool,
}

pub struct AgentMatcher<'a> {
    registry: &'a AgentRegistry,
    fallback: &'a FallbackPolicy,
}

impl<'a> AgentMatcher<'a> {
    pub fn new(registry: &'a AgentRegistry, fallback: &'a FallbackPolicy) -> Self {
        Self { registry, fallback }
    }

    /// Score every registered type for every task, in order.
    ///
    /// Workload accumulates across the batch: a type that already won tasks
    /// scores lower for the next ones.
    pub fn assign(&self, tasks: &[Task], complexity: Complexity) -> Vec<Assignment> {
        let mut workload_hours: HashMap<String, f64> = HashMap::new();
        let mut assignments = Vec::with_capacity(tasks.len());

        for task in tasks {
            let mut best: Option<(&AgentType, f64)> = None;
            for agent_type in self.registry.types() {
                let hours = workload_hours.get(&agent_type.name).copied().unwrap_or(0.0);
                let score = score(agent_type, task, complexity, hours);
                // strict > keeps the earliest registered type on ties
                if best.map_or(true, |(_, s)| score > s) {
                    best = Some((agent_type, score));
                }
            }

            let assignment = match best {
                Some((agent_type, score)) if score > 0.0 => Assignment {
                    task_id: task.id.clone(),
                    agent_type: agent_type.name.clone(),
                    score,
                    fallback: false,
                },
                other => Assignment {
                    task_id: task.id.clone(),
                    agent_type: self.fallback_type(task),
                    score: other.map_or(0.0, |(_, s)| s),
                    fallback: true,
                },
            };
            clog_debug!(
                "AgentMatcher: task={} -> {} (score={:.2}, fallback={})",
                task.id.short(),
                assignment.agent_type,
                assignment.score,
                assignment.fallback
            );

            *workload_hours.entry(assignment.agent_type.clone()).or_insert(0.0) +=
                task.metadata.estimated_minutes as f64 / 60.0;
            assignments.push(assignment);
        }
        assignments
    }

    fn fallback_type(&self, task: &Task) -> String {
        match self.fallback {
            FallbackPolicy::Generic { agent_type } if self.registry.contains(agent_type) => {
                agent_type.clone()
            }
            _ => task.agent_type.clone(),
        }
    }
}

/// Capability score of `agent_type` for `task`.
pub fn score(agent_type: &AgentType, task: &Task, complexity: Complexity, workload_hours: f64) -> f64 {
    let words: HashSet<String> = tokenize(&task.search_text()).into_iter().collect();
    let mut score = 0.0;

    for (signals, covering_tags) in CATEGORIES {
        let signalled = signals.iter().any(|s| words.contains(*s));
        if signalled && covering_tags.iter().any(|t| agent_type.has_tag(t)) {
            score += CATEGORY_WEIGHT;
        }
    }

    let tags: HashSet<String> = agent_type.tags().collect();
    let keywords: HashSet<String> = tokenize(&task.description)
        .into_iter()
        .filter(|w| w.len() > 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect();
    score += KEYWORD_WEIGHT * keywords.iter().filter(|k| tags.contains(*k)).count() as f64;

    if complexity.is_high() && agent_type.is_architecture_oriented() {
        score += COMPLEXITY_BONUS;
    }

    score - (workload_hours * WORKLOAD_WEIGHT).min(MAX_WORKLOAD_PENALTY)
}
