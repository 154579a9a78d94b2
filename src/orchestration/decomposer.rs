//! Request decomposition.
//!
//! Turns one free-text request into an `ExecutionGraph`: a small DAG of
//! tasks built from a template chosen by keyword intent, with durations
//! scaled by an estimated complexity.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::{Complexity, Task, TaskCategory, TaskDAG, TaskId, TaskMetadata};
use crate::{clog_debug, Result};

static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9]+").unwrap());

const FIX_KEYWORDS: &[&str] = &[
    "fix", "bug", "crash", "error", "broken", "repair", "debug", "issue", "resolve",
];
const TEST_KEYWORDS: &[&str] = &["test", "tests", "testing", "coverage", "verify", "qa", "spec"];
const BUILD_KEYWORDS: &[&str] = &[
    "build", "create", "implement", "add", "make", "develop", "design", "new",
];

const CRITICAL_KEYWORDS: &[&str] = &[
    "production",
    "security",
    "migration",
    "distributed",
    "enterprise",
    "scale",
    "scalable",
    "compliance",
];
const HIGH_KEYWORDS: &[&str] = &[
    "architecture",
    "system",
    "integration",
    "authentication",
    "database",
    "realtime",
    "payment",
    "concurrency",
];
const MEDIUM_KEYWORDS: &[&str] = &[
    "feature",
    "api",
    "form",
    "component",
    "page",
    "refactor",
    "endpoint",
    "dashboard",
];

const FRONTEND_HINTS: &[&str] = &[
    "ui", "frontend", "css", "page", "form", "button", "layout", "component", "react", "style",
];
const BACKEND_HINTS: &[&str] = &[
    "api", "server", "backend", "database", "endpoint", "query", "auth", "service",
];

/// Requests longer than this many words are bumped one complexity level.
const LONG_REQUEST_WORDS: usize = 30;

/// Lowercased alphanumeric words of `text`.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    WORD_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Build,
    Fix,
    Test,
    Other,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Intent::Build => "build",
            Intent::Fix => "fix",
            Intent::Test => "test",
            Intent::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Keyword intent. Fix wins over test, test over build.
pub fn classify_intent(text: &str) -> Intent {
    let words: HashSet<String> = tokenize(text).into_iter().collect();
    let any = |keywords: &[&str]| keywords.iter().any(|k| words.contains(*k));

    if any(FIX_KEYWORDS) {
        Intent::Fix
    } else if any(TEST_KEYWORDS) {
        Intent::Test
    } else if any(BUILD_KEYWORDS) {
        Intent::Build
    } else {
        Intent::Other
    }
}

pub fn estimate_complexity(text: &str) -> Complexity {
    let words = tokenize(text);
    let set: HashSet<&str> = words.iter().map(String::as_str).collect();
    let any = |keywords: &[&str]| keywords.iter().any(|k| set.contains(k));
    let realtime = text.to_lowercase().contains("real-time") || set.contains("realtime");

    let base = if any(CRITICAL_KEYWORDS) {
        Complexity::Critical
    } else if any(HIGH_KEYWORDS) || realtime {
        Complexity::High
    } else if any(MEDIUM_KEYWORDS) {
        Complexity::Medium
    } else {
        Complexity::Simple
    };

    if words.len() > LONG_REQUEST_WORDS {
        base.bump()
    } else {
        base
    }
}

/// The plan produced for one request.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionGraph {
    pub request: String,
    pub intent: Intent,
    pub complexity: Complexity,
    pub nodes: Vec<Task>,
    pub total_estimated_minutes: u32,
    pub max_concurrency: usize,
    pub parallelizable: bool,
    /// Ids of every task with at least one dependency.
    pub critical_path: Vec<TaskId>,
}

impl ExecutionGraph {
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.nodes.iter().find(|t| &t.id == id)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Task> {
        self.nodes.iter().filter(|t| t.dependencies.is_empty())
    }
}

/// One template step before ids are assigned.
struct Step {
    title: &'static str,
    description: String,
    agent_type: &'static str,
    priority: i32,
    minutes: u32,
    category: TaskCategory,
    tools: &'static [&'static str],
    outputs: &'static [&'static str],
    /// Indexes of earlier steps this one depends on.
    after: &'static [usize],
}

#[derive(Debug, Clone)]
pub struct QueryDecomposer {
    concurrency_ceiling: usize,
}

impl QueryDecomposer {
    pub fn new(concurrency_ceiling: usize) -> Self {
        Self {
            concurrency_ceiling: concurrency_ceiling.max(1),
        }
    }

    /// Decompose a request. Empty or unrecognized input still yields a
    /// single research task.
    pub fn decompose(&self, request: &str) -> Result<ExecutionGraph> {
        let intent = classify_intent(request);
        let complexity = estimate_complexity(request);
        let steps = match intent {
            Intent::Build => build_steps(request),
            Intent::Fix => fix_steps(request),
            Intent::Test => test_steps(request),
            Intent::Other => research_steps(request),
        };

        let mut nodes: Vec<Task> = Vec::with_capacity(steps.len());
        for step in steps {
            let minutes = (step.minutes as f64 * complexity.duration_multiplier()).round() as u32;
            let mut task = Task::new(step.title, &step.description, step.agent_type)
                .with_priority(step.priority)
                .with_metadata(TaskMetadata {
                    category: step.category,
                    complexity,
                    estimated_minutes: minutes,
                    tools: step.tools.iter().map(|s| s.to_string()).collect(),
                    outputs: step.outputs.iter().map(|s| s.to_string()).collect(),
                    extra: Default::default(),
                });
            for &i in step.after {
                if let Some(dep) = nodes.get(i) {
                    task = task.depends_on(&dep.id);
                }
            }
            nodes.push(task);
        }

        let dag = TaskDAG::from_tasks(&nodes)?;
        let parallelizable = dag.levels()?.iter().any(|level| level.len() > 1);
        let roots = nodes.iter().filter(|t| t.dependencies.is_empty()).count();

        let graph = ExecutionGraph {
            request: request.to_string(),
            intent,
            complexity,
            total_estimated_minutes: nodes.iter().map(|t| t.metadata.estimated_minutes).sum(),
            max_concurrency: roots.min(self.concurrency_ceiling),
            parallelizable,
            critical_path: nodes
                .iter()
                .filter(|t| !t.dependencies.is_empty())
                .map(|t| t.id.clone())
                .collect(),
            nodes,
        };
        clog_debug!(
            "QueryDecomposer::decompose intent={} complexity={} tasks={} minutes={}",
            graph.intent,
            graph.complexity,
            graph.nodes.len(),
            graph.total_estimated_minutes
        );
        Ok(graph)
    }
}

fn build_steps(request: &str) -> Vec<Step> {
    vec![
        Step {
            title: "Design system architecture",
            description: format!("Design the architecture and component boundaries for: {}", request),
            agent_type: "system-architect",
            priority: 10,
            minutes: 30,
            category: TaskCategory::Architecture,
            tools: &["editor"],
            outputs: &["architecture notes", "interface definitions"],
            after: &[],
        },
        Step {
            title: "Implement backend",
            description: format!("Implement the server side api and data layer for: {}", request),
            agent_type: "backend-developer",
            priority: 8,
            minutes: 60,
            category: TaskCategory::Backend,
            tools: &["editor", "shell"],
            outputs: &["backend code"],
            after: &[0],
        },
        Step {
            title: "Implement frontend",
            description: format!("Build the user interface components for: {}", request),
            agent_type: "frontend-developer",
            priority: 8,
            minutes: 60,
            category: TaskCategory::Frontend,
            tools: &["editor", "shell"],
            outputs: &["frontend code"],
            after: &[0],
        },
        Step {
            title: "Write and run tests",
            description: format!("Write unit and integration tests covering: {}", request),
            agent_type: "test-engineer",
            priority: 6,
            minutes: 45,
            category: TaskCategory::Testing,
            tools: &["editor", "shell"],
            outputs: &["test suite", "test report"],
            after: &[1, 2],
        },
    ]
}

fn fix_steps(request: &str) -> Vec<Step> {
    let words: HashSet<String> = tokenize(request).into_iter().collect();
    let hinted = |hints: &[&str]| hints.iter().any(|h| words.contains(*h));
    let (agent_type, focus) = if hinted(FRONTEND_HINTS) {
        ("frontend-developer", "frontend")
    } else if hinted(BACKEND_HINTS) {
        ("backend-developer", "backend")
    } else {
        ("debugger", "general")
    };

    vec![
        Step {
            title: "Analyze the problem",
            description: format!("Reproduce and find the root cause of: {}", request),
            agent_type: "debugger",
            priority: 10,
            minutes: 20,
            category: TaskCategory::Analysis,
            tools: &["shell"],
            outputs: &["root cause analysis"],
            after: &[],
        },
        Step {
            title: "Implement the fix",
            description: format!("Fix the {} code responsible for: {}", focus, request),
            agent_type,
            priority: 8,
            minutes: 40,
            category: TaskCategory::Implementation {
                focus: focus.to_string(),
            },
            tools: &["editor", "shell"],
            outputs: &["patch"],
            after: &[0],
        },
        Step {
            title: "Verify the fix",
            description: format!("Verify the fix and add a regression test for: {}", request),
            agent_type: "test-engineer",
            priority: 6,
            minutes: 20,
            category: TaskCategory::Verification,
            tools: &["shell"],
            outputs: &["verification report"],
            after: &[1],
        },
    ]
}

fn test_steps(request: &str) -> Vec<Step> {
    vec![Step {
        title: "Plan and write tests",
        description: format!("Plan test coverage and write the tests for: {}", request),
        agent_type: "test-engineer",
        priority: 8,
        minutes: 30,
        category: TaskCategory::Planning,
        tools: &["editor", "shell"],
        outputs: &["test plan", "test suite"],
        after: &[],
    }]
}

fn research_steps(request: &str) -> Vec<Step> {
    vec![Step {
        title: "Research the request",
        description: format!("Investigate and summarize: {}", request),
        agent_type: "researcher",
        priority: 5,
        minutes: 30,
        category: TaskCategory::Research,
        tools: &["shell"],
        outputs: &["summary"],
        after: &[],
    }]
}
