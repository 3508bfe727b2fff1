use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Worker Type Registry - the fixed catalogue of worker specialisations.
///
/// Each type carries a capability set and a keyword matcher; `match_by_text`
/// picks the type whose keywords score highest over a free-text task
/// description, ties broken by priority (lower wins).
#[derive(Debug, Clone)]
pub struct WorkerTypeRegistry {
    entries: Vec<WorkerTypeSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Developer,
    Test,
    Review,
    Research,
    Design,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTypeSpec {
    pub worker_type: WorkerType,
    pub capabilities: Vec<String>,
    pub keywords: Vec<String>,
    pub priority: u8,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Developer => "developer",
            WorkerType::Test => "test",
            WorkerType::Review => "review",
            WorkerType::Research => "research",
            WorkerType::Design => "design",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "developer" => Ok(WorkerType::Developer),
            "test" => Ok(WorkerType::Test),
            "review" => Ok(WorkerType::Review),
            "research" => Ok(WorkerType::Research),
            "design" => Ok(WorkerType::Design),
            other => Err(format!("unknown worker type: {other}")),
        }
    }
}

impl Default for WorkerTypeRegistry {
    fn default() -> Self {
        let table = [
            (
                WorkerType::Developer,
                &["code_generation", "refactoring", "debugging"][..],
                &["implement", "code", "fix", "build", "endpoint", "api", "feature", "bug"][..],
                1,
            ),
            (
                WorkerType::Test,
                &["test_authoring", "coverage_analysis"][..],
                &["test", "verify", "coverage", "regression", "assert"][..],
                2,
            ),
            (
                WorkerType::Review,
                &["code_review", "security_review"][..],
                &["review", "audit", "approve", "quality", "lint"][..],
                3,
            ),
            (
                WorkerType::Research,
                &["investigation", "benchmarking"][..],
                &["research", "investigate", "compare", "evaluate", "survey"][..],
                4,
            ),
            (
                WorkerType::Design,
                &["architecture", "api_design"][..],
                &["design", "architecture", "schema", "interface", "plan"][..],
                5,
            ),
        ];

        Self {
            entries: table
                .into_iter()
                .map(|(worker_type, caps, keywords, priority)| WorkerTypeSpec {
                    worker_type,
                    capabilities: caps.iter().map(|s| s.to_string()).collect(),
                    keywords: keywords.iter().map(|s| s.to_string()).collect(),
                    priority,
                })
                .collect(),
        }
    }
}

impl WorkerTypeRegistry {
    pub fn entries(&self) -> &[WorkerTypeSpec] {
        &self.entries
    }

    pub fn spec(&self, worker_type: WorkerType) -> Option<&WorkerTypeSpec> {
        self.entries.iter().find(|e| e.worker_type == worker_type)
    }

    /// Deterministic keyword match: highest keyword-hit count wins, ties go
    /// to the lower priority number. Zero hits everywhere falls through to
    /// the highest-priority type (developer).
    pub fn match_by_text(&self, text: &str) -> WorkerType {
        let lowered = text.to_lowercase();
        let mut best: Option<(&WorkerTypeSpec, usize)> = None;

        for entry in &self.entries {
            let score = entry
                .keywords
                .iter()
                .filter(|keyword| lowered.contains(keyword.as_str()))
                .count();

            best = match best {
                None => Some((entry, score)),
                Some((current, current_score)) => {
                    if score > current_score
                        || (score == current_score && entry.priority < current.priority)
                    {
                        Some((entry, score))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }

        best.map(|(entry, _)| entry.worker_type)
            .unwrap_or(WorkerType::Developer)
    }
}
