//! Core data types for events, handlers, and dispatch results.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A webhook event observed through the cloud event stream.
///
/// `id` is the remote row id assigned by the cloud store; it is unique and
/// strictly increasing across the global stream, so `(repo, id)` totally
/// orders events per repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub repo: String,
    pub event_type: String,
    #[serde(default)]
    pub action: String,
    #[serde(rename = "ref", default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub delivery_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Event types the relay knows how to route.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "check_run",
    "check_suite",
    "workflow_run",
    "pull_request_review",
    "pull_request_review_comment",
];

/// Outcome of running one handler for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success,
    Failure,
    Timeout,
    Skipped,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "timeout" => Some(Self::Timeout),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One row of the dispatch log: the result of executing handler
/// `handler_name` for event `remote_id`. Keyed on that pair; recording is
/// idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub remote_id: i64,
    pub handler_name: String,
    pub outcome: DispatchOutcome,
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Static handler definition loaded from the config file.
///
/// An empty `action` matches any event action. `command` is a template
/// expanded against the event before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub name: String,
    pub event_type: String,
    #[serde(default)]
    pub action: String,
    pub command: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(rename = "timeout", default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// A watched repository. `path` is the local checkout the event journal is
/// written under; repos without a path get no journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}
