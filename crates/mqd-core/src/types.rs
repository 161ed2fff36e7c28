use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Status codes ─────────────────────────────────────────────────────────

/// Canonical status of a `MergeStatus` row. Values are persisted as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum MergeState {
    Timeout = -3,
    Canceled = -2,
    StepFailed = -1,
    Success = 0,
    InProgress = 1,
}

impl MergeState {
    pub fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            -3 => Self::Timeout,
            -2 => Self::Canceled,
            -1 => Self::StepFailed,
            0 => Self::Success,
            1 => Self::InProgress,
            _ => return None,
        })
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

// ── Account ──────────────────────────────────────────────────────────────

/// Cached identity of an upstream review-server account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: i64,
    pub name: String,
    pub email: String,
    pub username: String,
}

impl Account {
    pub fn unknown(account_id: i64) -> Self {
        Self {
            account_id,
            name: "<none>".into(),
            email: "<none>".into(),
            username: "<none>".into(),
        }
    }
}

// ── ChangeInfo (queue cache) ─────────────────────────────────────────────

/// One ready change, as of the most recent poll. Rows are truncated and
/// replaced wholesale on every poll (see `Store::replace_queue`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeInfo {
    pub rid: i64,
    pub poll_id: i64,
    pub queue_time: DateTime<Utc>,
    /// Lower = higher precedence. 100 is the default when unset.
    pub priority: i64,
    pub change_id: String,
    pub project: String,
    pub branch: String,
    pub subject: String,
    pub current_revision: String,
    pub owner_id: i64,
    pub message_meta: MessageMeta,
}

impl ChangeInfo {
    /// Ascending sort key matching the scheduler's pick order.
    pub fn sort_key(&self) -> (i64, DateTime<Utc>, String, String) {
        (
            self.priority,
            self.queue_time,
            self.project.clone(),
            self.change_id.clone(),
        )
    }
}

/// Parsed `Key: value` headers from a change's current commit message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    pub feature_branch: Option<String>,
    pub priority: Option<i64>,
    pub closes: Vec<String>,
    pub resolves: Vec<String>,
    #[serde(default)]
    pub other: HashMap<String, String>,
}

// ── MergeStatus (history) ────────────────────────────────────────────────

/// One verification attempt. Append-only after creation except for
/// `status`, `end_time`, and `progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeStatus {
    pub rid: i64,
    pub project: String,
    pub branch: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: MergeState,
    /// Fraction out of 10000, matching the upstream's progress convention.
    pub progress: i64,
    pub msg_meta: Option<String>,
}

/// One change participating in a `MergeStatus`. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeChange {
    pub id: i64,
    pub merge_id: i64,
    pub change_id: String,
    pub owner_id: i64,
    pub feature_branch: String,
    pub request_time: DateTime<Utc>,
    pub msg_meta: Option<String>,
}

/// A `MergeStatus` together with its participating changes, as returned by
/// the Inspection API's history/status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct MergeStatusDetail {
    #[serde(flatten)]
    pub status: MergeStatus,
    pub changes: Vec<MergeChange>,
}

// ── Cancellation ─────────────────────────────────────────────────────────

/// Presence of a row means "cancel this merge". Consumed by the Step Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancellation {
    pub rid: i64,
    pub who: String,
    pub when: DateTime<Utc>,
}

// ── QueueSpec (configuration) ────────────────────────────────────────────

/// One configured verification pipeline for a (project, branch-pattern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    pub project: String,
    /// Regex matched against the change's target branch.
    pub branch: String,
    /// Unique within `project`. Defaults to `branch` when that pattern is a
    /// plain literal (see `QueueSpec::effective_name`).
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub build_env: HashMap<String, EnvValue>,
    #[serde(default)]
    pub merge_build_env: bool,
    pub build_steps: Vec<Vec<String>>,
    #[serde(default = "default_true")]
    pub submit_with_rest: bool,
    #[serde(default)]
    pub submit_cmd: Vec<String>,
    #[serde(default)]
    pub coalesce_count: usize,
}

fn default_true() -> bool {
    true
}

/// A `build_env` value: either a scalar, or a list joined with the
/// platform path separator when the key ends in `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Scalar(String),
    List(Vec<String>),
}

impl EnvValue {
    pub fn resolve(&self, key: &str) -> String {
        match self {
            EnvValue::Scalar(s) => s.clone(),
            EnvValue::List(items) => {
                let sep = if key.ends_with("PATH") { ":" } else { "," };
                items.join(sep)
            }
        }
    }
}

impl QueueSpec {
    pub fn effective_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.branch.clone())
    }

    pub fn branch_regex(&self) -> anyhow::Result<regex::Regex> {
        Ok(regex::Regex::new(&self.branch)?)
    }

    /// True when `branch` contains no regex metacharacters, i.e. it matches
    /// exactly one branch name. Only then is defaulting `name` to `branch`
    /// meaningful; a non-literal pattern with no `name` is a config error
    /// (see `Config::load`).
    pub fn is_literal_branch(&self) -> bool {
        regex::escape(&self.branch) == self.branch
    }
}

/// One change queued for a single verification, with its owning
/// `QueueSpec` context resolved.
#[derive(Debug, Clone)]
pub struct QueuedChange {
    pub change: ChangeInfo,
    pub owner: Account,
}
