//! The `ReviewClient` seam (C1): everything the Poller, Scheduler, and
//! Inspection API need from the upstream review server, independent of
//! transport. Modeled the way the donor separates `AgentBackend` (the
//! trait) from its concrete model backends.

use anyhow::Result;
use async_trait::async_trait;
use mqd_core::types::Account;
use serde::{Deserialize, Serialize};

/// One change as reported by the upstream review server. Distinct from
/// `mqd_core::types::ChangeInfo`: this carries no `rid`/`poll_id` (those
/// are assigned when the Poller writes it into the Store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamChange {
    pub change_id: String,
    pub project: String,
    pub branch: String,
    pub subject: String,
    pub current_revision: String,
    pub owner: Account,
    pub queue_time: chrono::DateTime<chrono::Utc>,
    pub priority: i64,
    pub message_body: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub project: Option<String>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Submitted,
    Rejected(String),
}

/// Transport-independent view of the upstream review server.
///
/// Failure handling per caller: `list_ready` swallows transport/parse
/// errors into an empty list (a poll tick with no upstream connectivity is
/// "no work this tick", not a fatal error); every other method propagates
/// `Err` so the Scheduler/Inspection API can decide how to react.
#[async_trait]
pub trait ReviewClient: Send + Sync {
    async fn list_ready(
        &self,
        filters: &ListFilters,
        offset: i64,
        limit: i64,
    ) -> Vec<UpstreamChange>;

    async fn get_change(&self, change_id: &str) -> Result<Option<UpstreamChange>>;

    /// Resolved `Merge-Queue` label score for `change_id` right now (see
    /// `mqd_core::labels::resolve_merge_queue_score`). Used by the Step
    /// Runner's periodic eviction check; `Ok(None)` means the change no
    /// longer exists upstream.
    async fn merge_queue_score(&self, change_id: &str) -> Result<Option<i64>>;

    async fn set_review(
        &self,
        change_id: &str,
        revision: &str,
        message: &str,
        labels: &[(&str, i64)],
        notify: &str,
    ) -> Result<()>;

    async fn submit(&self, change_id: &str) -> Result<SubmitStatus>;

    async fn lookup_account(&self, query: &str) -> Result<Option<Account>>;
}
