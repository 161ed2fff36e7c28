//! The Scheduler (C6): one verification decision per invocation, plus the
//! verification pipeline itself. Grounded in `gerrit_mq/functions.py`'s
//! `pick_change`/`merge_and_verify` loop and its `QueueSpec.dirty_changes`
//! instance state.

use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use mqd_core::config::Config;
use mqd_core::db::Store;
use mqd_core::git::{coalesce_merge, Git};
use mqd_core::types::{ChangeInfo, MergeState, QueueSpec};
use mqd_review::ReviewClient;
use tracing::{info, warn};

use crate::steps::{run_steps, StepOutcome};

type DirtyKey = (String, String);

/// Cross-tick scheduler state. Deliberately in-process memory, not a
/// persisted table: a daemon restart already implies `MarkStaleInProgress`
/// canceled any in-flight merge, so the conservative choice is to forget
/// the dirty set and re-attempt coalescing from scratch.
pub struct Scheduler {
    dirty: Mutex<HashMap<DirtyKey, HashSet<String>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            dirty: Mutex::new(HashMap::new()),
        }
    }

    fn dirty_set(&self, key: &DirtyKey) -> HashSet<String> {
        self.dirty.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned().unwrap_or_default()
    }

    fn mark_dirty(&self, key: &DirtyKey, changes: &[ChangeInfo]) {
        let mut guard = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        let set = guard.entry(key.clone()).or_default();
        for c in changes {
            set.insert(c.change_id.clone());
        }
    }

    fn clear_dirty(&self, key: &DirtyKey, changes: &[ChangeInfo]) {
        let mut guard = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = guard.get_mut(key) {
            for c in changes {
                set.remove(&c.change_id);
            }
        }
    }

    /// Make at most one scheduling decision: find the first ready change
    /// that matches a locally-serviced `QueueSpec`, build a coalesce
    /// attempt or fall back to a serial one, and run exactly one
    /// verification. Returns `true` if a verification ran.
    pub async fn run_once(
        &self,
        config: &Config,
        store: &Arc<Store>,
        review: &Arc<dyn ReviewClient>,
    ) -> Result<bool> {
        let store_clone = Arc::clone(store);
        let full_queue =
            tokio::task::spawn_blocking(move || store_clone.get_full_queue()).await??;

        let specs = config.active_queues();
        let Some((spec, head)) = full_queue.iter().find_map(|change| {
            specs
                .iter()
                .find(|s| {
                    s.project == change.project
                        && s.branch_regex().map(|re| re.is_match(&change.branch)).unwrap_or(false)
                })
                .map(|s| ((*s).clone(), change.clone()))
        }) else {
            return Ok(false);
        };

        let store_clone = Arc::clone(store);
        let project = head.project.clone();
        let branch = head.branch.clone();
        let request_queue: Vec<ChangeInfo> = tokio::task::spawn_blocking(move || {
            store_clone.get_queue_for_branch(&project, &branch)
        })
        .await??;
        if request_queue.is_empty() {
            return Ok(false);
        }

        let dirty_key = (spec.project.clone(), spec.effective_name());
        let dirty = self.dirty_set(&dirty_key);

        let mut coalesce_queue = Vec::new();
        if spec.coalesce_count > 0 && request_queue.len() > 1 {
            for change in &request_queue {
                if dirty.contains(&change.change_id) {
                    break;
                }
                coalesce_queue.push(change.clone());
                if coalesce_queue.len() == spec.coalesce_count {
                    break;
                }
            }
        }

        if coalesce_queue.len() > 1 {
            let state = self.verify(&spec, &coalesce_queue, config, store, review).await?;
            if state == MergeState::Success {
                self.clear_dirty(&dirty_key, &coalesce_queue);
                return Ok(true);
            }
            self.mark_dirty(&dirty_key, &coalesce_queue);
        }

        let head_change = request_queue[0].clone();
        let single = std::slice::from_ref(&head_change);
        let state = self.verify(&spec, single, config, store, review).await?;
        if state == MergeState::Success {
            self.clear_dirty(&dirty_key, single);
        }
        Ok(true)
    }

    /// Run the full verification pipeline (steps 1-10 of §4.6) for
    /// `change_queue` under `spec`. Runs as one `spawn_blocking` task: the
    /// git driver and Step Runner are already blocking, and the review
    /// client calls needed here go through a short-lived current-thread
    /// runtime the same way the Step Runner's eviction check does.
    async fn verify(
        &self,
        spec: &QueueSpec,
        change_queue: &[ChangeInfo],
        config: &Config,
        store: &Arc<Store>,
        review: &Arc<dyn ReviewClient>,
    ) -> Result<MergeState> {
        let spec = spec.clone();
        let change_queue = change_queue.to_vec();
        let config = config.clone();
        let store = Arc::clone(store);
        let review = Arc::clone(review);

        tokio::task::spawn_blocking(move || {
            verify_blocking(&spec, &change_queue, &config, &store, &review)
        })
        .await?
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn verify_blocking(
    spec: &QueueSpec,
    change_queue: &[ChangeInfo],
    config: &Config,
    store: &Arc<Store>,
    review: &Arc<dyn ReviewClient>,
) -> Result<MergeState> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build verification runtime")?;

    // Step 1: create the MergeStatus row and its MergeChange rows up front,
    // so a failure at any later point still has a history row to attach to.
    let merge_rid = store.create_merge(&spec.project, &spec.branch)?;
    for change in change_queue {
        let Some(feature_branch) = &change.message_meta.feature_branch else {
            store.update_merge_status(merge_rid, MergeState::StepFailed, Some(Utc::now()))?;
            if !config.daemon.silent {
                let _ = rt.block_on(review.set_review(
                    &change.change_id,
                    &change.current_revision,
                    "merge queue: missing required Feature-Branch commit-message tag",
                    &[],
                    "ALL",
                ));
            }
            return Ok(MergeState::StepFailed);
        };
        let msg_meta_json = serde_json::to_string(&change.message_meta).ok();
        store.append_merge_change(
            merge_rid,
            &change.change_id,
            change.owner_id,
            feature_branch,
            change.queue_time,
            msg_meta_json.as_deref(),
        )?;
    }

    // Step 2: open per-merge logs.
    std::fs::create_dir_all(&config.daemon.log_path).context("create log_path")?;
    let base = format!("{}/{merge_rid:06}", config.daemon.log_path);
    let mut stdout_log = std::fs::File::create(format!("{base}.stdout")).context("open stdout log")?;
    let mut stderr_log = std::fs::File::create(format!("{base}.stderr")).context("open stderr log")?;
    let mut merge_log = std::fs::File::create(format!("{base}.log")).context("open merge log")?;
    writeln!(
        merge_log,
        "merge {merge_rid:06} project={} branch={} changes={}",
        spec.project,
        spec.branch,
        change_queue.len()
    )?;
    drop(merge_log);

    let link = format!("merge #{merge_rid:06}");
    if !config.daemon.silent {
        for change in change_queue {
            let _ = rt.block_on(review.set_review(
                &change.change_id,
                &change.current_revision,
                &format!("submitted to {link}"),
                &[("Merge-Queue", 0)],
                "NONE",
            ));
        }
    }

    let workspace_dir = format!(
        "{}/{}/{}",
        config.daemon.workspace_root,
        spec.project,
        spec.effective_name()
    );
    let git = Git::new(workspace_dir.clone());
    let remote_url = format!("{}/{}", config.review.url.trim_end_matches('/'), spec.project);

    let feature_branches: Vec<String> = change_queue
        .iter()
        .filter_map(|c| c.message_meta.feature_branch.clone())
        .collect();

    let merge_result = (|| -> Result<String> {
        git.ensure_cloned(&remote_url)?;
        git.fetch()?;
        let staging = coalesce_merge(&git, &spec.branch, merge_rid, &feature_branches)?;
        Ok(staging)
    })();

    let staging = match merge_result {
        Ok(s) => s,
        Err(e) => {
            warn!(merge_rid, error = %e, "workspace merge failed");
            let _ = git.delete_remote(&mqd_core::git::merge_queue_branch(merge_rid));
            let _ = git.cleanup();
            return finish(
                MergeState::StepFailed,
                merge_rid,
                change_queue,
                spec,
                config,
                store,
                review,
                &rt,
                base,
                stdout_log,
                stderr_log,
            );
        }
    };

    let ccache_dir = config.ccache.path.as_deref();
    let outcome = run_steps(
        spec,
        &workspace_dir,
        change_queue,
        merge_rid,
        review,
        store,
        ccache_dir,
        &mut stdout_log,
        &mut stderr_log,
    )?;

    if matches!(outcome, StepOutcome::Success) {
        submit_or_run_submit_cmd(spec, change_queue, &git, review, &rt, &mut stdout_log)?;
    }

    let _ = git.delete_remote(&staging);
    let _ = git.cleanup();

    finish(
        outcome.merge_state(),
        merge_rid,
        change_queue,
        spec,
        config,
        store,
        review,
        &rt,
        base,
        stdout_log,
        stderr_log,
    )
}

/// Steps 6-7 of the verification pipeline: submit via REST in
/// `change_queue` order (stopping at the first non-SUBMITTED response), or
/// run `spec.submit_cmd` per change when the last build step already
/// performed the submission.
fn submit_or_run_submit_cmd(
    spec: &QueueSpec,
    change_queue: &[ChangeInfo],
    git: &Git,
    review: &Arc<dyn ReviewClient>,
    rt: &tokio::runtime::Runtime,
    log: &mut impl std::io::Write,
) -> Result<()> {
    if spec.submit_with_rest {
        for change in change_queue {
            match rt.block_on(review.submit(&change.change_id)) {
                Ok(mqd_review::SubmitStatus::Submitted) => {
                    let _ = writeln!(log, "submitted {}", change.change_id);
                }
                Ok(mqd_review::SubmitStatus::Rejected(reason)) => {
                    warn!(change_id = %change.change_id, reason, "submit rejected; stopping batch");
                    break;
                }
                Err(e) => {
                    warn!(change_id = %change.change_id, error = %e, "submit transport error; stopping batch");
                    break;
                }
            }
        }
        return Ok(());
    }

    for change in change_queue {
        let Some(feature_branch) = &change.message_meta.feature_branch else {
            continue;
        };
        if let Err(e) = (|| -> Result<(), mqd_core::error::WorkspaceError> {
            git.checkout(&spec.branch)?;
            git.fetch()?;
            git.checkout_and_merge(&spec.branch, feature_branch)?;
            Ok(())
        })() {
            warn!(change_id = %change.change_id, error = %e, "local submit merge failed");
            break;
        }
        if spec.submit_cmd.is_empty() {
            continue;
        }
        let Some((program, args)) = spec.submit_cmd.split_first() else {
            continue;
        };
        let status = std::process::Command::new(program)
            .args(args)
            .current_dir(&git.repo_path)
            .status();
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                warn!(change_id = %change.change_id, code = ?s.code(), "submit_cmd failed");
                break;
            }
            Err(e) => {
                warn!(change_id = %change.change_id, error = %e, "submit_cmd spawn failed");
                break;
            }
        }
    }
    Ok(())
}

/// Step 9-10: post the result comment with the coalesce/serial label
/// policy, write `end_time`, and gzip the logs leaving a zero-byte stub
/// (the static log server needs the uncompressed path to exist before it
/// serves the `.gz` alongside it).
#[allow(clippy::too_many_arguments)]
fn finish(
    state: MergeState,
    merge_rid: i64,
    change_queue: &[ChangeInfo],
    spec: &QueueSpec,
    config: &Config,
    store: &Arc<Store>,
    review: &Arc<dyn ReviewClient>,
    rt: &tokio::runtime::Runtime,
    base: String,
    stdout_log: std::fs::File,
    stderr_log: std::fs::File,
) -> Result<MergeState> {
    store.update_merge_status(merge_rid, state, Some(Utc::now()))?;

    if !config.daemon.silent {
        let serial = change_queue.len() == 1;
        for change in change_queue {
            let (message, labels): (String, Vec<(&str, i64)>) = match state {
                MergeState::Success => (format!("merge #{merge_rid:06} succeeded"), vec![("Merge-Queue", 1)]),
                _ if serial => (
                    format!("merge #{merge_rid:06} failed: {state:?}"),
                    vec![("Merge-Queue", -1)],
                ),
                _ => (
                    format!("merge #{merge_rid:06} failed as part of a coalesced batch; will retry individually"),
                    vec![("Merge-Queue", 0)],
                ),
            };
            let notify = if matches!(state, MergeState::Success) { "NONE" } else { "OWNER" };
            let _ = rt.block_on(review.set_review(&change.change_id, &change.current_revision, &message, &labels, notify));
        }
    }

    drop(stdout_log);
    drop(stderr_log);
    for suffix in [".log", ".stdout", ".stderr"] {
        let path = format!("{base}{suffix}");
        if let Err(e) = gzip_and_stub(&path) {
            warn!(path, error = %e, "failed to gzip merge log");
        }
    }

    info!(merge_rid, project = %spec.project, state = ?state, "verification finished");
    Ok(state)
}

fn gzip_and_stub(path: &str) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {path}"))?;
    let gz_path = format!("{path}.gz");
    let gz_file = std::fs::File::create(&gz_path).with_context(|| format!("creating {gz_path}"))?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    std::fs::File::create(path).with_context(|| format!("truncating {path}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_set_round_trips_mark_and_clear() {
        let scheduler = Scheduler::new();
        let key = ("widgets".to_string(), "master".to_string());
        let change = sample_change("c1");
        scheduler.mark_dirty(&key, &[change.clone()]);
        assert!(scheduler.dirty_set(&key).contains("c1"));
        scheduler.clear_dirty(&key, &[change]);
        assert!(!scheduler.dirty_set(&key).contains("c1"));
    }

    fn sample_change(change_id: &str) -> ChangeInfo {
        ChangeInfo {
            rid: 1,
            poll_id: 1,
            queue_time: Utc::now(),
            priority: 100,
            change_id: change_id.to_string(),
            project: "widgets".into(),
            branch: "master".into(),
            subject: "test".into(),
            current_revision: "deadbeef".into(),
            owner_id: 1,
            message_meta: Default::default(),
        }
    }
}
