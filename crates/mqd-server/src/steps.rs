//! The Step Runner (C5): runs one `QueueSpec`'s `build_steps` against a
//! staged workspace, supervising each child at ~1 Hz for cancellation and
//! upstream label eviction. Grounded in `gerrit_mq/functions.py`'s
//! `run_step`/`run_build` loop and its `kill_child` SIGTERM/SIGKILL
//! escalation.

use std::collections::HashMap;
use std::io::Write as _;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mqd_core::db::Store;
use mqd_core::types::{ChangeInfo, MergeState, QueueSpec};
use mqd_review::ReviewClient;
use tracing::{error, info, warn};

const SUPERVISE_POLL: Duration = Duration::from_secs(1);
const EVICTION_CHECK: Duration = Duration::from_secs(30);
const CANCEL_CHECK: Duration = Duration::from_secs(10);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5 * 60);
const KILL_POLL: Duration = Duration::from_secs(2);
const KILL_POLL_ROUNDS: u32 = 5;

/// Outcome of running every configured step, collapsing onto the same
/// states a `MergeStatus` row can hold.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success,
    StepFailed {
        stepno: usize,
        command: String,
        code: Option<i32>,
    },
    Canceled {
        reason: String,
    },
}

impl StepOutcome {
    pub fn merge_state(&self) -> MergeState {
        match self {
            StepOutcome::Success => MergeState::Success,
            StepOutcome::StepFailed { .. } => MergeState::StepFailed,
            StepOutcome::Canceled { .. } => MergeState::Canceled,
        }
    }
}

/// Build the child environment: `spec.build_env`, optionally overlaid on
/// the daemon's own process environment, plus `CCACHE_DIR` when
/// configured. List-valued entries whose key ends in `PATH` are joined
/// with `:`; other list entries are joined with `,` (see `EnvValue::resolve`).
fn build_env(spec: &QueueSpec, ccache_dir: Option<&str>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = HashMap::new();
    if spec.merge_build_env {
        for (k, v) in std::env::vars() {
            env.insert(k, v);
        }
    }
    for (key, value) in &spec.build_env {
        env.insert(key.clone(), value.resolve(key));
    }
    if let Some(dir) = ccache_dir {
        env.insert("CCACHE_DIR".to_string(), dir.to_string());
    }
    env
}

/// Run every step of `spec.build_steps` in order inside `workspace_dir`,
/// writing banners and child output to `stdout_log`/`stderr_log`.
///
/// Each child's stdout/stderr is redirected straight to a clone of the log
/// file descriptor (`gerrit_mq/functions.py`'s `run_step`: `Popen(stdout=
/// logfile, stderr=logfile)`), not piped back to this process — a piped
/// child whose combined output exceeds the OS pipe buffer would block on
/// `write()` forever, since the supervision loop below only polls
/// `try_wait()` and never reads a pipe.
///
/// Blocking by design: this is spawned onto a dedicated
/// `tokio::task::spawn_blocking` by the caller. The child is a
/// `std::process::Command`, not `tokio::process::Command` — the ~1 Hz
/// poll loop plus signal-based kill maps directly onto synchronous
/// `libc` signal delivery, the same way the Store and Git wrappers reason
/// about blocking OS calls.
#[allow(clippy::too_many_arguments)]
pub fn run_steps(
    spec: &QueueSpec,
    workspace_dir: &str,
    change_queue: &[ChangeInfo],
    merge_rid: i64,
    review: &Arc<dyn ReviewClient>,
    store: &Arc<Store>,
    ccache_dir: Option<&str>,
    stdout_log: &mut std::fs::File,
    stderr_log: &mut std::fs::File,
) -> Result<StepOutcome> {
    let env = build_env(spec, ccache_dir);
    let last_step = spec.build_steps.len().saturating_sub(1);

    for (stepno, argv) in spec.build_steps.iter().enumerate() {
        let command_str = argv.join(" ");
        let banner = format!("=== step {stepno}: {command_str} ===\n");
        let _ = stdout_log.write_all(banner.as_bytes());
        let _ = stderr_log.write_all(banner.as_bytes());
        let _ = stdout_log.flush();
        let _ = stderr_log.flush();

        let Some((program, args)) = argv.split_first() else {
            continue;
        };
        let child_stdout = stdout_log
            .try_clone()
            .with_context(|| format!("failed to clone stdout log for step {stepno}"))?;
        let child_stderr = stderr_log
            .try_clone()
            .with_context(|| format!("failed to clone stderr log for step {stepno}"))?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(workspace_dir)
            .envs(&env)
            .stdout(Stdio::from(child_stdout))
            .stderr(Stdio::from(child_stderr))
            .spawn()
            .with_context(|| format!("failed to spawn step {stepno}: {command_str}"))?;

        let is_last_step = stepno == last_step;
        let suppress_eviction_check = is_last_step && !spec.submit_with_rest;

        let outcome = supervise(
            &mut child,
            merge_rid,
            change_queue,
            review,
            store,
            suppress_eviction_check,
        );

        match outcome {
            SuperviseOutcome::Exited(status) => {
                if !status.success() {
                    return Ok(StepOutcome::StepFailed {
                        stepno,
                        command: command_str,
                        code: status.code(),
                    });
                }
            }
            SuperviseOutcome::Canceled(reason) => {
                kill_child(&mut child);
                return Ok(StepOutcome::Canceled { reason });
            }
        }
    }

    Ok(StepOutcome::Success)
}

enum SuperviseOutcome {
    Exited(std::process::ExitStatus),
    Canceled(String),
}

/// Poll `child` at ~1 Hz until it exits or a cancellation condition fires.
/// Runs the eviction/cancel checks via a fresh current-thread Tokio
/// runtime, since this function itself runs on a blocking thread with no
/// async context of its own.
fn supervise(
    child: &mut Child,
    merge_rid: i64,
    change_queue: &[ChangeInfo],
    review: &Arc<dyn ReviewClient>,
    store: &Arc<Store>,
    suppress_eviction_check: bool,
) -> SuperviseOutcome {
    let started = Instant::now();
    let mut last_eviction_check = Instant::now();
    let mut last_cancel_check = Instant::now();
    let mut last_heartbeat = Instant::now();
    let mut transient_failures: u64 = 0;
    let mut total_checks: u64 = 0;

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build supervision runtime; falling back to exit-only wait");
            let status = child.wait();
            return SuperviseOutcome::Exited(status.unwrap_or_else(|_| default_exit_status()));
        }
    };

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return SuperviseOutcome::Exited(status),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "try_wait failed; treating as still running");
            }
        }

        if !suppress_eviction_check && last_eviction_check.elapsed() >= EVICTION_CHECK {
            last_eviction_check = Instant::now();
            total_checks += 1;
            let evicted = rt.block_on(find_evicted(change_queue, review));
            match evicted {
                Ok(ids) if !ids.is_empty() => {
                    warn!(merge_rid, evicted = ?ids, "change lost merge-queue +1 mid-merge; canceling");
                    return SuperviseOutcome::Canceled(format!(
                        "changes lost merge-queue label: {}",
                        ids.join(", ")
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    transient_failures += 1;
                    if transient_failures == 1 {
                        error!(error = %e, "transient failure polling review server for label eviction; intermittent failures are expected");
                    } else {
                        warn!(
                            error = %e,
                            ratio = format!("{transient_failures}/{total_checks}"),
                            "repeated transient failure polling review server"
                        );
                    }
                }
            }
        }

        if last_cancel_check.elapsed() >= CANCEL_CHECK {
            last_cancel_check = Instant::now();
            match store.peek_cancel(merge_rid) {
                Ok(Some(cancel)) => {
                    info!(merge_rid, who = %cancel.who, "merge canceled by operator");
                    return SuperviseOutcome::Canceled(format!("canceled by {}", cancel.who));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "peek_cancel failed; continuing to poll"),
            }
        }

        if last_heartbeat.elapsed() >= HEARTBEAT_EVERY {
            last_heartbeat = Instant::now();
            info!(merge_rid, elapsed_s = started.elapsed().as_secs(), "step alive");
        }

        std::thread::sleep(SUPERVISE_POLL);
    }
}

async fn find_evicted(
    change_queue: &[ChangeInfo],
    review: &Arc<dyn ReviewClient>,
) -> Result<Vec<String>> {
    let mut evicted = Vec::new();
    for change in change_queue {
        match review.merge_queue_score(&change.change_id).await? {
            Some(1) => {}
            _ => evicted.push(change.change_id.clone()),
        }
    }
    Ok(evicted)
}

/// SIGTERM, poll every 2s up to 10s; if still alive, SIGKILL, poll every
/// 2s up to 10s; then log "zombified" and give up waiting.
fn kill_child(child: &mut Child) {
    let pid = child.id() as i32;
    send_signal(pid, libc::SIGTERM);
    if wait_for_exit(child, KILL_POLL, KILL_POLL_ROUNDS) {
        return;
    }
    send_signal(pid, libc::SIGKILL);
    if wait_for_exit(child, KILL_POLL, KILL_POLL_ROUNDS) {
        return;
    }
    warn!(pid, "child did not exit after SIGKILL; zombified");
}

fn send_signal(pid: i32, sig: i32) {
    unsafe {
        libc::kill(pid, sig);
    }
}

fn wait_for_exit(child: &mut Child, interval: Duration, rounds: u32) -> bool {
    for _ in 0..rounds {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => std::thread::sleep(interval),
            Err(_) => return true,
        }
    }
    matches!(child.try_wait(), Ok(Some(_)))
}

#[cfg(not(unix))]
fn default_exit_status() -> std::process::ExitStatus {
    unreachable!("unix-only kill protocol")
}

#[cfg(unix)]
fn default_exit_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqd_core::types::EnvValue;

    fn spec_with_steps(steps: Vec<Vec<&str>>) -> QueueSpec {
        QueueSpec {
            project: "widgets".into(),
            branch: "master".into(),
            name: None,
            build_env: Default::default(),
            merge_build_env: false,
            build_steps: steps
                .into_iter()
                .map(|s| s.into_iter().map(String::from).collect())
                .collect(),
            submit_with_rest: true,
            submit_cmd: vec![],
            coalesce_count: 0,
        }
    }

    #[test]
    fn build_env_joins_path_lists_with_colon() {
        let mut spec = spec_with_steps(vec![]);
        spec.build_env.insert(
            "PATH".to_string(),
            EnvValue::List(vec!["/usr/bin".into(), "/bin".into()]),
        );
        spec.build_env.insert("CC".to_string(), EnvValue::Scalar("clang".into()));
        let env = build_env(&spec, Some("/var/cache/ccache"));
        assert_eq!(env.get("PATH").unwrap(), "/usr/bin:/bin");
        assert_eq!(env.get("CC").unwrap(), "clang");
        assert_eq!(env.get("CCACHE_DIR").unwrap(), "/var/cache/ccache");
    }

    #[test]
    fn run_steps_reports_failure_with_stepno_and_code() {
        let spec = spec_with_steps(vec![vec!["true"], vec!["false"], vec!["true"]]);
        let review: Arc<dyn ReviewClient> = Arc::new(NullReviewClient);
        let store = Arc::new(Store::open(":memory:").unwrap());
        let mut out = tempfile::tempfile().unwrap();
        let mut err = tempfile::tempfile().unwrap();
        let outcome = run_steps(&spec, ".", &[], 1, &review, &store, None, &mut out, &mut err).unwrap();
        match outcome {
            StepOutcome::StepFailed { stepno, code, .. } => {
                assert_eq!(stepno, 1);
                assert_eq!(code, Some(1));
            }
            other => panic!("expected StepFailed, got {other:?}"),
        }
    }

    #[test]
    fn run_steps_succeeds_when_every_step_exits_zero() {
        let spec = spec_with_steps(vec![vec!["true"], vec!["true"]]);
        let review: Arc<dyn ReviewClient> = Arc::new(NullReviewClient);
        let store = Arc::new(Store::open(":memory:").unwrap());
        let mut out = tempfile::tempfile().unwrap();
        let mut err = tempfile::tempfile().unwrap();
        let outcome = run_steps(&spec, ".", &[], 1, &review, &store, None, &mut out, &mut err).unwrap();
        assert!(matches!(outcome, StepOutcome::Success));
    }

    #[test]
    fn run_steps_writes_child_output_straight_to_the_log_file() {
        let spec = spec_with_steps(vec![vec!["echo", "hello-from-step"]]);
        let review: Arc<dyn ReviewClient> = Arc::new(NullReviewClient);
        let store = Arc::new(Store::open(":memory:").unwrap());
        let mut out = tempfile::tempfile().unwrap();
        let mut err = tempfile::tempfile().unwrap();
        let outcome = run_steps(&spec, ".", &[], 1, &review, &store, None, &mut out, &mut err).unwrap();
        assert!(matches!(outcome, StepOutcome::Success));

        use std::io::{Read, Seek, SeekFrom};
        let mut contents = String::new();
        out.seek(SeekFrom::Start(0)).unwrap();
        out.read_to_string(&mut contents).unwrap();
        assert!(contents.contains("hello-from-step"), "{contents}");
    }

    struct NullReviewClient;

    #[async_trait::async_trait]
    impl ReviewClient for NullReviewClient {
        async fn list_ready(
            &self,
            _filters: &mqd_review::ListFilters,
            _offset: i64,
            _limit: i64,
        ) -> Vec<mqd_review::UpstreamChange> {
            Vec::new()
        }

        async fn get_change(&self, _change_id: &str) -> Result<Option<mqd_review::UpstreamChange>> {
            Ok(None)
        }

        async fn merge_queue_score(&self, _change_id: &str) -> Result<Option<i64>> {
            Ok(Some(1))
        }

        async fn set_review(
            &self,
            _change_id: &str,
            _revision: &str,
            _message: &str,
            _labels: &[(&str, i64)],
            _notify: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn submit(&self, _change_id: &str) -> Result<mqd_review::SubmitStatus> {
            Ok(mqd_review::SubmitStatus::Submitted)
        }

        async fn lookup_account(&self, _query: &str) -> Result<Option<mqd_core::types::Account>> {
            Ok(None)
        }
    }
}
