use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::QueueSpec;

/// Top-level configuration, loaded from a TOML file (default `./mqd.toml`,
/// overridable with `--config` / `MQD_CONFIG`). Secrets may be supplied via
/// environment variables layered over the file (see `Config::load`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub ccache: CcacheConfig,
    pub review: ReviewConfig,
    pub listen: ListenConfig,
    #[serde(rename = "queue", default)]
    pub queues: Vec<QueueSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub workspace_root: String,
    #[serde(default = "default_poll_period")]
    pub poll_period_s: u64,
    pub pidfile_path: String,
    pub offline_sentinel_path: String,
    #[serde(default)]
    pub silent: bool,
    pub log_path: String,
    /// (project, name) pairs this daemon instance actively services.
    /// Empty means "service every configured queue".
    #[serde(default)]
    pub enabled_queue: Vec<EnabledQueue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnabledQueue {
    pub project: String,
    pub name: String,
}

fn default_poll_period() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CcacheConfig {
    pub path: Option<String>,
    pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub disable_tls_verify: bool,
    #[serde(default)]
    pub ssh_username: String,
    #[serde(default)]
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_port() -> u16 {
    29418
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

impl Config {
    /// Load from a TOML file at `path`, then overlay `MQD_REVIEW_PASSWORD`
    /// from the environment if set (secrets never live in the file when the
    /// operator prefers env injection).
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {path:?}"))?;
        if let Ok(password) = std::env::var("MQD_REVIEW_PASSWORD") {
            config.review.password = password;
        }
        config.validate_queues()?;
        Ok(config)
    }

    /// A `QueueSpec` with a non-literal `branch` pattern (a real regex,
    /// matching more than one branch name) must name itself explicitly;
    /// only a plain-literal pattern can default `name` to `branch`.
    fn validate_queues(&self) -> Result<()> {
        for q in &self.queues {
            if q.name.is_none() && !q.is_literal_branch() {
                bail!(
                    "queue {}: `name` is required because `branch` (\"{}\") is not a plain literal pattern",
                    q.project, q.branch
                );
            }
        }
        Ok(())
    }

    /// Queues this daemon instance should actually service, keyed by
    /// `(project, name)`. Empty `enabled_queue` means "all of them".
    pub fn active_queues(&self) -> Vec<&QueueSpec> {
        if self.daemon.enabled_queue.is_empty() {
            return self.queues.iter().collect();
        }
        let enabled: HashMap<(&str, &str), ()> = self
            .daemon
            .enabled_queue
            .iter()
            .map(|e| ((e.project.as_str(), e.name.as_str()), ()))
            .collect();
        self.queues
            .iter()
            .filter(|q| enabled.contains_key(&(q.project.as_str(), q.effective_name().as_str())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sample_config() {
        let toml_src = r#"
[daemon]
workspace_root = "/srv/mqd/work"
poll_period_s = 15
pidfile_path = "/tmp/mqd.pid"
offline_sentinel_path = "/tmp/mqd.offline"
log_path = "/var/log/mqd"

[review]
url = "https://review.example.com"
username = "mqd-bot"

[listen]
host = "0.0.0.0"
port = 9090

[[queue]]
project = "widgets"
branch = "^master$"
coalesce_count = 4
build_steps = [["make", "test"]]

[queue.build_env]
PATH = ["/usr/bin", "/bin"]
CC = "clang"
"#;
        let config: Config = toml::from_str(toml_src).expect("parse");
        assert_eq!(config.daemon.poll_period_s, 15);
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[0].effective_name(), "^master$");
        assert_eq!(config.active_queues().len(), 1);
    }

    #[test]
    fn load_rejects_nonliteral_branch_without_name() {
        let toml_src = r#"
[daemon]
workspace_root = "/srv/mqd/work"
pidfile_path = "/tmp/mqd.pid"
offline_sentinel_path = "/tmp/mqd.offline"
log_path = "/var/log/mqd"

[review]
url = "https://review.example.com"
username = "mqd-bot"

[listen]

[[queue]]
project = "widgets"
branch = "^release/.*$"
build_steps = [["make", "test"]]
"#;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml_src).unwrap();
        let err = Config::load(file.path().to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("`name` is required"), "{err}");
    }

    #[test]
    fn load_accepts_nonliteral_branch_with_name() {
        let toml_src = r#"
[daemon]
workspace_root = "/srv/mqd/work"
pidfile_path = "/tmp/mqd.pid"
offline_sentinel_path = "/tmp/mqd.offline"
log_path = "/var/log/mqd"

[review]
url = "https://review.example.com"
username = "mqd-bot"

[listen]

[[queue]]
project = "widgets"
branch = "^release/.*$"
name = "release"
build_steps = [["make", "test"]]
"#;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), toml_src).unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.queues[0].effective_name(), "release");
    }

    #[test]
    fn enabled_queue_filters_active_queues() {
        let mut config = Config {
            daemon: DaemonConfig {
                workspace_root: "/w".into(),
                poll_period_s: 30,
                pidfile_path: "/p".into(),
                offline_sentinel_path: "/o".into(),
                silent: false,
                log_path: "/l".into(),
                enabled_queue: vec![EnabledQueue {
                    project: "widgets".into(),
                    name: "release".into(),
                }],
            },
            ccache: CcacheConfig::default(),
            review: ReviewConfig {
                url: "https://review".into(),
                username: "bot".into(),
                password: String::new(),
                disable_tls_verify: false,
                ssh_username: String::new(),
                ssh_host: String::new(),
                ssh_port: 29418,
            },
            listen: ListenConfig {
                host: "127.0.0.1".into(),
                port: 8088,
            },
            queues: vec![
                QueueSpec {
                    project: "widgets".into(),
                    branch: "master".into(),
                    name: Some("release".into()),
                    build_env: Default::default(),
                    merge_build_env: false,
                    build_steps: vec![],
                    submit_with_rest: true,
                    submit_cmd: vec![],
                    coalesce_count: 0,
                },
                QueueSpec {
                    project: "widgets".into(),
                    branch: "staging".into(),
                    name: Some("staging".into()),
                    build_env: Default::default(),
                    merge_build_env: false,
                    build_steps: vec![],
                    submit_with_rest: true,
                    submit_cmd: vec![],
                    coalesce_count: 0,
                },
            ],
        };
        assert_eq!(config.active_queues().len(), 1);
        config.daemon.enabled_queue.clear();
        assert_eq!(config.active_queues().len(), 2);
    }
}
