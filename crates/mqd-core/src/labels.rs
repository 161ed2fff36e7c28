//! Folding of `Merge-Queue` label event histories and extraction of
//! `Key: value` metadata from commit messages.
//!
//! Grounded in `gerrit_mq/common.py`'s `sort_merge_queue_labels` /
//! `get_resolved_merge_queue_score` and `get_message_meta`.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::types::MessageMeta;

/// One `Merge-Queue` label event as reported by the review server.
#[derive(Debug, Clone)]
pub struct LabelEvent {
    pub date: Option<String>,
    pub value: Option<i64>,
}

/// Canonicalize the upstream's timestamp format: strip trailing zeros from
/// the fractional-seconds component but keep at least one digit, then parse
/// against the long-form pattern.
fn parse_event_time(raw: &str) -> Option<DateTime<Utc>> {
    let (head, frac) = raw.split_once('.')?;
    let mut frac = frac.trim_end_matches('0').to_string();
    if frac.is_empty() {
        frac.push('0');
    }
    let canon = format!("{head}.{frac}000000");
    let canon = &canon[..head.len() + 1 + 6];
    NaiveDateTime::parse_from_str(canon, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|ndt| ndt.and_utc())
}

/// Resolve a label-event history into `(queue_time, queue_score)`.
///
/// Algorithm: sort chronologically; every `-1` replaces the running
/// `(time, -1)`; a `+1` replaces the running pair only if it isn't already
/// `+1`. If no `+1` is active at the end, the change is not ready and the
/// result is `(now, -1)`.
pub fn resolve_merge_queue_score(events: &[LabelEvent]) -> (DateTime<Utc>, i64) {
    let mut parsed: Vec<(DateTime<Utc>, i64)> = events
        .iter()
        .filter_map(|e| {
            let date = e.date.as_ref()?;
            let value = e.value?;
            let time = parse_event_time(date)?;
            Some((time, value))
        })
        .collect();
    parsed.sort_by_key(|(t, _)| *t);

    let mut current: Option<(DateTime<Utc>, i64)> = None;
    for (time, value) in parsed {
        match value {
            -1 => current = Some((time, -1)),
            1 => {
                if current.map(|(_, v)| v) != Some(1) {
                    current = Some((time, 1));
                }
            }
            _ => {}
        }
    }

    match current {
        Some((t, 1)) => (t, 1),
        _ => (Utc::now(), -1),
    }
}

/// Parse `Key: value` header lines out of a commit message body.
///
/// `Closes`/`Resolves` accumulate comma-separated values across repeated
/// keys; `Priority` is parsed as an integer (malformed values ignored);
/// every other key takes the last-seen value.
pub fn parse_message_meta(body: &str) -> MessageMeta {
    let mut meta = MessageMeta::default();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() || key.contains(' ') {
            continue;
        }
        match key {
            "Feature-Branch" => meta.feature_branch = Some(value.to_string()),
            "Priority" => {
                if let Ok(p) = value.parse::<i64>() {
                    meta.priority = Some(p);
                }
            }
            "Closes" => meta.closes.extend(split_csv(value)),
            "Resolves" => meta.resolves.extend(split_csv(value)),
            other => {
                meta.other.insert(other.to_string(), value.to_string());
            }
        }
    }
    meta
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(date: &str, value: i64) -> LabelEvent {
        LabelEvent {
            date: Some(date.to_string()),
            value: Some(value),
        }
    }

    #[test]
    fn picks_plus_one_after_latest_minus_one() {
        let events = vec![
            ev("2024-01-01 00:00:00.000000000", 1),
            ev("2024-01-02 00:00:00.000000000", -1),
            ev("2024-01-03 00:00:00.000000000", 1),
        ];
        let (_, score) = resolve_merge_queue_score(&events);
        assert_eq!(score, 1);
    }

    #[test]
    fn no_active_plus_one_is_not_ready() {
        let events = vec![
            ev("2024-01-01 00:00:00.000000000", 1),
            ev("2024-01-02 00:00:00.000000000", -1),
        ];
        let (_, score) = resolve_merge_queue_score(&events);
        assert_eq!(score, -1);
    }

    #[test]
    fn duplicate_plus_one_does_not_move_time() {
        let events = vec![
            ev("2024-01-01 00:00:00.000000000", 1),
            ev("2024-01-02 00:00:00.000000000", 1),
        ];
        let (t, score) = resolve_merge_queue_score(&events);
        assert_eq!(score, 1);
        assert_eq!(t.format("%Y-%m-%d").to_string(), "2024-01-01");
    }

    #[test]
    fn empty_history_is_not_ready() {
        let (_, score) = resolve_merge_queue_score(&[]);
        assert_eq!(score, -1);
    }

    #[test]
    fn closes_accumulates_across_duplicate_keys() {
        let meta = parse_message_meta("Closes: a, b\nCloses: c\n");
        assert_eq!(meta.closes, vec!["a", "b", "c"]);
    }

    #[test]
    fn malformed_priority_is_ignored() {
        let meta = parse_message_meta("Priority: not-a-number\n");
        assert_eq!(meta.priority, None);
    }

    #[test]
    fn valid_priority_is_parsed() {
        let meta = parse_message_meta("Priority: 5\n");
        assert_eq!(meta.priority, Some(5));
    }

    #[test]
    fn feature_branch_is_captured() {
        let meta = parse_message_meta("Some subject\n\nFeature-Branch: feat/x\n");
        assert_eq!(meta.feature_branch.as_deref(), Some("feat/x"));
    }
}
