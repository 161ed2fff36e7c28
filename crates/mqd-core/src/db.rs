//! The Store (C2): the shared queue cache, merge history, account cache,
//! and cancellation table. Grounded in `gerrit_mq/orm.py`'s schema and
//! `gerrit_mq/functions.py`'s poll/queue/history queries.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    Account, Cancellation, ChangeInfo, MergeChange, MergeState, MergeStatus, MergeStatusDetail,
    MessageMeta,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Store {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

const TS_FMT: &str = "%Y-%m-%d %H:%M:%S";

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FMT)
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FMT).to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        account_id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        username: row.get(3)?,
    })
}

fn row_to_change_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeInfo> {
    let queue_time_str: String = row.get(2)?;
    let message_meta_str: String = row.get(10)?;
    let message_meta: MessageMeta = serde_json::from_str(&message_meta_str).unwrap_or_default();
    Ok(ChangeInfo {
        rid: row.get(0)?,
        poll_id: row.get(1)?,
        queue_time: parse_ts(&queue_time_str),
        priority: row.get(3)?,
        change_id: row.get(4)?,
        project: row.get(5)?,
        branch: row.get(6)?,
        subject: row.get(7)?,
        current_revision: row.get(8)?,
        owner_id: row.get(9)?,
        message_meta,
    })
}

fn row_to_merge_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeStatus> {
    let start_time_str: String = row.get(3)?;
    let end_time_str: Option<String> = row.get(4)?;
    let status_i: i64 = row.get(5)?;
    Ok(MergeStatus {
        rid: row.get(0)?,
        project: row.get(1)?,
        branch: row.get(2)?,
        start_time: parse_ts(&start_time_str),
        end_time: end_time_str.map(|s| parse_ts(&s)),
        status: MergeState::from_i64(status_i).unwrap_or(MergeState::InProgress),
        progress: row.get(6)?,
        msg_meta: row.get(7)?,
    })
}

fn row_to_merge_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeChange> {
    let request_time_str: String = row.get(5)?;
    Ok(MergeChange {
        id: row.get(0)?,
        merge_id: row.get(1)?,
        change_id: row.get(2)?,
        owner_id: row.get(3)?,
        feature_branch: row.get(4)?,
        request_time: parse_ts(&request_time_str),
        msg_meta: row.get(6)?,
    })
}

fn row_to_cancellation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cancellation> {
    let when_str: String = row.get(2)?;
    Ok(Cancellation {
        rid: row.get(0)?,
        who: row.get(1)?,
        when: parse_ts(&when_str),
    })
}

// ── Store impl ────────────────────────────────────────────────────────────

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;
        Ok(())
    }

    // ── Accounts ──────────────────────────────────────────────────────────

    pub fn upsert_account(&self, account: &Account) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO accounts (account_id, name, email, username) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(account_id) DO UPDATE SET \
               name = excluded.name, email = excluded.email, username = excluded.username",
            params![account.account_id, account.name, account.email, account.username],
        )
        .context("upsert_account")?;
        Ok(())
    }

    pub fn get_account(&self, account_id: i64) -> Result<Option<Account>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT account_id, name, email, username FROM accounts WHERE account_id = ?1",
            params![account_id],
            row_to_account,
        )
        .optional()
        .context("get_account")
    }

    // ── Queue cache (ChangeInfo) ──────────────────────────────────────────

    pub fn next_poll_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let max: Option<i64> = conn
            .query_row("SELECT MAX(poll_id) FROM change_info", [], |r| r.get(0))
            .context("next_poll_id")?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Transactional queue-snapshot rotation: insert all `changes` under
    /// `poll_id`, then delete every row whose `poll_id` doesn't match.
    pub fn replace_queue(&self, poll_id: i64, changes: &[ChangeInfo]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("replace_queue begin")?;
        for change in changes {
            let message_meta = serde_json::to_string(&change.message_meta)?;
            tx.execute(
                "INSERT INTO change_info \
                 (poll_id, queue_time, priority, change_id, project, branch, subject, \
                  current_revision, owner_id, message_meta) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    poll_id,
                    fmt_ts(change.queue_time),
                    change.priority,
                    change.change_id,
                    change.project,
                    change.branch,
                    change.subject,
                    change.current_revision,
                    change.owner_id,
                    message_meta,
                ],
            )
            .context("replace_queue insert")?;
        }
        tx.execute(
            "DELETE FROM change_info WHERE poll_id != ?1",
            params![poll_id],
        )
        .context("replace_queue prune stale")?;
        tx.commit().context("replace_queue commit")?;
        Ok(())
    }

    pub fn get_queue(
        &self,
        project_like: Option<&str>,
        branch_like: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<ChangeInfo>)> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM change_info \
                 WHERE (?1 IS NULL OR project LIKE ?1) AND (?2 IS NULL OR branch LIKE ?2)",
                params![project_like, branch_like],
                |r| r.get(0),
            )
            .context("get_queue count")?;

        let mut stmt = conn.prepare(
            "SELECT rid, poll_id, queue_time, priority, change_id, project, branch, subject, \
             current_revision, owner_id, message_meta \
             FROM change_info \
             WHERE (?1 IS NULL OR project LIKE ?1) AND (?2 IS NULL OR branch LIKE ?2) \
             ORDER BY priority ASC, queue_time ASC, project ASC, change_id ASC \
             LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt
            .query_map(params![project_like, branch_like, limit, offset], row_to_change_info)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_queue rows")?;
        Ok((count, rows))
    }

    /// All queued changes for one `(project, branch)`, in scheduler pick
    /// order, for use by the Scheduler (C6).
    pub fn get_queue_for_branch(&self, project: &str, branch: &str) -> Result<Vec<ChangeInfo>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT rid, poll_id, queue_time, priority, change_id, project, branch, subject, \
             current_revision, owner_id, message_meta \
             FROM change_info \
             WHERE project = ?1 AND branch = ?2 \
             ORDER BY priority ASC, queue_time ASC, project ASC, change_id ASC",
        )?;
        let rows = stmt
            .query_map(params![project, branch], row_to_change_info)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_queue_for_branch")?;
        Ok(rows)
    }

    pub fn get_full_queue(&self) -> Result<Vec<ChangeInfo>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT rid, poll_id, queue_time, priority, change_id, project, branch, subject, \
             current_revision, owner_id, message_meta \
             FROM change_info \
             ORDER BY priority ASC, queue_time ASC, project ASC, change_id ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_change_info)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_full_queue")?;
        Ok(rows)
    }

    // ── Merge history ─────────────────────────────────────────────────────

    pub fn create_merge(&self, project: &str, branch: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO merge_status (project, branch, start_time, status, progress) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![project, branch, now_str(), MergeState::InProgress.as_i64()],
        )
        .context("create_merge")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn append_merge_change(
        &self,
        merge_id: i64,
        change_id: &str,
        owner_id: i64,
        feature_branch: &str,
        request_time: DateTime<Utc>,
        msg_meta: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO merge_change \
             (merge_id, change_id, owner_id, feature_branch, request_time, msg_meta) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                merge_id,
                change_id,
                owner_id,
                feature_branch,
                fmt_ts(request_time),
                msg_meta,
            ],
        )
        .context("append_merge_change")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_merge_status(
        &self,
        rid: i64,
        status: MergeState,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE merge_status SET status = ?1, end_time = ?2 WHERE rid = ?3",
            params![status.as_i64(), end_time.map(fmt_ts), rid],
        )
        .context("update_merge_status")?;
        Ok(())
    }

    pub fn update_merge_progress(&self, rid: i64, progress: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE merge_status SET progress = ?1 WHERE rid = ?2",
            params![progress, rid],
        )
        .context("update_merge_progress")?;
        Ok(())
    }

    /// Crash recovery: rewrite every IN_PROGRESS row to CANCELED. Called
    /// once at daemon startup.
    pub fn mark_stale_in_progress(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE merge_status SET status = ?1, end_time = COALESCE(end_time, ?2) \
                 WHERE status = ?3",
                params![
                    MergeState::Canceled.as_i64(),
                    now_str(),
                    MergeState::InProgress.as_i64()
                ],
            )
            .context("mark_stale_in_progress")?;
        Ok(n)
    }

    pub fn get_merge_status(&self, rid: i64) -> Result<Option<MergeStatus>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT rid, project, branch, start_time, end_time, status, progress, msg_meta \
             FROM merge_status WHERE rid = ?1",
            params![rid],
            row_to_merge_status,
        )
        .optional()
        .context("get_merge_status")
    }

    pub fn get_latest_merge_status(&self) -> Result<Option<MergeStatus>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT rid, project, branch, start_time, end_time, status, progress, msg_meta \
             FROM merge_status ORDER BY rid DESC LIMIT 1",
            [],
            row_to_merge_status,
        )
        .optional()
        .context("get_latest_merge_status")
    }

    pub fn get_merge_changes(&self, merge_id: i64) -> Result<Vec<MergeChange>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, merge_id, change_id, owner_id, feature_branch, request_time, msg_meta \
             FROM merge_change WHERE merge_id = ?1 ORDER BY request_time ASC",
        )?;
        let rows = stmt
            .query_map(params![merge_id], row_to_merge_change)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_merge_changes")?;
        Ok(rows)
    }

    pub fn get_merge_status_detail(&self, rid: i64) -> Result<Option<MergeStatusDetail>> {
        let Some(status) = self.get_merge_status(rid)? else {
            return Ok(None);
        };
        let changes = self.get_merge_changes(rid)?;
        Ok(Some(MergeStatusDetail { status, changes }))
    }

    pub fn get_history(
        &self,
        project_like: Option<&str>,
        branch_like: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<(i64, Vec<MergeStatusDetail>)> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM merge_status \
                 WHERE (?1 IS NULL OR project LIKE ?1) AND (?2 IS NULL OR branch LIKE ?2)",
                params![project_like, branch_like],
                |r| r.get(0),
            )
            .context("get_history count")?;

        let mut stmt = conn.prepare(
            "SELECT rid, project, branch, start_time, end_time, status, progress, msg_meta \
             FROM merge_status \
             WHERE (?1 IS NULL OR project LIKE ?1) AND (?2 IS NULL OR branch LIKE ?2) \
             ORDER BY rid DESC LIMIT ?3 OFFSET ?4",
        )?;
        let statuses = stmt
            .query_map(params![project_like, branch_like, limit, offset], row_to_merge_status)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_history rows")?;
        drop(stmt);
        drop(conn);

        let mut detailed = Vec::with_capacity(statuses.len());
        for status in statuses {
            let changes = self.get_merge_changes(status.rid)?;
            detailed.push(MergeStatusDetail { status, changes });
        }
        Ok((count, detailed))
    }

    // ── Cancellations ─────────────────────────────────────────────────────

    pub fn request_cancel(&self, rid: i64, who: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let existing: Option<i64> = conn
            .query_row(
                "SELECT rid FROM cancellation WHERE rid = ?1",
                params![rid],
                |r| r.get(0),
            )
            .optional()
            .context("request_cancel check")?;
        if existing.is_some() {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO cancellation (rid, who, when_ts) VALUES (?1, ?2, ?3)",
            params![rid, who, now_str()],
        )
        .context("request_cancel insert")?;
        Ok(true)
    }

    pub fn peek_cancel(&self, rid: i64) -> Result<Option<Cancellation>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT rid, who, when_ts FROM cancellation WHERE rid = ?1",
            params![rid],
            row_to_cancellation,
        )
        .optional()
        .context("peek_cancel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageMeta;

    fn make_store() -> Store {
        Store::open(":memory:").expect("open in-memory store")
    }

    fn sample_change(rid_hint: i64, poll_id: i64, priority: i64) -> ChangeInfo {
        ChangeInfo {
            rid: 0,
            poll_id,
            queue_time: Utc::now(),
            priority,
            change_id: format!("I{rid_hint:08x}"),
            project: "widgets".into(),
            branch: "master".into(),
            subject: "Add feature".into(),
            current_revision: "abc123".into(),
            owner_id: 1,
            message_meta: MessageMeta::default(),
        }
    }

    #[test]
    fn replace_queue_rotates_atomically() {
        let store = make_store();
        store
            .upsert_account(&Account {
                account_id: 1,
                name: "A".into(),
                email: "a@example.com".into(),
                username: "a".into(),
            })
            .unwrap();

        store.replace_queue(1, &[sample_change(1, 1, 100)]).unwrap();
        let (count, rows) = store.get_queue(None, None, 0, 10).unwrap();
        assert_eq!(count, 1);
        assert_eq!(rows.len(), 1);

        store.replace_queue(2, &[sample_change(2, 2, 100)]).unwrap();
        let (count, rows) = store.get_queue(None, None, 0, 10).unwrap();
        assert_eq!(count, 1);
        assert_eq!(rows[0].poll_id, 2);
    }

    #[test]
    fn mark_stale_in_progress_clears_crash_state() {
        let store = make_store();
        let rid = store.create_merge("widgets", "master").unwrap();
        assert_eq!(
            store.get_merge_status(rid).unwrap().unwrap().status,
            MergeState::InProgress
        );
        let n = store.mark_stale_in_progress().unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            store.get_merge_status(rid).unwrap().unwrap().status,
            MergeState::Canceled
        );
    }

    #[test]
    fn request_cancel_is_idempotent() {
        let store = make_store();
        let rid = store.create_merge("widgets", "master").unwrap();
        assert!(store.request_cancel(rid, "alice").unwrap());
        assert!(!store.request_cancel(rid, "bob").unwrap());
        let cancellation = store.peek_cancel(rid).unwrap().unwrap();
        assert_eq!(cancellation.who, "alice");
    }

    #[test]
    fn queue_ordering_matches_scheduler_pick_order() {
        let store = make_store();
        store
            .upsert_account(&Account {
                account_id: 1,
                name: "A".into(),
                email: "a@example.com".into(),
                username: "a".into(),
            })
            .unwrap();
        let mut low_priority = sample_change(1, 1, 100);
        low_priority.change_id = "Ilow".into();
        let mut high_priority = sample_change(2, 1, 0);
        high_priority.change_id = "Ihigh".into();
        store
            .replace_queue(1, &[low_priority, high_priority])
            .unwrap();
        let (_, rows) = store.get_queue(None, None, 0, 10).unwrap();
        assert_eq!(rows[0].change_id, "Ihigh");
        assert_eq!(rows[1].change_id, "Ilow");
    }
}
