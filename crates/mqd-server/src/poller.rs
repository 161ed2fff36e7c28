//! The Poller (C3): one pass over the upstream review server, staged into
//! a fresh `poll_id` and committed atomically. Grounded in
//! `gerrit_mq/functions.py`'s `poll_query`/`poll` loop.

use std::sync::Arc;

use anyhow::Result;
use mqd_core::db::Store;
use mqd_core::types::{Account, ChangeInfo};
use mqd_review::{ListFilters, ReviewClient};
use tracing::info;

const PAGE_SIZE: i64 = 25;

/// Run one poll pass: page through `ListReady` until an empty page, stage
/// every change under a fresh `poll_id`, and commit the rotation.
///
/// Network paging happens here on the async side; the DB work (account
/// upserts plus the queue rotation) is handed to `spawn_blocking` as one
/// batch so no blocking `rusqlite` call ever straddles an `.await`.
pub async fn poll_once(store: &Arc<Store>, review: &Arc<dyn ReviewClient>) -> Result<usize> {
    let mut staged: Vec<ChangeInfo> = Vec::new();
    let mut owners: Vec<Account> = Vec::new();
    let mut offset = 0i64;

    loop {
        let page = review
            .list_ready(&ListFilters::default(), offset, PAGE_SIZE)
            .await;
        if page.is_empty() {
            break;
        }
        let page_len = page.len();
        for change in page {
            owners.push(change.owner.clone());
            staged.push(ChangeInfo {
                rid: 0,
                poll_id: 0,
                queue_time: change.queue_time,
                priority: change.priority,
                change_id: change.change_id,
                project: change.project,
                branch: change.branch,
                subject: change.subject,
                current_revision: change.current_revision,
                owner_id: change.owner.account_id,
                message_meta: mqd_core::labels::parse_message_meta(&change.message_body),
            });
        }
        if (page_len as i64) < PAGE_SIZE {
            break;
        }
        offset += PAGE_SIZE;
    }

    let store = Arc::clone(store);
    let count = staged.len();
    let poll_id = tokio::task::spawn_blocking(move || -> Result<i64> {
        let poll_id = store.next_poll_id()?;
        for owner in &owners {
            store.upsert_account(owner)?;
        }
        let staged: Vec<ChangeInfo> = staged
            .into_iter()
            .map(|mut c| {
                c.poll_id = poll_id;
                c
            })
            .collect();
        store.replace_queue(poll_id, &staged)?;
        Ok(poll_id)
    })
    .await??;

    info!(poll_id, count, "poll committed");
    Ok(count)
}
