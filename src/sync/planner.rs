use log::info;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::store::Store;
use crate::sync::imap::{self, ImapSession};
use crate::sync::WorkPlan;
use crate::vault::Vault;

/// Identifiers on the server that have not been ingested yet, ascending.
/// Pure set difference: the same server state always yields the same delta.
pub fn compute_delta(server_uids: &[u32], ingested: &HashSet<u32>) -> Vec<u32> {
    let mut delta: Vec<u32> = server_uids
        .iter()
        .copied()
        .filter(|uid| !ingested.contains(uid))
        .collect();
    delta.sort_unstable();
    delta.dedup();
    delta
}

/// Diffs the owner's live mailbox listing against what is already stored.
/// Returns `None` when nothing new exists, so an empty delta never becomes
/// a job. Performs no writes; planning is idempotent and safe to repeat.
pub async fn plan(
    store: &Mutex<Store>,
    vault: &Vault,
    owner_id: &str,
    net_timeout: Duration,
) -> Result<Option<WorkPlan>> {
    let account = {
        store
            .lock()
            .expect("store mutex poisoned")
            .get_account(owner_id)?
    }
    .ok_or_else(|| {
        SyncError::configuration(format!("no mail account configured for {}", owner_id))
    })?;

    let password = vault.decrypt(&account.password_ciphertext, &account.password_nonce)?;

    let mut session = imap::connect(
        &account.host,
        account.port,
        &account.username,
        &password,
        net_timeout,
    )
    .await?;
    let scanned = scan_mailboxes(&mut session, store, owner_id, net_timeout).await;
    imap::close(session).await;

    let plan = scanned?;
    if plan.is_empty() {
        info!("no new messages for {}", owner_id);
        return Ok(None);
    }
    info!(
        "planned {} new messages across {} mailboxes for {}",
        plan.total(),
        plan.mailboxes.len(),
        owner_id
    );
    Ok(Some(plan))
}

async fn scan_mailboxes(
    session: &mut ImapSession,
    store: &Mutex<Store>,
    owner_id: &str,
    net_timeout: Duration,
) -> Result<WorkPlan> {
    let mut plan = WorkPlan::default();
    for mailbox in imap::list_selectable_mailboxes(session, net_timeout).await? {
        let server_uids = imap::list_message_uids(session, &mailbox, net_timeout).await?;
        let ingested = {
            store
                .lock()
                .expect("store mutex poisoned")
                .list_ingested_uids(owner_id, &mailbox)?
        };
        let delta = compute_delta(&server_uids, &ingested);
        if !delta.is_empty() {
            plan.mailboxes.insert(mailbox, delta);
        }
    }
    Ok(plan)
}
