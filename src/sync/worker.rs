use log::{error, info, warn};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::store::{JobStatus, NewMessage, SyncJob};
use crate::sync::imap::{self, ImapSession};
use crate::sync::message;
use crate::AppState;

/// Result of one worker invocation.
#[derive(Debug)]
pub enum BatchOutcome {
    /// No pending job existed to claim.
    Idle,
    /// A slice was attempted and progress advanced.
    Processed {
        job_id: i64,
        attempted: usize,
        finished: bool,
    },
    /// The job hit a terminal error and was marked failed.
    Failed { job_id: i64, error: String },
}

/// One bounded invocation of the batch worker: claim a pending job, ingest
/// the next slice of its queue, advance progress, and re-trigger itself
/// while work remains. Per-message parse failures and duplicate keys are
/// absorbed here; credential, connection, and storage errors fail the job
/// terminally and do not re-trigger.
pub async fn process_batch(state: AppState) -> Result<BatchOutcome> {
    let claimed = {
        state
            .store
            .lock()
            .expect("store mutex poisoned")
            .claim_next_pending()?
    };
    let job = match claimed {
        Some(job) => job,
        None => return Ok(BatchOutcome::Idle),
    };
    info!(
        "claimed sync job {} for {} ({}/{} processed)",
        job.id, job.owner_id, job.processed_count, job.total_count
    );

    run_invocation(state, job).await
}

/// One bounded slice of a job this worker already holds in processing.
/// Both the initial claim and every chained continuation funnel through
/// here, so a job larger than one batch keeps draining until it finishes.
async fn run_invocation(state: AppState, job: SyncJob) -> Result<BatchOutcome> {
    match run_claimed(&state, &job).await {
        Ok((attempted, finished)) => {
            if !finished {
                trigger_continuation(state.clone(), job.id);
            }
            Ok(BatchOutcome::Processed {
                job_id: job.id,
                attempted,
                finished,
            })
        }
        Err(e) => {
            let reason = e.to_string();
            error!("sync job {} failed: {}", job.id, reason);
            state
                .store
                .lock()
                .expect("store mutex poisoned")
                .fail(job.id, &reason)?;
            Ok(BatchOutcome::Failed {
                job_id: job.id,
                error: reason,
            })
        }
    }
}

// Everything after a successful claim. Any error here, not just connection
// or credential ones, marks the job failed with the reason recorded.
async fn run_claimed(state: &AppState, job: &SyncJob) -> Result<(usize, bool)> {
    let slice = {
        state
            .store
            .lock()
            .expect("store mutex poisoned")
            .next_slice(job.id, state.sync.batch_size)?
    };

    if slice.is_empty() {
        // Queue drained but the counter lags: a previous invocation stopped
        // between accounting the slice and advancing. Reconcile and close.
        let remaining = (job.total_count - job.processed_count).max(0);
        state
            .store
            .lock()
            .expect("store mutex poisoned")
            .advance(job.id, remaining)?;
        info!("sync job {} has no remaining work, completed", job.id);
        return Ok((0, true));
    }

    let attempted = ingest_slice(state, job, &slice).await?;
    let advanced = {
        let store = state.store.lock().expect("store mutex poisoned");
        store.complete_slice(job.id, &slice)?;
        store.advance(job.id, attempted as i64)?
    };
    let finished = advanced.status == JobStatus::Completed;
    info!(
        "sync job {} advanced to {}/{}{}",
        advanced.id,
        advanced.processed_count,
        advanced.total_count,
        if finished { ", completed" } else { "" }
    );
    Ok((attempted, finished))
}

// Chains bounded invocations until the job drains. The continuation
// re-enters the job it already holds by id rather than claiming again:
// the job stays in processing for its whole run, and the atomic claim
// keeps excluding other workers.
fn trigger_continuation(state: AppState, job_id: i64) {
    tokio::spawn(async move {
        if let Err(e) = continue_claimed(state, job_id).await {
            error!("sync continuation failed: {}", e);
        }
    });
}

async fn continue_claimed(state: AppState, job_id: i64) -> Result<()> {
    let job = {
        state
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_job(job_id)?
    };
    match job {
        Some(job) if job.status == JobStatus::Processing => {
            run_invocation(state, job).await?;
        }
        // Completed or failed in the meantime, or reclaimed by the sweep
        // after a stall; either way this chain is done with it.
        _ => {}
    }
    Ok(())
}

/// Opens one session for the whole slice and ingests each mailbox group.
/// Returns the number of identifiers attempted; the session is released on
/// every exit path.
async fn ingest_slice(
    state: &AppState,
    job: &SyncJob,
    slice: &[(String, Vec<u32>)],
) -> Result<usize> {
    let account = {
        state
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_account(&job.owner_id)?
    }
    .ok_or_else(|| {
        SyncError::configuration(format!("no mail account configured for {}", job.owner_id))
    })?;
    let password = state
        .vault
        .decrypt(&account.password_ciphertext, &account.password_nonce)?;
    let net_timeout = Duration::from_secs(state.sync.network_timeout_secs);

    let mut session = imap::connect(
        &account.host,
        account.port,
        &account.username,
        &password,
        net_timeout,
    )
    .await?;
    let result = ingest_groups(state, &job.owner_id, slice, &mut session, net_timeout).await;
    imap::close(session).await;
    result
}

async fn ingest_groups(
    state: &AppState,
    owner_id: &str,
    slice: &[(String, Vec<u32>)],
    session: &mut ImapSession,
    net_timeout: Duration,
) -> Result<usize> {
    let mut attempted = 0;
    for (mailbox, uids) in slice {
        let fetched = imap::fetch_raw(session, mailbox, uids, net_timeout).await?;
        let stored = store_fetched(state, owner_id, mailbox, &fetched)?;
        // Identifiers the server no longer has still count as attempted, so
        // a job whose messages were deleted remotely can finish.
        attempted += uids.len();
        info!(
            "stored {}/{} fetched messages from {}",
            stored,
            fetched.len(),
            mailbox
        );
    }
    Ok(attempted)
}

/// Persists a fetched batch. A poison message or a duplicate key skips one
/// identifier and never blocks the queue; storage and blob errors
/// propagate and fail the job. Returns how many new rows were created.
pub(crate) fn store_fetched(
    state: &AppState,
    owner_id: &str,
    mailbox: &str,
    fetched: &[(u32, Vec<u8>)],
) -> Result<usize> {
    let mut stored = 0;
    for (uid, raw) in fetched {
        match store_one(state, owner_id, mailbox, *uid, raw) {
            Ok(true) => stored += 1,
            Ok(false) => info!("message {}/{} already ingested, skipping", mailbox, uid),
            Err(SyncError::Parse(reason)) => {
                warn!("skipping unparseable message {}/{}: {}", mailbox, uid, reason)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stored)
}

fn store_one(
    state: &AppState,
    owner_id: &str,
    mailbox: &str,
    uid: u32,
    raw: &[u8],
) -> Result<bool> {
    let normalized = message::parse(raw)?;

    let inserted = {
        let store = state.store.lock().expect("store mutex poisoned");
        store.insert_message(&NewMessage {
            owner_id,
            mailbox,
            uid,
            from_addr: normalized.from.as_deref(),
            to_addr: normalized.to.as_deref(),
            subject: &normalized.subject,
            sent_at: normalized.sent_at,
            body_text: &normalized.body_text,
            body_html: normalized.body_html.as_deref(),
        })?
    };
    if !inserted {
        return Ok(false);
    }

    // Filesystem writes stay outside the store lock; only the row inserts
    // need it.
    let mut stored_parts = Vec::with_capacity(normalized.attachments.len());
    for part in &normalized.attachments {
        let blob_path = state
            .blob
            .put(owner_id, mailbox, uid, &part.filename, &part.content)?;
        stored_parts.push((part, blob_path));
    }

    let store = state.store.lock().expect("store mutex poisoned");
    for (part, blob_path) in stored_parts {
        store.insert_attachment(
            owner_id,
            mailbox,
            uid,
            &part.filename,
            &part.content_type,
            &blob_path,
        )?;
    }
    Ok(true)
}
