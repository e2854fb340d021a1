use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::error::{Result, SyncError};
use crate::sync::WorkPlan;

/// Lifecycle state of a sync job. Transitions are pending → processing →
/// {completed, failed}; `fail` is additionally reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    fn from_str(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncJob {
    pub id: i64,
    pub owner_id: String,
    pub status: JobStatus,
    pub total_count: i64,
    pub processed_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MailAccount {
    pub owner_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password_ciphertext: Vec<u8>,
    pub password_nonce: Vec<u8>,
}

/// Fields of a message the worker is about to persist.
#[derive(Debug)]
pub struct NewMessage<'a> {
    pub owner_id: &'a str,
    pub mailbox: &'a str,
    pub uid: u32,
    pub from_addr: Option<&'a str>,
    pub to_addr: Option<&'a str>,
    pub subject: &'a str,
    pub sent_at: DateTime<Utc>,
    pub body_text: &'a str,
    pub body_html: Option<&'a str>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;

        let store = Store { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                owner_id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                password_ciphertext BLOB NOT NULL,
                password_nonce BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                total_count INTEGER NOT NULL,
                processed_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // Normalized pending-work queue: rows are deleted as slices are
        // accounted for, so remaining work is always readable without
        // rewriting a blob column.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS job_uids (
                job_id INTEGER NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (job_id, mailbox, uid),
                FOREIGN KEY (job_id) REFERENCES sync_jobs(id) ON DELETE CASCADE
            )",
            [],
        )?;

        // (owner_id, mailbox, uid) is the idempotency key that makes
        // re-processing an overlapping slice safe.
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                owner_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                from_addr TEXT,
                to_addr TEXT,
                subject TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                body_text TEXT NOT NULL,
                body_html TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (owner_id, mailbox, uid)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY,
                owner_id TEXT NOT NULL,
                mailbox TEXT NOT NULL,
                uid INTEGER NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                blob_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (owner_id, mailbox, uid)
                    REFERENCES messages(owner_id, mailbox, uid) ON DELETE CASCADE
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON sync_jobs(status, id)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_job_uids_position ON job_uids(job_id, position)",
            [],
        )?;

        Ok(())
    }

    // ---- accounts ----

    pub fn upsert_account(&self, account: &MailAccount) -> Result<()> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO accounts (
                owner_id, host, port, username,
                password_ciphertext, password_nonce, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(owner_id) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                password_ciphertext = excluded.password_ciphertext,
                password_nonce = excluded.password_nonce,
                updated_at = excluded.updated_at",
            params![
                account.owner_id,
                account.host,
                account.port,
                account.username,
                account.password_ciphertext,
                account.password_nonce,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_account(&self, owner_id: &str) -> Result<Option<MailAccount>> {
        let account = self
            .conn
            .query_row(
                "SELECT owner_id, host, port, username, password_ciphertext, password_nonce
                 FROM accounts WHERE owner_id = ?1",
                params![owner_id],
                |row| {
                    Ok(MailAccount {
                        owner_id: row.get(0)?,
                        host: row.get(1)?,
                        port: row.get(2)?,
                        username: row.get(3)?,
                        password_ciphertext: row.get(4)?,
                        password_nonce: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    // ---- jobs ----

    /// Creates a pending job from a non-empty work plan, queueing every
    /// planned identifier in mailbox order.
    pub fn create_job(&self, owner_id: &str, plan: &WorkPlan) -> Result<SyncJob> {
        let total = plan.total();
        let now = Utc::now();

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO sync_jobs (owner_id, status, total_count, processed_count, created_at, updated_at)
             VALUES (?1, 'pending', ?2, 0, ?3, ?3)",
            params![owner_id, total as i64, now],
        )?;
        let job_id = tx.last_insert_rowid();

        let mut position: i64 = 0;
        for (mailbox, uids) in &plan.mailboxes {
            for uid in uids {
                tx.execute(
                    "INSERT INTO job_uids (job_id, mailbox, uid, position) VALUES (?1, ?2, ?3, ?4)",
                    params![job_id, mailbox, uid, position],
                )?;
                position += 1;
            }
        }
        tx.commit()?;

        self.get_job(job_id)?
            .ok_or(SyncError::Store(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Atomically transitions one pending job to processing and returns it.
    /// The conditional UPDATE is the subsystem's single mutual-exclusion
    /// point: SQLite serializes writers, so of two concurrent claims exactly
    /// one observes the pending row.
    pub fn claim_next_pending(&self) -> Result<Option<SyncJob>> {
        let mut stmt = self.conn.prepare(
            "UPDATE sync_jobs
             SET status = 'processing', updated_at = ?1
             WHERE id = (SELECT id FROM sync_jobs WHERE status = 'pending' ORDER BY id LIMIT 1)
               AND status = 'pending'
             RETURNING id, owner_id, status, total_count, processed_count,
                       error_message, created_at, updated_at",
        )?;
        let job = stmt.query_row(params![Utc::now()], row_to_job).optional()?;
        Ok(job)
    }

    /// Adds `processed_delta` attempted identifiers to the job's progress,
    /// flipping a processing job to completed once the counter reaches the
    /// total. Terminal jobs are immutable: the counter only moves while the
    /// job is in processing.
    pub fn advance(&self, job_id: i64, processed_delta: i64) -> Result<SyncJob> {
        let mut stmt = self.conn.prepare(
            "UPDATE sync_jobs
             SET status = CASE
                     WHEN status = 'processing' AND processed_count + ?1 >= total_count
                     THEN 'completed' ELSE status
                 END,
                 processed_count = CASE
                     WHEN status = 'processing'
                     THEN MIN(total_count, processed_count + ?1)
                     ELSE processed_count
                 END,
                 updated_at = CASE WHEN status = 'processing' THEN ?2 ELSE updated_at END
             WHERE id = ?3
             RETURNING id, owner_id, status, total_count, processed_count,
                       error_message, created_at, updated_at",
        )?;
        let job = stmt.query_row(params![processed_delta, Utc::now(), job_id], row_to_job)?;
        Ok(job)
    }

    /// Returns stalled processing jobs to pending so the periodic sweep can
    /// claim them again after a crash or restart. A job counts as stalled
    /// when nothing has advanced it for `stale_after_secs`; a live worker
    /// bumps `updated_at` on every slice.
    pub fn reclaim_stale(&self, stale_after_secs: u64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(stale_after_secs as i64);
        let reclaimed = self.conn.execute(
            "UPDATE sync_jobs SET status = 'pending', updated_at = ?1
             WHERE status = 'processing' AND updated_at < ?2",
            params![Utc::now(), cutoff],
        )?;
        Ok(reclaimed)
    }

    /// Marks a job failed with a human-readable reason. Terminal regardless
    /// of the current state; a failed job is never auto-resumed.
    pub fn fail(&self, job_id: i64, error_message: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_jobs SET status = 'failed', error_message = ?1, updated_at = ?2 WHERE id = ?3",
            params![error_message, Utc::now(), job_id],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<SyncJob>> {
        let job = self
            .conn
            .query_row(
                "SELECT id, owner_id, status, total_count, processed_count,
                        error_message, created_at, updated_at
                 FROM sync_jobs WHERE id = ?1",
                params![job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    // ---- pending-work queue ----

    /// Returns up to `limit` queued identifiers in plan order, grouped by
    /// mailbox so the worker opens each mailbox once per slice.
    pub fn next_slice(&self, job_id: i64, limit: usize) -> Result<Vec<(String, Vec<u32>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT mailbox, uid FROM job_uids WHERE job_id = ?1 ORDER BY position LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job_id, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut groups: Vec<(String, Vec<u32>)> = Vec::new();
        for row in rows {
            let (mailbox, uid) = row?;
            match groups.last_mut() {
                Some((last, uids)) if *last == mailbox => uids.push(uid),
                _ => groups.push((mailbox, vec![uid])),
            }
        }
        Ok(groups)
    }

    /// Removes a slice's identifiers from the queue once they have been
    /// accounted for, so a later invocation never sees them again.
    pub fn complete_slice(&self, job_id: i64, slice: &[(String, Vec<u32>)]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for (mailbox, uids) in slice {
            for uid in uids {
                tx.execute(
                    "DELETE FROM job_uids WHERE job_id = ?1 AND mailbox = ?2 AND uid = ?3",
                    params![job_id, mailbox, uid],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remaining work as a mailbox → identifiers map, for job readback.
    pub fn pending_map(&self, job_id: i64) -> Result<BTreeMap<String, Vec<u32>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT mailbox, uid FROM job_uids WHERE job_id = ?1 ORDER BY position")?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut map: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for row in rows {
            let (mailbox, uid) = row?;
            map.entry(mailbox).or_default().push(uid);
        }
        Ok(map)
    }

    // ---- messages ----

    pub fn list_ingested_uids(&self, owner_id: &str, mailbox: &str) -> Result<HashSet<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uid FROM messages WHERE owner_id = ?1 AND mailbox = ?2")?;
        let rows = stmt.query_map(params![owner_id, mailbox], |row| row.get::<_, u32>(0))?;

        let mut uids = HashSet::new();
        for row in rows {
            uids.insert(row?);
        }
        Ok(uids)
    }

    /// Inserts a normalized message. Returns `Ok(false)` when the
    /// idempotency key already exists: re-processing an overlapping slice is
    /// "already ingested, skip", not an error.
    pub fn insert_message(&self, message: &NewMessage) -> Result<bool> {
        let result = self.conn.execute(
            "INSERT INTO messages (
                owner_id, mailbox, uid, from_addr, to_addr,
                subject, sent_at, body_text, body_html, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.owner_id,
                message.mailbox,
                message.uid,
                message.from_addr,
                message.to_addr,
                message.subject,
                message.sent_at,
                message.body_text,
                message.body_html,
                Utc::now(),
            ],
        );

        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn insert_attachment(
        &self,
        owner_id: &str,
        mailbox: &str,
        uid: u32,
        filename: &str,
        content_type: &str,
        blob_path: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO attachments (
                owner_id, mailbox, uid, filename, content_type, blob_path, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![owner_id, mailbox, uid, filename, content_type, blob_path, Utc::now()],
        )?;
        Ok(())
    }

    pub fn message_count(&self, owner_id: &str, mailbox: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE owner_id = ?1 AND mailbox = ?2",
            params![owner_id, mailbox],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<SyncJob> {
    let status_raw: String = row.get(2)?;
    let status = JobStatus::from_str(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown job status: {}", status_raw).into(),
        )
    })?;

    Ok(SyncJob {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        status,
        total_count: row.get(3)?,
        processed_count: row.get(4)?,
        error_message: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
