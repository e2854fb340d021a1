#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use crate::blob::BlobStore;
    use crate::error::SyncError;
    use crate::settings::{SyncConfig, VaultConfig};
    use crate::store::{JobStatus, MailAccount, NewMessage, Store};
    use crate::sync::planner::compute_delta;
    use crate::sync::worker::store_fetched;
    use crate::sync::{message, WorkPlan};
    use crate::vault::Vault;
    use crate::AppState;

    use chrono::Utc;

    fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = AppState {
            store: Arc::new(Mutex::new(Store::open_in_memory().expect("in-memory store"))),
            vault: Arc::new(Vault::new(&[7u8; 32]).expect("vault")),
            blob: Arc::new(BlobStore::new(dir.path().join("blobs"))),
            sync: SyncConfig::default(),
        };
        (state, dir)
    }

    fn raw_message(subject: &str) -> Vec<u8> {
        format!(
            "From: Alice Example <alice@example.com>\r\n\
             To: Bob <bob@example.com>\r\n\
             Subject: {}\r\n\
             Date: Mon, 23 Dec 2024 10:15:00 +0000\r\n\
             \r\n\
             Hello from the test.\r\n",
            subject
        )
        .into_bytes()
    }

    fn plan_of(mailbox: &str, uids: &[u32]) -> WorkPlan {
        let mut plan = WorkPlan::default();
        plan.mailboxes.insert(mailbox.to_string(), uids.to_vec());
        plan
    }

    // ---- vault ----

    #[test]
    fn vault_round_trip() {
        let vault = Vault::new(&[1u8; 32]).expect("vault");
        let secret = vault.encrypt("hunter2").expect("encrypt");
        let plaintext = vault
            .decrypt(&secret.ciphertext, &secret.nonce)
            .expect("decrypt");
        assert_eq!(plaintext, "hunter2");
    }

    #[test]
    fn vault_rejects_wrong_key() {
        let vault = Vault::new(&[1u8; 32]).expect("vault");
        let other = Vault::new(&[2u8; 32]).expect("vault");
        let secret = vault.encrypt("hunter2").expect("encrypt");
        let result = other.decrypt(&secret.ciphertext, &secret.nonce);
        assert!(matches!(result, Err(SyncError::Credential(_))));
    }

    #[test]
    fn vault_generates_fresh_nonce_per_encrypt() {
        let vault = Vault::new(&[1u8; 32]).expect("vault");
        let first = vault.encrypt("same input").expect("encrypt");
        let second = vault.encrypt("same input").expect("encrypt");
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn vault_requires_master_key() {
        std::env::remove_var("MAILSPOOL_MASTER_KEY");
        let result = Vault::from_settings(&VaultConfig { master_key: None });
        assert!(matches!(result, Err(SyncError::Configuration(_))));
    }

    #[test]
    fn vault_rejects_short_key() {
        assert!(matches!(
            Vault::new(&[1u8; 16]),
            Err(SyncError::Configuration(_))
        ));
    }

    // ---- normalizer ----

    #[test]
    fn parse_extracts_headers_and_body() {
        let msg = message::parse(&raw_message("Quarterly report")).expect("parse");
        assert_eq!(msg.from.as_deref(), Some("Alice Example <alice@example.com>"));
        assert_eq!(msg.to.as_deref(), Some("Bob <bob@example.com>"));
        assert_eq!(msg.subject, "Quarterly report");
        assert_eq!(msg.sent_at.to_rfc2822(), "Mon, 23 Dec 2024 10:15:00 +0000");
        assert!(msg.body_text.contains("Hello from the test."));
        assert!(msg.body_html.is_none());
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn parse_extracts_attachments_and_skips_inline_parts() {
        let raw = b"From: a@example.com\r\n\
            To: b@example.com\r\n\
            Subject: with parts\r\n\
            Date: Mon, 23 Dec 2024 10:15:00 +0000\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
            \r\n\
            --xyz\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            Body text here.\r\n\
            --xyz\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>Body html here.</p>\r\n\
            --xyz\r\n\
            Content-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
            \r\n\
            fake pdf bytes\r\n\
            --xyz\r\n\
            Content-Type: image/png\r\n\
            Content-Disposition: inline\r\n\
            \r\n\
            fake png bytes\r\n\
            --xyz--\r\n";

        let msg = message::parse(raw).expect("parse");
        assert!(msg.body_text.contains("Body text here."));
        assert!(msg
            .body_html
            .as_deref()
            .is_some_and(|html| html.contains("Body html here.")));
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].filename, "report.pdf");
        assert_eq!(msg.attachments[0].content_type, "application/pdf");
        assert!(!msg.attachments[0].content.is_empty());
    }

    #[test]
    fn parse_rejects_headerless_input() {
        assert!(matches!(message::parse(b""), Err(SyncError::Parse(_))));
        assert!(matches!(
            message::parse(b"\r\n\r\n"),
            Err(SyncError::Parse(_))
        ));
    }

    #[test]
    fn parse_survives_malformed_date() {
        let raw = b"From: a@example.com\r\n\
            Subject: odd date\r\n\
            Date: not a date at all\r\n\
            \r\n\
            body\r\n";
        let before = Utc::now();
        let msg = message::parse(raw).expect("parse");
        assert!(msg.sent_at >= before - chrono::Duration::seconds(5));
        assert!(msg.to.is_none());
    }

    // ---- planner ----

    #[test]
    fn delta_is_sorted_difference() {
        let ingested: HashSet<u32> = [2u32, 4].into_iter().collect();
        assert_eq!(compute_delta(&[5, 1, 2, 3, 4], &ingested), vec![1, 3, 5]);
    }

    #[test]
    fn delta_empty_when_server_subset_of_ingested() {
        // No phantom jobs: nothing new on the server means no delta.
        let ingested: HashSet<u32> = [1u32, 2, 3, 4].into_iter().collect();
        assert!(compute_delta(&[1, 2, 3], &ingested).is_empty());
    }

    // ---- store ----

    #[test]
    fn create_job_queues_plan_in_order() {
        let store = Store::open_in_memory().expect("store");
        let plan = plan_of("INBOX", &[3, 1, 2]);
        let job = store.create_job("owner-1", &plan).expect("create");

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.total_count, 3);
        assert_eq!(job.processed_count, 0);

        let pending = store.pending_map(job.id).expect("pending");
        assert_eq!(pending.get("INBOX"), Some(&vec![3, 1, 2]));
    }

    #[test]
    fn claim_is_exclusive() {
        let store = Store::open_in_memory().expect("store");
        let job = store
            .create_job("owner-1", &plan_of("INBOX", &[1]))
            .expect("create");

        let first = store.claim_next_pending().expect("claim");
        let second = store.claim_next_pending().expect("claim");

        let claimed = first.expect("one claim succeeds");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(second.is_none(), "the same job must not be claimed twice");
    }

    #[test]
    fn advance_completes_at_total() {
        let store = Store::open_in_memory().expect("store");
        let job = store
            .create_job("owner-1", &plan_of("INBOX", &[1, 2, 3, 4, 5, 6, 7]))
            .expect("create");
        store.claim_next_pending().expect("claim");

        let partial = store.advance(job.id, 5).expect("advance");
        assert_eq!(partial.status, JobStatus::Processing);
        assert_eq!(partial.processed_count, 5);

        let done = store.advance(job.id, 5).expect("advance");
        assert_eq!(done.status, JobStatus::Completed);
        // processed_count never overshoots total_count
        assert_eq!(done.processed_count, done.total_count);
    }

    #[test]
    fn advance_does_not_resurrect_failed_job() {
        let store = Store::open_in_memory().expect("store");
        let job = store
            .create_job("owner-1", &plan_of("INBOX", &[1, 2]))
            .expect("create");
        store.claim_next_pending().expect("claim");
        store.fail(job.id, "connection error: boom").expect("fail");

        let after = store.advance(job.id, 2).expect("advance");
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.processed_count, 0, "terminal jobs stay frozen");
        assert_eq!(
            after.error_message.as_deref(),
            Some("connection error: boom")
        );
    }

    #[test]
    fn stalled_processing_job_returns_to_pending() {
        let store = Store::open_in_memory().expect("store");
        let job = store
            .create_job("owner-1", &plan_of("INBOX", &[1, 2]))
            .expect("create");
        store.claim_next_pending().expect("claim").expect("claimed");

        // Freshly claimed, so nothing is stale yet.
        assert_eq!(store.reclaim_stale(3600).expect("reclaim"), 0);

        // A zero threshold treats the job as abandoned immediately, the
        // same way a long-dead process would look to the sweep.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.reclaim_stale(0).expect("reclaim"), 1);
        let reclaimed = store.claim_next_pending().expect("claim").expect("claimed");
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.status, JobStatus::Processing);
    }

    #[test]
    fn insert_message_absorbs_duplicates() {
        let store = Store::open_in_memory().expect("store");
        let new_message = NewMessage {
            owner_id: "owner-1",
            mailbox: "INBOX",
            uid: 42,
            from_addr: Some("a@example.com"),
            to_addr: None,
            subject: "hi",
            sent_at: Utc::now(),
            body_text: "body",
            body_html: None,
        };

        assert!(store.insert_message(&new_message).expect("insert"));
        assert!(!store.insert_message(&new_message).expect("re-insert"));
        assert_eq!(store.message_count("owner-1", "INBOX").expect("count"), 1);
    }

    #[test]
    fn next_slice_groups_by_mailbox_and_respects_limit() {
        let store = Store::open_in_memory().expect("store");
        let mut plan = plan_of("Archive", &[10, 11]);
        plan.mailboxes.insert("INBOX".to_string(), vec![1, 2, 3]);
        let job = store.create_job("owner-1", &plan).expect("create");

        // BTreeMap order: Archive first, then INBOX
        let slice = store.next_slice(job.id, 4).expect("slice");
        assert_eq!(
            slice,
            vec![
                ("Archive".to_string(), vec![10, 11]),
                ("INBOX".to_string(), vec![1, 2])
            ]
        );

        store.complete_slice(job.id, &slice).expect("complete");
        let rest = store.next_slice(job.id, 4).expect("slice");
        assert_eq!(rest, vec![("INBOX".to_string(), vec![3])]);
    }

    #[test]
    fn upsert_account_keeps_one_row_per_owner() {
        let store = Store::open_in_memory().expect("store");
        let mut account = MailAccount {
            owner_id: "owner-1".to_string(),
            host: "imap.old.example".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            password_ciphertext: vec![1, 2, 3],
            password_nonce: vec![0; 12],
        };
        store.upsert_account(&account).expect("insert");

        account.host = "imap.new.example".to_string();
        store.upsert_account(&account).expect("update");

        let loaded = store
            .get_account("owner-1")
            .expect("get")
            .expect("account exists");
        assert_eq!(loaded.host, "imap.new.example");
    }

    // ---- worker ----

    #[test]
    fn store_fetched_tolerates_poison_messages() {
        let (state, _dir) = test_state();
        let fetched = vec![
            (1u32, raw_message("one")),
            (2, raw_message("two")),
            (3, Vec::new()), // unparseable
            (4, raw_message("four")),
            (5, raw_message("five")),
        ];

        let stored = store_fetched(&state, "owner-1", "INBOX", &fetched).expect("store");
        assert_eq!(stored, 4);

        let store = state.store.lock().expect("lock");
        assert_eq!(store.message_count("owner-1", "INBOX").expect("count"), 4);
    }

    #[test]
    fn store_fetched_is_idempotent_across_reruns() {
        let (state, _dir) = test_state();
        let fetched = vec![(1u32, raw_message("once"))];

        let first = store_fetched(&state, "owner-1", "INBOX", &fetched).expect("store");
        let second = store_fetched(&state, "owner-1", "INBOX", &fetched).expect("re-store");
        assert_eq!(first, 1);
        assert_eq!(second, 0, "overlapping slices never duplicate rows");

        let store = state.store.lock().expect("lock");
        assert_eq!(store.message_count("owner-1", "INBOX").expect("count"), 1);
    }

    // Spec scenario: empty local store, INBOX has {1,2,3}. One batch
    // (size 5) ingests everything and completes the job.
    #[test]
    fn single_batch_drains_small_job() {
        let (state, _dir) = test_state();
        let plan = plan_of("INBOX", &[1, 2, 3]);

        let job = {
            let store = state.store.lock().expect("lock");
            let job = store.create_job("owner-1", &plan).expect("create");
            assert_eq!(job.total_count, 3);
            store.claim_next_pending().expect("claim").expect("claimed")
        };

        let slice = {
            let store = state.store.lock().expect("lock");
            store
                .next_slice(job.id, state.sync.batch_size)
                .expect("slice")
        };
        let fetched: Vec<(u32, Vec<u8>)> = slice[0]
            .1
            .iter()
            .map(|uid| (*uid, raw_message(&format!("msg {}", uid))))
            .collect();
        let attempted = fetched.len();
        store_fetched(&state, "owner-1", "INBOX", &fetched).expect("store");

        let done = {
            let store = state.store.lock().expect("lock");
            store.complete_slice(job.id, &slice).expect("complete");
            store.advance(job.id, attempted as i64).expect("advance")
        };
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_count, 3);

        let store = state.store.lock().expect("lock");
        assert_eq!(store.message_count("owner-1", "INBOX").expect("count"), 3);
        let ingested = store
            .list_ingested_uids("owner-1", "INBOX")
            .expect("ingested");
        let planned: HashSet<u32> = [1, 2, 3].into_iter().collect();
        assert_eq!(ingested, planned);
        assert!(store.next_slice(job.id, 5).expect("slice").is_empty());
    }

    // One worker pass over a job that is already claimed: fetch the next
    // slice, ingest it, record the progress. Mirrors what a continuation
    // invocation does with the claim it inherited.
    fn drain_one_slice(state: &AppState, job_id: i64) -> crate::store::SyncJob {
        let slice = {
            let store = state.store.lock().expect("lock");
            store
                .next_slice(job_id, state.sync.batch_size)
                .expect("slice")
        };
        for (mailbox, uids) in &slice {
            let fetched: Vec<(u32, Vec<u8>)> = uids
                .iter()
                .map(|uid| (*uid, raw_message(&format!("msg {}", uid))))
                .collect();
            store_fetched(state, "owner-1", mailbox, &fetched).expect("store");
        }
        let attempted: i64 = slice.iter().map(|(_, uids)| uids.len() as i64).sum();

        let store = state.store.lock().expect("lock");
        store.complete_slice(job_id, &slice).expect("complete");
        store.advance(job_id, attempted).expect("advance")
    }

    // A job bigger than one batch stays claimed between invocations and
    // finishes on the second pass instead of stranding in processing.
    #[test]
    fn continuation_drains_job_larger_than_one_batch() {
        let (state, _dir) = test_state();
        let plan = plan_of("INBOX", &[1, 2, 3, 4, 5, 6, 7]);

        let job = {
            let store = state.store.lock().expect("lock");
            store.create_job("owner-1", &plan).expect("create");
            store.claim_next_pending().expect("claim").expect("claimed")
        };

        let partial = drain_one_slice(&state, job.id);
        assert_eq!(partial.status, JobStatus::Processing);
        assert_eq!(partial.processed_count, 5);

        {
            let store = state.store.lock().expect("lock");
            // Still owned by this chain, so no one else can claim it.
            assert!(store.claim_next_pending().expect("claim").is_none());
            let mid = store.get_job(job.id).expect("get").expect("exists");
            assert_eq!(mid.status, JobStatus::Processing);
        }

        // A continuation re-enters the job it already holds by id.
        let done = drain_one_slice(&state, job.id);
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.processed_count, 7);

        let store = state.store.lock().expect("lock");
        assert_eq!(store.message_count("owner-1", "INBOX").expect("count"), 7);
        assert!(store
            .next_slice(job.id, state.sync.batch_size)
            .expect("slice")
            .is_empty());
    }

    #[test]
    fn store_fetched_records_attachments_in_blob_store() {
        let (state, dir) = test_state();
        let raw = b"From: a@example.com\r\n\
            Subject: attached\r\n\
            Date: Mon, 23 Dec 2024 10:15:00 +0000\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/mixed; boundary=\"b\"\r\n\
            \r\n\
            --b\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            see attachment\r\n\
            --b\r\n\
            Content-Type: text/csv\r\n\
            Content-Disposition: attachment; filename=\"data.csv\"\r\n\
            \r\n\
            a,b,c\r\n\
            --b--\r\n";

        let stored =
            store_fetched(&state, "owner-1", "INBOX", &[(7, raw.to_vec())]).expect("store");
        assert_eq!(stored, 1);
        assert!(dir
            .path()
            .join("blobs/owner-1/INBOX/7/data.csv")
            .exists());
    }

    // ---- blob store ----

    #[test]
    fn blob_put_keeps_hostile_filenames_under_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blobs = BlobStore::new(dir.path());

        let path = blobs
            .put("owner-1", "INBOX", 3, "../../evil.txt", b"x")
            .expect("put");
        assert!(!path.contains("../"));
        assert!(dir.path().join(&path).exists());
        assert_eq!(blobs.get(&path).expect("get"), b"x");
    }
}
