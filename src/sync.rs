use serde::Serialize;
use std::collections::BTreeMap;

pub mod imap;
pub mod message;
pub mod planner;
pub mod worker;

/// The unit of work a sync job is created from: for each mailbox, the
/// server identifiers not yet ingested, in ascending order. A BTreeMap
/// keeps iteration deterministic so the same server state always queues
/// the same job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkPlan {
    pub mailboxes: BTreeMap<String, Vec<u32>>,
}

impl WorkPlan {
    pub fn total(&self) -> usize {
        self.mailboxes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.mailboxes.values().all(Vec::is_empty)
    }
}
