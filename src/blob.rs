use std::fs;
use std::path::PathBuf;

use crate::error::Result;

/// Filesystem-backed object store for attachment bytes. The rest of the
/// system treats it as an opaque put/get collaborator keyed by the path
/// returned from `put`.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BlobStore { root: root.into() }
    }

    /// Stores attachment bytes at a path derived from the owning message,
    /// returning the store-relative path recorded in the attachment row.
    pub fn put(
        &self,
        owner_id: &str,
        mailbox: &str,
        uid: u32,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let relative = format!(
            "{}/{}/{}/{}",
            sanitize(owner_id),
            sanitize(mailbox),
            uid,
            sanitize(filename)
        );
        let full = self.root.join(&relative);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, bytes)?;
        Ok(relative)
    }

    pub fn get(&self, relative: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.root.join(relative))?)
    }
}

// Keeps declared filenames from escaping the store root.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned == ".." || cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
