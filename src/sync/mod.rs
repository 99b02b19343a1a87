//! Bidirectional file sync between blob storage and `/workspace`.
//!
//! - to-sandbox on bind: every recorded file is downloaded and written
//!   into the sandbox;
//! - from-sandbox after a stream (and opportunistically mid-stream on
//!   file-tool events): regular files under `/workspace` are uploaded and
//!   their records upserted.
//!
//! Reserved prefixes hold internal state (agent session files) and are
//! excluded from both directions and from user-visible listings. Failures
//! are per-file: log, skip, continue.

pub mod blob;
pub mod records;

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::audit;
use crate::backend::ContainerBackend;
use crate::error::Result;
use crate::sandbox::Sandbox;

pub use blob::{BlobEntry, BlobStore, S3BlobStore};
pub use records::{FileRecord, FileRecordStore, FileSource};

/// Blob-side prefixes invisible to workspace semantics.
pub const RESERVED_PREFIXES: &[&str] = &["_sdk_session/"];

const WORKSPACE_ROOT: &str = "/workspace";
/// Where the agent keeps per-session state inside the sandbox.
const SESSION_DIR: &str = "/home/appuser/.agent/sessions";

/// Whether a relative path falls under a reserved prefix.
pub fn is_reserved_path(path: &str) -> bool {
    RESERVED_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix) || path == prefix.trim_end_matches('/'))
}

fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// The sync bridge. Metadata upserts are serialised by a mutex because
/// opportunistic mid-stream syncs run concurrently with the final one.
pub struct FileSync {
    blob: Arc<dyn BlobStore>,
    records: FileRecordStore,
    backend: Arc<dyn ContainerBackend>,
    record_lock: Mutex<()>,
}

impl FileSync {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        records: FileRecordStore,
        backend: Arc<dyn ContainerBackend>,
    ) -> Self {
        Self {
            blob,
            records,
            backend,
            record_lock: Mutex::new(()),
        }
    }

    /// Blob store -> sandbox. Returns the number of files synced.
    pub async fn sync_to_sandbox(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        sandbox: &Sandbox,
    ) -> Result<usize> {
        let files = self.records.list(conversation_id).await?;
        if files.is_empty() {
            return Ok(0);
        }

        let total = files.len();
        let mut synced = 0;
        for record in files {
            // Reserved paths should never have records; skip defensively.
            if is_reserved_path(&record.path) {
                tracing::warn!(
                    "File record under reserved prefix (skipped): {}",
                    record.path
                );
                continue;
            }

            let result = async {
                let data = self
                    .blob
                    .download(tenant_id, conversation_id, &record.path)
                    .await?;
                self.backend
                    .write_file(
                        sandbox,
                        &format!("{WORKSPACE_ROOT}/{}", record.path),
                        &data,
                    )
                    .await
            }
            .await;

            match result {
                Ok(()) => synced += 1,
                Err(e) => {
                    tracing::error!(
                        "Sync to sandbox {} failed for {}: {}",
                        sandbox.id,
                        record.path,
                        e
                    );
                }
            }
        }

        tracing::info!(
            "Synced {}/{} file(s) into sandbox {} for {}",
            synced,
            total,
            sandbox.id,
            conversation_id
        );
        audit::file_sync_to_container(&sandbox.id, conversation_id, tenant_id, synced, total);
        Ok(synced)
    }

    /// Sandbox -> blob store. Returns the number of files synced.
    pub async fn sync_from_sandbox(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        sandbox: &Sandbox,
    ) -> Result<usize> {
        let (exit_code, output) = self
            .backend
            .exec(
                sandbox,
                &[
                    "find".to_string(),
                    WORKSPACE_ROOT.to_string(),
                    "-type".to_string(),
                    "f".to_string(),
                    "-printf".to_string(),
                    "%P\\n".to_string(),
                ],
            )
            .await?;
        if exit_code != 0 {
            tracing::error!(
                "Workspace listing failed in sandbox {} ({})",
                sandbox.id,
                exit_code
            );
            return Ok(0);
        }

        let paths: Vec<String> = output
            .lines()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .filter(|p| !is_reserved_path(p))
            .map(str::to_string)
            .collect();
        if paths.is_empty() {
            return Ok(0);
        }

        let mut synced = 0;
        for path in &paths {
            let result = async {
                let data = self
                    .backend
                    .read_file(sandbox, &format!("{WORKSPACE_ROOT}/{path}"))
                    .await?;
                let Some(data) = data else {
                    return Ok(false);
                };
                self.blob
                    .upload(tenant_id, conversation_id, path, data.clone())
                    .await?;
                self.upsert_record(conversation_id, path, &data).await?;
                Ok::<bool, crate::error::WorkspaceError>(true)
            }
            .await;

            match result {
                Ok(true) => synced += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(
                        "Sync from sandbox {} failed for {}: {}",
                        sandbox.id,
                        path,
                        e
                    );
                }
            }
        }

        tracing::info!(
            "Synced {} file(s) out of sandbox {} for {}",
            synced,
            sandbox.id,
            conversation_id
        );
        audit::file_sync_from_container(&sandbox.id, conversation_id, tenant_id, synced);
        Ok(synced)
    }

    /// Copy the agent's opaque session state out of the sandbox so a fresh
    /// sandbox can resume the conversation later.
    pub async fn save_session_file(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        sandbox: &Sandbox,
        session_id: &str,
    ) -> Result<bool> {
        let session_path = format!("{SESSION_DIR}/{session_id}.jsonl");
        let Some(data) = self.backend.read_file(sandbox, &session_path).await? else {
            tracing::debug!(
                "No session file {} in sandbox {} (skipped)",
                session_id,
                sandbox.id
            );
            return Ok(false);
        };

        let size = data.len();
        self.blob
            .upload(
                tenant_id,
                conversation_id,
                &format!("_sdk_session/{session_id}.jsonl"),
                data,
            )
            .await?;
        tracing::info!(
            "Saved session file {} for {} ({} bytes)",
            session_id,
            conversation_id,
            size
        );
        Ok(true)
    }

    /// Restore a previously saved session file into a fresh sandbox.
    pub async fn restore_session_file(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        sandbox: &Sandbox,
        session_id: &str,
    ) -> Result<bool> {
        let data = match self
            .blob
            .download(
                tenant_id,
                conversation_id,
                &format!("_sdk_session/{session_id}.jsonl"),
            )
            .await
        {
            Ok(data) => data,
            Err(crate::error::WorkspaceError::NotFound { .. }) => {
                tracing::debug!(
                    "No stored session {} for {} (new session)",
                    session_id,
                    conversation_id
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let size = data.len();
        self.backend
            .write_file(
                sandbox,
                &format!("{SESSION_DIR}/{session_id}.jsonl"),
                &data,
            )
            .await?;
        tracing::info!(
            "Restored session file {} into sandbox {} ({} bytes)",
            session_id,
            sandbox.id,
            size
        );
        Ok(true)
    }

    async fn upsert_record(&self, conversation_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let _guard = self.record_lock.lock().await;
        let existing = self.records.get(conversation_id, path).await?;
        let record = FileRecord::upsert(existing, path, data.len() as u64, &checksum(data));
        self.records.put(conversation_id, &record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_path_detection() {
        assert!(is_reserved_path("_sdk_session/abc.jsonl"));
        assert!(is_reserved_path("_sdk_session"));
        assert!(!is_reserved_path("report.md"));
        assert!(!is_reserved_path("data/_sdk_session/abc.jsonl"));
        assert!(!is_reserved_path("sdk_session/abc.jsonl"));
    }

    #[test]
    fn test_checksum_is_content_addressed() {
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(checksum(b"abc"), checksum(b"abd"));
        assert_eq!(checksum(b"abc").len(), 64);
    }
}
