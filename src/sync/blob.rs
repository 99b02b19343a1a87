//! Blob storage behind the file-sync bridge.
//!
//! Workspace files live at `{prefix}/{tenant}/{conversation}/{relpath}`.
//! The store itself is an external collaborator; only this contract
//! matters to the rest of the system, so it is a trait with the S3
//! implementation beside it.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;

use crate::error::{Result, WorkspaceError};
use crate::metrics::metrics;

/// One object under a conversation's prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobEntry {
    /// Path relative to the conversation prefix.
    pub path: String,
    pub size: u64,
}

/// Contract the file-sync bridge needs from blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        path: &str,
        content: Vec<u8>,
    ) -> Result<()>;

    async fn download(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        path: &str,
    ) -> Result<Vec<u8>>;

    async fn list(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<BlobEntry>>;

    async fn delete(&self, tenant_id: &str, conversation_id: &str, path: &str) -> Result<()>;

    async fn exists(&self, tenant_id: &str, conversation_id: &str, path: &str) -> Result<bool>;
}

/// S3-backed blob store.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub fn new(sdk_config: &aws_config::SdkConfig, bucket: &str, prefix: &str) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(sdk_config),
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn key(&self, tenant_id: &str, conversation_id: &str, path: &str) -> String {
        format!("{}/{tenant_id}/{conversation_id}/{path}", self.prefix)
    }

    fn conversation_prefix(&self, tenant_id: &str, conversation_id: &str) -> String {
        format!("{}/{tenant_id}/{conversation_id}/", self.prefix)
    }

    fn record(&self, operation: &str, status: &str) {
        metrics()
            .s3_operations_total
            .with_label_values(&[operation, status])
            .inc();
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        path: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let key = self.key(tenant_id, conversation_id, path);
        let size = content.len();
        match self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(content))
            .send()
            .await
        {
            Ok(_) => {
                tracing::debug!("Uploaded {} ({} bytes)", key, size);
                self.record("upload", "success");
                Ok(())
            }
            Err(e) => {
                self.record("upload", "error");
                Err(WorkspaceError::BlobStore {
                    reason: format!("upload {key}: {e}"),
                })
            }
        }
    }

    async fn download(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        path: &str,
    ) -> Result<Vec<u8>> {
        let key = self.key(tenant_id, conversation_id, path);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match response {
            Ok(output) => {
                let bytes = output.body.collect().await.map_err(|e| {
                    self.record("download", "error");
                    WorkspaceError::BlobStore {
                        reason: format!("download body {key}: {e}"),
                    }
                })?;
                self.record("download", "success");
                Ok(bytes.into_bytes().to_vec())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    self.record("download", "not_found");
                    Err(WorkspaceError::NotFound {
                        resource: format!("blob {key}"),
                    })
                } else {
                    self.record("download", "error");
                    Err(WorkspaceError::BlobStore {
                        reason: format!("download {key}: {service_error}"),
                    })
                }
            }
        }
    }

    async fn list(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<BlobEntry>> {
        let prefix = self.conversation_prefix(tenant_id, conversation_id);
        let mut entries = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                self.record("list", "error");
                WorkspaceError::BlobStore {
                    reason: format!("list {prefix}: {e}"),
                }
            })?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let relative = &key[prefix.len().min(key.len())..];
                if relative.is_empty() {
                    continue;
                }
                entries.push(BlobEntry {
                    path: relative.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                });
            }
        }
        self.record("list", "success");
        Ok(entries)
    }

    async fn delete(&self, tenant_id: &str, conversation_id: &str, path: &str) -> Result<()> {
        let key = self.key(tenant_id, conversation_id, path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                self.record("delete", "error");
                WorkspaceError::BlobStore {
                    reason: format!("delete {key}: {e}"),
                }
            })?;
        self.record("delete", "success");
        Ok(())
    }

    async fn exists(&self, tenant_id: &str, conversation_id: &str, path: &str) -> Result<bool> {
        let key = self.key(tenant_id, conversation_id, path);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(WorkspaceError::BlobStore {
                        reason: format!("head {key}: {service_error}"),
                    })
                }
            }
        }
    }
}

/// In-memory blob store for tests.
#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryBlobStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn key(tenant_id: &str, conversation_id: &str, path: &str) -> String {
            format!("{tenant_id}/{conversation_id}/{path}")
        }
    }

    #[async_trait]
    impl BlobStore for MemoryBlobStore {
        async fn upload(
            &self,
            tenant_id: &str,
            conversation_id: &str,
            path: &str,
            content: Vec<u8>,
        ) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .insert(Self::key(tenant_id, conversation_id, path), content);
            Ok(())
        }

        async fn download(
            &self,
            tenant_id: &str,
            conversation_id: &str,
            path: &str,
        ) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(&Self::key(tenant_id, conversation_id, path))
                .cloned()
                .ok_or_else(|| WorkspaceError::NotFound {
                    resource: format!("blob {path}"),
                })
        }

        async fn list(&self, tenant_id: &str, conversation_id: &str) -> Result<Vec<BlobEntry>> {
            let prefix = format!("{tenant_id}/{conversation_id}/");
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, content)| BlobEntry {
                    path: key[prefix.len()..].to_string(),
                    size: content.len() as u64,
                })
                .collect())
        }

        async fn delete(&self, tenant_id: &str, conversation_id: &str, path: &str) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .remove(&Self::key(tenant_id, conversation_id, path));
            Ok(())
        }

        async fn exists(
            &self,
            tenant_id: &str,
            conversation_id: &str,
            path: &str,
        ) -> Result<bool> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .contains_key(&Self::key(tenant_id, conversation_id, path)))
        }
    }
}
