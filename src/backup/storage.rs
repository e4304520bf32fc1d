use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;

use crate::config::S3Config;

/// The three object-storage operations the backup pipeline relies on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams the file at `source` into `key`. When `content_md5` is set the
    /// service must reject a body whose digest does not match.
    async fn put_object(&self, key: &str, source: &Path, content_md5: Option<&str>) -> Result<()>;

    /// All keys starting with `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub async fn from_config(s3_config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(s3_config.region.clone()));

        if let Some(endpoint) = &s3_config.endpoint_url {
            tracing::info!(endpoint = %endpoint, "Using custom S3 endpoint");
            loader = loader.endpoint_url(endpoint);
        }

        if let Some(credentials) = &s3_config.credentials {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                &credentials.access_key_id,
                credentials.secret_access_key.expose(),
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }

        let sdk_config = loader.load().await;
        let client_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(s3_config.force_path_style)
            .build();

        Self::new(s3::Client::from_conf(client_config), s3_config.bucket_name.clone())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, source: &Path, content_md5: Option<&str>) -> Result<()> {
        let body = ByteStream::from_path(source)
            .await
            .with_context(|| format!("Failed to create ByteStream from file: {}", source.display()))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body);
        if let Some(md5) = content_md5 {
            request = request.content_md5(md5);
        }

        request.send().await.with_context(|| {
            format!(
                "Failed to upload file {} to S3 bucket {} with key {}",
                source.display(),
                self.bucket,
                key
            )
        })?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .with_context(|| {
                    format!("Failed to list objects in bucket {} under {}", self.bucket, prefix)
                })?;

            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to delete {} from S3 bucket {}", key, self.bucket))?;
        Ok(())
    }
}

/// In-memory store with failure injection, standing in for S3 in tests.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StoreCall {
        Put(String),
        List(String),
        Delete(String),
    }

    #[derive(Debug, Clone)]
    pub struct StoredObject {
        pub body: Vec<u8>,
        pub content_md5: Option<String>,
    }

    #[derive(Default)]
    pub struct InMemoryObjectStore {
        objects: Mutex<BTreeMap<String, StoredObject>>,
        calls: Mutex<Vec<StoreCall>>,
        fail_puts: AtomicBool,
        fail_lists: AtomicBool,
        failing_deletes: Mutex<HashSet<String>>,
    }

    impl InMemoryObjectStore {
        pub fn with_keys(keys: &[&str]) -> Self {
            let store = Self::default();
            for key in keys {
                store.objects.lock().unwrap().insert(
                    key.to_string(),
                    StoredObject {
                        body: Vec::new(),
                        content_md5: None,
                    },
                );
            }
            store
        }

        pub fn fail_puts(&self) {
            self.fail_puts.store(true, Ordering::SeqCst);
        }

        pub fn fail_lists(&self) {
            self.fail_lists.store(true, Ordering::SeqCst);
        }

        pub fn fail_delete_of(&self, key: &str) {
            self.failing_deletes.lock().unwrap().insert(key.to_string());
        }

        pub fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        pub fn keys_under(&self, prefix: &str) -> Vec<String> {
            self.keys().into_iter().filter(|k| k.starts_with(prefix)).collect()
        }

        pub fn object(&self, key: &str) -> Option<StoredObject> {
            self.objects.lock().unwrap().get(key).cloned()
        }

        pub fn calls(&self) -> Vec<StoreCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn deletes(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    StoreCall::Delete(key) => Some(key),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: StoreCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryObjectStore {
        async fn put_object(&self, key: &str, source: &Path, content_md5: Option<&str>) -> Result<()> {
            self.record(StoreCall::Put(key.to_string()));
            if self.fail_puts.load(Ordering::SeqCst) {
                anyhow::bail!("simulated PutObject failure: 503 SlowDown");
            }
            let body = tokio::fs::read(source)
                .await
                .with_context(|| format!("Failed to read {}", source.display()))?;
            self.objects.lock().unwrap().insert(
                key.to_string(),
                StoredObject {
                    body,
                    content_md5: content_md5.map(str::to_string),
                },
            );
            Ok(())
        }

        async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
            self.record(StoreCall::List(prefix.to_string()));
            if self.fail_lists.load(Ordering::SeqCst) {
                anyhow::bail!("simulated ListObjectsV2 failure: AccessDenied");
            }
            Ok(self.keys_under(prefix))
        }

        async fn delete_object(&self, key: &str) -> Result<()> {
            self.record(StoreCall::Delete(key.to_string()));
            if self.failing_deletes.lock().unwrap().contains(key) {
                anyhow::bail!("simulated DeleteObject failure for {}", key);
            }
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
    }
}
