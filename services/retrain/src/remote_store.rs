//! Remote object store access and the local mirror of the dataset prefix.

use crate::config::StoreConfig;
use async_trait::async_trait;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::Client as S3Client;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors raised by the object store and the local mirror
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Failed to download {key}: {message}")]
    Download { key: String, message: String },

    #[error("Local mirror I/O error at {path}: {source}")]
    Mirror {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn mirror(path: &Path, source: std::io::Error) -> Self {
        StoreError::Mirror {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Minimal object store surface the mirror needs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Full keys of every object whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Download the object at `key` into `dest`, overwriting it
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError>;
}

/// S3-compatible store (AWS S3, MinIO, GCS interoperability endpoint)
pub struct S3ObjectStore {
    config: StoreConfig,
    client: OnceCell<S3Client>,
}

impl S3ObjectStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            config: config.clone(),
            client: OnceCell::new(),
        }
    }

    /// Build the client on first use; later calls reuse it.
    async fn client(&self) -> Result<&S3Client, StoreError> {
        self.client.get_or_try_init(|| self.connect()).await
    }

    /// Credentials file named by the configured environment variable
    fn credentials_file(&self) -> Result<PathBuf, StoreError> {
        let env = &self.config.credentials_env;
        let credentials = std::env::var_os(env).ok_or_else(|| {
            StoreError::RemoteUnavailable(format!("{} environment variable not set", env))
        })?;
        let path = PathBuf::from(credentials);
        if !path.is_file() {
            return Err(StoreError::RemoteUnavailable(format!(
                "Credentials file {} (from {}) does not exist",
                path.display(),
                env
            )));
        }
        Ok(path)
    }

    async fn connect(&self) -> Result<S3Client, StoreError> {
        let credentials = self.credentials_file()?;

        let profile_files = ProfileFiles::builder()
            .with_file(ProfileFileKind::Credentials, &credentials)
            .include_default_config_file(true)
            .build();

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(self.config.region.clone()))
            .profile_files(profile_files)
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = self.config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if self.config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %self.config.bucket,
            region = %self.config.region,
            credentials = %credentials.display(),
            "Object store client initialized"
        );

        Ok(client)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let client = self.client().await?;
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    StoreError::RemoteUnavailable(format!(
                        "Failed to list objects: {}",
                        DisplayErrorContext(&e)
                    ))
                })?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        debug!(count = keys.len(), "Listed remote objects");
        Ok(keys)
    }

    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        let client = self.client().await?;
        let download_error = |message: String| StoreError::Download {
            key: key.to_string(),
            message,
        };

        let response = client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| download_error(DisplayErrorContext(&e).to_string()))?;

        let mut body = response.body;
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| StoreError::mirror(dest, e))?;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| download_error(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| StoreError::mirror(dest, e))?;
        }

        file.flush().await.map_err(|e| StoreError::mirror(dest, e))?;
        Ok(())
    }
}

/// Result of a mirror refresh
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    /// Number of objects materialized in this refresh
    pub count: usize,
    /// Relative keys of those objects
    pub keys: BTreeSet<String>,
    /// Relative keys that were new but failed to download
    pub failed: BTreeSet<String>,
}

/// Keeps the local mirror in step with the remote prefix
pub struct RemoteStoreClient {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    mirror_root: PathBuf,
    staging_dir: PathBuf,
}

impl RemoteStoreClient {
    /// `staging_dir` holds in-flight downloads and must live outside
    /// `mirror_root` on the same file system.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        mirror_root: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            mirror_root: mirror_root.into(),
            staging_dir: staging_dir.into(),
        }
    }

    pub fn mirror_root(&self) -> &Path {
        &self.mirror_root
    }

    /// Keys under the prefix, relative to it.
    ///
    /// Folder placeholders (keys ending in `/`) and keys that would escape the
    /// mirror root are left out.
    pub async fn list_remote_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let keys = self.store.list(&self.prefix).await?;

        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(self.prefix.as_str()))
            .filter(|relative| !relative.is_empty() && !relative.ends_with('/'))
            .filter(|relative| {
                let safe = is_safe_relative_key(relative);
                if !safe {
                    warn!(key = %relative, "Ignoring remote key outside the mirror root");
                }
                safe
            })
            .map(String::from)
            .collect())
    }

    /// Files in the mirror, relative to its root, always `/`-separated.
    pub fn list_local_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut keys = BTreeSet::new();
        if self.mirror_root.is_dir() {
            collect_files(&self.mirror_root, &self.mirror_root, &mut keys)?;
        }
        Ok(keys)
    }

    /// Remote keys missing from the mirror
    pub async fn pending_keys(&self) -> Result<BTreeSet<String>, StoreError> {
        let remote = self.list_remote_keys().await?;
        let local = self.list_local_keys()?;
        Ok(remote.difference(&local).cloned().collect())
    }

    /// Download every remote object the mirror does not have yet.
    ///
    /// A failed object is logged and skipped; it stays missing locally and is
    /// picked up again by the next refresh.
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn fetch_new(&self) -> Result<FetchReport, StoreError> {
        let pending = self.pending_keys().await?;
        let mut report = FetchReport::default();

        for relative in pending {
            let full_key = format!("{}{}", self.prefix, relative);
            let dest = self.local_path(&relative);

            match self.download_atomic(&full_key, &dest).await {
                Ok(()) => {
                    info!(key = %full_key, dest = %dest.display(), "Downloaded");
                    metrics::counter!("retrain_objects_downloaded_total").increment(1);
                    report.count += 1;
                    report.keys.insert(relative);
                }
                Err(e) => {
                    warn!(key = %full_key, error = %e, "Download failed, skipping");
                    metrics::counter!("retrain_object_download_failures_total").increment(1);
                    report.failed.insert(relative);
                }
            }
        }

        if report.count == 0 && report.failed.is_empty() {
            info!("No new files found, mirror is up to date");
        } else {
            info!(
                downloaded = report.count,
                failed = report.failed.len(),
                "Mirror refreshed"
            );
        }

        Ok(report)
    }

    fn local_path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.mirror_root.clone(), |path, part| path.join(part))
    }

    /// Download into the staging directory and rename it into place.
    async fn download_atomic(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::mirror(parent, e))?;
        }
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| StoreError::mirror(&self.staging_dir, e))?;

        let partial = self.staging_dir.join(format!("{}.part", Uuid::new_v4()));

        if let Err(e) = self.store.download(key, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|e| StoreError::mirror(dest, e))
    }
}

fn is_safe_relative_key(key: &str) -> bool {
    Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

fn collect_files(root: &Path, dir: &Path, keys: &mut BTreeSet<String>) -> Result<(), StoreError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StoreError::mirror(dir, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| StoreError::mirror(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| StoreError::mirror(&path, e))?;

        if file_type.is_dir() {
            collect_files(root, &path, keys)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            keys.insert(key);
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;

    /// Client mirroring into `<dir>/raw` and staging in `<dir>/staging`
    fn client(store: Arc<MemoryStore>, dir: &Path) -> RemoteStoreClient {
        RemoteStoreClient::new(store, "yolo_1/", dir.join("raw"), dir.join("staging"))
    }

    fn test_store_config(credentials_env: &str) -> StoreConfig {
        StoreConfig {
            bucket: "harvest-test".to_string(),
            prefix: "yolo_1/".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            credentials_env: credentials_env.to_string(),
        }
    }

    #[tokio::test]
    async fn test_list_remote_keys_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/strawberry/a.jpg", b"a");
        store.put("yolo_1/strawberry/labels/a.txt", b"0 0.5 0.5 0.1 0.1");
        store.put("yolo_1/", b"");
        store.put("yolo_1/onion/", b"");
        store.put("other/strawberry/b.jpg", b"b");

        let keys = client(store, dir.path()).list_remote_keys().await.unwrap();

        let expected: BTreeSet<String> = ["strawberry/a.jpg", "strawberry/labels/a.txt"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_list_remote_keys_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/../escape.jpg", b"x");
        store.put("yolo_1/onion/ok.jpg", b"x");

        let keys = client(store, dir.path()).list_remote_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains("onion/ok.jpg"));
    }

    #[test]
    fn test_list_local_keys_uses_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(raw.join("onion/labels")).unwrap();
        std::fs::write(raw.join("onion/a.jpg"), b"a").unwrap();
        std::fs::write(raw.join("onion/labels/a.txt"), b"a").unwrap();
        std::fs::create_dir_all(dir.path().join("staging")).unwrap();
        std::fs::write(dir.path().join("staging/in-flight.part"), b"b").unwrap();

        let store = Arc::new(MemoryStore::new());
        let keys = client(store, dir.path()).list_local_keys().unwrap();

        let expected: BTreeSet<String> = ["onion/a.jpg", "onion/labels/a.txt"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_list_local_keys_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let keys = client(store, dir.path()).list_local_keys().unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_new_downloads_only_missing() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(raw.join("lettuce")).unwrap();
        std::fs::write(raw.join("lettuce/old.jpg"), b"local copy").unwrap();

        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/lettuce/old.jpg", b"remote copy");
        store.put("yolo_1/lettuce/new.jpg", b"new");
        store.put("yolo_1/rucola/deep/labels/x.txt", b"label");

        let client = client(store, dir.path());
        let report = client.fetch_new().await.unwrap();

        assert_eq!(report.count, 2);
        assert!(report.keys.contains("lettuce/new.jpg"));
        assert!(report.keys.contains("rucola/deep/labels/x.txt"));
        // Existing files are not re-downloaded
        assert_eq!(std::fs::read(raw.join("lettuce/old.jpg")).unwrap(), b"local copy");

        let remote = client.list_remote_keys().await.unwrap();
        let local = client.list_local_keys().unwrap();
        assert!(local.is_superset(&remote));
    }

    #[tokio::test]
    async fn test_fetch_new_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/onion/a.jpg", b"a");

        let client = client(store, dir.path());
        assert_eq!(client.fetch_new().await.unwrap().count, 1);

        let second = client.fetch_new().await.unwrap();
        assert_eq!(second.count, 0);
        assert!(second.keys.is_empty());
    }

    #[tokio::test]
    async fn test_failed_download_is_skipped_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/onion/good.jpg", b"good");
        store.put("yolo_1/onion/bad.jpg", b"bad");
        store.fail_download("yolo_1/onion/bad.jpg");

        let client = client(store.clone(), dir.path());
        let report = client.fetch_new().await.unwrap();

        assert_eq!(report.count, 1);
        assert!(report.failed.contains("onion/bad.jpg"));
        assert!(!dir.path().join("raw/onion/bad.jpg").exists());
        assert_eq!(std::fs::read_dir(dir.path().join("staging")).unwrap().count(), 0);

        let pending = client.pending_keys().await.unwrap();
        assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec!["onion/bad.jpg"]);
    }

    #[tokio::test]
    async fn test_part_suffixed_key_is_mirrored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.put("yolo_1/onion/archive.part", b"p");

        let client = client(store, dir.path());
        assert_eq!(client.fetch_new().await.unwrap().count, 1);

        assert!(client.pending_keys().await.unwrap().is_empty());
        assert!(client.list_local_keys().unwrap().contains("onion/archive.part"));
    }

    #[tokio::test]
    async fn test_unavailable_store_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let result = client(store, dir.path()).fetch_new().await;
        assert!(matches!(result, Err(StoreError::RemoteUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_credentials_env_is_unavailable() {
        let store = S3ObjectStore::new(&test_store_config(
            "HARVEST_TEST_CREDENTIALS_THAT_ARE_NEVER_SET",
        ));

        let result = store.list("yolo_1/").await;
        assert!(matches!(result, Err(StoreError::RemoteUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_credentials_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(
            "HARVEST_TEST_CREDENTIALS_MISSING_FILE",
            dir.path().join("does-not-exist"),
        );
        let store = S3ObjectStore::new(&test_store_config(
            "HARVEST_TEST_CREDENTIALS_MISSING_FILE",
        ));

        let result = store.list("yolo_1/").await;
        assert!(matches!(result, Err(StoreError::RemoteUnavailable(ref m)) if m.contains("does not exist")));
    }

    #[test]
    fn test_credentials_file_comes_from_configured_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest-credentials");
        std::fs::write(&path, "[default]\naws_access_key_id = x\naws_secret_access_key = y\n")
            .unwrap();
        std::env::set_var("HARVEST_TEST_CREDENTIALS_CUSTOM_ENV", &path);

        let store = S3ObjectStore::new(&test_store_config("HARVEST_TEST_CREDENTIALS_CUSTOM_ENV"));
        assert_eq!(store.credentials_file().unwrap(), path);
    }

    #[test]
    fn test_is_safe_relative_key() {
        assert!(is_safe_relative_key("onion/a.jpg"));
        assert!(!is_safe_relative_key("../a.jpg"));
        assert!(!is_safe_relative_key("/etc/passwd"));
    }
}
