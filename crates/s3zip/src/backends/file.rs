//! 📂 The local-directory object store, for people without an AWS bill.
//!
//! The disk was quiet. Too quiet. Somebody wanted to zip a "prefix" and there was no
//! cloud in sight, just a directory tree and a dream.
//!
//! 🧠 Knowledge graph:
//! - `<root>/<bucket>/<key>`: each first-level directory under the root is a bucket,
//!   and keys are `/`-separated relative paths inside it.
//! - Listing walks the bucket recursively and returns keys sorted, like S3 does.
//! - Multipart uploads stage their parts under `<root>/.s3zip-uploads/<upload id>/`.
//!   Completion concatenates them into a temp file and renames it over the destination,
//!   so the destination path never holds half an archive. Abort deletes the staging dir.
//! - Keys with `..`, `.` or a leading `/` are refused. The duck does not leave the root. 🦆

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::backends::{
    EntrySink, FetchError, ObjectMeta, ObjectStore, StoreError, UploadedPart,
};

const STAGING_DIR: &str = ".s3zip-uploads";
const READ_CHUNK_BYTES: usize = 64 * 1024;

static NEXT_UPLOAD: AtomicU64 = AtomicU64::new(1);

/// 🔧 Where the "buckets" live.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FileStoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    config: FileStoreConfig,
}

impl FileStore {
    /// 🚀 Checks the root is a real directory and moves in.
    pub fn new(config: FileStoreConfig) -> anyhow::Result<Self> {
        let metadata = std::fs::metadata(&config.root).with_context(|| {
            format!(
                "💀 The store root '{}' could not be found. We stared at the path. \
                 The path stared back.",
                config.root.display()
            )
        })?;
        anyhow::ensure!(
            metadata.is_dir(),
            "💀 The store root '{}' is a file, and buckets do not fit inside files.",
            config.root.display()
        );
        Ok(Self { config })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StoreError> {
        if bucket.is_empty()
            || bucket == "."
            || bucket == ".."
            || bucket == STAGING_DIR
            || bucket.contains(['/', '\\'])
        {
            return Err(StoreError::Protocol(format!("invalid bucket name '{bucket}'")));
        }
        Ok(self.config.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let mut path = self.bucket_path(bucket)?;
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(StoreError::Protocol(format!("invalid object key '{key}'")));
        }
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(StoreError::Protocol(format!("invalid object key '{key}'")));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn staging_path(&self, upload_id: &str) -> Result<PathBuf, StoreError> {
        if upload_id.is_empty() || upload_id.contains(['/', '\\', '.']) {
            return Err(StoreError::Protocol(format!("invalid upload id '{upload_id}'")));
        }
        Ok(self.config.root.join(STAGING_DIR).join(upload_id))
    }
}

/// 💀 io::Error → StoreError, keeping "not there" and "not allowed" distinguishable.
fn io_error(err: std::io::Error, context: String, target: &str) -> StoreError {
    match err.kind() {
        ErrorKind::NotFound => StoreError::NotFound {
            key: target.to_string(),
        },
        ErrorKind::PermissionDenied => StoreError::AccessDenied {
            target: target.to_string(),
        },
        _ => StoreError::unavailable(context, err),
    }
}

fn part_file_name(part_number: i32) -> String {
    format!("part-{part_number:05}")
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let bucket_root = self.bucket_path(bucket)?;
        let mut keys = Vec::new();
        let mut pending = vec![(bucket_root.clone(), String::new())];

        while let Some((dir, relative)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| io_error(e, format!("listing '{}'", dir.display()), bucket))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error(e, format!("listing '{}'", dir.display()), bucket))?
            {
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    // -- 🐛 non-UTF-8 file names cannot be keys
                    continue;
                };
                let key = if relative.is_empty() {
                    name
                } else {
                    format!("{relative}/{name}")
                };
                let file_type = entry.file_type().await.map_err(|e| {
                    io_error(e, format!("inspecting '{}'", entry.path().display()), &key)
                })?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        debug!(
            "📚 listed {} keys under '{}' with prefix '{prefix}'",
            keys.len(),
            bucket_root.display()
        );
        Ok(keys)
    }

    async fn probe(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = self.object_path(bucket, key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, format!("probing '{}'", path.display()), key))?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(ObjectMeta {
            size: Some(metadata.len()),
        })
    }

    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn EntrySink + Send),
    ) -> Result<u64, FetchError> {
        let path = self.object_path(bucket, key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_error(e, format!("opening '{}'", path.display()), key))?;

        let mut buffer = vec![0u8; READ_CHUNK_BYTES];
        let mut fetched = 0u64;
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| io_error(e, format!("reading '{}'", path.display()), key))?;
            if read == 0 {
                break;
            }
            trace!("📂 {read} bytes off the disk for '{key}'");
            sink.append(&buffer[..read]).await?;
            fetched += read as u64;
        }
        Ok(fetched)
    }

    async fn create_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        // -- validate the destination up front, not at completion time
        self.object_path(bucket, key)?;
        let upload_id = format!(
            "{}-{}",
            std::process::id(),
            NEXT_UPLOAD.fetch_add(1, Ordering::Relaxed)
        );
        let staging = self.staging_path(&upload_id)?;
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_error(e, format!("creating '{}'", staging.display()), key))?;
        debug!("🧩 staging upload {upload_id} for '{bucket}/{key}'");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<UploadedPart, StoreError> {
        let staging = self.staging_path(upload_id)?;
        if !tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            return Err(StoreError::Protocol(format!("unknown upload id '{upload_id}'")));
        }
        let part_path = staging.join(part_file_name(part_number));
        tokio::fs::write(&part_path, &data)
            .await
            .map_err(|e| io_error(e, format!("writing '{}'", part_path.display()), key))?;
        Ok(UploadedPart {
            part_number,
            etag: format!("{upload_id}-{part_number}-{}", data.len()),
        })
    }

    async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        let destination = self.object_path(bucket, key)?;
        let staging = self.staging_path(upload_id)?;
        let assembled = staging.join("assembled");

        let mut out = tokio::fs::File::create(&assembled)
            .await
            .map_err(|e| io_error(e, format!("creating '{}'", assembled.display()), key))?;
        for part in &parts {
            let part_path = staging.join(part_file_name(part.part_number));
            let data = tokio::fs::read(&part_path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    StoreError::Protocol(format!("part {} was never uploaded", part.part_number))
                }
                _ => io_error(e, format!("reading '{}'", part_path.display()), key),
            })?;
            out.write_all(&data)
                .await
                .map_err(|e| io_error(e, format!("writing '{}'", assembled.display()), key))?;
        }
        out.flush()
            .await
            .map_err(|e| io_error(e, format!("flushing '{}'", assembled.display()), key))?;
        drop(out);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(e, format!("creating '{}'", parent.display()), key))?;
        }
        tokio::fs::rename(&assembled, &destination)
            .await
            .map_err(|e| io_error(e, format!("publishing '{}'", destination.display()), key))?;
        tokio::fs::remove_dir_all(&staging)
            .await
            .map_err(|e| io_error(e, format!("cleaning '{}'", staging.display()), key))?;
        Ok(())
    }

    async fn abort_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let staging = self.staging_path(upload_id)?;
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => Ok(()),
            // -- already gone counts as aborted
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e, format!("removing '{}'", staging.display()), key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(FileStoreConfig {
            root: dir.path().to_path_buf(),
        })
        .expect("root exists")
    }

    fn seed(dir: &tempfile::TempDir, relative: &str, contents: &[u8]) {
        let path = dir.path().join(relative);
        std::fs::create_dir_all(path.parent().expect("has parent")).expect("mkdir");
        std::fs::write(path, contents).expect("seed file");
    }

    #[test]
    fn the_one_where_the_root_must_exist() {
        let err = FileStore::new(FileStoreConfig {
            root: PathBuf::from("/definitely/not/a/real/place/🦆"),
        })
        .expect_err("missing root");
        assert!(err.to_string().contains("could not be found"));
    }

    #[tokio::test]
    async fn the_one_where_listing_recurses_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(&dir, "bucket/photos/b.jpg", b"b");
        seed(&dir, "bucket/photos/2024/a.jpg", b"a");
        seed(&dir, "bucket/docs/readme.md", b"r");

        let store = store_in(&dir);
        let keys = store.list_keys("bucket", "photos/").await.expect("list");
        assert_eq!(keys, vec!["photos/2024/a.jpg", "photos/b.jpg"]);
    }

    #[tokio::test]
    async fn the_one_where_probe_and_fetch_agree() {
        let dir = tempfile::tempdir().expect("tempdir");
        seed(&dir, "bucket/k.txt", b"file contents");
        let store = store_in(&dir);

        assert_eq!(store.probe("bucket", "k.txt").await.expect("probe").size, Some(13));
        let mut sink = Vec::new();
        assert_eq!(store.fetch("bucket", "k.txt", &mut sink).await.expect("fetch"), 13);
        assert_eq!(sink, b"file contents");
        assert!(store
            .probe("bucket", "nope.txt")
            .await
            .expect_err("absent")
            .is_not_found());
    }

    #[tokio::test]
    async fn the_one_where_escaping_the_root_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        for key in ["../etc/passwd", "/etc/passwd", "a/../../b", "a//b"] {
            assert!(
                matches!(store.probe("bucket", key).await, Err(StoreError::Protocol(_))),
                "key '{key}' should be refused"
            );
        }
        assert!(matches!(
            store.probe("..", "x").await,
            Err(StoreError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn the_one_where_completion_assembles_parts_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("bucket")).expect("bucket");
        let store = store_in(&dir);

        let id = store.create_upload("bucket", "out/archive.zip").await.expect("create");
        let p1 = store
            .upload_part("bucket", "out/archive.zip", &id, 1, b"first ".to_vec())
            .await
            .expect("p1");
        let p2 = store
            .upload_part("bucket", "out/archive.zip", &id, 2, b"second".to_vec())
            .await
            .expect("p2");
        assert!(!dir.path().join("bucket/out/archive.zip").exists());

        store
            .complete_upload("bucket", "out/archive.zip", &id, vec![p1, p2])
            .await
            .expect("complete");
        assert_eq!(
            std::fs::read(dir.path().join("bucket/out/archive.zip")).expect("read"),
            b"first second"
        );
        assert!(!dir.path().join(STAGING_DIR).join(&id).exists());
    }

    #[tokio::test]
    async fn the_one_where_abort_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let id = store.create_upload("bucket", "out.zip").await.expect("create");
        store
            .upload_part("bucket", "out.zip", &id, 1, vec![1, 2, 3])
            .await
            .expect("part");

        store.abort_upload("bucket", "out.zip", &id).await.expect("abort");
        assert!(!dir.path().join("bucket/out.zip").exists());
        assert!(!dir.path().join(STAGING_DIR).join(&id).exists());
        // -- twice is fine too
        store.abort_upload("bucket", "out.zip", &id).await.expect("abort again");
    }
}
