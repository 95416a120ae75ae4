//! Directory-backed state store
//!
//! One JSON document per instance under a shared directory. Each save
//! writes a uniquely named temp file and renames it over the record, so a
//! reader never observes a torn record and the last rename wins.

use super::StateStore;
use crate::error::{IdleError, IdleResult};
use crate::models::IdleRecord;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// State store keeping `<instance id>.json` files in one directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Open (and create if needed) the store directory
    pub async fn open(dir: impl Into<PathBuf>) -> IdleResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            IdleError::StateStore(format!("failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, instance_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_stem(instance_id), RECORD_EXTENSION))
    }
}

/// Map an instance id onto a file name.
///
/// Percent-encoding keeps distinct ids on distinct files.
fn file_stem(instance_id: &str) -> String {
    url::form_urlencoded::byte_serialize(instance_id.as_bytes()).collect()
}

/// Write `data` to `temp_path` and rename it over `path`.
///
/// The temp file is removed on every failure.
async fn replace_file(temp_path: &Path, path: &Path, data: &[u8]) -> IdleResult<()> {
    let written = async {
        let mut file = fs::File::create(temp_path).await?;
        file.write_all(data).await?;
        // sync_all does not report a failed buffered write; flush does
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(temp_path).await;
        return Err(IdleError::StateStore(format!(
            "failed to write {}: {}",
            temp_path.display(),
            e
        )));
    }

    if let Err(e) = fs::rename(temp_path, path).await {
        let _ = fs::remove_file(temp_path).await;
        return Err(IdleError::StateStore(format!(
            "failed to rename {} to {}: {}",
            temp_path.display(),
            path.display(),
            e
        )));
    }
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, instance_id: &str) -> IdleResult<Option<IdleRecord>> {
        let path = self.record_path(instance_id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(IdleError::StateStore(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let record = serde_json::from_slice(&data)?;
        Ok(Some(record))
    }

    async fn save(&self, record: &IdleRecord) -> IdleResult<()> {
        let path = self.record_path(&record.instance_id);
        let json = serde_json::to_vec_pretty(record)?;

        let temp_path = path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        replace_file(&temp_path, &path, &json).await?;

        debug!(
            instance_id = %record.instance_id,
            path = %path.display(),
            "Idle record persisted"
        );
        Ok(())
    }

    async fn list(&self) -> IdleResult<Vec<IdleRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match fs::read(&path).await {
                Ok(data) => match serde_json::from_slice::<IdleRecord>(&data) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed record"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_load_and_list() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path().join("state")).await.unwrap();

        assert!(store.load("i-1").await.unwrap().is_none());

        let mut record = IdleRecord::fresh("i-1", Utc::now());
        record.last_writer = "fleet-detector".to_string();
        store.save(&record).await.unwrap();
        store
            .save(&IdleRecord::fresh("i-0", Utc::now()))
            .await
            .unwrap();

        let loaded = store.load("i-1").await.unwrap().unwrap();
        assert_eq!(loaded, record);

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.instance_id)
            .collect();
        assert_eq!(ids, vec!["i-0", "i-1"]);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();

        for _ in 0..5 {
            store
                .save(&IdleRecord::fresh("i-1", Utc::now()))
                .await
                .unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["i-1.json"]);
    }

    #[test]
    fn test_instance_ids_are_encoded() {
        assert_eq!(file_stem("projects/a b"), "projects%2Fa+b");
        assert_eq!(file_stem("i-0abc.x"), "i-0abc.x");
        assert_ne!(file_stem("a/b"), file_stem("a_b"));
    }

    #[tokio::test]
    async fn test_similar_ids_keep_separate_records() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();

        let mut slash = IdleRecord::fresh("a/b", Utc::now());
        slash.last_writer = "fleet-detector".to_string();
        store.save(&slash).await.unwrap();
        store
            .save(&IdleRecord::fresh("a_b", Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.load("a/b").await.unwrap().unwrap(), slash);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_write_removes_temp_file() {
        if !Path::new("/dev/full").exists() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let temp_path = dir.path().join("i-1.json.0.0.tmp");
        let path = dir.path().join("i-1.json");
        std::os::unix::fs::symlink("/dev/full", &temp_path).unwrap();

        let err = replace_file(&temp_path, &path, &[b'x'; 4096]).await.unwrap_err();
        assert!(matches!(err, IdleError::StateStore(_)));
        assert!(std::fs::symlink_metadata(&temp_path).is_err());
        assert!(!path.exists());
    }
}
