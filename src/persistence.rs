//! Persistence abstraction.
//!
//! Two kinds of durable state pass through [`Persistence`]: media records
//! (carrying the `has_thumbnails` consistency flag) and dispatched job
//! records (carrying retry counters and recovery checkpoints). Writes are
//! field-level; [`flush`](Persistence::flush) commits them.
//!
//! [`JsonStore`] keeps everything in memory and, when opened on a path,
//! commits by atomically replacing a JSON document.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::dispatch::JobRecord;
use crate::error::StillframeError;
use crate::media::MediaRecord;

/// Durable state used by the synchronizer and the dispatch strategy.
///
/// Implementations provide no locking across calls; callers serialize
/// concurrent work on the same media item or job.
pub trait Persistence: Send + Sync {
    /// Load a media record.
    fn media(&self, media_id: &str) -> Result<Option<MediaRecord>, StillframeError>;

    /// Insert or replace a media record.
    fn save_media(&self, media_id: &str, record: &MediaRecord) -> Result<(), StillframeError>;

    /// Identifiers of every media record, in ascending order.
    fn media_ids(&self) -> Result<Vec<String>, StillframeError>;

    /// Set only the consistency flag of an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::UnknownMedia`] if no record exists.
    fn set_has_thumbnails(&self, media_id: &str, value: bool) -> Result<(), StillframeError> {
        let mut record = self
            .media(media_id)?
            .ok_or_else(|| StillframeError::UnknownMedia(media_id.to_string()))?;
        record.has_thumbnails = value;
        self.save_media(media_id, &record)
    }

    /// Load a job record.
    fn job(&self, job_id: &str) -> Result<Option<JobRecord>, StillframeError>;

    /// Insert or replace a job record.
    fn save_job(&self, job: &JobRecord) -> Result<(), StillframeError>;

    /// Remove a job record. Removing a missing job is not an error.
    fn remove_job(&self, job_id: &str) -> Result<(), StillframeError>;

    /// Every job record, ordered by identifier.
    fn jobs(&self) -> Result<Vec<JobRecord>, StillframeError>;

    /// Commit pending writes.
    fn flush(&self) -> Result<(), StillframeError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    media: BTreeMap<String, MediaRecord>,
    #[serde(default)]
    jobs: BTreeMap<String, JobRecord>,
}

/// [`Persistence`] backed by a single JSON document.
///
/// # Example
///
/// ```no_run
/// use stillframe::{JsonStore, MediaAsset, MediaRecord, Persistence};
///
/// let store = JsonStore::open("state.json")?;
/// let asset = MediaAsset::new("clip-42", "videos/clip-42.mp4", "video/mp4");
/// store.save_media("42", &MediaRecord::new(asset))?;
/// store.flush()?;
/// # Ok::<(), stillframe::StillframeError>(())
/// ```
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    data: Mutex<StoreData>,
}

impl JsonStore {
    /// Open (or start) the document at `path`. A missing file is an empty
    /// store; it is created on the first [`flush`](Persistence::flush).
    ///
    /// # Errors
    ///
    /// Returns [`StillframeError::Persistence`] if the file exists but cannot
    /// be read, or [`StillframeError::Json`] if it is malformed.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StillframeError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => StoreData::default(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(error) if error.kind() == ErrorKind::NotFound => StoreData::default(),
            Err(error) => {
                return Err(StillframeError::Persistence(format!(
                    "cannot read {}: {error}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// A store that lives only in memory; `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(StoreData::default()),
        }
    }

    /// The backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>, StillframeError> {
        self.data
            .lock()
            .map_err(|_| StillframeError::Persistence("state lock poisoned".to_string()))
    }
}

impl Persistence for JsonStore {
    fn media(&self, media_id: &str) -> Result<Option<MediaRecord>, StillframeError> {
        Ok(self.lock()?.media.get(media_id).cloned())
    }

    fn save_media(&self, media_id: &str, record: &MediaRecord) -> Result<(), StillframeError> {
        self.lock()?
            .media
            .insert(media_id.to_string(), record.clone());
        Ok(())
    }

    fn media_ids(&self) -> Result<Vec<String>, StillframeError> {
        Ok(self.lock()?.media.keys().cloned().collect())
    }

    fn job(&self, job_id: &str) -> Result<Option<JobRecord>, StillframeError> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    fn save_job(&self, job: &JobRecord) -> Result<(), StillframeError> {
        self.lock()?.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn remove_job(&self, job_id: &str) -> Result<(), StillframeError> {
        self.lock()?.jobs.remove(job_id);
        Ok(())
    }

    fn jobs(&self) -> Result<Vec<JobRecord>, StillframeError> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }

    fn flush(&self) -> Result<(), StillframeError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(&*self.lock()?)?;
        let persistence_error = |error: std::io::Error| {
            StillframeError::Persistence(format!("cannot write {}: {error}", path.display()))
        };

        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&directory).map_err(persistence_error)?;

        let mut staging = tempfile::NamedTempFile::new_in(&directory).map_err(persistence_error)?;
        staging.write_all(&json).map_err(persistence_error)?;
        staging.as_file().sync_all().map_err(persistence_error)?;
        staging
            .persist(path)
            .map_err(|error| persistence_error(error.error))?;
        Ok(())
    }
}
