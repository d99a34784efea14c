//! Storage abstraction.
//!
//! The core never touches an object store directly. Source videos are
//! resolved to local paths and derivative images are written through the
//! [`Storage`] trait; [`FilesystemStorage`] is the implementation for a
//! directory tree on local disk.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::StillframeError;

/// Where source videos are read from and derivatives are written to.
///
/// Storage paths are `/`-separated relative keys such as
/// `thumbnails/clip-42/large.jpg`.
pub trait Storage: Send + Sync {
    /// Copy the file at `local_path` to `storage_path`, replacing any
    /// previous content.
    fn put(&self, local_path: &Path, storage_path: &str) -> Result<(), StillframeError>;

    /// A local filesystem path the content of `storage_path` can be read from.
    fn local_path(&self, storage_path: &str) -> Result<PathBuf, StillframeError>;

    /// Size in bytes of `storage_path`, or `None` if nothing is stored there.
    ///
    /// The default implementation stats [`local_path`](Storage::local_path).
    fn file_size(&self, storage_path: &str) -> Result<Option<u64>, StillframeError> {
        let path = self.local_path(storage_path)?;
        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StillframeError::Storage {
                path: storage_path.to_string(),
                reason: error.to_string(),
            }),
        }
    }
}

/// [`Storage`] backed by a directory on the local filesystem.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
///
/// use stillframe::{FilesystemStorage, Storage};
///
/// let storage = FilesystemStorage::new("/var/lib/stillframe/files");
/// storage.put(Path::new("/tmp/frame.jpg"), "thumbnails/clip-42/large.jpg")?;
/// assert_eq!(
///     storage.local_path("thumbnails/clip-42/large.jpg")?,
///     Path::new("/var/lib/stillframe/files/thumbnails/clip-42/large.jpg"),
/// );
/// # Ok::<(), stillframe::StillframeError>(())
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Create a storage rooted at `root`. The directory is created lazily on
    /// the first write.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a storage path below the root, rejecting absolute paths and `..`.
    fn resolve(&self, storage_path: &str) -> Result<PathBuf, StillframeError> {
        let relative = Path::new(storage_path);
        let escapes = relative.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if storage_path.is_empty() || escapes {
            return Err(StillframeError::Storage {
                path: storage_path.to_string(),
                reason: "storage paths must be relative and stay below the root".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl Storage for FilesystemStorage {
    fn put(&self, local_path: &Path, storage_path: &str) -> Result<(), StillframeError> {
        let destination = self.resolve(storage_path)?;
        let storage_error = |error: std::io::Error| StillframeError::Storage {
            path: storage_path.to_string(),
            reason: error.to_string(),
        };

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(storage_error)?;
        }

        // Copy next to the destination, then rename, so readers never see a
        // half-written derivative.
        let staging = destination.with_extension("partial");
        fs::copy(local_path, &staging).map_err(storage_error)?;
        fs::rename(&staging, &destination).map_err(|error| {
            let _ = fs::remove_file(&staging);
            storage_error(error)
        })?;
        Ok(())
    }

    fn local_path(&self, storage_path: &str) -> Result<PathBuf, StillframeError> {
        self.resolve(storage_path)
    }
}
