//! Staged uploads: CSV bytes parked between intake and the import worker.
//!
//! A staged file belongs to exactly one job and is released when that job
//! reaches a terminal state, unless the store was built with retention on.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use shelfsync_core::JobId;

/// Reference to staged bytes owned by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub job_id: JobId,
    /// Filesystem path or storage key, depending on the store.
    pub key: String,
    pub size_bytes: u64,
    /// SHA-256 of the content, hex encoded.
    pub content_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("staged file not found: {0}")]
    NotFound(String),

    #[error("staging I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("staging store unavailable: {0}")]
    Unavailable(String),
}

/// Sequential reader handed to the CSV parser (runs on a blocking thread).
pub type StagedReader = Box<dyn Read + Send>;

#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn stage(&self, job_id: JobId, bytes: &[u8]) -> Result<StagedFile, StagingError>;

    async fn open(&self, file: &StagedFile) -> Result<StagedReader, StagingError>;

    /// Delete the staged bytes. Returns `false` when retained or already gone.
    async fn release(&self, file: &StagedFile) -> Result<bool, StagingError>;
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Staging on the local filesystem, one `{job_id}.csv` per job.
#[derive(Debug, Clone)]
pub struct LocalStagingStore {
    dir: PathBuf,
    retain: bool,
}

impl LocalStagingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retain: false,
        }
    }

    pub fn with_retention(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.csv"))
    }
}

fn io_error(key: &Path) -> impl FnOnce(std::io::Error) -> StagingError + '_ {
    move |source| StagingError::Io {
        key: key.display().to_string(),
        source,
    }
}

#[async_trait]
impl StagingStore for LocalStagingStore {
    #[instrument(skip(self, bytes), fields(job_id = %job_id, size_bytes = bytes.len()), err)]
    async fn stage(&self, job_id: JobId, bytes: &[u8]) -> Result<StagedFile, StagingError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error(&self.dir))?;

        let path = self.path_for(job_id);
        let partial = path.with_extension("csv.part");
        tokio::fs::write(&partial, bytes).await.map_err(io_error(&partial))?;
        tokio::fs::rename(&partial, &path).await.map_err(io_error(&path))?;

        Ok(StagedFile {
            job_id,
            key: path.display().to_string(),
            size_bytes: bytes.len() as u64,
            content_hash: content_hash(bytes),
        })
    }

    async fn open(&self, file: &StagedFile) -> Result<StagedReader, StagingError> {
        let path = Path::new(&file.key);
        let handle = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StagingError::NotFound(file.key.clone()));
            }
            Err(e) => return Err(io_error(path)(e)),
        };
        Ok(Box::new(std::io::BufReader::new(handle.into_std().await)))
    }

    async fn release(&self, file: &StagedFile) -> Result<bool, StagingError> {
        if self.retain {
            debug!(job_id = %file.job_id, key = %file.key, "retaining staged file");
            return Ok(false);
        }
        match tokio::fs::remove_file(&file.key).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(Path::new(&file.key))(e)),
        }
    }
}

/// In-memory staging for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStagingStore {
    files: RwLock<HashMap<String, Arc<[u8]>>>,
    retain: bool,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn contains(&self, file: &StagedFile) -> bool {
        self.files
            .read()
            .map(|files| files.contains_key(&file.key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.files.read().map(|files| files.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StagingError {
    StagingError::Unavailable("staging lock poisoned".to_string())
}

#[async_trait]
impl StagingStore for InMemoryStagingStore {
    async fn stage(&self, job_id: JobId, bytes: &[u8]) -> Result<StagedFile, StagingError> {
        let key = format!("memory://{job_id}.csv");
        self.files
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), Arc::from(bytes));
        Ok(StagedFile {
            job_id,
            key,
            size_bytes: bytes.len() as u64,
            content_hash: content_hash(bytes),
        })
    }

    async fn open(&self, file: &StagedFile) -> Result<StagedReader, StagingError> {
        let files = self.files.read().map_err(poisoned)?;
        let bytes = files
            .get(&file.key)
            .cloned()
            .ok_or_else(|| StagingError::NotFound(file.key.clone()))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn release(&self, file: &StagedFile) -> Result<bool, StagingError> {
        if self.retain {
            return Ok(false);
        }
        Ok(self.files.write().map_err(poisoned)?.remove(&file.key).is_some())
    }
}
