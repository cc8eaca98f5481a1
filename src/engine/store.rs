use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::engine::trace::TraceRecord;
use crate::error::TraceError;
use crate::task::TaskId;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Execution traces owned by a single engine.
///
/// Records are always replaced whole. When the store is persistent, each
/// record also lives in `<dir>/<digest>.cbor`, where `digest` is the content
/// address of the task identifier. Files are written to a temporary sibling
/// first and renamed into place, so a reader never sees half a record.
///
/// A persisted record that cannot be decoded, or that belongs to another
/// task, is treated as if it were not there: the task simply runs again and
/// the file is overwritten.
pub struct TraceStore {
    records: RwLock<HashMap<TaskId, Arc<TraceRecord>>>,
    dir: Option<Utf8PathBuf>,
}

impl TraceStore {
    /// A store that forgets everything when the engine is dropped.
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::default(),
            dir: None,
        }
    }

    /// A store backed by `dir`. The directory is created on first write.
    pub fn persistent(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            records: RwLock::default(),
            dir: Some(dir.into()),
        }
    }

    pub fn dir(&self) -> Option<&Utf8Path> {
        self.dir.as_deref()
    }

    /// Location of the persisted record for `task`, if the store is persistent.
    pub fn path_of(&self, task: &TaskId) -> Option<Utf8PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(task.digest().to_hex()).with_extension("cbor"))
    }

    pub fn get(&self, task: &TaskId) -> Option<Arc<TraceRecord>> {
        {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = records.get(task) {
                return Some(record.clone());
            }
        }

        let record = match self.load(task) {
            Ok(record) => Arc::new(record?),
            Err(err) => {
                tracing::warn!("{err}, treating {task} as not built");
                return None;
            }
        };

        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Some(records.entry(task.clone()).or_insert(record).clone())
    }

    /// Replaces the record of `record.task`. Nothing is changed if writing
    /// the persisted copy fails.
    pub(crate) fn insert(&self, record: TraceRecord) -> Result<Arc<TraceRecord>, TraceError> {
        if let Some(path) = self.path_of(&record.task) {
            write_atomic(&path, &record)?;
        }

        let record = Arc::new(record);
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(record.task.clone(), record.clone());

        Ok(record)
    }

    /// Number of records currently held in memory.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads every persisted record into memory up front, decoding files in
    /// parallel. Unreadable records are skipped with a warning. Returns the
    /// number of records loaded.
    pub fn preload(&self) -> Result<usize, TraceError> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };

        let entries = match dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(TraceError::Io {
                    path: dir.clone(),
                    source,
                });
            }
        };

        let paths: Vec<Utf8PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().to_path_buf())
            .filter(|path| path.extension() == Some("cbor"))
            .collect();

        let loaded: Vec<TraceRecord> = paths
            .par_iter()
            .filter_map(|path| match decode_file(path) {
                Ok(Some(record)) if Some(record.task.digest().to_hex().as_str()) == path.file_stem() => {
                    Some(record)
                }
                Ok(Some(_)) => {
                    tracing::warn!("Trace file {path} is misplaced, skipping");
                    None
                }
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!("{err}, skipping");
                    None
                }
            })
            .collect();

        let count = loaded.len();
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        for record in loaded {
            records
                .entry(record.task.clone())
                .or_insert_with(|| Arc::new(record));
        }

        Ok(count)
    }

    fn load(&self, task: &TaskId) -> Result<Option<TraceRecord>, TraceError> {
        let Some(path) = self.path_of(task) else {
            return Ok(None);
        };

        let Some(record) = decode_file(&path)? else {
            return Ok(None);
        };

        if &record.task != task {
            return Err(TraceError::Corruption {
                path,
                reason: format!("record belongs to {}", record.task),
            });
        }

        Ok(Some(record))
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("records", &self.len())
            .field("dir", &self.dir)
            .finish()
    }
}

fn decode_file(path: &Utf8Path) -> Result<Option<TraceRecord>, TraceError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(TraceError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let record: TraceRecord =
        ciborium::from_reader(bytes.as_slice()).map_err(|e| TraceError::Corruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !record.is_intact() {
        return Err(TraceError::Corruption {
            path: path.to_path_buf(),
            reason: "fingerprint mismatch".into(),
        });
    }

    Ok(Some(record))
}

fn write_atomic(path: &Utf8Path, record: &TraceRecord) -> Result<(), TraceError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes).map_err(|e| TraceError::Encode(e.to_string()))?;

    let io = |source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io)?;
    }

    let temp = path.with_extension(format!(
        "{}.{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    fs::write(&temp, &bytes).map_err(io)?;

    if let Err(e) = fs::rename(&temp, path) {
        fs::remove_file(&temp).ok();
        return Err(io(e));
    }

    Ok(())
}
