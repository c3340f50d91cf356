use std::{
    collections::HashMap,
    fs::{File, OpenOptions, read_dir},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

pub const DATASET_FILE_EXTENSION: &str = "jsonl";
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;
pub const MAX_DATASET_NAME_BYTES: usize = 128;

const PROBE_FILE_PREFIX: &str = ".health-probe";

static PROBE_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatasetNameError {
    #[error("dataset name must not be empty")]
    Empty,
    #[error("dataset name exceeds {MAX_DATASET_NAME_BYTES} bytes")]
    TooLong,
    #[error("dataset name must not contain null bytes")]
    NullByte,
    #[error("dataset name must not contain path separators")]
    PathSeparator,
    #[error("dataset name must not contain '..'")]
    ParentDirectory,
    #[error("dataset name must not start or end with '.'")]
    EdgePeriod,
    #[error("dataset name contains disallowed character {0:?}")]
    DisallowedCharacter(char),
    #[error("dataset name resolves outside the data directory")]
    OutsideDataDir,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record must not contain raw newlines")]
    InvalidRecord,
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(context: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("data directory {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("data directory {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("data directory {} is not accessible: {source}", .path.display())]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("data directory {} is not writable: {source}", .path.display())]
    NotWritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A validated dataset name and the current file it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetPath {
    name: String,
    path: PathBuf,
}

impl DatasetPath {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_name(&self) -> String {
        format!("{}.{DATASET_FILE_EXTENSION}", self.name)
    }

    fn rotated_path(&self, index: u64) -> PathBuf {
        self.path.with_file_name(format!("{}.{index}", self.file_name()))
    }

    fn rotation_index_of(&self, candidate: &str) -> Option<u64> {
        let suffix = candidate.strip_prefix(&self.file_name())?.strip_prefix('.')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse::<u64>().ok()
    }
}

pub fn sanitize_dataset_name(data_dir: &Path, raw: &str) -> Result<DatasetPath, DatasetNameError> {
    if raw.is_empty() {
        return Err(DatasetNameError::Empty);
    }
    if raw.len() > MAX_DATASET_NAME_BYTES {
        return Err(DatasetNameError::TooLong);
    }
    if raw.contains('\0') {
        return Err(DatasetNameError::NullByte);
    }
    if raw.contains(['/', '\\']) {
        return Err(DatasetNameError::PathSeparator);
    }
    if raw.contains("..") {
        return Err(DatasetNameError::ParentDirectory);
    }
    if raw.starts_with('.') || raw.ends_with('.') {
        return Err(DatasetNameError::EdgePeriod);
    }
    if let Some(ch) = raw
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
    {
        return Err(DatasetNameError::DisallowedCharacter(ch));
    }

    let path = data_dir.join(format!("{raw}.{DATASET_FILE_EXTENSION}"));
    if path.parent() != Some(data_dir) {
        return Err(DatasetNameError::OutsideDataDir);
    }
    Ok(DatasetPath {
        name: raw.to_string(),
        path,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Written { bytes: u64 },
    RotatedThenWritten { bytes: u64, retired: PathBuf },
}

impl AppendOutcome {
    pub fn rotated(&self) -> bool {
        matches!(self, Self::RotatedThenWritten { .. })
    }
}

/// Appends newline-terminated records to dataset files, retiring the
/// current file once the next record would push it past the threshold.
///
/// Writers of one dataset are serialized through a per-dataset lock; the
/// lock covers the size check, the rotation rename and the append.
#[derive(Debug)]
pub struct RotatingWriter {
    max_file_size_bytes: u64,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RotatingWriter {
    pub fn new(max_file_size_bytes: u64) -> Self {
        Self {
            max_file_size_bytes: max_file_size_bytes.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_bytes
    }

    pub fn append(&self, dataset: &DatasetPath, record: &[u8]) -> Result<AppendOutcome, StoreError> {
        if record.contains(&b'\n') {
            return Err(StoreError::InvalidRecord);
        }
        let mut line = Vec::with_capacity(record.len() + 1);
        line.extend_from_slice(record);
        line.push(b'\n');
        let line_len = line.len() as u64;

        let lock = self.dataset_lock(dataset);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current_size = current_file_size(dataset.path())?;
        let mut retired = None;
        let mut size_before = current_size;
        if current_size > 0 && current_size.saturating_add(line_len) > self.max_file_size_bytes {
            let target = self.next_rotation_path(dataset)?;
            std::fs::rename(dataset.path(), &target)
                .map_err(|e| StoreError::io("rotating dataset file", dataset.path(), e))?;
            tracing::info!(
                dataset = dataset.name(),
                retired = %target.display(),
                retired_bytes = current_size,
                max_file_size_bytes = self.max_file_size_bytes,
                "rotated dataset file"
            );
            retired = Some(target);
            size_before = 0;
        }

        if let Err(err) = write_line(dataset.path(), &line, size_before) {
            if let Some(retired) = retired.as_deref() {
                undo_rotation(dataset, retired);
            }
            return Err(err);
        }
        Ok(match retired {
            Some(retired) => AppendOutcome::RotatedThenWritten {
                bytes: line_len,
                retired,
            },
            None => AppendOutcome::Written { bytes: line_len },
        })
    }

    /// Retired files of `dataset`, oldest first.
    pub fn rotated_files(&self, dataset: &DatasetPath) -> Result<Vec<PathBuf>, StoreError> {
        let mut indexed = rotation_indices(dataset)?;
        indexed.sort_unstable();
        Ok(indexed
            .into_iter()
            .map(|index| dataset.rotated_path(index))
            .collect())
    }

    fn next_rotation_path(&self, dataset: &DatasetPath) -> Result<PathBuf, StoreError> {
        let next = rotation_indices(dataset)?
            .into_iter()
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        Ok(dataset.rotated_path(next))
    }

    fn dataset_lock(&self, dataset: &DatasetPath) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(dataset.path().to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

impl Default for RotatingWriter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FILE_SIZE_BYTES)
    }
}

fn current_file_size(path: &Path) -> Result<u64, StoreError> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(StoreError::io("inspecting dataset file", path, err)),
    }
}

fn write_line(path: &Path, line: &[u8], size_before: u64) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io("opening dataset file", path, e))?;
    if let Err(err) = file.write_all(line).and_then(|()| file.sync_data()) {
        if let Err(rollback_err) = file.set_len(size_before) {
            tracing::error!(
                path = %path.display(),
                error = %rollback_err,
                "truncating partial dataset write failed"
            );
        }
        return Err(StoreError::io("appending dataset file", path, err));
    }
    Ok(())
}

fn undo_rotation(dataset: &DatasetPath, retired: &Path) {
    if current_file_size(dataset.path()).unwrap_or(0) > 0 {
        return;
    }
    let _ = std::fs::remove_file(dataset.path());
    if let Err(err) = std::fs::rename(retired, dataset.path()) {
        tracing::error!(
            dataset = dataset.name(),
            retired = %retired.display(),
            error = %err,
            "restoring rotated dataset file failed"
        );
    }
}

fn rotation_indices(dataset: &DatasetPath) -> Result<Vec<u64>, StoreError> {
    let Some(dir) = dataset.path().parent() else {
        return Ok(Vec::new());
    };
    let entries = read_dir(dir).map_err(|e| StoreError::io("listing data directory", dir, e))?;
    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io("listing data directory", dir, e))?;
        if let Some(index) = entry
            .file_name()
            .to_str()
            .and_then(|name| dataset.rotation_index_of(name))
        {
            indices.push(index);
        }
    }
    Ok(indices)
}

/// Reads the current file of `dataset`, dropping any bytes after the last
/// newline. Returns `None` when the dataset has never been written.
pub fn read_current(dataset: &DatasetPath) -> Result<Option<Vec<u8>>, StoreError> {
    let mut file = match File::open(dataset.path()) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io("opening dataset file", dataset.path(), err)),
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| StoreError::io("reading dataset file", dataset.path(), e))?;
    let complete = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    bytes.truncate(complete);
    Ok(Some(bytes))
}

pub fn probe_data_dir(dir: &Path) -> Result<(), ProbeError> {
    let metadata = match std::fs::metadata(dir) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ProbeError::Missing(dir.to_path_buf()));
        }
        Err(source) => {
            return Err(ProbeError::Inaccessible {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    if !metadata.is_dir() {
        return Err(ProbeError::NotADirectory(dir.to_path_buf()));
    }

    let probe_path = dir.join(format!(
        "{PROBE_FILE_PREFIX}-{}-{}",
        std::process::id(),
        PROBE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe_path)
        .map_err(|source| ProbeError::NotWritable {
            path: dir.to_path_buf(),
            source,
        })?;
    std::fs::remove_file(&probe_path).map_err(|source| ProbeError::NotWritable {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(())
}
