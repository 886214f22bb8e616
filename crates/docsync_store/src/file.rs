//! File-backed persistence using an append-only commit log.

use crate::codec::{decode_record, encode_record};
use crate::error::{PersistenceError, PersistenceResult};
use crate::frame::{decode_frame, encode_frame};
use crate::persistence::{apply_ops, Persistence, Table, WriteBatch, WriteOp};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "commits.log";
const COMPACT_FILE: &str = "commits.log.compact";

/// Configuration for [`FilePersistence`].
#[derive(Debug, Clone)]
pub struct FilePersistenceConfig {
    /// Whether every commit is fsynced before it returns.
    pub sync_on_commit: bool,
    /// Log size in bytes above which the log is rewritten with only live
    /// entries.
    pub compaction_threshold: u64,
}

impl FilePersistenceConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether commits are fsynced.
    #[must_use]
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Sets the compaction threshold in bytes.
    #[must_use]
    pub fn with_compaction_threshold(mut self, bytes: u64) -> Self {
        self.compaction_threshold = bytes;
        self
    }
}

impl Default for FilePersistenceConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            compaction_threshold: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct LogState {
    log: File,
    log_size: u64,
    tables: BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>,
    compactions: u64,
}

/// A [`Persistence`] stored in a directory on disk.
///
/// Every commit appends one checksummed frame to `commits.log`. On open the
/// log is replayed into memory; a torn or corrupt tail is truncated at the
/// last intact frame. The directory is exclusively locked while open.
///
/// # Example
///
/// ```no_run
/// use docsync_store::{FilePersistence, FilePersistenceConfig};
/// use std::path::Path;
///
/// let store = FilePersistence::open(Path::new("client-data"), FilePersistenceConfig::new()).unwrap();
/// ```
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
    config: FilePersistenceConfig,
    state: Mutex<LogState>,
    _lock_file: File,
}

impl FilePersistence {
    /// Opens or creates a store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another handle holds the directory, or an I/O
    /// error if the log cannot be read.
    pub fn open(dir: &Path, config: FilePersistenceConfig) -> PersistenceResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(PersistenceError::Locked(dir.to_path_buf()));
        }

        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOG_FILE))?;
        let mut contents = Vec::new();
        log.read_to_end(&mut contents)?;

        let mut tables = BTreeMap::new();
        let valid_len = replay(&contents, &mut tables);
        if valid_len < contents.len() {
            tracing::warn!(
                path = %dir.display(),
                valid_len,
                dropped = contents.len() - valid_len,
                "truncating damaged commit log tail"
            );
            log.set_len(valid_len as u64)?;
            log.sync_all()?;
        }
        tracing::debug!(path = %dir.display(), bytes = valid_len, "opened commit log");

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            state: Mutex::new(LogState {
                log,
                log_size: valid_len as u64,
                tables,
                compactions: 0,
            }),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Current size of the commit log in bytes.
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.state.lock().log_size
    }

    /// Number of compactions performed since open.
    #[must_use]
    pub fn compactions(&self) -> u64 {
        self.state.lock().compactions
    }

    /// Rewrites the log so it contains only live entries.
    pub fn compact(&self) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state)
    }

    fn compact_locked(&self, state: &mut LogState) -> PersistenceResult<()> {
        let ops: Vec<WriteOp> = state
            .tables
            .iter()
            .flat_map(|(table, entries)| {
                entries.iter().map(|(key, value)| WriteOp::Put {
                    table: *table,
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        let frame = encode_frame(&encode_record(&ops)?);

        let tmp_path = self.dir.join(COMPACT_FILE);
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&frame)?;
            tmp.sync_all()?;
        }
        let log_path = self.dir.join(LOG_FILE);
        fs::rename(&tmp_path, &log_path)?;

        state.log = OpenOptions::new().read(true).write(true).open(&log_path)?;
        let before = state.log_size;
        state.log_size = frame.len() as u64;
        state.compactions += 1;
        tracing::debug!(before, after = state.log_size, "compacted commit log");
        Ok(())
    }
}

fn append_frame(log: &mut File, at: u64, frame: &[u8], sync: bool) -> std::io::Result<()> {
    log.seek(SeekFrom::Start(at))?;
    log.write_all(frame)?;
    if sync {
        log.sync_data()?;
    }
    Ok(())
}

fn replay(
    contents: &[u8],
    tables: &mut BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>,
) -> usize {
    let mut offset = 0;
    while offset < contents.len() {
        match decode_frame(&contents[offset..]) {
            Ok(Some((payload, used))) => {
                let ops: Vec<WriteOp> = match decode_record(payload) {
                    Ok(ops) => ops,
                    Err(err) => {
                        tracing::warn!(offset, error = %err, "undecodable commit in log");
                        break;
                    }
                };
                apply_ops(tables, ops);
                offset += used;
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(offset, error = %err, "damaged frame in commit log");
                break;
            }
        }
    }
    offset
}

impl Persistence for FilePersistence {
    fn get(&self, table: Table, key: &[u8]) -> PersistenceResult<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&table)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn scan(&self, table: Table) -> PersistenceResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&table)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> PersistenceResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let ops = batch.into_ops();
        let frame = encode_frame(&encode_record(&ops)?);

        let mut state = self.state.lock();
        let start = state.log_size;
        if let Err(err) = append_frame(&mut state.log, start, &frame, self.config.sync_on_commit) {
            // Drop any partial frame so later commits append after intact data.
            let _ = state.log.set_len(start);
            return Err(err.into());
        }

        state.log_size = start + frame.len() as u64;
        apply_ops(&mut state.tables, ops);

        if state.log_size > self.config.compaction_threshold {
            self.compact_locked(&mut state)?;
        }
        Ok(())
    }

    fn flush(&self) -> PersistenceResult<()> {
        let mut state = self.state.lock();
        state.log.flush()?;
        state.log.sync_all()?;
        Ok(())
    }
}
