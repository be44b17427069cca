/// Write-ahead log for consensus progress
///
/// Two stores live under the WAL directory:
/// - `wal_meta/`: a RocksDB instance holding the chain-state high-water
///   mark, the journal position of the last confirmed view change, and
///   view-change QCs of the current epoch.
/// - `wal.{id}` segment files: the append-only message journal.
///
/// Recovery loads the chain state first, then replays the journal from the
/// last confirmed view change.

use crate::protocols::{ChainState, WalMessage};
use crate::types::ViewChangeQC;
use parking_lot::{Mutex, RwLock};
use rocksdb::{Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod journal;

pub use journal::{Journal, JournalError, JournalRecord, DEFAULT_JOURNAL_LIMIT_SIZE};

const META_DIR: &str = "wal_meta";
const CHAIN_STATE_KEY: &[u8] = b"chain-state";
const VIEW_CHANGE_KEY: &[u8] = b"view-change";
const VIEW_CHANGE_QC_PREFIX: &[u8] = b"view-change-qc";
const KEY_SEPARATOR: &[u8] = b"qs";

#[derive(Error, Debug)]
pub enum WalError {
    #[error("Failed to create WAL directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Invalid chain state: {0}")]
    InvalidChainState(String),

    #[error("Recovery failed: {0}")]
    Recovery(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WalError>;

/// Journal position of the last confirmed view change
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeMessage {
    pub epoch: u64,
    pub view_number: u64,
    pub block_number: u64,
    pub file_id: u32,
    pub seq: u64,
}

impl ViewChangeMessage {
    pub fn new(epoch: u64, view_number: u64, block_number: u64) -> Self {
        Self {
            epoch,
            view_number,
            block_number,
            ..Default::default()
        }
    }
}

/// Durable consensus log
///
/// The engine always holds some `Wal`; nodes that keep nothing on disk get
/// an [`EmptyWal`].
pub trait Wal: Send + Sync {
    /// Overwrite the persisted chain state; rejects states that fail
    /// `valid_chain_state`
    fn update_chain_state(&self, chain_state: &ChainState) -> Result<()>;

    /// Hand the persisted chain state, if any, to `recovery`
    fn load_chain_state(
        &self,
        recovery: &mut dyn FnMut(&ChainState) -> anyhow::Result<()>,
    ) -> Result<()>;

    /// Append to the journal without waiting for the disk
    fn write(&self, msg: &WalMessage) -> Result<()>;

    /// Append and flush to disk before returning
    fn write_sync(&self, msg: &WalMessage) -> Result<()>;

    /// Record the current journal position as the replay start point and
    /// expire older journal files in the background
    fn update_view_change(&self, info: ViewChangeMessage) -> Result<ViewChangeMessage>;

    fn update_view_change_qc(
        &self,
        epoch: u64,
        block_number: u64,
        view_number: u64,
        qc: &ViewChangeQC,
    ) -> Result<()>;

    fn get_view_change_qc(
        &self,
        epoch: u64,
        block_number: u64,
        view_number: u64,
    ) -> Result<Option<ViewChangeQC>>;

    /// Replay journal messages written since the last confirmed view change
    fn load(&self, recovery: &mut dyn FnMut(WalMessage) -> anyhow::Result<()>) -> Result<()>;

    /// Flush and wait for background maintenance
    fn close(&self);
}

/// Open the WAL under `path`, or a no-op WAL when no path is configured
pub fn new_wal(path: Option<&Path>, journal_limit_size: u64) -> Result<Box<dyn Wal>> {
    match path {
        Some(path) => Ok(Box::new(BaseWal::open(path, journal_limit_size)?)),
        None => Ok(Box::new(EmptyWal)),
    }
}

fn view_change_qc_key(epoch: u64, block_number: u64, view_number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(VIEW_CHANGE_QC_PREFIX.len() + 24 + 2 * KEY_SEPARATOR.len());
    key.extend_from_slice(VIEW_CHANGE_QC_PREFIX);
    key.extend_from_slice(&epoch.to_be_bytes());
    key.extend_from_slice(KEY_SEPARATOR);
    key.extend_from_slice(&block_number.to_be_bytes());
    key.extend_from_slice(KEY_SEPARATOR);
    key.extend_from_slice(&view_number.to_be_bytes());
    key
}

fn epoch_prefix(epoch: u64) -> Vec<u8> {
    let mut prefix = VIEW_CHANGE_QC_PREFIX.to_vec();
    prefix.extend_from_slice(&epoch.to_be_bytes());
    prefix
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// RocksDB + journal backed WAL
pub struct BaseWal {
    path: PathBuf,
    meta: Arc<DB>,
    journal: Arc<Journal>,
    chain_state: RwLock<Option<ChainState>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl BaseWal {
    pub fn open(path: &Path, journal_limit_size: u64) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|source| WalError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let meta = DB::open(&opts, path.join(META_DIR))?;
        let journal = Journal::open(path, journal_limit_size)?;
        if let Some(bytes) = meta.get(VIEW_CHANGE_KEY)? {
            let confirmed: ViewChangeMessage = bincode::deserialize(&bytes)?;
            journal.resume_from(confirmed.file_id, confirmed.seq)?;
        }

        info!("Opened WAL at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            meta: Arc::new(meta),
            journal: Arc::new(journal),
            chain_state: RwLock::new(None),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Forget the cached chain state so the next load reads storage
    pub fn clear_cache(&self) {
        *self.chain_state.write() = None;
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut background = self.background.lock();
        background.retain(|h| !h.is_finished());
        background.push(std::thread::spawn(task));
    }

    fn join_background(&self) {
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("WAL background task panicked");
            }
        }
    }

    fn read_view_change(&self) -> Result<Option<ViewChangeMessage>> {
        match self.meta.get(VIEW_CHANGE_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn append(&self, msg: &WalMessage, sync: bool) -> Result<()> {
        let seq = self.journal.insert(msg, now_millis(), sync)?;
        debug!(
            "WAL {} tag={:#04x} epoch={} view={} number={} seq={}",
            if sync { "write_sync" } else { "write" },
            msg.tag(),
            msg.epoch(),
            msg.view_number(),
            msg.block_number(),
            seq
        );
        Ok(())
    }
}

/// Delete every view-change QC stored under `epoch`
fn delete_epoch_qcs(db: &DB, epoch: u64) -> std::result::Result<usize, rocksdb::Error> {
    let prefix = epoch_prefix(epoch);
    let mut deleted = 0;
    for item in db.iterator(IteratorMode::From(&prefix[..], Direction::Forward)) {
        let (key, _) = item?;
        if !key.starts_with(&prefix) {
            break;
        }
        db.delete(&key)?;
        deleted += 1;
    }
    Ok(deleted)
}

impl Wal for BaseWal {
    fn update_chain_state(&self, chain_state: &ChainState) -> Result<()> {
        if !chain_state.valid_chain_state() {
            return Err(WalError::InvalidChainState(chain_state.to_string()));
        }
        let bytes = bincode::serialize(chain_state)?;
        self.meta.put(CHAIN_STATE_KEY, bytes)?;
        *self.chain_state.write() = Some(chain_state.clone());
        debug!("Updated chain state {}", chain_state);
        Ok(())
    }

    fn load_chain_state(
        &self,
        recovery: &mut dyn FnMut(&ChainState) -> anyhow::Result<()>,
    ) -> Result<()> {
        if let Some(cached) = self.chain_state.read().as_ref() {
            return recovery(cached).map_err(WalError::Recovery);
        }

        let Some(bytes) = self.meta.get(CHAIN_STATE_KEY)? else {
            return Ok(());
        };
        let chain_state: ChainState = bincode::deserialize(&bytes)?;
        if !chain_state.valid_chain_state() {
            return Err(WalError::InvalidChainState(chain_state.to_string()));
        }
        recovery(&chain_state).map_err(WalError::Recovery)?;
        *self.chain_state.write() = Some(chain_state);
        Ok(())
    }

    fn write(&self, msg: &WalMessage) -> Result<()> {
        self.append(msg, false)
    }

    fn write_sync(&self, msg: &WalMessage) -> Result<()> {
        self.append(msg, true)
    }

    fn update_view_change(&self, info: ViewChangeMessage) -> Result<ViewChangeMessage> {
        let (file_id, seq) = self.journal.current_journal()?;
        let info = ViewChangeMessage {
            file_id,
            seq,
            ..info
        };
        self.meta.put(VIEW_CHANGE_KEY, bincode::serialize(&info)?)?;
        info!(
            "Confirmed view change epoch={} view={} number={} at journal {}:{}",
            info.epoch, info.view_number, info.block_number, file_id, seq
        );

        let journal = Arc::clone(&self.journal);
        self.spawn_background(move || {
            if let Err(e) = journal.expire(file_id) {
                warn!("Failed to expire journal files below {}: {}", file_id, e);
            }
        });
        Ok(info)
    }

    fn update_view_change_qc(
        &self,
        epoch: u64,
        block_number: u64,
        view_number: u64,
        qc: &ViewChangeQC,
    ) -> Result<()> {
        let key = view_change_qc_key(epoch, block_number, view_number);
        self.meta.put(key, bincode::serialize(qc)?)?;
        debug!(
            "Stored view change QC epoch={} number={} view={}",
            epoch, block_number, view_number
        );

        if epoch > 0 {
            let meta = Arc::clone(&self.meta);
            let previous = epoch - 1;
            self.spawn_background(move || match delete_epoch_qcs(&meta, previous) {
                Ok(0) => {}
                Ok(n) => debug!("Deleted {} view change QCs of epoch {}", n, previous),
                Err(e) => warn!("Failed to delete view change QCs of epoch {}: {}", previous, e),
            });
        }
        Ok(())
    }

    fn get_view_change_qc(
        &self,
        epoch: u64,
        block_number: u64,
        view_number: u64,
    ) -> Result<Option<ViewChangeQC>> {
        let key = view_change_qc_key(epoch, block_number, view_number);
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load(&self, recovery: &mut dyn FnMut(WalMessage) -> anyhow::Result<()>) -> Result<()> {
        let (file_id, seq) = match self.read_view_change()? {
            Some(vc) => (vc.file_id, vc.seq),
            None => (0, 0),
        };

        let mut failure = None;
        let replayed = self.journal.load(file_id, seq, |record| {
            if failure.is_none() {
                if let Err(e) = recovery(record.msg) {
                    failure = Some(e);
                }
            }
            Ok(())
        })?;
        if let Some(e) = failure {
            return Err(WalError::Recovery(e));
        }
        info!(
            "Replayed {} journal messages from {}:{}",
            replayed, file_id, seq
        );
        Ok(())
    }

    fn close(&self) {
        self.join_background();
        if let Err(e) = self.journal.flush() {
            warn!("Failed to flush journal: {}", e);
        }
    }
}

impl Drop for BaseWal {
    fn drop(&mut self) {
        self.join_background();
    }
}

/// WAL that keeps nothing; every read finds an empty log
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyWal;

impl Wal for EmptyWal {
    fn update_chain_state(&self, _chain_state: &ChainState) -> Result<()> {
        Ok(())
    }

    fn load_chain_state(
        &self,
        _recovery: &mut dyn FnMut(&ChainState) -> anyhow::Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    fn write(&self, _msg: &WalMessage) -> Result<()> {
        Ok(())
    }

    fn write_sync(&self, _msg: &WalMessage) -> Result<()> {
        Ok(())
    }

    fn update_view_change(&self, info: ViewChangeMessage) -> Result<ViewChangeMessage> {
        Ok(info)
    }

    fn update_view_change_qc(
        &self,
        _epoch: u64,
        _block_number: u64,
        _view_number: u64,
        _qc: &ViewChangeQC,
    ) -> Result<()> {
        Ok(())
    }

    fn get_view_change_qc(
        &self,
        _epoch: u64,
        _block_number: u64,
        _view_number: u64,
    ) -> Result<Option<ViewChangeQC>> {
        Ok(None)
    }

    fn load(&self, _recovery: &mut dyn FnMut(WalMessage) -> anyhow::Result<()>) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}
}
