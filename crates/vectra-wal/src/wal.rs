//! High-level WAL API: epoch assignment, group commit, rotation, retention.
//!
//! Appends are serialized through a single writer state. Each append takes
//! the next epoch and parks the caller until the group-commit cycle has made
//! its record durable. A background committer drains the pending queue every
//! `group_commit_ms`, terminates each group with a fence, and fsyncs once
//! per `fsync_every_fences` fences (or at the next idle tick, whichever
//! comes first). `group_commit_ms == 0` degrades to commit-per-record.

use crate::file::{wal_file_path, FileHeader};
use crate::record::{encode_fence, Record, RecordError};
use crate::recovery::{self, RecoveryInfo};
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Duration;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("WAL is closed")]
    Closed,
}

/// Configuration for the WAL.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the `wal-*.log` files.
    pub dir: PathBuf,
    /// Group-commit window in milliseconds. 0 means commit per record.
    pub group_commit_ms: u64,
    /// Fsync once per this many fences.
    pub fsync_every_fences: u32,
    /// Rotate the active file once it reaches this many bytes.
    pub rotate_bytes: u64,
    /// Maximum number of WAL files kept on disk.
    pub max_files: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("wal"),
            group_commit_ms: 8,
            fsync_every_fences: 50,
            rotate_bytes: 3 * 1024 * 1024 * 1024,
            max_files: 10,
        }
    }
}

impl WalConfig {
    fn validate(&self) -> Result<(), WalError> {
        if self.rotate_bytes < 1024 * 1024 {
            return Err(WalError::InvalidConfig(
                "rotate_bytes must be at least 1MiB".to_string(),
            ));
        }
        if self.fsync_every_fences == 0 {
            return Err(WalError::InvalidConfig(
                "fsync_every_fences must be greater than 0".to_string(),
            ));
        }
        if self.max_files == 0 {
            return Err(WalError::InvalidConfig(
                "max_files must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A sealed (no longer active) WAL file.
#[derive(Debug, Clone)]
struct SealedFile {
    seq: u64,
    path: PathBuf,
    /// Greatest epoch written to this file; 0 if it holds none.
    last_epoch: u64,
}

struct WalInner {
    file: File,
    seq: u64,
    bytes: u64,
    sealed: Vec<SealedFile>,
    pending: Vec<Record>,
    next_epoch: u64,
    /// Highest epoch handed to the OS (written, possibly not yet synced).
    written_epoch: u64,
    /// Highest epoch known durable (fsync returned).
    durable_epoch: u64,
    fences_since_sync: u32,
    /// Epochs at or below this may be reclaimed by retention.
    retain_floor: u64,
    closed: bool,
}

#[derive(Debug, Clone, Default)]
struct CommitState {
    durable_epoch: u64,
    failed: bool,
}

struct Shared {
    config: WalConfig,
    inner: Mutex<WalInner>,
    state_tx: watch::Sender<CommitState>,
    shutdown: Notify,
}

/// Write-ahead log with group commit, rotation, and crash recovery.
pub struct Wal {
    shared: Arc<Shared>,
    committer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Wal {
    /// Opens the WAL, performing recovery first.
    ///
    /// Recovery truncates torn tails; the returned info reports how much of
    /// the log survived. New epochs continue from the recovered high water.
    pub async fn open(config: WalConfig) -> Result<(Self, RecoveryInfo), WalError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.dir).await?;

        let (scans, info) = recovery::recover_dir(&config.dir).await?;

        let next_epoch = info.last_epoch + 1;
        let mut sealed: Vec<SealedFile> = Vec::new();
        let (file, seq, bytes) = match scans.last() {
            Some(last) => {
                for scan in &scans[..scans.len() - 1] {
                    sealed.push(SealedFile {
                        seq: scan.seq,
                        path: scan.path.clone(),
                        last_epoch: scan.last_epoch.unwrap_or(0),
                    });
                }
                let mut file = OpenOptions::new().append(true).open(&last.path).await?;
                let mut bytes = last.valid_len;
                // A file truncated below its header gets a fresh one before
                // any record is appended.
                if bytes < crate::file::FILE_HEADER_SIZE as u64 {
                    let mut buf = BytesMut::new();
                    FileHeader::new(next_epoch).encode_into(&mut buf);
                    encode_fence(&mut buf);
                    file.write_all(&buf).await?;
                    file.sync_all().await?;
                    bytes = buf.len() as u64;
                }
                (file, last.seq, bytes)
            }
            None => {
                let seq = 1;
                let path = wal_file_path(&config.dir, seq);
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&path)
                    .await?;
                let mut buf = BytesMut::new();
                FileHeader::new(next_epoch).encode_into(&mut buf);
                encode_fence(&mut buf);
                file.write_all(&buf).await?;
                file.sync_all().await?;
                (file, seq, buf.len() as u64)
            }
        };

        tracing::info!(
            last_epoch = info.last_epoch,
            records = info.valid_records,
            files = info.files_scanned,
            corruption = info.corruption_detected,
            "WAL opened"
        );

        let (state_tx, _) = watch::channel(CommitState {
            durable_epoch: info.last_epoch,
            failed: false,
        });

        let shared = Arc::new(Shared {
            config: config.clone(),
            inner: Mutex::new(WalInner {
                file,
                seq,
                bytes,
                sealed,
                pending: Vec::new(),
                next_epoch,
                written_epoch: info.last_epoch,
                durable_epoch: info.last_epoch,
                fences_since_sync: 0,
                retain_floor: 0,
                closed: false,
            }),
            state_tx,
            shutdown: Notify::new(),
        });

        let committer = if config.group_commit_ms > 0 {
            Some(tokio::spawn(committer_loop(shared.clone())))
        } else {
            None
        };

        Ok((
            Self {
                shared,
                committer: std::sync::Mutex::new(committer),
            },
            info,
        ))
    }

    /// Appends a record, returning its epoch once the record is durable per
    /// the group-commit policy.
    pub async fn append(&self, op: u8, payload: Bytes) -> Result<u64, WalError> {
        let epoch = {
            let mut inner = self.shared.inner.lock().await;
            if inner.closed {
                return Err(WalError::Closed);
            }
            let epoch = inner.next_epoch;
            inner.next_epoch += 1;
            inner.pending.push(Record::new(epoch, op, payload));

            if self.shared.config.group_commit_ms == 0 {
                commit_cycle(&self.shared, &mut inner, true).await?;
                return Ok(epoch);
            }
            epoch
        };

        // Park until the committer reports this epoch durable.
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if state.failed {
                    return Err(WalError::Closed);
                }
                if state.durable_epoch >= epoch {
                    return Ok(epoch);
                }
            }
            if rx.changed().await.is_err() {
                return Err(WalError::Closed);
            }
        }
    }

    /// Forces pending records to disk, fsyncing regardless of fence count.
    pub async fn sync(&self) -> Result<(), WalError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.closed {
            return Err(WalError::Closed);
        }
        commit_cycle(&self.shared, &mut inner, true).await
    }

    /// Highest epoch assigned so far (0 if none).
    pub async fn last_epoch(&self) -> u64 {
        self.shared.inner.lock().await.next_epoch - 1
    }

    /// Highest epoch known durable.
    pub fn durable_epoch(&self) -> u64 {
        self.shared.state_tx.borrow().durable_epoch
    }

    /// Replays records with epoch strictly greater than `from_epoch`, in
    /// epoch order across all retained files.
    pub async fn replay_from(&self, from_epoch: u64) -> Result<Vec<Record>, WalError> {
        let paths: Vec<PathBuf> = {
            let inner = self.shared.inner.lock().await;
            inner
                .sealed
                .iter()
                .map(|s| s.path.clone())
                .chain(std::iter::once(wal_file_path(
                    &self.shared.config.dir,
                    inner.seq,
                )))
                .collect()
        };
        // Make sure everything written so far is visible to the read pass.
        self.sync().await?;

        let mut records = Vec::new();
        for path in paths {
            let data = tokio::fs::read(&path).await?;
            if FileHeader::decode(&data).is_none() {
                continue;
            }
            let mut offset = crate::file::FILE_HEADER_SIZE;
            while offset < data.len() {
                match Record::decode(&data[offset..]) {
                    Ok((Some(record), consumed)) => {
                        if record.epoch > from_epoch {
                            records.push(record);
                        }
                        offset += consumed;
                    }
                    Ok((None, consumed)) => offset += consumed,
                    Err(_) => break,
                }
            }
        }
        records.sort_by_key(|r| r.epoch);
        Ok(records)
    }

    /// Allows retention to reclaim files whose greatest epoch is at or below
    /// `epoch`, and deletes any that are now eligible. Driven by checkpoints.
    pub async fn truncate_below(&self, epoch: u64) -> Result<u64, WalError> {
        let mut inner = self.shared.inner.lock().await;
        inner.retain_floor = inner.retain_floor.max(epoch);
        let floor = inner.retain_floor;

        let mut deleted = 0u64;
        let mut keep = Vec::with_capacity(inner.sealed.len());
        for sealed in std::mem::take(&mut inner.sealed) {
            if sealed.last_epoch <= floor {
                tracing::debug!(seq = sealed.seq, "deleting reclaimed WAL file");
                tokio::fs::remove_file(&sealed.path).await?;
                deleted += 1;
            } else {
                keep.push(sealed);
            }
        }
        inner.sealed = keep;
        Ok(deleted)
    }

    /// Number of WAL files currently on disk (sealed + active).
    pub async fn file_count(&self) -> usize {
        self.shared.inner.lock().await.sealed.len() + 1
    }

    /// Gracefully closes the WAL: stops the committer and fsyncs the tail.
    pub async fn close(&self) -> Result<(), WalError> {
        let handle = self.committer.lock().unwrap().take();
        if let Some(handle) = handle {
            self.shared.shutdown.notify_one();
            let _ = handle.await;
        }
        let mut inner = self.shared.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        commit_cycle(&self.shared, &mut inner, true).await?;
        inner.closed = true;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Some(handle) = self.committer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

async fn committer_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(Duration::from_millis(shared.config.group_commit_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shared.shutdown.notified() => return,
        }
        let mut inner = shared.inner.lock().await;
        if inner.closed {
            return;
        }
        if let Err(e) = commit_cycle(&shared, &mut inner, false).await {
            tracing::error!(error = %e, "WAL commit failed; latching writer");
            inner.closed = true;
            shared.state_tx.send_modify(|s| s.failed = true);
            return;
        }
    }
}

/// One commit cycle: write pending frames plus a fence, fsync when due,
/// rotate when the active file is over the limit.
async fn commit_cycle(
    shared: &Shared,
    inner: &mut WalInner,
    force_sync: bool,
) -> Result<(), WalError> {
    let had_pending = !inner.pending.is_empty();
    if had_pending {
        let mut buf = BytesMut::new();
        let mut last = inner.written_epoch;
        for record in inner.pending.drain(..) {
            last = record.epoch;
            record.encode_into(&mut buf);
        }
        encode_fence(&mut buf);
        inner.file.write_all(&buf).await?;
        inner.bytes += buf.len() as u64;
        inner.written_epoch = last;
        inner.fences_since_sync += 1;
    }

    let lagging = inner.written_epoch > inner.durable_epoch;
    let sync_due = lagging
        && (force_sync
            || inner.fences_since_sync >= shared.config.fsync_every_fences
            // Idle tick with unsynced data: don't leave writers parked.
            || !had_pending);
    if sync_due {
        inner.file.sync_data().await?;
        inner.fences_since_sync = 0;
        inner.durable_epoch = inner.written_epoch;
        let durable = inner.durable_epoch;
        shared.state_tx.send_modify(|s| s.durable_epoch = durable);
    }

    if inner.bytes >= shared.config.rotate_bytes {
        rotate(shared, inner).await?;
    }
    Ok(())
}

/// Seals the active file and opens the next one in sequence.
async fn rotate(shared: &Shared, inner: &mut WalInner) -> Result<(), WalError> {
    // Everything in the old file must be durable before it is sealed.
    if inner.written_epoch > inner.durable_epoch {
        inner.file.sync_data().await?;
        inner.fences_since_sync = 0;
        inner.durable_epoch = inner.written_epoch;
        let durable = inner.durable_epoch;
        shared.state_tx.send_modify(|s| s.durable_epoch = durable);
    }

    inner.sealed.push(SealedFile {
        seq: inner.seq,
        path: wal_file_path(&shared.config.dir, inner.seq),
        last_epoch: inner.written_epoch,
    });

    let seq = inner.seq + 1;
    let path = wal_file_path(&shared.config.dir, seq);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)
        .await?;
    let mut buf = BytesMut::new();
    FileHeader::new(inner.next_epoch).encode_into(&mut buf);
    encode_fence(&mut buf);
    file.write_all(&buf).await?;
    file.sync_all().await?;

    tracing::info!(seq, starting_epoch = inner.next_epoch, "rotated WAL file");

    inner.file = file;
    inner.seq = seq;
    inner.bytes = buf.len() as u64;

    // Retention: drop the oldest reclaimable files once over the limit.
    while inner.sealed.len() + 1 > shared.config.max_files {
        let oldest = &inner.sealed[0];
        if oldest.last_epoch > inner.retain_floor {
            tracing::warn!(
                files = inner.sealed.len() + 1,
                max_files = shared.config.max_files,
                "WAL over file limit but oldest file is not yet checkpointed"
            );
            break;
        }
        let oldest = inner.sealed.remove(0);
        tracing::debug!(seq = oldest.seq, "deleting reclaimed WAL file");
        tokio::fs::remove_file(&oldest.path).await?;
    }

    Ok(())
}
