//! MANIFEST: crash-safe record of the live segment set.
//!
//! The manifest is a versioned edit log. Each commit appends framed edits
//! (`[length: u32][bincode edit][crc32c: u32]`), fsyncs, and applies them to
//! an in-memory snapshot swapped atomically for readers. A `CURRENT` file
//! names the active manifest file and is replaced by write-temp + rename.
//!
//! # File layout
//! ```text
//! data_dir/manifest/
//!   ├── CURRENT           # name of the active MANIFEST file
//!   ├── MANIFEST-000001   # edit log
//!   ├── MANIFEST-000002   # snapshot + subsequent edits
//!   └── ...
//! ```
//!
//! # Recovery
//! 1. Read CURRENT to find the active file
//! 2. Replay edits with CRC validation, truncating at damage
//! 3. Callers verify referenced segment files separately

use crate::error::{EngineError, Result};
use crate::types::{Epoch, SegmentDescriptor, SegmentId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Complete snapshot of the committed segment set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    /// Monotonic version, bumped once per applied edit.
    pub version: u64,
    /// Greatest epoch whose segment has been committed.
    pub high_water_epoch: Epoch,
    pub segments: Vec<SegmentDescriptor>,
}

impl ManifestSnapshot {
    pub fn segment(&self, segment_id: &str) -> Option<&SegmentDescriptor> {
        self.segments.iter().find(|s| s.segment_id == segment_id)
    }

    fn apply_edit(&mut self, edit: ManifestEdit) {
        match edit {
            ManifestEdit::AddSegment(descriptor) => {
                self.high_water_epoch = self.high_water_epoch.max(descriptor.max_epoch);
                self.segments.push(descriptor);
            }
            ManifestEdit::RemoveSegment(segment_id) => {
                self.segments.retain(|s| s.segment_id != segment_id);
            }
            ManifestEdit::SetHighWater(epoch) => {
                self.high_water_epoch = self.high_water_epoch.max(epoch);
            }
            ManifestEdit::Snapshot(snapshot) => {
                *self = *snapshot;
            }
        }
        self.version += 1;
    }
}

/// Incremental manifest edit, applied atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ManifestEdit {
    AddSegment(SegmentDescriptor),
    RemoveSegment(SegmentId),
    SetHighWater(Epoch),
    /// Complete snapshot, replacing all previous state.
    Snapshot(Box<ManifestSnapshot>),
}

struct LogState {
    writer: BufWriter<File>,
    current_number: u64,
    edits_since_snapshot: usize,
}

pub struct ManifestLog {
    manifest_dir: PathBuf,
    state: Mutex<LogState>,
    snapshot: RwLock<Arc<ManifestSnapshot>>,
    snapshot_threshold: usize,
}

impl ManifestLog {
    /// Opens or creates the manifest, replaying any existing log.
    pub fn open(manifest_dir: impl AsRef<Path>) -> Result<Self> {
        let manifest_dir = manifest_dir.as_ref();
        fs::create_dir_all(manifest_dir)?;

        let current_path = manifest_dir.join("CURRENT");
        let (snapshot, manifest_number) = if current_path.exists() {
            Self::recover(manifest_dir)?
        } else {
            (ManifestSnapshot::default(), 1)
        };

        let manifest_path = Self::manifest_path(manifest_dir, manifest_number);
        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&manifest_path)?,
        );
        Self::write_current_file(manifest_dir, manifest_number)?;

        tracing::info!(
            segments = snapshot.segments.len(),
            high_water = snapshot.high_water_epoch,
            "manifest opened"
        );

        Ok(Self {
            manifest_dir: manifest_dir.to_path_buf(),
            state: Mutex::new(LogState {
                writer,
                current_number: manifest_number,
                edits_since_snapshot: 0,
            }),
            snapshot: RwLock::new(Arc::new(snapshot)),
            snapshot_threshold: 100,
        })
    }

    /// Atomically commits a set of additions and removals.
    ///
    /// The edits are durable before the in-memory snapshot is swapped, so a
    /// reader can never observe a segment set the log does not contain.
    /// Returns the new manifest version.
    pub fn commit(&self, add: Vec<SegmentDescriptor>, remove: Vec<SegmentId>) -> Result<u64> {
        let mut state = self.state.lock();

        let mut edits = Vec::with_capacity(add.len() + remove.len());
        for descriptor in add {
            edits.push(ManifestEdit::AddSegment(descriptor));
        }
        for segment_id in remove {
            edits.push(ManifestEdit::RemoveSegment(segment_id));
        }

        for edit in &edits {
            Self::append_edit(&mut state.writer, edit)?;
        }
        state.writer.flush()?;
        state.writer.get_ref().sync_all()?;

        let mut next = (**self.snapshot.read()).clone();
        for edit in edits {
            next.apply_edit(edit);
            state.edits_since_snapshot += 1;
        }
        let version = next.version;
        *self.snapshot.write() = Arc::new(next);

        if state.edits_since_snapshot >= self.snapshot_threshold {
            self.roll_snapshot(&mut state)?;
        }
        Ok(version)
    }

    /// Records a new durable high-water epoch without touching segments.
    pub fn set_high_water(&self, epoch: Epoch) -> Result<u64> {
        let mut state = self.state.lock();
        let edit = ManifestEdit::SetHighWater(epoch);
        Self::append_edit(&mut state.writer, &edit)?;
        state.writer.flush()?;
        state.writer.get_ref().sync_all()?;

        let mut next = (**self.snapshot.read()).clone();
        next.apply_edit(edit);
        state.edits_since_snapshot += 1;
        let version = next.version;
        *self.snapshot.write() = Arc::new(next);
        Ok(version)
    }

    /// Current consistent snapshot; cheap to clone and hold.
    pub fn current(&self) -> Arc<ManifestSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn high_water(&self) -> Epoch {
        self.snapshot.read().high_water_epoch
    }

    /// Writes a full snapshot into a fresh manifest file and retargets
    /// CURRENT, bounding replay time.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut state = self.state.lock();
        self.roll_snapshot(&mut state)?;
        Ok(self.snapshot.read().version)
    }

    fn roll_snapshot(&self, state: &mut LogState) -> Result<()> {
        let snapshot = (**self.snapshot.read()).clone();
        let new_number = state.current_number + 1;
        let new_path = Self::manifest_path(&self.manifest_dir, new_number);

        let mut writer = BufWriter::new(File::create(&new_path)?);
        Self::append_edit(&mut writer, &ManifestEdit::Snapshot(Box::new(snapshot)))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Self::write_current_file(&self.manifest_dir, new_number)?;

        state.writer = writer;
        state.current_number = new_number;
        state.edits_since_snapshot = 0;

        self.cleanup_old_manifests(new_number)?;
        Ok(())
    }

    fn append_edit(writer: &mut BufWriter<File>, edit: &ManifestEdit) -> Result<()> {
        let encoded = bincode::serialize(edit)
            .map_err(|e| EngineError::Manifest(format!("failed to serialize edit: {}", e)))?;
        let length = encoded.len() as u32;
        let crc = crc32c::crc32c(&encoded);

        writer.write_all(&length.to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc.to_le_bytes())?;
        Ok(())
    }

    fn recover(manifest_dir: &Path) -> Result<(ManifestSnapshot, u64)> {
        let current_path = manifest_dir.join("CURRENT");
        let mut manifest_name = String::new();
        File::open(current_path)?.read_to_string(&mut manifest_name)?;
        let manifest_name = manifest_name.trim();

        let manifest_number = manifest_name
            .strip_prefix("MANIFEST-")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| EngineError::Manifest("invalid CURRENT file".to_string()))?;

        let manifest_path = manifest_dir.join(manifest_name);
        let mut reader = BufReader::new(File::open(manifest_path)?);
        let mut snapshot = ManifestSnapshot::default();

        loop {
            let mut length_buf = [0u8; 4];
            if reader.read_exact(&mut length_buf).is_err() {
                break;
            }
            let length = u32::from_le_bytes(length_buf) as usize;

            let mut data = vec![0u8; length];
            if reader.read_exact(&mut data).is_err() {
                tracing::warn!("manifest tail torn mid-edit; truncating replay");
                break;
            }

            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut crc_buf).is_err() {
                tracing::warn!("manifest tail torn before CRC; truncating replay");
                break;
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            if stored_crc != crc32c::crc32c(&data) {
                tracing::warn!("manifest edit failed CRC; truncating replay");
                break;
            }

            let edit: ManifestEdit = bincode::deserialize(&data)
                .map_err(|e| EngineError::Manifest(format!("failed to deserialize edit: {}", e)))?;
            snapshot.apply_edit(edit);
        }

        Ok((snapshot, manifest_number))
    }

    fn manifest_path(manifest_dir: &Path, number: u64) -> PathBuf {
        manifest_dir.join(format!("MANIFEST-{:06}", number))
    }

    fn write_current_file(manifest_dir: &Path, manifest_number: u64) -> Result<()> {
        let current_path = manifest_dir.join("CURRENT");
        let temp_path = manifest_dir.join("CURRENT.tmp");

        fs::write(&temp_path, format!("MANIFEST-{:06}", manifest_number))?;
        fs::rename(&temp_path, &current_path)?;
        File::open(manifest_dir)?.sync_all()?;
        Ok(())
    }

    fn cleanup_old_manifests(&self, current_number: u64) -> Result<()> {
        for entry in fs::read_dir(&self.manifest_dir)? {
            let entry = entry?;
            let path = entry.path();
            let number = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("MANIFEST-"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(number) = number {
                // Keep the active file and its predecessor.
                if number + 1 < current_number {
                    let _ = fs::remove_file(path);
                }
            }
        }
        Ok(())
    }
}
