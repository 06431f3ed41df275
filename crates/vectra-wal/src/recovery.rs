//! WAL recovery: scan files in sequence order, validate frames, truncate
//! torn tails.
//!
//! Recovery walks every `wal-*.log` file, replays frames until the first
//! invalid length or CRC, and truncates the file at the last valid offset.
//! Anything after a corruption point, including later files, is discarded:
//! epochs are assigned serially, so a hole in the middle of the log would
//! make every later record unreachable anyway.

use crate::file::{parse_wal_seq, FileHeader, FILE_HEADER_SIZE};
use crate::record::{Record, RecordError};
use crate::wal::WalError;
use std::path::{Path, PathBuf};

/// Summary of a recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryInfo {
    /// Highest epoch found in a valid record (0 if the log is empty).
    pub last_epoch: u64,
    /// Number of valid records across all files.
    pub valid_records: u64,
    /// Number of WAL files scanned.
    pub files_scanned: usize,
    /// True if a torn tail or CRC failure forced truncation.
    pub corruption_detected: bool,
    /// Bytes dropped by tail truncation.
    pub truncated_bytes: u64,
}

/// Per-file scan result.
#[derive(Debug)]
pub(crate) struct FileScan {
    pub seq: u64,
    pub path: PathBuf,
    pub header: FileHeader,
    /// First/last record epochs in this file, if any records were found.
    pub first_epoch: Option<u64>,
    pub last_epoch: Option<u64>,
    pub valid_records: u64,
    /// Byte offset of the end of the last valid frame.
    pub valid_len: u64,
    /// Total bytes in the file on disk.
    pub file_len: u64,
}

impl FileScan {
    pub fn corrupted(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Lists WAL files in `dir` in ascending sequence order.
pub(crate) async fn list_wal_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(seq) = parse_wal_seq(name) {
                files.push((seq, path));
            }
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

/// Scans one WAL file, decoding frames until damage or EOF.
pub(crate) async fn scan_file(seq: u64, path: &Path) -> Result<FileScan, WalError> {
    let data = tokio::fs::read(path).await?;
    let file_len = data.len() as u64;

    let header = match FileHeader::decode(&data) {
        Some(h) => h,
        None => {
            // Unreadable header: the whole file is garbage.
            return Ok(FileScan {
                seq,
                path: path.to_path_buf(),
                header: FileHeader::new(0),
                first_epoch: None,
                last_epoch: None,
                valid_records: 0,
                valid_len: 0,
                file_len,
            });
        }
    };

    let mut offset = FILE_HEADER_SIZE;
    let mut first_epoch = None;
    let mut last_epoch = None;
    let mut valid_records = 0u64;

    while offset < data.len() {
        match Record::decode(&data[offset..]) {
            Ok((Some(record), consumed)) => {
                first_epoch.get_or_insert(record.epoch);
                last_epoch = Some(record.epoch);
                valid_records += 1;
                offset += consumed;
            }
            Ok((None, consumed)) => {
                offset += consumed;
            }
            Err(RecordError::Incomplete) | Err(RecordError::CrcMismatch { .. }) => break,
            Err(e) => {
                tracing::warn!(seq, offset, error = %e, "stopping WAL scan on invalid frame");
                break;
            }
        }
    }

    Ok(FileScan {
        seq,
        path: path.to_path_buf(),
        header,
        first_epoch,
        last_epoch,
        valid_records,
        valid_len: offset as u64,
        file_len,
    })
}

/// Scans all WAL files under `dir`, truncating at the first damaged frame
/// and removing any files past the damage point.
pub(crate) async fn recover_dir(dir: &Path) -> Result<(Vec<FileScan>, RecoveryInfo), WalError> {
    let files = list_wal_files(dir).await?;
    let mut scans = Vec::new();
    let mut info = RecoveryInfo::default();

    let mut damaged_at = None;
    for (idx, (seq, path)) in files.iter().enumerate() {
        let scan = scan_file(*seq, path).await?;
        info.files_scanned += 1;
        info.valid_records += scan.valid_records;
        if let Some(epoch) = scan.last_epoch {
            info.last_epoch = info.last_epoch.max(epoch);
        }

        if scan.corrupted() {
            let lost = scan.file_len - scan.valid_len;
            info.corruption_detected = true;
            info.truncated_bytes += lost;
            tracing::warn!(
                seq,
                lost_bytes = lost,
                recovered_to = info.last_epoch,
                "truncating WAL tail after damaged frame"
            );

            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(scan.valid_len).await?;
            file.sync_all().await?;

            scans.push(scan);
            damaged_at = Some(idx);
            break;
        }

        scans.push(scan);
    }

    // Files after a damage point can only hold epochs beyond the hole.
    if let Some(idx) = damaged_at {
        for (seq, path) in files.iter().skip(idx + 1) {
            tracing::warn!(seq, "removing WAL file stranded past damage point");
            tokio::fs::remove_file(path).await?;
        }
    }

    Ok((scans, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{encode_fence, OP_UPSERT};
    use bytes::{Bytes, BytesMut};
    use tempfile::TempDir;

    async fn write_file(path: &Path, starting_epoch: u64, epochs: &[u64]) {
        let mut buf = BytesMut::new();
        FileHeader::new(starting_epoch).encode_into(&mut buf);
        encode_fence(&mut buf);
        for &epoch in epochs {
            Record::new(epoch, OP_UPSERT, Bytes::from_static(b"v")).encode_into(&mut buf);
        }
        encode_fence(&mut buf);
        tokio::fs::write(path, &buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_clean_file() {
        let dir = TempDir::new().unwrap();
        let path = crate::file::wal_file_path(dir.path(), 1);
        write_file(&path, 1, &[1, 2, 3]).await;

        let scan = scan_file(1, &path).await.unwrap();
        assert_eq!(scan.valid_records, 3);
        assert_eq!(scan.first_epoch, Some(1));
        assert_eq!(scan.last_epoch, Some(3));
        assert!(!scan.corrupted());
    }

    #[tokio::test]
    async fn test_truncated_tail_detected() {
        let dir = TempDir::new().unwrap();
        let path = crate::file::wal_file_path(dir.path(), 1);
        write_file(&path, 1, &[1, 2, 3]).await;

        // Chop 7 bytes off the end, tearing the final record.
        let len = tokio::fs::metadata(&path).await.unwrap().len();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .unwrap();
        file.set_len(len - 7).await.unwrap();

        let (scans, info) = recover_dir(dir.path()).await.unwrap();
        assert_eq!(scans.len(), 1);
        assert!(info.corruption_detected);
        assert_eq!(info.valid_records, 2);
        assert_eq!(info.last_epoch, 2);
        assert!(info.truncated_bytes > 0);

        // Second pass over the truncated file is clean.
        let (_, info2) = recover_dir(dir.path()).await.unwrap();
        assert!(!info2.corruption_detected);
        assert_eq!(info2.valid_records, 2);
    }

    #[tokio::test]
    async fn test_files_past_damage_removed() {
        let dir = TempDir::new().unwrap();
        let p1 = crate::file::wal_file_path(dir.path(), 1);
        let p2 = crate::file::wal_file_path(dir.path(), 2);
        write_file(&p1, 1, &[1, 2]).await;
        write_file(&p2, 3, &[3, 4]).await;

        // Corrupt the middle of file 1's last record.
        let mut data = tokio::fs::read(&p1).await.unwrap();
        let n = data.len();
        data[n - 8] ^= 0xFF;
        tokio::fs::write(&p1, &data).await.unwrap();

        let (_, info) = recover_dir(dir.path()).await.unwrap();
        assert!(info.corruption_detected);
        assert_eq!(info.last_epoch, 1);
        assert!(!p2.exists());
    }
}
