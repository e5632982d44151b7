//! # Per-thread append-only trace files
//!
//! The drain owns one `SessionWriter`; no producer ever touches a file
//! descriptor. Each registered thread gets up to two files under the
//! session directory:
//!
//! ```text
//! <session root>/
//!   manifest.json
//!   thread_0/index.atf
//!   thread_0/detail.atf
//!   thread_1/index.atf
//!   ...
//! ```
//!
//! A file is created the first time one of that thread's rings reaches the
//! drain. Layout: 32-byte header, packed fixed-size records as received,
//! and on finalize a 32-byte footer carrying final counters. A truncated
//! file (crash before finalize) is still self-describing via its header.

pub mod manifest;

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracelane_common::{
    DETAIL_FILE_MAGIC, FILE_FOOTER_MAGIC, FORMAT_VERSION, INDEX_FILE_MAGIC,
};

use crate::domain::{LaneKind, SlotIndex, WriterError};

pub use manifest::{
    write_manifest, ManifestModule, ManifestSymbol, ManifestThread, SessionManifest,
};

struct LaneFile {
    path: PathBuf,
    file: BufWriter<File>,
    records_written: u64,
    bytes_written: u64,
}

impl LaneFile {
    fn create(
        session_dir: &Path,
        slot: SlotIndex,
        kind: LaneKind,
        record_size: u32,
    ) -> Result<Self, WriterError> {
        let dir = session_dir.join(format!("thread_{}", slot.0));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.atf", kind.as_str()));
        let file = File::create(&path).map_err(|source| WriterError::Create {
            path: path.display().to_string(),
            source,
        })?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; tracelane_common::FILE_HEADER_BYTES];
        let magic = match kind {
            LaneKind::Index => INDEX_FILE_MAGIC,
            LaneKind::Detail => DETAIL_FILE_MAGIC,
        };
        header[0..8].copy_from_slice(&magic);
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&record_size.to_le_bytes());
        header[16..20].copy_from_slice(&slot.0.to_le_bytes());
        writer.write_all(&header)?;

        Ok(Self {
            path,
            file: writer,
            records_written: 0,
            bytes_written: 0,
        })
    }

    fn finalize(&mut self, events_dropped: u64) -> Result<(), WriterError> {
        let mut footer = [0u8; tracelane_common::FILE_FOOTER_BYTES];
        footer[0..8].copy_from_slice(&FILE_FOOTER_MAGIC);
        footer[8..16].copy_from_slice(&self.records_written.to_le_bytes());
        footer[16..24].copy_from_slice(&events_dropped.to_le_bytes());
        self.file.write_all(&footer)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Append-only writer for every thread's index and detail streams.
pub struct SessionWriter {
    session_dir: PathBuf,
    files: Vec<[Option<LaneFile>; 2]>,
    index_record_size: u32,
    detail_record_size: u32,
}

impl SessionWriter {
    #[must_use]
    pub fn new(
        session_dir: PathBuf,
        capacity: u32,
        index_record_size: u32,
        detail_record_size: u32,
    ) -> Self {
        let files = (0..capacity).map(|_| [None, None]).collect();
        Self {
            session_dir,
            files,
            index_record_size,
            detail_record_size,
        }
    }

    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    fn lane_slot(kind: LaneKind) -> usize {
        match kind {
            LaneKind::Index => 0,
            LaneKind::Detail => 1,
        }
    }

    /// Append one drained ring's worth of records. Creates the file on
    /// first delivery.
    pub fn append(
        &mut self,
        slot: SlotIndex,
        kind: LaneKind,
        bytes: &[u8],
    ) -> Result<(), WriterError> {
        let record_size = match kind {
            LaneKind::Index => self.index_record_size,
            LaneKind::Detail => self.detail_record_size,
        };
        let entry = &mut self.files[slot.as_usize()][Self::lane_slot(kind)];
        if entry.is_none() {
            *entry = Some(LaneFile::create(&self.session_dir, slot, kind, record_size)?);
        }
        let lane_file = entry.as_mut().expect("just created");
        lane_file.file.write_all(bytes)?;
        lane_file.records_written += bytes.len() as u64 / u64::from(record_size);
        lane_file.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Records written so far to a thread's stream, if the file exists.
    #[must_use]
    pub fn records_written(&self, slot: SlotIndex, kind: LaneKind) -> u64 {
        self.files[slot.as_usize()][Self::lane_slot(kind)]
            .as_ref()
            .map_or(0, |f| f.records_written)
    }

    /// Total payload bytes across every open file.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.files
            .iter()
            .flatten()
            .flatten()
            .map(|f| f.bytes_written)
            .sum()
    }

    /// Relative path of a thread's stream file, if it was ever created.
    #[must_use]
    pub fn file_path(&self, slot: SlotIndex, kind: LaneKind) -> Option<String> {
        self.files[slot.as_usize()][Self::lane_slot(kind)]
            .as_ref()
            .and_then(|f| f.path.strip_prefix(&self.session_dir).ok())
            .map(|p| p.display().to_string())
    }

    /// Write footers and flush every open file. `dropped_for` supplies the
    /// per-slot drop counter recorded in each footer.
    pub fn finalize(
        &mut self,
        dropped_for: impl Fn(SlotIndex) -> u64,
    ) -> Result<(), WriterError> {
        for (slot, pair) in self.files.iter_mut().enumerate() {
            let dropped = dropped_for(SlotIndex(slot as u32));
            for lane_file in pair.iter_mut().flatten() {
                lane_file.finalize(dropped)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelane_common::{FILE_FOOTER_BYTES, FILE_HEADER_BYTES, INDEX_EVENT_BYTES};

    #[test]
    fn header_records_footer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::new(dir.path().to_path_buf(), 4, 32, 96);

        let records = vec![0xABu8; 3 * INDEX_EVENT_BYTES];
        writer.append(SlotIndex(2), LaneKind::Index, &records).unwrap();
        assert_eq!(writer.records_written(SlotIndex(2), LaneKind::Index), 3);
        writer.finalize(|_| 5).unwrap();

        let bytes = std::fs::read(dir.path().join("thread_2/index.atf")).unwrap();
        assert_eq!(
            bytes.len(),
            FILE_HEADER_BYTES + 3 * INDEX_EVENT_BYTES + FILE_FOOTER_BYTES
        );
        assert_eq!(&bytes[0..8], b"ADAIDX1\0");
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 32);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 2);

        let footer = &bytes[bytes.len() - FILE_FOOTER_BYTES..];
        assert_eq!(&footer[0..8], b"ADAEND1\0");
        assert_eq!(u64::from_le_bytes(footer[8..16].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(footer[16..24].try_into().unwrap()), 5);
    }

    #[test]
    fn detail_file_uses_detail_magic_and_record_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::new(dir.path().to_path_buf(), 1, 32, 96);
        writer
            .append(SlotIndex(0), LaneKind::Detail, &vec![0u8; 96])
            .unwrap();
        writer.finalize(|_| 0).unwrap();

        let bytes = std::fs::read(dir.path().join("thread_0/detail.atf")).unwrap();
        assert_eq!(&bytes[0..8], b"ADADET1\0");
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 96);
    }

    #[test]
    fn no_file_until_first_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::new(dir.path().to_path_buf(), 2, 32, 96);
        writer.finalize(|_| 0).unwrap();
        assert!(!dir.path().join("thread_0").exists());
        assert!(writer.file_path(SlotIndex(0), LaneKind::Index).is_none());
    }
}
