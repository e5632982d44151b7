//! # Session reader
//!
//! Consumer-side access to a recorded session: the manifest plus one serial
//! record stream per thread file. There is no query or index layer here —
//! callers pull each thread's stream in file order and merge by timestamp
//! themselves if they need a cross-thread view.
//!
//! A file does not need a footer to be readable: a session that crashed
//! before finalize leaves header + records, and the header alone describes
//! the record geometry. Trailing partial records are ignored.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracelane_common::{
    DetailEventHeader, IndexEvent, DETAIL_FILE_MAGIC, DETAIL_HEADER_BYTES, FILE_FOOTER_BYTES,
    FILE_FOOTER_MAGIC, FILE_HEADER_BYTES, INDEX_FILE_MAGIC,
};

use crate::domain::LaneKind;
use crate::writer::SessionManifest;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("session directory not found: {0}")]
    SessionNotFound(String),

    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("bad trace file {path}: {reason}")]
    BadFile { path: String, reason: String },

    #[error("I/O error on {path}: {source}")]
    Io { path: String, source: std::io::Error },
}

impl ReaderError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ReaderError::Io { path: path.display().to_string(), source }
    }

    fn bad(path: &Path, reason: impl Into<String>) -> Self {
        ReaderError::BadFile { path: path.display().to_string(), reason: reason.into() }
    }
}

/// Footer counters, present only when the session finalized cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFooter {
    pub events_written: u64,
    pub events_dropped: u64,
}

/// One per-thread stream file loaded into memory.
#[derive(Debug)]
pub struct TraceFile {
    pub kind: LaneKind,
    pub version: u32,
    pub record_size: u32,
    pub slot_index: u32,
    pub footer: Option<FileFooter>,
    body: Vec<u8>,
}

impl TraceFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReaderError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| ReaderError::io(path, e))?;
        if bytes.len() < FILE_HEADER_BYTES {
            return Err(ReaderError::bad(path, "shorter than the file header"));
        }

        let kind = match <[u8; 8]>::try_from(&bytes[0..8]).expect("sized slice") {
            m if m == INDEX_FILE_MAGIC => LaneKind::Index,
            m if m == DETAIL_FILE_MAGIC => LaneKind::Detail,
            _ => return Err(ReaderError::bad(path, "unrecognized magic")),
        };
        let version = u32::from_le_bytes(bytes[8..12].try_into().expect("sized"));
        let record_size = u32::from_le_bytes(bytes[12..16].try_into().expect("sized"));
        let slot_index = u32::from_le_bytes(bytes[16..20].try_into().expect("sized"));
        if record_size == 0 {
            return Err(ReaderError::bad(path, "zero record size"));
        }

        let mut body = &bytes[FILE_HEADER_BYTES..];
        let mut footer = None;
        if body.len() >= FILE_FOOTER_BYTES {
            let tail = &body[body.len() - FILE_FOOTER_BYTES..];
            if tail[0..8] == FILE_FOOTER_MAGIC {
                footer = Some(FileFooter {
                    events_written: u64::from_le_bytes(tail[8..16].try_into().expect("sized")),
                    events_dropped: u64::from_le_bytes(tail[16..24].try_into().expect("sized")),
                });
                body = &body[..body.len() - FILE_FOOTER_BYTES];
            }
        }

        Ok(Self {
            kind,
            version,
            record_size,
            slot_index,
            footer,
            body: body.to_vec(),
        })
    }

    /// Whole records in file order; a truncated trailing record is ignored.
    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        self.body.chunks_exact(self.record_size as usize)
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.body.len() as u64 / u64::from(self.record_size)
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.footer.is_some()
    }
}

/// A recorded session directory: manifest plus per-thread files.
#[derive(Debug)]
pub struct SessionReader {
    session_dir: PathBuf,
    manifest: SessionManifest,
}

impl SessionReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReaderError> {
        let session_dir = path.as_ref();
        if !session_dir.is_dir() {
            return Err(ReaderError::SessionNotFound(
                session_dir.display().to_string(),
            ));
        }

        let manifest_path = session_dir.join("manifest.json");
        let manifest_bytes = fs::read(&manifest_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ReaderError::ManifestNotFound(manifest_path.display().to_string())
            } else {
                ReaderError::io(&manifest_path, e)
            }
        })?;
        let manifest: SessionManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| ReaderError::Manifest(e.to_string()))?;

        if manifest.stopped_at_ns_monotonic < manifest.started_at_ns_monotonic {
            return Err(ReaderError::Manifest(
                "stop time precedes start time".into(),
            ));
        }

        Ok(Self {
            session_dir: session_dir.to_path_buf(),
            manifest,
        })
    }

    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    #[must_use]
    pub fn manifest(&self) -> &SessionManifest {
        &self.manifest
    }

    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.manifest
            .stopped_at_ns_monotonic
            .saturating_sub(self.manifest.started_at_ns_monotonic)
    }

    /// Open one thread's stream file via its manifest entry.
    pub fn trace_file(&self, slot_index: u32, kind: LaneKind) -> Result<TraceFile, ReaderError> {
        let entry = self
            .manifest
            .threads
            .iter()
            .find(|t| t.slot_index == slot_index)
            .ok_or_else(|| {
                ReaderError::Manifest(format!("no thread entry for slot {slot_index}"))
            })?;
        let rel = match kind {
            LaneKind::Index => entry.index_path.as_ref(),
            LaneKind::Detail => entry.detail_path.as_ref(),
        }
        .ok_or_else(|| {
            ReaderError::Manifest(format!("slot {slot_index} has no {kind} stream"))
        })?;
        TraceFile::open(self.session_dir.join(rel))
    }

    /// All of one thread's index events, in capture order.
    pub fn index_events(&self, slot_index: u32) -> Result<Vec<IndexEvent>, ReaderError> {
        let file = self.trace_file(slot_index, LaneKind::Index)?;
        Ok(file
            .records()
            .filter_map(IndexEvent::read_from)
            .collect())
    }

    /// All of one thread's detail records as `(header, stack)` pairs; the
    /// stack is truncated to each record's `stack_len`.
    pub fn detail_records(
        &self,
        slot_index: u32,
    ) -> Result<Vec<(DetailEventHeader, Vec<u8>)>, ReaderError> {
        let file = self.trace_file(slot_index, LaneKind::Detail)?;
        Ok(file
            .records()
            .filter_map(|record| {
                let header = DetailEventHeader::read_from(record)?;
                let stack_end =
                    (DETAIL_HEADER_BYTES + header.stack_len as usize).min(record.len());
                Some((header, record[DETAIL_HEADER_BYTES..stack_end].to_vec()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelane_common::{EVENT_KIND_CALL, INDEX_EVENT_BYTES};

    fn write_index_file(path: &Path, slot: u32, events: &[IndexEvent], footer: bool) {
        let mut bytes = Vec::new();
        let mut header = [0u8; FILE_HEADER_BYTES];
        header[0..8].copy_from_slice(&INDEX_FILE_MAGIC);
        header[8..12].copy_from_slice(&1u32.to_le_bytes());
        header[12..16].copy_from_slice(&(INDEX_EVENT_BYTES as u32).to_le_bytes());
        header[16..20].copy_from_slice(&slot.to_le_bytes());
        bytes.extend_from_slice(&header);
        for event in events {
            bytes.extend_from_slice(event.as_bytes());
        }
        if footer {
            let mut tail = [0u8; FILE_FOOTER_BYTES];
            tail[0..8].copy_from_slice(&FILE_FOOTER_MAGIC);
            tail[8..16].copy_from_slice(&(events.len() as u64).to_le_bytes());
            bytes.extend_from_slice(&tail);
        }
        fs::write(path, bytes).unwrap();
    }

    fn event(ts: u64) -> IndexEvent {
        IndexEvent {
            timestamp_ns: ts,
            function_id: 1,
            thread_id: 2,
            kind: EVENT_KIND_CALL,
            call_depth: 0,
            _reserved: 0,
        }
    }

    #[test]
    fn open_missing_directory_is_session_not_found() {
        let err = SessionReader::open("/does/not/exist").unwrap_err();
        assert!(matches!(err, ReaderError::SessionNotFound(_)));
    }

    #[test]
    fn open_without_manifest_is_manifest_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = SessionReader::open(dir.path()).unwrap_err();
        assert!(matches!(err, ReaderError::ManifestNotFound(_)));
    }

    #[test]
    fn finalized_file_exposes_footer_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.atf");
        write_index_file(&path, 3, &[event(10), event(20)], true);

        let file = TraceFile::open(&path).unwrap();
        assert_eq!(file.kind, LaneKind::Index);
        assert_eq!(file.slot_index, 3);
        assert_eq!(file.record_count(), 2);
        assert!(file.is_finalized());
        assert_eq!(file.footer.unwrap().events_written, 2);
    }

    #[test]
    fn truncated_file_reads_whole_records_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.atf");
        write_index_file(&path, 0, &[event(10), event(20)], false);
        // Chop mid-record.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

        let file = TraceFile::open(&path).unwrap();
        assert!(!file.is_finalized());
        assert_eq!(file.record_count(), 1);
        let events: Vec<_> = file.records().filter_map(IndexEvent::read_from).collect();
        assert_eq!(events[0].timestamp_ns, 10);
    }

    #[test]
    fn rejects_unknown_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.atf");
        fs::write(&path, [0u8; 64]).unwrap();
        assert!(matches!(
            TraceFile::open(&path).unwrap_err(),
            ReaderError::BadFile { .. }
        ));
    }
}
