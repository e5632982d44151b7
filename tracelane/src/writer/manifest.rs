//! Session manifest: the single JSON record tying a session's per-thread
//! files, timing, and symbol table together.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::WriterError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestThread {
    pub slot_index: u32,
    pub thread_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_path: Option<String>,
    pub events_written: u64,
    pub events_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestModule {
    pub module_id: u32,
    pub path: String,
    pub base_address: u64,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSymbol {
    pub function_id: u64,
    pub module_id: u32,
    pub symbol_index: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub format_version: u32,
    pub session_id: u64,
    pub pid: u32,
    pub started_at_ns_monotonic: u64,
    /// Nanoseconds since the Unix epoch.
    pub started_at_utc: u64,
    pub stopped_at_ns_monotonic: u64,
    pub stopped_at_utc: u64,
    pub os: String,
    pub arch: String,
    pub bytes_written: u64,
    pub threads: Vec<ManifestThread>,
    pub modules: Vec<ManifestModule>,
    pub symbols: Vec<ManifestSymbol>,
}

/// Write the manifest atomically: serialize to a sibling temp file, then
/// rename over the final path.
pub fn write_manifest(path: &Path, manifest: &SessionManifest) -> Result<(), WriterError> {
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| WriterError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
