//! # Session controller
//!
//! Binds a registry, drain worker, writer, and optional metrics reporter
//! into one lifecycle:
//!
//! ```text
//! Session::start(config)
//!   validate config (repairing)      session directory created
//!   build registry (arena)           drain thread spawned
//!   install process-wide session ──▶ producers may now trace
//!
//! Session::stop()
//!   accepting = false (release)      producers drop silently
//!   uninstall process-wide session   TLS caches invalidated via epoch
//!   drain final pass + join ──────▶  all published rings persisted
//!   writer finalize (footers)
//!   manifest written atomically
//! ```
//!
//! The only process-wide state is the current session pointer plus an
//! epoch counter; producer TLS caches carry the epoch they were built
//! under, so a cache from a previous session can never leak into a new one.

pub mod config;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::Serialize;
use tracelane_common::{detail_record_bytes, INDEX_EVENT_BYTES};

use crate::backpressure::BackpressureSnapshot;
use crate::clock::monotonic_now_ns;
use crate::domain::{LaneKind, SessionError, SessionId};
use crate::drain::{DrainState, DrainWorker};
use crate::hooks::HookRegistry;
use crate::metrics::{DrainMetricsSnapshot, MetricsReporter, ThreadMetricsSnapshot};
use crate::registry::{RegistryConfig, ThreadRegistry};
use crate::writer::{write_manifest, ManifestThread, SessionManifest, SessionWriter};

pub use config::SessionConfig;

/// Arena sanity bound; a registry larger than this will not be allocated.
const MAX_ARENA_BYTES: u64 = 1 << 30;

/// State shared between the controller, the drain, and every producer.
pub struct SessionInner {
    pub(crate) session_id: u64,
    pub(crate) pid: u32,
    pub(crate) accepting: AtomicBool,
    pub(crate) registry: Arc<ThreadRegistry>,
    pub(crate) hooks: HookRegistry,
    /// Events dropped because registration failed at capacity.
    pub(crate) unregistered_drops: AtomicU64,
    started_ns_monotonic: u64,
    started_utc_ns: u64,
    session_dir: PathBuf,
}

impl SessionInner {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        SessionId(self.session_id)
    }

    /// Producers observe this with acquire on every event attempt.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    #[must_use]
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    #[must_use]
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }
}

// ---------------------------------------------------------------------------
// Process-wide current session
// ---------------------------------------------------------------------------

static CURRENT: Mutex<Option<Arc<SessionInner>>> = Mutex::new(None);
static EPOCH: AtomicU64 = AtomicU64::new(0);

/// Epoch the producer TLS caches key on. Bumped on install and uninstall.
pub(crate) fn current_epoch() -> u64 {
    EPOCH.load(Ordering::Acquire)
}

/// Slow path: clone the current session handle, if one is installed. The
/// epoch is read under the lock so it always pairs with the session it
/// describes.
pub(crate) fn current_session() -> Option<(u64, Arc<SessionInner>)> {
    let guard = CURRENT.lock().expect("session slot poisoned");
    let epoch = current_epoch();
    guard.as_ref().map(|inner| (epoch, Arc::clone(inner)))
}

fn install(inner: &Arc<SessionInner>) -> Result<(), SessionError> {
    let mut guard = CURRENT.lock().expect("session slot poisoned");
    if guard.is_some() {
        return Err(SessionError::InvalidConfig(
            "another session is already active in this process".into(),
        ));
    }
    *guard = Some(Arc::clone(inner));
    EPOCH.fetch_add(1, Ordering::Release);
    Ok(())
}

fn uninstall(inner: &Arc<SessionInner>) {
    let mut guard = CURRENT.lock().expect("session slot poisoned");
    if let Some(current) = guard.as_ref() {
        if Arc::ptr_eq(current, inner) {
            *guard = None;
            EPOCH.fetch_add(1, Ordering::Release);
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ThreadStatus {
    pub slot_index: u32,
    pub thread_id: u64,
    pub active: bool,
    pub metrics: ThreadMetricsSnapshot,
    pub index_backpressure: BackpressureSnapshot,
    pub detail_backpressure: BackpressureSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: u64,
    pub pid: u32,
    pub accepting: bool,
    pub capacity: u32,
    pub active_threads: u32,
    pub unregistered_drops: u64,
    pub drain_state: &'static str,
    pub drain: DrainMetricsSnapshot,
    pub threads: Vec<ThreadStatus>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One bounded lifecycle of the tracing pipeline.
pub struct Session {
    inner: Arc<SessionInner>,
    drain: DrainWorker,
    reporter: Option<MetricsReporter>,
    stopped: bool,
}

impl Session {
    /// Validate the configuration (repairing soft problems), build the
    /// pipeline, spawn the drain, and install this session process-wide.
    pub fn start(mut config: SessionConfig) -> Result<Self, SessionError> {
        if !config.validate() {
            warn!("session config was invalid; repaired values are in effect");
        }

        if config.arena_bytes() > MAX_ARENA_BYTES {
            return Err(SessionError::Capacity(format!(
                "arena of {} bytes exceeds the {MAX_ARENA_BYTES}-byte bound",
                config.arena_bytes()
            )));
        }

        let pid = std::process::id();
        let started_utc_ns = utc_now_ns();
        let label = config
            .session_label
            .clone()
            .unwrap_or_else(|| format!("session_{pid}_{}", started_utc_ns / 1_000_000_000));
        let session_dir = config.output_root.join(label);
        std::fs::create_dir_all(&session_dir)
            .map_err(|e| SessionError::InvalidConfig(format!("output root: {e}")))?;

        let registry = Arc::new(ThreadRegistry::new(&RegistryConfig {
            capacity: config.capacity,
            rings_per_lane: config.rings_per_lane,
            ring_bytes_index: config.ring_bytes_index,
            ring_bytes_detail: config.ring_bytes_detail,
            stack_bytes: config.stack_bytes,
            backpressure: config.backpressure,
        })?);

        let inner = Arc::new(SessionInner {
            session_id: (u64::from(pid) << 32) ^ started_utc_ns,
            pid,
            accepting: AtomicBool::new(true),
            registry: Arc::clone(&registry),
            hooks: HookRegistry::new(),
            unregistered_drops: AtomicU64::new(0),
            started_ns_monotonic: monotonic_now_ns(),
            started_utc_ns,
            session_dir: session_dir.clone(),
        });

        let writer = SessionWriter::new(
            session_dir,
            config.capacity,
            INDEX_EVENT_BYTES as u32,
            detail_record_bytes(config.stack_bytes) as u32,
        );
        let mut drain = DrainWorker::new(
            registry,
            writer,
            config.drain,
            config.detail_persistence,
        );
        drain.start()?;

        let reporter = config
            .reporter
            .as_ref()
            .map(|cfg| MetricsReporter::spawn(Arc::clone(&inner), cfg.clone()));

        install(&inner)?;
        info!(
            "session {} started in {}",
            inner.session_id(),
            inner.session_dir().display()
        );

        Ok(Self {
            inner,
            drain,
            reporter,
            stopped: false,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    #[must_use]
    pub fn session_dir(&self) -> &Path {
        self.inner.session_dir()
    }

    /// Stop accepting, drain everything in flight, finalize the files, and
    /// write the manifest. Idempotent after the first call.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if self.stopped {
            return Ok(());
        }

        self.inner.accepting.store(false, Ordering::Release);
        uninstall(&self.inner);

        if let Some(reporter) = self.reporter.take() {
            reporter.stop();
        }

        let writer = self.drain.stop()?;
        let stopped_ns_monotonic = monotonic_now_ns();
        let stopped_utc_ns = utc_now_ns();

        if let Some(mut writer) = writer {
            let registry = &self.inner.registry;
            writer
                .finalize(|slot| {
                    registry
                        .slot_at(slot.0)
                        .map_or(0, |s| s.metrics().snapshot().events_dropped)
                })
                .map_err(|e| SessionError::Finalize(std::io::Error::other(e)))?;

            let manifest = self.build_manifest(&writer, stopped_ns_monotonic, stopped_utc_ns);
            write_manifest(&self.inner.session_dir.join("manifest.json"), &manifest)
                .map_err(|e| SessionError::Finalize(std::io::Error::other(e)))?;
        }

        self.stopped = true;
        info!("session {} stopped", self.inner.session_id());
        Ok(())
    }

    fn build_manifest(
        &self,
        writer: &SessionWriter,
        stopped_ns_monotonic: u64,
        stopped_utc_ns: u64,
    ) -> SessionManifest {
        let (modules, symbols) = self.inner.hooks.export();
        let threads = self
            .inner
            .registry
            .claimed_slots()
            .map(|slot| {
                let metrics = slot.metrics().snapshot();
                ManifestThread {
                    slot_index: slot.slot_index().0,
                    thread_id: slot.thread_id(),
                    index_path: writer.file_path(slot.slot_index(), LaneKind::Index),
                    detail_path: writer.file_path(slot.slot_index(), LaneKind::Detail),
                    events_written: metrics.events_written,
                    events_dropped: metrics.events_dropped,
                }
            })
            .collect();

        SessionManifest {
            format_version: tracelane_common::FORMAT_VERSION,
            session_id: self.inner.session_id,
            pid: self.inner.pid,
            started_at_ns_monotonic: self.inner.started_ns_monotonic,
            started_at_utc: self.inner.started_utc_ns,
            stopped_at_ns_monotonic: stopped_ns_monotonic,
            stopped_at_utc: stopped_utc_ns,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            bytes_written: writer.bytes_written(),
            threads,
            modules,
            symbols,
        }
    }

    /// Point-in-time view of the whole pipeline. Safe from any thread.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let threads = self
            .inner
            .registry
            .claimed_slots()
            .map(|slot| ThreadStatus {
                slot_index: slot.slot_index().0,
                thread_id: slot.thread_id(),
                active: slot.is_active(),
                metrics: slot.metrics().snapshot(),
                index_backpressure: slot.backpressure(LaneKind::Index).snapshot(),
                detail_backpressure: slot.backpressure(LaneKind::Detail).snapshot(),
            })
            .collect();

        SessionStatus {
            session_id: self.inner.session_id,
            pid: self.inner.pid,
            accepting: self.inner.is_accepting(),
            capacity: self.inner.registry.capacity(),
            active_threads: self.inner.registry.active_count(),
            unregistered_drops: self.inner.unregistered_drops.load(Ordering::Relaxed),
            drain_state: self.drain_state().as_str(),
            drain: self.drain.metrics(),
            threads,
        }
    }

    #[must_use]
    pub fn drain_state(&self) -> DrainState {
        self.drain.state()
    }

    #[must_use]
    pub fn drain_metrics(&self) -> DrainMetricsSnapshot {
        self.drain.metrics()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.stopped {
            if let Err(e) = self.stop() {
                warn!("session stop during drop failed: {e}");
            }
        }
    }
}

fn utc_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
