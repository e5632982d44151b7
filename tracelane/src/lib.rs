//! # Tracelane - In-Process Function-Call Tracing Pipeline
//!
//! Tracelane captures function-call events from an instrumented process at
//! line-rate and materializes per-thread event streams on disk. Producers
//! record events on their own threads with no locks, no allocations, and no
//! blocking syscalls; a single drain thread moves published data to
//! append-only per-thread files.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Instrumented Application                      │
//! │          trace_index() / trace_detail() on any thread           │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ producer fast path (TLS slot cache)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Tracelane (This Crate)                      │
//! │                                                                 │
//! │  ┌──────────────┐  submit  ┌──────────────┐   ┌─────────────┐ │
//! │  │  Per-thread  │ ───────▶ │    Drain     │──▶│  Per-thread │ │
//! │  │  lanes       │ ◀─────── │    worker    │   │  .atf files │ │
//! │  │  (SPSC rings)│   free   │ (round-robin)│   │  + manifest │ │
//! │  └──────┬───────┘          └──────┬───────┘   └─────────────┘ │
//! │         │                         │                            │
//! │  ┌──────▼───────┐          ┌──────▼───────┐                   │
//! │  │ Backpressure │          │   Metrics    │                   │
//! │  │ state machine│          │   reporter   │                   │
//! │  └──────────────┘          └──────────────┘                   │
//! │                                                                 │
//! │  ┌──────────────┐          ┌──────────────┐                   │
//! │  │    Thread    │          │     Hook     │                   │
//! │  │   registry   │          │   registry   │                   │
//! │  └──────────────┘          └──────────────┘                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core Pipeline Modules
//!
//! - [`capture`]: the producer-side hot path
//!   - `ring_buffer`: SPSC byte rings with release/acquire publication
//!   - `lane`: ring pools with submit/free hand-off queues
//!   - `producer`: `trace_index` / `trace_detail` and the TLS slot cache
//!
//! - [`registry`]: fixed-capacity slot allocator; one lane set per thread,
//!   claimed by CAS on first touch
//!
//! - [`drain`]: the single consumer thread; fairness-bounded round-robin,
//!   final unbounded pass on shutdown
//!
//! - [`writer`]: append-only per-thread files (header/records/footer) and
//!   the atomically-written session manifest
//!
//! - [`backpressure`]: NORMAL → PRESSURE → DROPPING → RECOVERY per-lane
//!   state machine scheduling the drop-oldest policy
//!
//! ### Support Modules
//!
//! - [`session`]: lifecycle controller binding everything together
//! - [`hooks`]: (module, symbol) → 64-bit function identifier mapping
//! - [`metrics`]: relaxed-atomic counters and the periodic reporter
//! - [`reader`]: consumer-side access to a recorded session
//! - [`cli`] / [`domain`] / [`clock`]: arguments, domain types, timebase
//!
//! ## Key Guarantees
//!
//! - **Per-thread ordering**: each thread's file is monotonic in timestamp,
//!   modulo intentional drops. Cross-thread order is not reconstructed.
//! - **Accounted loss**: an event either reaches its thread's file or
//!   increments that thread's drop counters; drops are never silent to the
//!   counters and never visible in the stream format.
//! - **Graceful degradation**: when producers outrun the drain, the lane
//!   drops its oldest data, the backpressure mode classifies the episode,
//!   and the pipeline keeps accepting events.
//! - **Cooperative shutdown**: `stop` flips the accepting flag, the drain
//!   runs a final unbounded pass, files get footers, and the manifest is
//!   written last.
//!
//! ## Typical Usage
//!
//! ```no_run
//! use tracelane::session::{Session, SessionConfig};
//! use tracelane::capture::trace_index;
//! use tracelane_common::EVENT_KIND_CALL;
//!
//! let mut session = Session::start(SessionConfig::default()).unwrap();
//! let fid = session.inner().hooks().register_symbol("/bin/app", "main");
//! trace_index(fid, EVENT_KIND_CALL, 0);
//! session.stop().unwrap();
//! ```

pub mod backpressure;
pub mod capture;
pub mod cli;
pub mod clock;
pub mod domain;
pub mod drain;
pub mod hooks;
pub mod metrics;
pub mod reader;
pub mod registry;
pub mod session;
pub mod writer;
