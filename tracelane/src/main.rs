//! # tracelane - Session Controller Entry Point
//!
//! Starts a tracing session, drives it with a built-in multi-threaded
//! workload generator, and shuts it down cooperatively on SIGINT/SIGTERM
//! or when the workload completes.
//!
//! ## Program Flow
//!
//! ```text
//! ┌─────────────────────┐
//! │  Parse CLI Args     │
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼──────────┐
//! │ Session::start      │  registry + drain thread + writer
//! │ (config validated)  │  + optional metrics reporter
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼──────────┐
//! │ Register synthetic  │  hook registry: (module, symbol) →
//! │ symbols             │  function identifiers
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼──────────┐
//! │ Spawn producer      │  each thread calls trace_index /
//! │ threads             │  trace_detail through the real pipeline
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼──────────┐
//! │ Wait loop           │  tokio::select! over Ctrl+C, SIGTERM,
//! │                     │  duration limit, workload completion
//! └──────────┬──────────┘
//!            │
//! ┌──────────▼──────────┐
//! │ session.stop()      │  final drain pass → footers → manifest
//! │ print summary       │
//! └─────────────────────┘
//! ```
//!
//! ## Exit Codes
//!
//! - 0: clean stop
//! - 1: configuration error
//! - 2: capacity error (cannot allocate the arena)
//! - 3: I/O error during finalize

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::info;
use tracelane_common::{EVENT_KIND_CALL, EVENT_KIND_RETURN};

use tracelane::capture::{trace_detail, trace_detail_marked, trace_index};
use tracelane::cli::Args;
use tracelane::metrics::ReporterConfig;
use tracelane::session::{Session, SessionConfig};

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    // Dump mode: inspect a recorded session, no live pipeline involved.
    if let Some(session_dir) = args.dump.as_ref() {
        if let Err(e) = dump_session(session_dir) {
            eprintln!("tracelane: {e}");
            std::process::exit(1);
        }
        return;
    }

    match run(args).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("tracelane: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

/// Print a recorded session's manifest and per-thread stream summaries.
fn dump_session(session_dir: &std::path::Path) -> Result<(), tracelane::reader::ReaderError> {
    use tracelane::domain::LaneKind;
    use tracelane::reader::SessionReader;

    let reader = SessionReader::open(session_dir)?;
    let manifest = reader.manifest();

    println!("🛰  tracelane session {}", manifest.session_id);
    println!("   Host: {}/{} pid {}", manifest.os, manifest.arch, manifest.pid);
    println!(
        "   Duration: {:.3}s, {} on disk",
        reader.duration_ns() as f64 / 1e9,
        tracelane::metrics::format_bytes(manifest.bytes_written),
    );
    println!(
        "   Modules: {}, symbols: {}",
        manifest.modules.len(),
        manifest.symbols.len()
    );

    for thread in &manifest.threads {
        println!(
            "\n   thread slot {} (tid {}): written:{} dropped:{}",
            thread.slot_index, thread.thread_id, thread.events_written, thread.events_dropped
        );
        if thread.index_path.is_some() {
            let events = reader.index_events(thread.slot_index)?;
            if let (Some(first), Some(last)) = (events.first(), events.last()) {
                println!(
                    "     index: {} records, {:.3}s span",
                    events.len(),
                    (last.timestamp_ns - first.timestamp_ns) as f64 / 1e9
                );
            } else {
                println!("     index: 0 records");
            }

            let mut by_function: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
            for event in &events {
                *by_function.entry(event.function_id).or_default() += 1;
            }
            let mut ranked: Vec<_> = by_function.into_iter().collect();
            ranked.sort_by_key(|&(id, count)| (std::cmp::Reverse(count), id));
            for (function_id, count) in ranked.into_iter().take(5) {
                let name = manifest
                    .symbols
                    .iter()
                    .find(|s| s.function_id == function_id)
                    .map_or("?", |s| s.name.as_str());
                println!("       {count:>8}  {function_id:#018x}  {name}");
            }
        }
        if thread.detail_path.is_some() {
            let file = reader.trace_file(thread.slot_index, LaneKind::Detail)?;
            println!(
                "     detail: {} records{}",
                file.record_count(),
                if file.is_finalized() { "" } else { " (not finalized)" }
            );
        }
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), tracelane::domain::SessionError> {
    let config = SessionConfig {
        capacity: args.capacity,
        rings_per_lane: args.rings_per_lane,
        ring_bytes_index: args.ring_bytes_index,
        ring_bytes_detail: args.ring_bytes_detail,
        stack_bytes: args.stack_bytes,
        output_root: args.output.clone(),
        session_label: args.label.clone(),
        drain: tracelane::drain::DrainConfig {
            poll_interval_us: args.poll_interval_us,
            max_batch_size: args.max_batch_size,
            fairness_quantum: args.fairness_quantum,
            yield_on_idle: args.yield_on_idle,
        },
        backpressure: tracelane::backpressure::BackpressureConfig::from_env(),
        detail_persistence: args.detail_persistence.into(),
        reporter: (args.report_interval_ms > 0).then(|| ReporterConfig {
            interval_ms: args.report_interval_ms,
            json_path: args.metrics_json.clone(),
            start_paused: false,
        }),
    };

    let mut session = Session::start(config)?;

    println!("🛰  tracelane v0.1.0");
    println!("   Session: {}", session.session_dir().display());
    println!("   Producers: {} x {} events", args.threads, args.events);

    // Synthetic symbol table: one module, one symbol per producer thread.
    let function_ids: Vec<u64> = (0..args.threads)
        .map(|t| {
            session
                .inner()
                .hooks()
                .register_symbol("tracelane/workload", &format!("worker_{t}"))
        })
        .collect();

    // Producer threads drive the real pipeline end to end.
    let stop_flag = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = function_ids
        .into_iter()
        .map(|function_id| {
            let stop = Arc::clone(&stop_flag);
            let events = args.events;
            let detail_every = args.detail_every;
            let mark_every = args.mark_every;
            std::thread::spawn(move || {
                workload(function_id, events, detail_every, mark_every, &stop);
            })
        })
        .collect();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(tracelane::domain::SessionError::Io)?;

    let started = Instant::now();
    let duration_limit =
        (args.duration > 0).then(|| Duration::from_secs(args.duration));

    loop {
        if handles.iter().all(|handle| handle.is_finished()) {
            println!("\n✓ Workload complete");
            break;
        }
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                println!("\n✓ Duration limit reached ({}s)", args.duration);
                break;
            }
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                println!("\n✓ Received Ctrl+C, shutting down gracefully");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    stop_flag.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }

    session.stop()?;

    let status = session.status();
    let written: u64 = status.threads.iter().map(|t| t.metrics.events_written).sum();
    let dropped: u64 = status.threads.iter().map(|t| t.metrics.events_dropped).sum();
    println!("\n📊 Summary");
    println!("   Threads: {}", status.threads.len());
    println!("   Events written: {written}");
    println!("   Events dropped: {dropped}");
    println!("   Rings drained: {}", status.drain.rings_total);
    println!("   Manifest: {}", session.session_dir().join("manifest.json").display());
    Ok(())
}

/// One producer thread's synthetic call/return stream.
fn workload(function_id: u64, events: u64, detail_every: u64, mark_every: u64, stop: &AtomicBool) {
    let stack = [0x5Au8; 64];
    let mut emitted = 0u64;
    let mut depth = 0u32;

    while !stop.load(Ordering::Relaxed) && (events == 0 || emitted < events) {
        let kind = if depth % 2 == 0 { EVENT_KIND_CALL } else { EVENT_KIND_RETURN };
        trace_index(function_id, kind, depth % 32);

        if detail_every > 0 && emitted % detail_every == 0 {
            let sp = 0x7fff_0000_0000u64 + emitted;
            if mark_every > 0 && emitted % (detail_every * mark_every) == 0 {
                trace_detail_marked(function_id, kind, depth % 32, sp + 8, sp + 16, sp, &stack);
            } else {
                trace_detail(function_id, kind, depth % 32, sp + 8, sp + 16, sp, &stack);
            }
        }

        depth = depth.wrapping_add(1);
        emitted += 1;
    }
}
