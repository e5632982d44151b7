//! End-to-end pipeline scenarios: real session, real producer threads,
//! real drain, assertions on the files left behind.

use std::path::Path;

use serial_test::serial;
use tracelane::capture::{trace_detail, trace_index};
use tracelane::drain::{DrainConfig, DrainState};
use tracelane::session::{Session, SessionConfig};
use tracelane_common::{
    DetailEventHeader, IndexEvent, DETAIL_HEADER_BYTES, EVENT_KIND_CALL, EVENT_KIND_RETURN,
    FILE_FOOTER_BYTES, FILE_HEADER_BYTES,
};

fn base_config(root: &Path, label: &str) -> SessionConfig {
    SessionConfig {
        output_root: root.to_path_buf(),
        session_label: Some(label.to_string()),
        // Small arena; tests never register more than a few threads.
        capacity: 8,
        reporter: None,
        ..SessionConfig::default()
    }
}

/// Strip header (and footer, when present) and parse the packed records.
fn read_records(path: &Path) -> (u32, Vec<Vec<u8>>) {
    let bytes = std::fs::read(path).expect("trace file");
    assert!(bytes.len() >= FILE_HEADER_BYTES);
    let record_size = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let mut body = &bytes[FILE_HEADER_BYTES..];
    if body.len() >= FILE_FOOTER_BYTES
        && &body[body.len() - FILE_FOOTER_BYTES..body.len() - FILE_FOOTER_BYTES + 8]
            == b"ADAEND1\0"
    {
        body = &body[..body.len() - FILE_FOOTER_BYTES];
    }
    let records = body
        .chunks_exact(record_size as usize)
        .map(<[u8]>::to_vec)
        .collect();
    (record_size, records)
}

fn read_index_events(path: &Path) -> Vec<IndexEvent> {
    let (record_size, records) = read_records(path);
    assert_eq!(record_size, 32);
    records
        .iter()
        .map(|r| IndexEvent::read_from(r).unwrap())
        .collect()
}

#[test]
#[serial]
fn single_producer_low_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        rings_per_lane: 1,
        ring_bytes_index: 64 * 1024,
        ..base_config(dir.path(), "single")
    };
    let mut session = Session::start(config).unwrap();

    let function_id = 0x0001_0000_0000_0001u64;
    for i in 0..1000u32 {
        let kind = if i % 2 == 0 { EVENT_KIND_CALL } else { EVENT_KIND_RETURN };
        trace_index(function_id, kind, 1);
    }
    session.stop().unwrap();

    let status = session.status();
    assert_eq!(status.threads.len(), 1);
    assert_eq!(status.threads[0].metrics.events_written, 1000);
    assert_eq!(status.threads[0].metrics.events_dropped, 0);

    let slot = status.threads[0].slot_index;
    let events = read_index_events(&session.session_dir().join(format!("thread_{slot}/index.atf")));
    assert_eq!(events.len(), 1000);
    for pair in events.windows(2) {
        assert!(pair[1].timestamp_ns >= pair[0].timestamp_ns);
    }
    assert!(events.iter().all(|e| e.function_id == function_id));
}

#[test]
#[serial]
fn multi_producer_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        rings_per_lane: 4,
        ring_bytes_index: 4096,
        ..base_config(dir.path(), "multi")
    };
    let mut session = Session::start(config).unwrap();

    let handles: Vec<_> = (0..4u64)
        .map(|i| {
            std::thread::spawn(move || {
                let function_id = 0x0000_0002_0000_0000 | i;
                for call in 0..200u32 {
                    let kind = if call % 2 == 0 { EVENT_KIND_CALL } else { EVENT_KIND_RETURN };
                    trace_index(function_id, kind, 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    session.stop().unwrap();

    let status = session.status();
    assert_eq!(status.threads.len(), 4);
    let mut seen_function_ids = Vec::new();
    for thread in &status.threads {
        assert_eq!(thread.metrics.events_written, 200);
        assert_eq!(thread.metrics.events_dropped, 0);
        let path = session
            .session_dir()
            .join(format!("thread_{}/index.atf", thread.slot_index));
        let events = read_index_events(&path);
        assert_eq!(events.len(), 200);
        // Each file carries exactly one producer's stream.
        let fid = events[0].function_id;
        assert!(events.iter().all(|e| e.function_id == fid));
        seen_function_ids.push(fid);
    }
    seen_function_ids.sort_unstable();
    assert_eq!(
        seen_function_ids,
        (0..4u64).map(|i| 0x0000_0002_0000_0000 | i).collect::<Vec<_>>()
    );

    let drain = status.drain;
    assert_eq!(drain.rings_total, drain.rings_index);
    assert_eq!(drain.rings_detail, 0);
}

#[test]
#[serial]
fn graceful_shutdown_during_burst() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        rings_per_lane: 8,
        ring_bytes_index: 1024,
        drain: DrainConfig {
            max_batch_size: 2,
            fairness_quantum: 2,
            poll_interval_us: 100,
            yield_on_idle: false,
        },
        ..base_config(dir.path(), "burst")
    };
    let mut session = Session::start(config).unwrap();

    let producer = std::thread::spawn(move || {
        for i in 0..100_000u32 {
            let kind = if i % 2 == 0 { EVENT_KIND_CALL } else { EVENT_KIND_RETURN };
            trace_index(0xABCD_0000_0000_0001, kind, 2);
        }
    });

    // Stop mid-burst; everything published before the final pass must land.
    std::thread::sleep(std::time::Duration::from_millis(5));
    session.stop().unwrap();
    producer.join().unwrap();

    assert_eq!(session.drain_state(), DrainState::Stopped);
    let status = session.status();
    assert!(status.drain.final_drains >= 1);
    assert!(!status.accepting);

    let thread = &status.threads[0];
    let path = session
        .session_dir()
        .join(format!("thread_{}/index.atf", thread.slot_index));
    let events = read_index_events(&path);
    // Every written event is either on disk or was a drop-oldest victim
    // (backpressure drops minus the producer's own rejected events).
    let victims =
        thread.index_backpressure.events_dropped - thread.metrics.events_dropped;
    assert_eq!(events.len() as u64, thread.metrics.events_written - victims);
    for pair in events.windows(2) {
        assert!(pair[1].timestamp_ns >= pair[0].timestamp_ns);
    }

    // Idempotent after the first call.
    session.stop().unwrap();
}

#[test]
#[serial]
fn registry_at_capacity_drops_without_crash() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        capacity: 1,
        ..base_config(dir.path(), "capacity")
    };
    let mut session = Session::start(config).unwrap();

    // Main thread claims the only slot.
    trace_index(1, EVENT_KIND_CALL, 0);

    let loser = std::thread::spawn(|| {
        for _ in 0..5 {
            trace_index(2, EVENT_KIND_CALL, 0);
        }
    });
    loser.join().unwrap();

    let status = session.status();
    assert_eq!(status.capacity, 1);
    assert_eq!(status.active_threads, 1);
    assert_eq!(status.unregistered_drops, 5);
    session.stop().unwrap();
}

#[test]
#[serial]
fn zero_length_stack_snapshot_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        stack_bytes: 64,
        ..base_config(dir.path(), "zerostack")
    };
    let mut session = Session::start(config).unwrap();

    trace_detail(0x42, EVENT_KIND_CALL, 3, 0x1000, 0x2000, 0x3000, &[]);
    session.stop().unwrap();

    let status = session.status();
    let slot = status.threads[0].slot_index;
    let (record_size, records) =
        read_records(&session.session_dir().join(format!("thread_{slot}/detail.atf")));
    assert_eq!(record_size as usize, DETAIL_HEADER_BYTES + 64);
    assert_eq!(records.len(), 1);
    let header = DetailEventHeader::read_from(&records[0]).unwrap();
    assert_eq!(header.stack_len, 0);
    assert_eq!(header.lr, 0x1000);
    assert_eq!(header.call_depth, 3);
}

#[test]
#[serial]
fn session_start_rejects_second_concurrent_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::start(base_config(dir.path(), "first")).unwrap();
    assert!(Session::start(base_config(dir.path(), "second")).is_err());
    session.stop().unwrap();
}
