//! Detail-lane marked persistence: every detail event is captured in
//! memory, but only rings carrying a marked record reach disk.

use std::path::Path;

use serial_test::serial;
use tracelane::capture::{trace_detail, trace_detail_marked};
use tracelane::domain::DetailPersistence;
use tracelane::session::{Session, SessionConfig};
use tracelane_common::{
    DetailEventHeader, DETAIL_FLAG_MARKED, EVENT_KIND_CALL, FILE_FOOTER_BYTES, FILE_HEADER_BYTES,
};

fn read_detail_headers(path: &Path) -> Vec<DetailEventHeader> {
    let bytes = std::fs::read(path).expect("detail file");
    let record_size = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let mut body = &bytes[FILE_HEADER_BYTES..];
    if body.len() >= FILE_FOOTER_BYTES
        && &body[body.len() - FILE_FOOTER_BYTES..body.len() - FILE_FOOTER_BYTES + 8]
            == b"ADAEND1\0"
    {
        body = &body[..body.len() - FILE_FOOTER_BYTES];
    }
    body.chunks_exact(record_size)
        .map(|r| DetailEventHeader::read_from(r).unwrap())
        .collect()
}

#[test]
#[serial]
fn only_marked_rings_reach_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        output_root: dir.path().to_path_buf(),
        session_label: Some("marked".to_string()),
        capacity: 4,
        detail_persistence: DetailPersistence::Marked,
        // 96-byte detail records, ~42 per ring: the burst spans several
        // rings while the pool (8 x 42) comfortably holds all 201 events,
        // so nothing is lost even if the drain lags the whole burst.
        stack_bytes: 32,
        ring_bytes_detail: 4096,
        rings_per_lane: 8,
        reporter: None,
        ..SessionConfig::default()
    };
    let mut session = Session::start(config).unwrap();

    let stack = [0xEEu8; 32];
    for _ in 0..100 {
        trace_detail(0x10, EVENT_KIND_CALL, 1, 0, 0, 0, &stack);
    }
    trace_detail_marked(0x11, EVENT_KIND_CALL, 1, 0, 0, 0, &stack);
    for _ in 0..100 {
        trace_detail(0x10, EVENT_KIND_CALL, 1, 0, 0, 0, &stack);
    }
    session.stop().unwrap();

    let status = session.status();
    let thread = &status.threads[0];
    assert_eq!(thread.metrics.events_written, 201);

    let path = session
        .session_dir()
        .join(format!("thread_{}/detail.atf", thread.slot_index));
    let headers = read_detail_headers(&path);

    // The marked record is on disk, and unmarked-only rings were recycled
    // silently: far fewer than 201 records persist.
    assert!(!headers.is_empty());
    assert!(headers.len() < 201);
    assert_eq!(
        headers
            .iter()
            .filter(|h| h.flags & DETAIL_FLAG_MARKED != 0)
            .count(),
        1
    );
    assert!(headers.iter().all(|h| h.stack_len == 32));
}

#[test]
#[serial]
fn always_policy_persists_every_ring() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig {
        output_root: dir.path().to_path_buf(),
        session_label: Some("always".to_string()),
        capacity: 4,
        detail_persistence: DetailPersistence::Always,
        stack_bytes: 32,
        ring_bytes_detail: 1024,
        reporter: None,
        ..SessionConfig::default()
    };
    let mut session = Session::start(config).unwrap();

    let stack = [0x11u8; 32];
    for _ in 0..50 {
        trace_detail(0x20, EVENT_KIND_CALL, 0, 0, 0, 0, &stack);
    }
    session.stop().unwrap();

    let thread_slot = session.status().threads[0].slot_index;
    let headers = read_detail_headers(
        &session
            .session_dir()
            .join(format!("thread_{thread_slot}/detail.atf")),
    );
    assert_eq!(headers.len(), 50);
}
