//! Minimal instrumented application: trace a recursive workload through a
//! real session, then dump what landed on disk.
//!
//! ```bash
//! cargo run --example instrumented-app
//! cargo run -- --dump <printed session dir>
//! ```

use tracelane::capture::trace_index;
use tracelane::session::{Session, SessionConfig};
use tracelane_common::{EVENT_KIND_CALL, EVENT_KIND_RETURN};

fn fib(n: u64, depth: u32, function_id: u64) -> u64 {
    trace_index(function_id, EVENT_KIND_CALL, depth);
    let result = if n < 2 {
        n
    } else {
        fib(n - 1, depth + 1, function_id) + fib(n - 2, depth + 1, function_id)
    };
    trace_index(function_id, EVENT_KIND_RETURN, depth);
    result
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut session = Session::start(SessionConfig {
        output_root: "./traces".into(),
        session_label: Some("fib-demo".into()),
        capacity: 4,
        ..SessionConfig::default()
    })?;

    let function_id = session.inner().hooks().register_symbol("examples/fib", "fib");
    let result = fib(20, 0, function_id);
    println!("fib(20) = {result}");

    session.stop()?;
    let status = session.status();
    println!(
        "captured {} events into {}",
        status.threads[0].metrics.events_written,
        session.session_dir().display()
    );
    Ok(())
}
