//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::domain::DetailPersistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DetailPolicyArg {
    /// Persist every drained detail ring
    Always,
    /// Persist only rings containing a marked event
    Marked,
}

impl From<DetailPolicyArg> for DetailPersistence {
    fn from(arg: DetailPolicyArg) -> Self {
        match arg {
            DetailPolicyArg::Always => DetailPersistence::Always,
            DetailPolicyArg::Marked => DetailPersistence::Marked,
        }
    }
}

#[derive(Parser)]
#[command(about = "In-process function-call tracing pipeline with a built-in workload generator")]
pub struct Args {
    /// Dump a previously recorded session directory and exit
    #[arg(long, value_name = "SESSION_DIR", conflicts_with_all = &["threads", "events", "duration"])]
    pub dump: Option<PathBuf>,

    /// Directory under which the session directory is created
    #[arg(short, long, default_value = "./traces")]
    pub output: PathBuf,

    /// Session directory name (generated from pid + time if omitted)
    #[arg(long)]
    pub label: Option<String>,

    /// Synthetic producer threads to run
    #[arg(short, long, default_value = "4")]
    pub threads: u32,

    /// Index events emitted per thread (0 = run until duration/signal)
    #[arg(short, long, default_value = "100000")]
    pub events: u64,

    /// Seconds to run before stopping (0 = until the workload completes)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Emit a detail event every Nth call (0 disables the detail stream)
    #[arg(long, default_value = "0")]
    pub detail_every: u64,

    /// Mark every Nth detail event as a persistence trigger (0 = never)
    #[arg(long, default_value = "0")]
    pub mark_every: u64,

    /// Detail persistence policy
    #[arg(long, value_enum, default_value_t = DetailPolicyArg::Always)]
    pub detail_persistence: DetailPolicyArg,

    /// Max registered threads for the session
    #[arg(long, default_value = "64")]
    pub capacity: u32,

    /// Rings per lane
    #[arg(long, default_value = "8")]
    pub rings_per_lane: u32,

    /// Index ring capacity in bytes (power of two)
    #[arg(long, default_value = "65536")]
    pub ring_bytes_index: u32,

    /// Detail ring capacity in bytes (power of two)
    #[arg(long, default_value = "262144")]
    pub ring_bytes_detail: u32,

    /// Stack snapshot bytes per detail event
    #[arg(long, default_value = "128")]
    pub stack_bytes: u32,

    /// Drain idle sleep in microseconds (0 spin-polls)
    #[arg(long, default_value = "1000")]
    pub poll_interval_us: u64,

    /// Rings drained per lane per cycle (0 = unbounded)
    #[arg(long, default_value = "8")]
    pub max_batch_size: u32,

    /// Fairness quantum bounding the batch size (0 disables)
    #[arg(long, default_value = "8")]
    pub fairness_quantum: u32,

    /// Yield instead of sleeping on idle drain cycles
    #[arg(long)]
    pub yield_on_idle: bool,

    /// Metrics report interval in milliseconds (0 disables the reporter)
    #[arg(long, default_value = "5000")]
    pub report_interval_ms: u64,

    /// Append JSON metrics reports to this file
    #[arg(long)]
    pub metrics_json: Option<PathBuf>,
}
