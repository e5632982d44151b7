//! Capture-side pipeline: rings, lanes, and the producer fast path.
//!
//! Everything in this module runs on the hot path of an instrumented call.
//! The contract is strict: no locks, no allocations, no blocking syscalls
//! between a `trace_index` call and its return. The only synchronization is
//! release/acquire publication on ring positions and queue cursors.

pub mod lane;
pub mod producer;
pub mod ring_buffer;

pub use lane::{Lane, SwapOutcome};
pub use producer::{trace_detail, trace_detail_marked, trace_index};
pub use ring_buffer::RingBuffer;
