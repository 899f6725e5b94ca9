//! Per-executor build admission control.
//!
//! One [`BuildQueue`] per executor: FIFO admission against declared
//! capacity, bounded concurrency, cancellation, and a bounded build-result
//! history. Draining is polling-driven; an external loop or timer calls
//! [`BuildQueue::process_next_build`] repeatedly.

pub mod queue;

pub use queue::BuildQueue;
