//! Core copy engine: io_uring ring facade, pooled resources, the per-file
//! state machine and the worker engine that drives it.
//!
//! The pieces compose as: `scanner` produces `WorkItem`s and a size sample,
//! `engine` feeds them through a `WorkQueue` to per-thread workers, each
//! worker owns one `Ring`, one `BufferPool` and one `PipePool` and advances
//! up to queue-depth `FileJob` state machines off ring completions.

pub mod buffer_pool;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod pipe_pool;
pub mod ring;
pub mod scanner;
pub mod stats;
pub mod sync_copy;
pub mod work_queue;

pub use buffer_pool::BufferPool;
pub use config::CopyConfig;
pub use error::{EngineError, EngineResult};
pub use pipe_pool::PipePool;
pub use ring::{Completion, Ring};
pub use scanner::{scan, scan_relative, ScanOutcome, SendItem, SizeStats, WorkItem};
pub use stats::CopyStats;
pub use work_queue::WorkQueue;
