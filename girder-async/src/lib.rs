//! GIRDER Async - Dependency-Resolution Map
//!
//! The coordination primitive of the analysis engine: a keyed,
//! memoized, concurrent computation map with fan-out/fan-in, cycle
//! detection, and structured failure propagation over the tokio
//! runtime.

pub mod task_map;

pub use task_map::{
    null_logger, AsyncTaskMap, Failure, Logger, Reader, ReaderFuture, TaskContext,
};
