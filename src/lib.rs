//! A nanosecond-scale binary logging runtime.
//!
//! Log statements do almost no work where they execute: a build-time code
//! generator assigns every call site an integer id and replaces the
//! statement with a few stores of raw argument bytes into a per-thread
//! staging buffer (see [`reserve_alloc`]/[`finish_alloc`]). A single
//! background thread drains the staging buffers, compresses each staged
//! entry through its call site's generated compressor, and writes the
//! result to the log file with double-buffered asynchronous IO. The
//! bundled `decoder` binary reconstructs human-readable lines offline by
//! joining the compact records back with their static metadata.
//!
//! ```no_run
//! nanolog::install(nanolog::generated::demo::SITES).unwrap();
//! nanolog::preallocate();
//! nanolog::generated::demo::log_backup_started(4096);
//! nanolog::sync();
//! ```

#![cfg_attr(test, deny(warnings))]
#![deny(unsafe_code)]

pub mod config;
pub mod cycles;
pub mod decoder;
pub mod generated;

mod logger;
mod staging;
mod writer;

pub use config::print_config;
pub use decoder::Decoder;
pub use generated::install;
pub use logger::{
    finish_alloc, preallocate, print_stats, reserve_alloc, set_log_file, shutdown,
    stage_record, stats, sync, Stats,
};
pub use staging::StagingBuffer;
