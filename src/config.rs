//! Compile-time configuration knobs.
//!
//! Everything here is fixed at build time so the hot path compiles down to
//! constants. Runtime-tunable state (the output file path) lives on the
//! logger instead.

/// Capacity in bytes of each per-thread staging buffer.
pub const STAGING_BUFFER_SIZE: usize = 1 << 20;

/// Capacity in bytes of each of the two output buffers the background
/// thread alternates between. MUST be a multiple of `FILE_ALIGNMENT_BYTES`.
pub const OUTPUT_BUFFER_SIZE: usize = 1 << 22;

/// How long the background thread sleeps on its condition variable when a
/// full pass over the staging buffers found no work, in microseconds.
pub const POLL_INTERVAL_NO_WORK_US: u64 = 100;

/// Number of buffered output bytes that triggers an early rotation of the
/// output buffers, ahead of the current one filling completely.
pub const POLL_INTERVAL_BYTES: usize = OUTPUT_BUFFER_SIZE / 2;

/// Output submissions are zero-padded to a multiple of this many bytes.
pub const FILE_ALIGNMENT_BYTES: usize = 512;

/// Log file opened on first use, before any call to `set_log_file`.
pub const DEFAULT_LOG_FILE: &str = "./compressedLog";

const _: () = assert!(FILE_ALIGNMENT_BYTES.is_power_of_two());
const _: () = assert!(OUTPUT_BUFFER_SIZE % FILE_ALIGNMENT_BYTES == 0);
const _: () = assert!(STAGING_BUFFER_SIZE >= 4096);
const _: () = assert!(POLL_INTERVAL_BYTES <= OUTPUT_BUFFER_SIZE);

/// Print the build-time configuration to stdout.
pub fn print_config() {
    println!("==== configuration ====");
    println!("staging buffer size:   {} B", STAGING_BUFFER_SIZE);
    println!("output buffer size:    {} B", OUTPUT_BUFFER_SIZE);
    println!("idle poll interval:    {} us", POLL_INTERVAL_NO_WORK_US);
    println!("rotation high-water:   {} B", POLL_INTERVAL_BYTES);
    println!("file alignment:        {} B", FILE_ALIGNMENT_BYTES);
    println!("default log file:      {}", DEFAULT_LOG_FILE);
    if cfg!(all(feature = "aio", target_family = "unix")) {
        println!("output mode:           posix aio");
    } else {
        println!("output mode:           synchronous write");
    }
}
