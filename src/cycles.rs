//! Cycle counter and ordering fences for the staging buffer protocol.

use std::sync::atomic::{fence, Ordering};

use lazy_static::lazy_static;

/// Reads a monotonically non-decreasing 64-bit cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
#[allow(unsafe_code)]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Reads a monotonically non-decreasing 64-bit cycle counter.
///
/// On non-x86 targets this counts nanoseconds of monotonic clock instead of
/// CPU cycles; callers only rely on monotonicity and a stable rate.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    lazy_static! {
        static ref BASE: std::time::Instant = std::time::Instant::now();
    }
    BASE.elapsed().as_nanos() as u64
}

/// Store fence: prior stores become visible before any later store.
#[inline(always)]
pub fn sfence() {
    fence(Ordering::Release);
}

/// Load fence: prior loads complete before any later memory operation.
#[inline(always)]
pub fn lfence() {
    fence(Ordering::Acquire);
}

/// Estimated counter ticks per second, measured once on first use.
pub fn cycles_per_second() -> f64 {
    lazy_static! {
        static ref HZ: f64 = calibrate();
    }
    *HZ
}

fn calibrate() -> f64 {
    let t0 = rdtsc();
    let wall = std::time::Instant::now();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let ticks = rdtsc().wrapping_sub(t0) as f64;
    let elapsed = wall.elapsed().as_secs_f64();
    ticks / elapsed
}

/// Converts a tick delta from `rdtsc` into seconds.
pub fn to_seconds(ticks: u64) -> f64 {
    ticks as f64 / cycles_per_second()
}
