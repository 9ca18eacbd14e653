// vim: tw=80
//! Common utility functions used throughout raidgen

use std::ops::{Add, Div, Rem, Sub};

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Round `x` down to a multiple of `m`
pub fn round_down<T>(x: T, m: T) -> T
    where T: Copy + Rem<Output=T> + Sub<Output=T>
{
    x - x % m
}

/// Find the largest `n` in `1..=max` for which `pred(n)` holds.
///
/// `pred` must be monotone: if it holds for `n` then it holds for every smaller
/// `n`.  Returns `None` if it doesn't even hold for 1.
pub fn largest_prefix<F>(max: u64, mut pred: F) -> Option<u64>
    where F: FnMut(u64) -> bool
{
    if max == 0 || !pred(1) {
        return None;
    }
    let (mut lo, mut hi) = (1u64, max);
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if pred(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Some(lo)
}

/// Length of the intersection of two half-open ranges, expressed as
/// `(start, len)` pairs
pub fn overlap(a: (u64, u64), b: (u64, u64)) -> u64 {
    let start = a.0.max(b.0);
    let end = (a.0 + a.1).min(b.0 + b.1);
    end.saturating_sub(start)
}

// LCOV_EXCL_START
#[cfg(test)]
/// Helper to generate the runtime used by most unit tests
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
