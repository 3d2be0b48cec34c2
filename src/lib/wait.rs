//! Polling helpers for counters published by the remote side.

use std::hint;
use std::thread;
use std::time::Duration;

use crate::config::WaitPolicy;

const BUSY_WAIT_ORDER: u32 = 4;
const BASE_SLEEP_US: u64 = 10;

/// Back off once. `iter` counts the polls done so far by the caller.
///
/// With `Relax`, the first 2^4 polls only yield; after that the thread sleeps
/// 10us, doubling the sleep each time `iter` crosses a power of two.
pub fn relax(policy: WaitPolicy, iter: &mut u32) {
    *iter = iter.wrapping_add(1);
    match policy {
        WaitPolicy::Spin => hint::spin_loop(),
        WaitPolicy::Relax => {
            if *iter < (1 << BUSY_WAIT_ORDER) {
                thread::yield_now();
                return;
            }
            let last_bit = 32 - iter.leading_zeros();
            let shift = (last_bit - BUSY_WAIT_ORDER - 1).min(16);
            thread::sleep(Duration::from_micros(BASE_SLEEP_US << shift));
        }
    }
}

/// Wraparound-safe "has `current` reached `target`" for 32-bit sequence
/// numbers: true while `current - target` is below half the range.
pub fn seqno_reached(current: u32, target: u32) -> bool {
    current.wrapping_sub(target) < 0x8000_0000
}

/// Poll `done` until it returns true, backing off between polls.
pub fn poll_until(policy: WaitPolicy, mut done: impl FnMut() -> bool) {
    let mut iter = 0;
    while !done() {
        relax(policy, &mut iter);
    }
}
