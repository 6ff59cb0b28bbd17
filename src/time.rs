//! Collection of time utilities for courier
//!
//! Courier cares about two clocks: the wall clock that stamps transmissions
//! and ages spool files, and the thread-delay helpers that keep idle and
//! failing workers from spinning. The wall clock hides behind the `Clock`
//! trait so tests can bend time without touching the disk or the scheduler.

use chrono::DateTime;
use chrono::offset::Utc;
use std::sync::Mutex;
use std::{thread, time};

/// A source of UTC wall-clock time.
///
/// Production code uses `Wall`. Tests inject `Fixed` to simulate clock skew,
/// retention expiry and retry deadlines without sleeping.
pub trait Clock: Send + Sync {
    /// The current moment, UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wall;

impl Clock for Wall {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock. PUBLIC primarily for testing and simulation; production
/// wiring has no reason to prefer it over `Wall`.
#[derive(Debug)]
pub struct Fixed {
    now: Mutex<DateTime<Utc>>,
}

impl Fixed {
    /// Create a `Fixed` clock pinned to the given moment.
    pub fn new(now: DateTime<Utc>) -> Fixed {
        Fixed {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to a new moment. Time may flow backward; courier has
    /// to cope with that on real hosts too.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("Fixed clock poisoned") = now;
    }
}

impl Clock for Fixed {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("Fixed clock poisoned")
    }
}

/// Look up the millisecond pause for a given number of attempts.
///
/// An attempt count of X maps to:
///
/// - 0 = 0 ms
/// - x, x >= 9 = 512 ms
/// - x, x < 9 = 2**x ms
#[inline]
pub fn delay_ms(attempts: u32) -> u64 {
    match attempts {
        0 => 0,
        1 => 1,
        2 => 4,
        3 => 8,
        4 => 16,
        5 => 32,
        6 => 64,
        7 => 128,
        8 => 256,
        _ => 512,
    }
}

/// Pause a thread of execution
///
/// This function pauses the thread of execution for a fixed number of
/// attempts. That input, attempts, is used to exponentially increase the
/// length of delay, from 0 milliseconds to 512. See `delay_ms` for the table.
#[inline]
pub fn delay(attempts: u32) {
    let delay = delay_ms(attempts);
    if delay == 0 {
        return;
    }
    let sleep_time = time::Duration::from_millis(delay);
    thread::sleep(sleep_time);
}

/// Millisecond backoff for delivery failures: 1s doubling up to a 60s cap,
/// reset by the caller on any success.
#[inline]
pub fn backoff_ms(failures: u32) -> u64 {
    if failures == 0 {
        return 0;
    }
    let exp = if failures - 1 > 6 { 6 } else { failures - 1 };
    let ms = 1_000u64 << exp;
    if ms > 60_000 {
        60_000
    } else {
        ms
    }
}
