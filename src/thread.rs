//! Mio enabled threading library.
//!
//! Courier's background workers -- the transmitter drain loops and the
//! channel assembly worker -- are plain OS threads that poll a
//! `mio::Registration` for their stop signal. A worker that is waiting out a
//! delivery backoff polls with a timeout and so observes shutdown promptly
//! instead of sleeping through it.

use constants;
use mio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Mio enabled thread state.
pub struct ThreadHandle {
    /// JoinHandle for the executing thread.
    pub handle: thread::JoinHandle<()>,

    /// Readiness signal used to notify the given thread when an event is
    /// ready to be consumed on the SYSTEM channel.
    readiness: mio::SetReadiness,

    /// Set by the worker as its very last act, consulted by `shutdown` to
    /// bound the wait for a wedged thread.
    exited: Arc<AtomicBool>,
}

/// Trait for stoppable processes.
pub trait Stoppable {
    /// Join the given process, blocking until it exits.
    fn join(self) -> ();

    /// Gracefully shutdown the process, blocking until exit or until the
    /// shutdown grace expires.
    fn shutdown(self) -> ();
}

impl Stoppable for ThreadHandle {
    /// Join the given Thread, blocking until it exits.
    fn join(self) {
        self.handle.join().expect("Failed to join child thread!");
    }

    /// Gracefully shutdown the given Thread, blocking until it exits or
    /// until `constants::SHUTDOWN_GRACE` has elapsed.
    ///
    /// Note - It is the responsibility of the worker to poll for events
    /// occurring on the SYSTEM token. A worker that fails to observe the
    /// signal within the grace is abandoned, not killed; it keeps running
    /// detached until its current operation completes.
    fn shutdown(self) {
        let _ = self.readiness.set_readiness(mio::Ready::readable());
        let start = Instant::now();
        while !self.exited.load(Ordering::Acquire) {
            if start.elapsed() >= constants::SHUTDOWN_GRACE {
                warn!("worker thread ignored shutdown for {:?}, abandoning", constants::SHUTDOWN_GRACE);
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.join();
    }
}

/// Spawns a new thread executing the provided closure.
pub fn spawn<F>(f: F) -> ThreadHandle
where
    F: Send + 'static + FnOnce(mio::Poll) -> (),
{
    let poller = mio::Poll::new().expect("Failed to create poller");
    let (registration, readiness) = mio::Registration::new2();
    let exited = Arc::new(AtomicBool::new(false));
    let thread_exited = Arc::clone(&exited);

    ThreadHandle {
        readiness: readiness,
        exited: exited,

        handle: thread::spawn(move || {
            poller
                .register(
                    &registration,
                    constants::SYSTEM,
                    mio::Ready::readable(),
                    mio::PollOpt::edge(),
                )
                .expect("Failed to register system pipe");

            f(poller);
            thread_exited.store(true, Ordering::Release);
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mio;
    use std::time::Duration;

    #[test]
    fn shutdown_wakes_a_polling_worker() {
        let handle = spawn(|poll: mio::Poll| {
            let mut events = mio::Events::with_capacity(4);
            loop {
                poll.poll(&mut events, Some(Duration::from_millis(500)))
                    .expect("poll failed");
                if events.iter().any(|ev| ev.token() == ::constants::SYSTEM) {
                    return;
                }
            }
        });
        handle.shutdown();
    }

    #[test]
    fn join_waits_for_natural_exit() {
        let handle = spawn(|_poll| ());
        handle.join();
    }
}
