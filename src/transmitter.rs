//! The background drain loop between the spool and the wire.
//!
//! A transmitter owns a small pool of worker threads -- one by default --
//! each running the same loop: peek a committed transmission, drop it if its
//! retry deadline has passed, otherwise POST it and let the delivery verdict
//! decide between delete, permanent drop and release-for-retry. Failures
//! back off exponentially; an empty spool backs off too, so neither a dead
//! endpoint nor a quiet application burns a core.
//!
//! The loop never terminates on error. Result variants are the control
//! flow; `catch_unwind` at the loop boundary is defense-in-depth against
//! bugs, not a mechanism anything should rely on.

use mio;
use sender::{Delivery, HttpSender};
use spool::Spool;
use std::cmp;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thread;
use thread::Stoppable;
use time;
use time::Clock;

/// Total transmissions delivered and deleted.
pub static TRANSMITTER_DELIVERED: AtomicUsize = AtomicUsize::new(0);
/// Total retryable failures observed.
pub static TRANSMITTER_RETRIES: AtomicUsize = AtomicUsize::new(0);
/// Total transmissions dropped past their retry deadline.
pub static TRANSMITTER_DROP_DEADLINE: AtomicUsize = AtomicUsize::new(0);
/// Total transmissions dropped on permanent server rejection.
pub static TRANSMITTER_DROP_PERMANENT: AtomicUsize = AtomicUsize::new(0);
/// Total panics caught at the loop boundary.
pub static TRANSMITTER_PANICS: AtomicUsize = AtomicUsize::new(0);

/// Floor for the idle poll period. The configured interval may be lower but
/// an empty spool must never spin.
const MIN_SENDING_INTERVAL_MS: u64 = 50;

/// How often an idle transmitter lets the spool garbage collect.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// What one drain pass accomplished.
enum Outcome {
    /// A transmission was posted and its file deleted.
    Delivered,
    /// A transmission was discarded: deadline passed or permanent rejection.
    Dropped,
    /// Nothing sendable in the spool.
    Idle,
    /// A retryable failure; the file stays for a later pass.
    Failed,
}

/// The long-running drainer. Construction spawns the workers; `shutdown`
/// stops them with a bounded grace.
pub struct Transmitter {
    workers: Vec<thread::ThreadHandle>,
}

impl Transmitter {
    /// Spawn `config.workers` drain workers over `spool`, delivering through
    /// `sender`.
    pub fn new(
        spool: Spool,
        sender: Arc<HttpSender>,
        clock: Arc<Clock>,
        config: ::config::TransmitterConfig,
    ) -> Transmitter {
        let interval_ms = cmp::max(config.sending_interval_ms, MIN_SENDING_INTERVAL_MS);
        let workers = (0..cmp::max(config.workers, 1))
            .map(|_| {
                let spool = spool.clone();
                let sender = Arc::clone(&sender);
                let clock = Arc::clone(&clock);
                thread::spawn(move |poll| {
                    drain_loop(poll, &spool, &*sender, &*clock, interval_ms);
                })
            })
            .collect();
        Transmitter { workers: workers }
    }
}

impl Stoppable for Transmitter {
    fn join(self) {
        for worker in self.workers {
            worker.join();
        }
    }

    fn shutdown(self) {
        for worker in self.workers {
            worker.shutdown();
        }
    }
}

fn drain_loop(
    poll: mio::Poll,
    spool: &Spool,
    sender: &HttpSender,
    clock: &Clock,
    interval_ms: u64,
) {
    let mut events = mio::Events::with_capacity(4);
    let mut idle_attempts: u32 = 0;
    let mut failures: u32 = 0;
    let mut wait_ms: u64 = 0;
    loop {
        // The wait doubles as the shutdown observation point: dispose flips
        // the SYSTEM readiness and the poll returns early.
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(wait_ms))) {
            warn!("transmitter poll failed: {}", e);
        }
        if events.iter().any(|ev| ev.token() == ::constants::SYSTEM) {
            trace!("transmitter observed shutdown");
            return;
        }

        let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            drain_once(spool, sender, clock)
        }));
        wait_ms = match outcome {
            Ok(Outcome::Delivered) => {
                idle_attempts = 0;
                failures = 0;
                0
            }
            Ok(Outcome::Dropped) => {
                // a drop is not evidence the endpoint recovered; keep any
                // backoff we owe but drain the next file promptly
                idle_attempts = 0;
                time::backoff_ms(failures)
            }
            Ok(Outcome::Idle) => {
                idle_attempts = idle_attempts.saturating_add(1);
                spool.gc_if_due(GC_INTERVAL);
                cmp::max(interval_ms, time::delay_ms(idle_attempts))
            }
            Ok(Outcome::Failed) => {
                idle_attempts = 0;
                failures = failures.saturating_add(1);
                time::backoff_ms(failures)
            }
            Err(_) => {
                TRANSMITTER_PANICS.fetch_add(1, Ordering::Relaxed);
                error!("transmitter drain pass panicked; continuing");
                interval_ms
            }
        };
    }
}

fn drain_once(spool: &Spool, sender: &HttpSender, clock: &Clock) -> Outcome {
    let handle = match spool.peek() {
        Some(handle) => handle,
        None => return Outcome::Idle,
    };

    let deadline_secs = spool.config().retry_deadline_secs;
    let age_secs = clock
        .now_utc()
        .signed_duration_since(handle.transmission().created_at_utc())
        .num_seconds();
    if age_secs >= deadline_secs as i64 {
        TRANSMITTER_DROP_DEADLINE.fetch_add(1, Ordering::Relaxed);
        warn!(
            "send.drop.deadline: {} is {}s old, deadline {}s",
            handle.name(),
            age_secs,
            deadline_secs
        );
        spool.delete(handle);
        return Outcome::Dropped;
    }

    match sender.post(handle.transmission()) {
        Delivery::Delivered => {
            TRANSMITTER_DELIVERED.fetch_add(1, Ordering::Relaxed);
            trace!("delivered {}", handle.name());
            spool.delete(handle);
            Outcome::Delivered
        }
        Delivery::Rejected(status) => {
            TRANSMITTER_DROP_PERMANENT.fetch_add(1, Ordering::Relaxed);
            warn!(
                "send.drop.permanent: receiver rejected {} with status {}",
                handle.name(),
                status
            );
            spool.delete(handle);
            Outcome::Dropped
        }
        Delivery::Retryable(reason) => {
            TRANSMITTER_RETRIES.fetch_add(1, Ordering::Relaxed);
            info!("send.retry: {} not delivered: {}", handle.name(), reason);
            spool.release(handle);
            Outcome::Failed
        }
    }
}

#[cfg(test)]
mod test {
    extern crate tempdir;

    use self::tempdir::TempDir;
    use super::*;
    use chrono::offset::Utc;
    use config::{SpoolConfig, TransmitterConfig};
    use sender::Delivery;
    use spool::EnqueueResult;
    use std::fs as stdfs;
    use std::sync::Mutex;
    use std::thread as stdthread;
    use std::time::Instant;
    use time::Fixed;
    use transmission::Transmission;
    use url::Url;

    /// A sender that replays a script, then repeats its final entry.
    struct Scripted {
        script: Mutex<Vec<Delivery>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut script: Vec<Delivery>) -> Scripted {
            script.reverse();
            Scripted {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl HttpSender for Scripted {
        fn post(&self, _: &Transmission) -> Delivery {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop().unwrap()
            } else {
                script[0].clone()
            }
        }
    }

    fn seeded_spool(dir: &TempDir) -> Spool {
        let spool = Spool::open(dir.path().to_path_buf(), SpoolConfig::default())
            .expect("spool open failed");
        let t = Transmission::new(
            Url::parse("https://ingest.example.com/v2/track").unwrap(),
            b"payload".to_vec(),
            "application/json",
            "",
            Utc::now(),
        );
        assert_eq!(EnqueueResult::Accepted, spool.enqueue(&t));
        spool
    }

    fn trn_count(dir: &TempDir) -> usize {
        stdfs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_str()
                    .unwrap()
                    .ends_with(".trn")
            })
            .count()
    }

    fn wait_until<F>(limit: Duration, mut pred: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < limit {
            if pred() {
                return true;
            }
            stdthread::sleep(Duration::from_millis(10));
        }
        pred()
    }

    #[test]
    fn delivers_and_deletes() {
        let dir = TempDir::new("courier").unwrap();
        let spool = seeded_spool(&dir);
        let sender = Arc::new(Scripted::new(vec![Delivery::Delivered]));

        let transmitter = Transmitter::new(
            spool,
            Arc::clone(&sender) as Arc<HttpSender>,
            Arc::new(::time::Wall),
            TransmitterConfig::default(),
        );
        assert!(wait_until(Duration::from_secs(5), || trn_count(&dir) == 0));
        transmitter.shutdown();
        assert_eq!(1, sender.calls());
    }

    #[test]
    fn permanent_rejection_drops_without_retry() {
        let dir = TempDir::new("courier").unwrap();
        let spool = seeded_spool(&dir);
        let sender = Arc::new(Scripted::new(vec![Delivery::Rejected(400)]));

        let transmitter = Transmitter::new(
            spool,
            Arc::clone(&sender) as Arc<HttpSender>,
            Arc::new(::time::Wall),
            TransmitterConfig::default(),
        );
        assert!(wait_until(Duration::from_secs(5), || trn_count(&dir) == 0));
        transmitter.shutdown();
        assert_eq!(1, sender.calls());
    }

    #[test]
    fn retryable_failure_leaves_the_file_and_retries() {
        let dir = TempDir::new("courier").unwrap();
        let spool = seeded_spool(&dir);
        let sender = Arc::new(Scripted::new(vec![
            Delivery::Retryable("simulated outage".to_string()),
            Delivery::Delivered,
        ]));

        let transmitter = Transmitter::new(
            spool,
            Arc::clone(&sender) as Arc<HttpSender>,
            Arc::new(::time::Wall),
            TransmitterConfig::default(),
        );
        // first attempt fails; the file must still be committed
        assert!(wait_until(Duration::from_secs(5), || sender.calls() >= 1));
        assert_eq!(1, trn_count(&dir));
        // the retry lands within the first backoff step
        assert!(wait_until(Duration::from_secs(5), || trn_count(&dir) == 0));
        transmitter.shutdown();
        assert!(sender.calls() >= 2);
    }

    #[test]
    fn deadline_expired_files_drop_without_a_post() {
        let dir = TempDir::new("courier").unwrap();
        let spool = seeded_spool(&dir);
        let sender = Arc::new(Scripted::new(vec![Delivery::Retryable(
            "should never be consulted".to_string(),
        )]));
        // three hours past the enqueue, one past the deadline
        let clock = Arc::new(Fixed::new(Utc::now() + ::chrono::Duration::hours(3)));

        let transmitter = Transmitter::new(
            spool,
            Arc::clone(&sender) as Arc<HttpSender>,
            clock,
            TransmitterConfig::default(),
        );
        assert!(wait_until(Duration::from_secs(5), || trn_count(&dir) == 0));
        transmitter.shutdown();
        assert_eq!(0, sender.calls());
    }

    #[test]
    fn shutdown_returns_promptly_when_idle() {
        let dir = TempDir::new("courier").unwrap();
        let spool = Spool::open(dir.path().to_path_buf(), SpoolConfig::default())
            .expect("spool open failed");
        let sender = Arc::new(Scripted::new(vec![Delivery::Delivered]));
        let transmitter = Transmitter::new(
            spool,
            sender as Arc<HttpSender>,
            Arc::new(::time::Wall),
            TransmitterConfig::default(),
        );
        let start = Instant::now();
        transmitter.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
