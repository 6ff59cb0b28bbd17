//! The producer-facing façade.
//!
//! A `Channel` is what an application holds: it accepts items on any thread,
//! stamps them with the channel's common context, assembles the gzip'd JSON
//! payload and hands the result to the spool, all off the producer's
//! critical path. One assembly worker drains a queue fed by `send`, which
//! preserves per-channel FIFO without ever blocking producers on each other.
//!
//! Two environment switches are honored at construction:
//!
//! * `COURIER_TELEMETRY_OPTOUT=true` disables the channel outright; `send`
//!   becomes a no-op and no worker or transmitter is spawned.
//! * `COURIER_TELEMETRY_FILE=<path>` routes items to a debug file sink in
//!   place of the spool and transmitter.

use config::ChannelConfig;
use debug::FileSink;
use flate2::Compression;
use flate2::write::GzEncoder;
use fs;
use sender;
use sender::HttpSender;
use serde_json;
use spool::Spool;
use std::collections::HashMap;
use std::env;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use telemetry::Item;
use thread::Stoppable;
use time;
use time::Clock;
use transmission::Transmission;
use transmitter::Transmitter;
use url::Url;
use uuid::Uuid;

/// Environment variable that disables telemetry when set to `true` or `1`.
pub const OPTOUT_ENV: &'static str = "COURIER_TELEMETRY_OPTOUT";
/// Environment variable that redirects telemetry to a debug file sink.
pub const FILE_ENV: &'static str = "COURIER_TELEMETRY_FILE";

/// Total items accepted by some channel's `send`.
pub static CHANNEL_SENDS: AtomicUsize = AtomicUsize::new(0);
/// Total items discarded because the channel was disabled or disposed.
pub static CHANNEL_SENDS_DISCARDED: AtomicUsize = AtomicUsize::new(0);
/// Total items lost to payload serialization or compression failures.
pub static CHANNEL_SERIALIZE_FAILURES: AtomicUsize = AtomicUsize::new(0);

lazy_static! {
    static ref MACHINE: String = machine_name();
}

fn machine_name() -> String {
    env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_spool_dir() -> PathBuf {
    env::temp_dir().join("courier-spool")
}

fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

enum Inner {
    /// Opted out: accept and discard.
    Disabled,
    /// Debug file sink in place of the durable pipeline.
    Debug {
        sink: FileSink,
        common: HashMap<String, String>,
    },
    /// The durable pipeline: assembly worker, spool, transmitter.
    Live(Live),
}

struct Live {
    queue: Mutex<Option<mpsc::Sender<Item>>>,
    pending: Arc<AtomicUsize>,
    worker: Option<thread::JoinHandle<()>>,
    transmitter: Option<Transmitter>,
}

/// The telemetry channel an application embeds.
///
/// `send` may be called from any thread. `dispose` quiesces the channel:
/// queued items are still assembled and spooled, then the transmitter is
/// shut down with its usual grace. Dropping an undisposed channel disposes
/// it.
pub struct Channel {
    inner: Inner,
}

impl Channel {
    /// Build a channel per `config`, honoring the environment switches, with
    /// the host filesystem, wall clock and HTTP stack.
    pub fn new(config: ChannelConfig) -> Result<Channel, String> {
        let timeout = Duration::from_secs(config.transmitter.request_timeout_secs);
        let sender = Arc::new(sender::HttpPoster::new(timeout)?);
        Channel::wired(
            config,
            sender,
            Arc::new(time::Wall),
            env::var(OPTOUT_ENV).ok(),
            env::var(FILE_ENV).ok(),
        )
    }

    /// Build a channel with an injected sender and clock. The environment
    /// switches still apply; this is the constructor integration tests and
    /// exotic embeddings use.
    pub fn with_transport(
        config: ChannelConfig,
        sender: Arc<HttpSender>,
        clock: Arc<Clock>,
    ) -> Result<Channel, String> {
        Channel::wired(
            config,
            sender,
            clock,
            env::var(OPTOUT_ENV).ok(),
            env::var(FILE_ENV).ok(),
        )
    }

    fn wired(
        config: ChannelConfig,
        sender: Arc<HttpSender>,
        clock: Arc<Clock>,
        optout: Option<String>,
        debug_file: Option<String>,
    ) -> Result<Channel, String> {
        let common = common_context(&config);

        if optout
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
        {
            info!("telemetry opt-out is set; channel disabled");
            return Ok(Channel {
                inner: Inner::Disabled,
            });
        }

        if let Some(path) = debug_file {
            info!("telemetry redirected to debug sink {}", path);
            let sink = FileSink::new(&PathBuf::from(path))?;
            return Ok(Channel {
                inner: Inner::Debug {
                    sink: sink,
                    common: common,
                },
            });
        }

        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| format!("bad endpoint {:?}: {}", config.endpoint, e))?;
        let dir = config
            .spool_dir
            .clone()
            .unwrap_or_else(default_spool_dir);
        let spool = Spool::new(
            dir,
            config.spool.clone(),
            Arc::new(fs::Disk),
            Arc::clone(&clock),
        )?;
        let transmitter = Transmitter::new(
            spool.clone(),
            sender,
            Arc::clone(&clock),
            config.transmitter.clone(),
        );

        let pending = Arc::new(AtomicUsize::new(0));
        let (queue, feed) = mpsc::channel();
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name("courier-channel".to_string())
            .spawn(move || {
                assembly_loop(feed, spool, endpoint, common, clock, worker_pending);
            })
            .map_err(|e| format!("could not spawn channel worker: {}", e))?;

        Ok(Channel {
            inner: Inner::Live(Live {
                queue: Mutex::new(Some(queue)),
                pending: pending,
                worker: Some(worker),
                transmitter: Some(transmitter),
            }),
        })
    }

    /// Accept one item. Returns immediately; assembly, spooling and
    /// delivery all happen on background workers. Items sent after
    /// `dispose` are discarded.
    pub fn send<I>(&self, item: I)
    where
        I: Into<Item>,
    {
        let item = item.into();
        match self.inner {
            Inner::Disabled => {
                CHANNEL_SENDS_DISCARDED.fetch_add(1, Ordering::Relaxed);
            }
            Inner::Debug {
                ref sink,
                ref common,
            } => {
                CHANNEL_SENDS.fetch_add(1, Ordering::Relaxed);
                sink.deliver(&item.into_envelope(common));
            }
            Inner::Live(ref live) => {
                live.pending.fetch_add(1, Ordering::SeqCst);
                let queue = live.queue.lock().expect("channel queue poisoned");
                let sent = match *queue {
                    Some(ref queue) => queue.send(item).is_ok(),
                    None => false,
                };
                if sent {
                    CHANNEL_SENDS.fetch_add(1, Ordering::Relaxed);
                } else {
                    live.pending.fetch_sub(1, Ordering::SeqCst);
                    CHANNEL_SENDS_DISCARDED.fetch_add(1, Ordering::Relaxed);
                    debug!("send after dispose discarded");
                }
            }
        }
    }

    /// Block until every item accepted so far has reached the spool, or
    /// until `timeout` elapses. Reaching the deadline is not an error and is
    /// not signalled.
    pub fn flush(&self, timeout: Duration) {
        let cancel = AtomicBool::new(false);
        self.flush_async(timeout, &cancel);
    }

    /// `flush` with a cancellation hook: returns when the send queue is
    /// idle, the timeout elapses or `cancel` becomes true, whichever is
    /// first. Never raises.
    pub fn flush_async(&self, timeout: Duration, cancel: &AtomicBool) {
        let live = match self.inner {
            Inner::Live(ref live) => live,
            Inner::Disabled => return,
            Inner::Debug { ref sink, .. } => {
                sink.flush();
                return;
            }
        };
        let start = Instant::now();
        let mut attempts: u32 = 0;
        while live.pending.load(Ordering::SeqCst) != 0 {
            if start.elapsed() >= timeout || cancel.load(Ordering::SeqCst) {
                return;
            }
            attempts = attempts.saturating_add(1);
            time::delay(attempts);
        }
    }

    /// Quiesce the channel: stop accepting sends, assemble and spool
    /// everything already queued, then shut the transmitter down. Idempotent.
    pub fn dispose(&mut self) {
        if let Inner::Live(ref mut live) = self.inner {
            {
                let mut queue = live.queue.lock().expect("channel queue poisoned");
                *queue = None;
            }
            if let Some(worker) = live.worker.take() {
                if worker.join().is_err() {
                    error!("channel worker panicked before dispose");
                }
            }
            if let Some(transmitter) = live.transmitter.take() {
                transmitter.shutdown();
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn common_context(config: &ChannelConfig) -> HashMap<String, String> {
    let mut common = HashMap::new();
    common.insert("machine".to_string(), MACHINE.clone());
    common.insert("os".to_string(), env::consts::OS.to_string());
    common.insert(
        "process_id".to_string(),
        ::std::process::id().to_string(),
    );
    common.insert(
        "session_id".to_string(),
        Uuid::new_v4().simple().to_string(),
    );
    for (key, value) in &config.common_properties {
        common.insert(key.clone(), value.clone());
    }
    common
}

fn assembly_loop(
    feed: mpsc::Receiver<Item>,
    spool: Spool,
    endpoint: Url,
    common: HashMap<String, String>,
    clock: Arc<Clock>,
    pending: Arc<AtomicUsize>,
) {
    while let Ok(item) = feed.recv() {
        assemble_one(item, &spool, &endpoint, &common, &*clock);
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    trace!("channel queue closed, assembly worker exiting");
}

fn assemble_one(
    item: Item,
    spool: &Spool,
    endpoint: &Url,
    common: &HashMap<String, String>,
    clock: &Clock,
) {
    let envelope = item.into_envelope(common);
    let json = match serde_json::to_vec(&envelope) {
        Ok(json) => json,
        Err(e) => {
            CHANNEL_SERIALIZE_FAILURES.fetch_add(1, Ordering::Relaxed);
            warn!("could not serialize envelope {}: {}", envelope.id, e);
            return;
        }
    };
    let body = match gzip(&json) {
        Ok(body) => body,
        Err(e) => {
            CHANNEL_SERIALIZE_FAILURES.fetch_add(1, Ordering::Relaxed);
            warn!("could not compress envelope {}: {}", envelope.id, e);
            return;
        }
    };
    let transmission = Transmission::new(
        endpoint.clone(),
        body,
        "application/json",
        "gzip",
        clock.now_utc(),
    );
    // drops are counted and logged inside the spool
    let _ = spool.enqueue(&transmission);
}

#[cfg(test)]
mod test {
    extern crate tempdir;

    use self::tempdir::TempDir;
    use super::*;
    use config::ChannelConfig;
    use sender::Delivery;
    use std::fs as stdfs;
    use telemetry::Telemetry;
    use transmission::Transmission;

    /// A sender that refuses everything; files stay spooled.
    struct Unreachable;

    impl HttpSender for Unreachable {
        fn post(&self, _: &Transmission) -> Delivery {
            Delivery::Retryable("unreachable".to_string())
        }
    }

    fn live_config(dir: &TempDir) -> ChannelConfig {
        let mut config = ChannelConfig::default();
        config.endpoint = "https://ingest.example.com/v2/track".to_string();
        config.spool_dir = Some(dir.path().to_path_buf());
        config
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

    #[test]
    fn each_send_commits_one_trn() {
        let dir = TempDir::new("courier").unwrap();
        let mut channel = Channel::wired(
            live_config(&dir),
            Arc::new(Unreachable),
            Arc::new(::time::Wall),
            None,
            None,
        ).expect("channel failed");

        for idx in 0..4 {
            channel.send(Telemetry::new(format!("event.{}", idx)));
        }
        channel.flush(Duration::from_secs(10));
        assert_eq!(4, trn_count(&dir));
        channel.dispose();
    }

    #[test]
    fn concurrent_producers_each_commit_once() {
        use std::thread as stdthread;

        let dir = TempDir::new("courier").unwrap();
        let channel = Arc::new(
            Channel::wired(
                live_config(&dir),
                Arc::new(Unreachable),
                Arc::new(::time::Wall),
                None,
                None,
            ).expect("channel failed"),
        );

        let max_thrs = 8;
        let per_thread = 8;
        let mut joins = Vec::new();
        for thr in 0..max_thrs {
            let thr_channel = Arc::clone(&channel);
            joins.push(stdthread::spawn(move || {
                for idx in 0..per_thread {
                    thr_channel.send(Telemetry::new(format!("event.{}.{}", thr, idx)));
                }
            }));
        }
        for jh in joins {
            jh.join().expect("producer panicked");
        }
        channel.flush(Duration::from_secs(10));
        assert_eq!(max_thrs * per_thread, trn_count(&dir));
    }

    #[test]
    fn optout_disables_everything() {
        let dir = TempDir::new("courier").unwrap();
        let mut channel = Channel::wired(
            live_config(&dir),
            Arc::new(Unreachable),
            Arc::new(::time::Wall),
            Some("true".to_string()),
            None,
        ).expect("channel failed");

        channel.send(Telemetry::new("discarded"));
        channel.flush(Duration::from_secs(1));
        assert_eq!(0, trn_count(&dir));
        channel.dispose();
    }

    #[test]
    fn debug_file_replaces_the_pipeline() {
        let dir = TempDir::new("courier").unwrap();
        let sink_path = dir.path().join("debug.jsonl");
        let mut channel = Channel::wired(
            live_config(&dir),
            Arc::new(Unreachable),
            Arc::new(::time::Wall),
            None,
            Some(sink_path.to_str().unwrap().to_string()),
        ).expect("channel failed");

        channel.send(Telemetry::new("routed"));
        channel.flush(Duration::from_secs(1));
        channel.dispose();

        assert_eq!(0, trn_count(&dir));
        let raw = stdfs::read_to_string(&sink_path).unwrap();
        assert_eq!(1, raw.lines().count());
        assert!(raw.contains("routed"));
    }

    #[test]
    fn sends_after_dispose_are_discarded() {
        let dir = TempDir::new("courier").unwrap();
        let mut channel = Channel::wired(
            live_config(&dir),
            Arc::new(Unreachable),
            Arc::new(::time::Wall),
            None,
            None,
        ).expect("channel failed");

        channel.send(Telemetry::new("kept"));
        channel.flush(Duration::from_secs(10));
        channel.dispose();
        channel.send(Telemetry::new("dropped"));
        assert_eq!(1, trn_count(&dir));
    }

    #[test]
    fn flush_respects_cancellation() {
        let dir = TempDir::new("courier").unwrap();
        let channel = Channel::wired(
            live_config(&dir),
            Arc::new(Unreachable),
            Arc::new(::time::Wall),
            None,
            None,
        ).expect("channel failed");

        let cancel = AtomicBool::new(true);
        let start = Instant::now();
        // even with nothing pending this must return at once, not sleep
        channel.flush_async(Duration::from_secs(30), &cancel);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
