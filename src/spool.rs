//! The durable, directory-backed transmission queue.
//!
//! The spool is where courier earns its keep. Producers enqueue
//! transmissions; the transmitter peeks, posts and deletes them. Everything
//! in between -- process crashes, concurrent processes sharing the
//! directory, torn writes, corrupted files, full disks, permission trouble
//! and clocks that lie -- is the spool's problem, and its answer everywhere
//! is the same: never raise to the caller, log, and lean on the filesystem's
//! rename/unlink atomicity.
//!
//! # Inside Baseball
//!
//! A spool is one flat directory. A file's extension is its state:
//!
//! ```text
//! spool-dir/
//!    f81d4fae7dec11d0a76500a0c91e6bf6.tmp          <- in-progress write
//!    20260107120501_bf2c41f0[..].trn               <- committed, sendable
//!    20260107115958_90ad31c2[..].corrupt           <- quarantined
//! ```
//!
//! Writers serialize into a `.tmp` under a fresh 128-bit random name, then
//! rename to a stamped `.trn` in one atomic step. Readers only ever open
//! `.trn` files, so a reader never observes a half-written frame: the file
//! is either whole or it does not exist yet. The random suffix makes names
//! unique across processes without coordination; the stamp prefix orders
//! peeks and survives filesystems that refuse to record creation times.
//!
//! ## Won't this fill up my disk?
//!
//! Nope! Admission is capped by total bytes and file count, rechecked
//! against a full directory rescan so the cheap in-memory counters only ever
//! act as hints. Past the caps, enqueues drop. Files that overstay their
//! kind's retention -- committed, quarantined or orphaned-temporary -- are
//! garbage collected.

use config::SpoolConfig;
use fs;
use fs::FileSystem;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use time;
use time::Clock;
use transmission;
use transmission::Transmission;
use uuid::Uuid;

/// Total transmissions accepted into some spool.
pub static SPOOL_ENQUEUE_ACCEPTED: AtomicUsize = AtomicUsize::new(0);
/// Total transmissions dropped at the capacity caps.
pub static SPOOL_ENQUEUE_DROP_CAPACITY: AtomicUsize = AtomicUsize::new(0);
/// Total transmissions dropped to I/O failures.
pub static SPOOL_ENQUEUE_DROP_IO: AtomicUsize = AtomicUsize::new(0);
/// Total files quarantined as corrupt.
pub static SPOOL_QUARANTINED: AtomicUsize = AtomicUsize::new(0);
/// Total files removed by garbage collection.
pub static SPOOL_GC_DELETED: AtomicUsize = AtomicUsize::new(0);

/// How many freshly deleted filenames peek refuses to hand out again.
const RECENTLY_DELETED_CAP: usize = 10;

/// Immediate, back-to-back attempts for deletes hitting sharing violations.
const DELETE_ATTEMPTS: u32 = 3;

/// The verdict on one enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Committed: exactly one `.trn` file now holds the transmission.
    Accepted,
    /// Dropped without writing: the spool is at its byte or file cap.
    DroppedCapacity,
    /// Dropped: an I/O or serialization failure interrupted the write. Any
    /// partial `.tmp` was cleaned up on a best-effort basis.
    DroppedIo,
}

#[derive(Debug)]
struct State {
    in_flight: HashSet<String>,
    recently_deleted: VecDeque<String>,
    storage_size_bytes: u64,
    file_count: usize,
    last_gc: Option<Instant>,
}

/// A transmission checked out by `peek` and not yet resolved.
///
/// Exactly one of `Spool::delete` or `Spool::release` should consume the
/// handle. If neither does -- a worker died mid-send -- dropping the handle
/// releases the in-flight reservation so the file becomes visible to peek
/// again.
pub struct InFlight {
    name: String,
    size: u64,
    transmission: Transmission,
    state: Arc<Mutex<State>>,
    resolved: bool,
}

impl InFlight {
    /// The decoded transmission.
    pub fn transmission(&self) -> &Transmission {
        &self.transmission
    }

    /// The spool filename backing this handle.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.resolved {
            let mut state = self.state.lock().expect("spool state poisoned");
            state.in_flight.remove(&self.name);
        }
    }
}

/// The directory-backed queue. Clones share one spool; hand a clone to the
/// transmitter and keep one for the channel.
#[derive(Clone)]
pub struct Spool {
    dir: PathBuf,
    config: SpoolConfig,
    fs: Arc<FileSystem>,
    clock: Arc<Clock>,
    state: Arc<Mutex<State>>,
}

impl Spool {
    /// Open a spool over `dir` with the host filesystem and wall clock.
    pub fn open(dir: PathBuf, config: SpoolConfig) -> Result<Spool, String> {
        Spool::new(dir, config, Arc::new(fs::Disk), Arc::new(time::Wall))
    }

    /// Open a spool over `dir` with injected seams. The directory is created
    /// if missing and a garbage collection pass is kicked off in the
    /// background shortly after.
    pub fn new(
        dir: PathBuf,
        config: SpoolConfig,
        fs: Arc<FileSystem>,
        clock: Arc<Clock>,
    ) -> Result<Spool, String> {
        fs.create_dir_all(&dir)
            .map_err(|e| format!("could not create spool directory {:?}: {}", dir, e))?;
        let spool = Spool {
            dir: dir,
            config: config,
            fs: fs,
            clock: clock,
            state: Arc::new(Mutex::new(State {
                in_flight: HashSet::new(),
                recently_deleted: VecDeque::with_capacity(RECENTLY_DELETED_CAP),
                storage_size_bytes: 0,
                file_count: 0,
                last_gc: None,
            })),
        };
        let gc_spool = spool.clone();
        let spawned = thread::Builder::new()
            .name("courier-spool-gc".to_string())
            .spawn(move || {
                // let init finish before churning the directory
                thread::sleep(Duration::from_millis(250));
                gc_spool.gc();
            });
        if let Err(e) = spawned {
            warn!("could not spawn initial gc pass: {}", e);
        }
        Ok(spool)
    }

    /// The directory this spool manages.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The spool's configuration.
    pub fn config(&self) -> &SpoolConfig {
        &self.config
    }

    /// Admit one transmission to the spool.
    ///
    /// On `Accepted`, exactly one committed `.trn` file holds the
    /// transmission and the caller is done with it. Every failure mode maps
    /// to a drop; enqueue never raises and never blocks beyond its own I/O.
    pub fn enqueue(&self, transmission: &Transmission) -> EnqueueResult {
        // Counters drift under concurrent writers; a full rescan is the only
        // admission evidence we trust.
        let (total_bytes, total_files) = match self.rescan() {
            Ok(totals) => totals,
            Err(e) => {
                SPOOL_ENQUEUE_DROP_IO.fetch_add(1, Ordering::Relaxed);
                warn!("enqueue.drop.io: spool rescan failed: {}", e);
                return EnqueueResult::DroppedIo;
            }
        };
        {
            let mut state = self.state.lock().expect("spool state poisoned");
            state.storage_size_bytes = total_bytes;
            state.file_count = total_files;
        }
        if total_bytes >= self.config.capacity_bytes || total_files >= self.config.max_files {
            let dropped = SPOOL_ENQUEUE_DROP_CAPACITY.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 0 {
                info!(
                    "enqueue.drop.capacity: {} drops total, spool at {} bytes / {} files",
                    dropped, total_bytes, total_files
                );
            } else {
                debug!("enqueue.drop.capacity: spool full, dropping");
            }
            return EnqueueResult::DroppedCapacity;
        }

        let random = Uuid::new_v4().simple().to_string();
        let tmp_path = self.dir.join(format!("{}.tmp", random));
        if let Err(e) = self.write_tmp(&tmp_path, transmission) {
            SPOOL_ENQUEUE_DROP_IO.fetch_add(1, Ordering::Relaxed);
            warn!("enqueue.drop.io: could not write {:?}: {}", tmp_path, e);
            let _ = self.remove_with_retry(&tmp_path);
            return EnqueueResult::DroppedIo;
        }

        let stamp = self.clock.now_utc().format("%Y%m%d%H%M%S").to_string();
        let final_name = format!("{}_{}.trn", stamp, random);
        let final_path = self.dir.join(&final_name);
        match self.fs.rename(&tmp_path, &final_path) {
            Ok(()) => {
                let size = self.fs.size(&final_path).unwrap_or(0);
                let mut state = self.state.lock().expect("spool state poisoned");
                state.storage_size_bytes = state.storage_size_bytes.saturating_add(size);
                state.file_count = state.file_count.saturating_add(1);
                SPOOL_ENQUEUE_ACCEPTED.fetch_add(1, Ordering::Relaxed);
                trace!("enqueued {}", final_name);
                EnqueueResult::Accepted
            }
            Err(e) => {
                SPOOL_ENQUEUE_DROP_IO.fetch_add(1, Ordering::Relaxed);
                warn!("enqueue.drop.io: could not commit {:?}: {}", final_path, e);
                let _ = self.remove_with_retry(&tmp_path);
                EnqueueResult::DroppedIo
            }
        }
    }

    fn write_tmp(&self, tmp_path: &Path, t: &Transmission) -> Result<(), String> {
        let mut fp = self.fs
            .create_excl(tmp_path)
            .map_err(|e| e.to_string())?;
        transmission::write(t, &mut fp).map_err(|e| e.to_string())
    }

    /// Check out the next sendable transmission, if any.
    ///
    /// Scans up to `peek_scan_limit` committed files, freshest stamp first,
    /// skipping anything already in flight or freshly deleted. A file that
    /// fails to decode is quarantined and the scan continues; a file another
    /// process got to first is skipped. Returns `None` when nothing decodes.
    pub fn peek(&self) -> Option<InFlight> {
        let mut paths = match self.fs.list(&self.dir, "trn") {
            Ok(paths) => paths,
            Err(e) => {
                warn!("peek failed to enumerate {:?}: {}", self.dir, e);
                return None;
            }
        };
        paths.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

        for path in paths.into_iter().take(self.config.peek_scan_limit) {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            {
                // reserve the name before touching the disk so that
                // concurrent workers never double-send one file
                let mut state = self.state.lock().expect("spool state poisoned");
                if state.in_flight.contains(&name)
                    || state.recently_deleted.iter().any(|n| *n == name)
                {
                    continue;
                }
                state.in_flight.insert(name.clone());
            }
            match self.fs.read(&path) {
                Ok(bytes) => match transmission::decode(&bytes, &name) {
                    Ok(transmission) => {
                        return Some(InFlight {
                            name: name,
                            size: bytes.len() as u64,
                            transmission: transmission,
                            state: Arc::clone(&self.state),
                            resolved: false,
                        });
                    }
                    Err(err) => {
                        SPOOL_QUARANTINED.fetch_add(1, Ordering::Relaxed);
                        warn!("peek.corrupt: {}", err);
                        self.unreserve(&name);
                        self.quarantine(&path);
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                    // another process drained it between readdir and open
                    self.unreserve(&name);
                }
                Err(e) => {
                    warn!("peek could not open {:?}: {}", path, e);
                    self.unreserve(&name);
                }
            }
        }
        None
    }

    fn unreserve(&self, name: &str) {
        let mut state = self.state.lock().expect("spool state poisoned");
        state.in_flight.remove(name);
    }

    /// Resolve an in-flight handle by removing its file: the transmission
    /// was delivered or permanently given up on.
    ///
    /// Tolerates the file having been removed already -- by garbage
    /// collection or by another process -- and never raises.
    pub fn delete(&self, mut handle: InFlight) {
        handle.resolved = true;
        let name = handle.name.clone();
        let size = handle.size;
        {
            let mut state = self.state.lock().expect("spool state poisoned");
            state.in_flight.remove(&name);
            state.recently_deleted.push_back(name.clone());
            while state.recently_deleted.len() > RECENTLY_DELETED_CAP {
                state.recently_deleted.pop_front();
            }
        }
        let path = self.dir.join(&name);
        if let Err(e) = self.remove_with_retry(&path) {
            warn!("could not delete {}: {}", name, e);
        }
        let mut state = self.state.lock().expect("spool state poisoned");
        state.storage_size_bytes = state.storage_size_bytes.saturating_sub(size);
        state.file_count = state.file_count.saturating_sub(1);
    }

    /// Resolve an in-flight handle without touching its file: the
    /// transmission will be retried on a later drain pass.
    pub fn release(&self, mut handle: InFlight) {
        handle.resolved = true;
        self.unreserve(&handle.name);
    }

    /// Move a malformed committed file aside as `.corrupt` so peek stops
    /// tripping over it. The file is retained for human diagnostics until
    /// its retention elapses. Never raises.
    pub fn quarantine(&self, path: &Path) {
        let corrupt_path = path.with_extension("corrupt");
        // a previous quarantine attempt may have left a stale target behind
        let _ = self.remove_with_retry(&corrupt_path);
        match self.fs.rename(path, &corrupt_path) {
            Ok(()) => info!("quarantined {:?}", corrupt_path.file_name()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not quarantine {:?}: {}", path, e),
        }
    }

    /// One garbage collection pass: remove every file older than its kind's
    /// retention. Ages come from filesystem creation time where plausible,
    /// with the filename stamp and mtime as fallbacks. Per-file failures are
    /// logged and skipped.
    pub fn gc(&self) {
        {
            let mut state = self.state.lock().expect("spool state poisoned");
            state.last_gc = Some(Instant::now());
        }
        let now = self.clock.now_utc();
        let sweeps = [
            ("tmp", self.config.tmp_ttl_secs),
            ("trn", self.config.trn_ttl_secs),
            ("corrupt", self.config.corrupt_ttl_secs),
        ];
        for &(ext, ttl_secs) in &sweeps {
            let paths = match self.fs.list(&self.dir, ext) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!("gc failed to enumerate *.{}: {}", ext, e);
                    continue;
                }
            };
            for path in paths {
                let created = fs::created_utc(&*self.fs, &path, now);
                let age_secs = now.signed_duration_since(created).num_seconds();
                if age_secs < ttl_secs as i64 {
                    continue;
                }
                match self.remove_with_retry(&path) {
                    Ok(()) => {
                        SPOOL_GC_DELETED.fetch_add(1, Ordering::Relaxed);
                        debug!("gc removed {:?}, age {}s", path.file_name(), age_secs);
                    }
                    Err(e) => warn!("gc.delete.failed: {:?}: {}", path, e),
                }
            }
        }
        if let Ok((total_bytes, total_files)) = self.rescan() {
            let mut state = self.state.lock().expect("spool state poisoned");
            state.storage_size_bytes = total_bytes;
            state.file_count = total_files;
        }
    }

    /// Run a garbage collection pass if none has run within `interval`.
    /// Called by the transmitter on idle peeks.
    pub fn gc_if_due(&self, interval: Duration) {
        let due = {
            let mut state = self.state.lock().expect("spool state poisoned");
            let due = match state.last_gc {
                None => true,
                Some(last) => last.elapsed() >= interval,
            };
            if due {
                // claim the pass before the lock drops so workers do not pile on
                state.last_gc = Some(Instant::now());
            }
            due
        };
        if due {
            self.gc();
        }
    }

    /// Advisory size of the spool in bytes, as of the last rescan.
    pub fn storage_size_bytes(&self) -> u64 {
        self.state
            .lock()
            .expect("spool state poisoned")
            .storage_size_bytes
    }

    /// Advisory file count, as of the last rescan.
    pub fn file_count(&self) -> usize {
        self.state.lock().expect("spool state poisoned").file_count
    }

    fn rescan(&self) -> io::Result<(u64, usize)> {
        let mut total_bytes = 0u64;
        let mut total_files = 0usize;
        for ext in &["tmp", "trn", "corrupt"] {
            for path in self.fs.list(&self.dir, ext)? {
                match self.fs.size(&path) {
                    Ok(size) => {
                        total_bytes = total_bytes.saturating_add(size);
                        total_files = total_files.saturating_add(1);
                    }
                    // vanished mid-scan; that is the directory being drained
                    Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok((total_bytes, total_files))
    }

    fn remove_with_retry(&self, path: &Path) -> io::Result<()> {
        let mut attempt = 0;
        loop {
            match self.fs.remove(path) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= DELETE_ATTEMPTS || !retryable_delete(&e) {
                        return Err(e);
                    }
                    // no sleep: sharing violations on busy files clear in the
                    // time it takes the other handle to close
                }
            }
        }
    }
}

fn retryable_delete(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::Other => true,
        _ => false,
    }
}
