//! Thin filesystem seam for the spool.
//!
//! The spool's correctness story leans on a small set of file operations --
//! enumerate, exclusive create, whole-file read, rename, remove, age -- and
//! on very particular error tolerances around each of them. Hiding the
//! operations behind `FileSystem` keeps that surface explicit and lets tests
//! inject permission errors, sharing violations and vanished files without a
//! real disk misbehaving on cue.

use chrono::DateTime;
use chrono::TimeZone;
use chrono::offset::Utc;
use glob::glob;
use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::{Path, PathBuf};

/// The file operations the spool consumes.
///
/// Implementations must be safe to share across threads. The default is
/// `Disk`, backed by `std::fs`. Every method maps one-to-one onto an OS
/// operation; policy -- retries, fallbacks, error swallowing -- lives in the
/// spool, not here.
pub trait FileSystem: Send + Sync {
    /// Create `dir` and any missing parents.
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;

    /// Enumerate the files directly under `dir` whose extension is `ext`.
    /// Order is whatever the OS hands back.
    fn list(&self, dir: &Path, ext: &str) -> io::Result<Vec<PathBuf>>;

    /// Open `path` for writing, failing if it already exists.
    fn create_excl(&self, path: &Path) -> io::Result<Box<Write + Send>>;

    /// Read the complete contents of `path`.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Atomically rename `from` to `to`. Both live in the spool directory.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove `path`.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// The size of `path` in bytes.
    fn size(&self, path: &Path) -> io::Result<u64>;

    /// Filesystem creation time of `path`, where the platform records one.
    fn created(&self, path: &Path) -> io::Result<DateTime<Utc>>;

    /// Filesystem modification time of `path`.
    fn modified(&self, path: &Path) -> io::Result<DateTime<Utc>>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disk;

impl FileSystem for Disk {
    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn list(&self, dir: &Path, ext: &str) -> io::Result<Vec<PathBuf>> {
        let pattern = format!("{}/*.{}", dir.display(), ext);
        let entries = glob(&pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => paths.push(path),
                // the file vanished between readdir and stat; skip it
                Err(_) => continue,
            }
        }
        Ok(paths)
    }

    fn create_excl(&self, path: &Path) -> io::Result<Box<Write + Send>> {
        let fp = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Box::new(fp))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut fp = fs::File::open(path)?;
        let mut buf = Vec::new();
        fp.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn created(&self, path: &Path) -> io::Result<DateTime<Utc>> {
        let created = fs::metadata(path)?.created()?;
        Ok(DateTime::<Utc>::from(created))
    }

    fn modified(&self, path: &Path) -> io::Result<DateTime<Utc>> {
        let modified = fs::metadata(path)?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

/// Parse the `YYYYMMDDhhmmss` stamp prefix out of a spool filename.
///
/// Committed spool files are named `YYYYMMDDhhmmss_<32 hex>.<ext>`; the
/// prefix is the UTC moment of the commit rename and doubles as a creation
/// time of last resort on filesystems that do not record one.
pub fn stamp_of_filename(name: &str) -> Option<DateTime<Utc>> {
    let prefix = match name.find('_') {
        Some(idx) => &name[..idx],
        None => return None,
    };
    if prefix.len() != 14 {
        return None;
    }
    Utc.datetime_from_str(prefix, "%Y%m%d%H%M%S").ok()
}

/// Best-effort creation time for a spool file.
///
/// Filesystem creation time is authoritative when present and plausible.
/// Many Linux configurations report none at all and some report garbage
/// (epoch zero, or stamps from the future under clock skew), so the chain
/// falls back to the filename stamp, then mtime, then `now`. "Now" means the
/// file is treated as fresh: a file we cannot age is never garbage
/// collected on this pass.
pub fn created_utc(fs: &FileSystem, path: &Path, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Ok(ts) = fs.created(path) {
        if plausible(ts, now) {
            return ts;
        }
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if let Some(ts) = stamp_of_filename(name) {
            if plausible(ts, now) {
                return ts;
            }
        }
    }
    if let Ok(ts) = fs.modified(path) {
        if plausible(ts, now) {
            return ts;
        }
    }
    now
}

fn plausible(ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let earliest = Utc.ymd(2000, 1, 1).and_hms(0, 0, 0);
    let latest = now + ::chrono::Duration::days(1);
    ts > earliest && ts < latest
}
