//! The file debug sink.
//!
//! When `COURIER_TELEMETRY_FILE` names a path, the channel routes every item
//! here instead of standing up the spool and transmitter: one JSON envelope
//! per line, appended to the named file. Handy for inspecting exactly what
//! would have gone over the wire. Like every courier surface, delivery
//! problems are logged and swallowed, never raised.

use serde_json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use telemetry::Envelope;

/// Total envelopes this process failed to write to a debug sink.
pub static DEBUG_SINK_WRITE_FAILURES: AtomicUsize = AtomicUsize::new(0);

/// Appends one JSON envelope per line to a file.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    /// Open (or create) the sink file for appending.
    pub fn new(path: &Path) -> Result<FileSink, String> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("could not open debug sink {:?}: {}", path, e))?;
        Ok(FileSink {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Append one envelope. Failures are counted and logged.
    pub fn deliver(&self, envelope: &Envelope) {
        let line = match serde_json::to_string(envelope) {
            Ok(line) => line,
            Err(e) => {
                DEBUG_SINK_WRITE_FAILURES.fetch_add(1, Ordering::Relaxed);
                warn!("debug sink could not serialize envelope: {}", e);
                return;
            }
        };
        let mut file = self.file.lock().expect("debug sink poisoned");
        if let Err(e) = writeln!(file, "{}", line) {
            DEBUG_SINK_WRITE_FAILURES.fetch_add(1, Ordering::Relaxed);
            warn!("debug sink could not write {:?}: {}", self.path, e);
        }
    }

    /// Push buffered bytes down to the OS.
    pub fn flush(&self) {
        let mut file = self.file.lock().expect("debug sink poisoned");
        if let Err(e) = file.flush() {
            warn!("debug sink could not flush {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod test {
    extern crate tempdir;

    use self::tempdir::TempDir;
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use telemetry::{Item, Telemetry};

    #[test]
    fn envelopes_land_one_per_line_in_order() {
        let dir = TempDir::new("courier").unwrap();
        let path = dir.path().join("debug.jsonl");
        let sink = FileSink::new(&path).expect("sink open failed");

        for idx in 0..5 {
            let item: Item = Telemetry::new(format!("event.{}", idx)).into();
            sink.deliver(&item.into_envelope(&HashMap::new()));
        }
        sink.flush();

        let raw = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(5, lines.len());
        for (idx, line) in lines.iter().enumerate() {
            let envelope: Envelope = ::serde_json::from_str(line).expect("bad line");
            assert_eq!(format!("event.{}", idx), envelope.name);
        }
    }
}
