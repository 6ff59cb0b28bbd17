//! Library level constants
use mio;
use std::time::Duration;

/// MIO token used to distinguish shutdown signals from other event sources.
///
/// Note - Worker threads register exactly one `mio::Registration` each, so
/// any token clear of the low range would do. We keep the value well out of
/// the way regardless.
pub const SYSTEM: mio::Token = mio::Token(2048);

/// How long `Stoppable::shutdown` will wait for a worker thread to observe
/// its stop signal before abandoning the thread. Abandonment is safe: the
/// spool keeps all interesting state on disk.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
