//! Configuration structs for the courier pipeline.
//!
//! Embedding applications deserialize these from whatever configuration
//! medium they already use, or build them in code and lean on the defaults.
//! Every knob ships with a production-shaped default; an empty
//! `ChannelConfig::default()` with a real endpoint is a working setup.

use std::collections::HashMap;
use std::path::PathBuf;

/// Tuning for the on-disk spool.
#[derive(Clone, Debug, Deserialize)]
pub struct SpoolConfig {
    /// Soft cap on the total bytes of spool files. Enqueues past the cap are
    /// dropped, not blocked.
    pub capacity_bytes: u64,
    /// Soft cap on the number of spool files.
    pub max_files: usize,
    /// Seconds a committed `.trn` file may wait before garbage collection
    /// gives up on it.
    pub trn_ttl_secs: u64,
    /// Seconds a quarantined `.corrupt` file is retained for diagnostics.
    pub corrupt_ttl_secs: u64,
    /// Seconds an orphaned `.tmp` file may linger. Anything past this was a
    /// write that never committed.
    pub tmp_ttl_secs: u64,
    /// Seconds from a transmission's first enqueue until the transmitter
    /// stops retrying it and drops it.
    pub retry_deadline_secs: u64,
    /// Upper bound on files examined per peek.
    pub peek_scan_limit: usize,
}

impl Default for SpoolConfig {
    fn default() -> SpoolConfig {
        SpoolConfig {
            capacity_bytes: 10 * 1024 * 1024,
            max_files: 100,
            trn_ttl_secs: 30 * 24 * 60 * 60,
            corrupt_ttl_secs: 7 * 24 * 60 * 60,
            tmp_ttl_secs: 5 * 60,
            retry_deadline_secs: 2 * 60 * 60,
            peek_scan_limit: 50,
        }
    }
}

/// Tuning for the background transmitter.
#[derive(Clone, Debug, Deserialize)]
pub struct TransmitterConfig {
    /// Number of drain workers. One is right for nearly everyone; the spool
    /// keeps additional workers from colliding but they multiply load on the
    /// ingest endpoint.
    pub workers: usize,
    /// Idle poll period in milliseconds. Values below 50 are raised to 50 so
    /// an empty spool cannot spin a core.
    pub sending_interval_ms: u64,
    /// Per-request HTTP timeout in seconds. A timeout is retryable.
    pub request_timeout_secs: u64,
}

impl Default for TransmitterConfig {
    fn default() -> TransmitterConfig {
        TransmitterConfig {
            workers: 1,
            sending_interval_ms: 50,
            request_timeout_secs: 30,
        }
    }
}

/// Configuration for a `Channel`, the producer-facing façade.
#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    /// Absolute URL of the ingest receiver.
    pub endpoint: String,
    /// Directory for the spool. Shared safely between processes. When unset,
    /// a `courier-spool` directory under the OS temporary directory is used.
    pub spool_dir: Option<PathBuf>,
    /// Properties stamped onto every item under the producer's own, e.g. an
    /// application version or deployment name.
    pub common_properties: HashMap<String, String>,
    /// Spool tuning.
    pub spool: SpoolConfig,
    /// Transmitter tuning.
    pub transmitter: TransmitterConfig,
}

impl Default for ChannelConfig {
    fn default() -> ChannelConfig {
        ChannelConfig {
            endpoint: "https://localhost/v2/track".to_string(),
            spool_dir: None,
            common_properties: HashMap::new(),
            spool: SpoolConfig::default(),
            transmitter: TransmitterConfig::default(),
        }
    }
}
