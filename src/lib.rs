//! Courier is a durable client-side telemetry delivery library. An
//! application hands courier named events and exception reports; courier
//! decorates them with process and machine context, spools them to local disk
//! and drains the spool toward a remote ingest endpoint in the background,
//! retrying over network outages and host restarts. Courier aims to be
//! _reliable_ and _unobtrusive_: accepted telemetry survives crashes inside
//! its retention window and no failure in courier is allowed to take the host
//! application down with it.
//!
//! Why you might choose to use courier:
//!
//!  * You need telemetry to survive process crashes and reboots.
//!  * You need delivery to tolerate flaky networks and slow ingest endpoints.
//!  * You want multiple processes to share one on-disk spool safely.
//!  * You want the library to shed load rather than exhaust the host disk.
//!
//! The persistence channel is the heart of the crate: see the `spool` module
//! for the on-disk queue and the `transmitter` module for the drain loop. The
//! `channel` module is the producer-facing façade.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, missing_docs, unstable_features, unused_import_braces)]
extern crate byteorder;
extern crate chrono;
extern crate crc32c;
extern crate flate2;
extern crate glob;
extern crate mio;
extern crate reqwest;
extern crate serde;
extern crate serde_json;
extern crate url;
extern crate uuid;

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
extern crate quickcheck;

pub mod channel;
pub mod config;
pub mod constants;
pub mod debug;
pub mod fs;
pub mod sender;
pub mod spool;
pub mod telemetry;
pub mod thread;
pub mod time;
pub mod transmission;
pub mod transmitter;

pub use channel::Channel;
pub use config::{ChannelConfig, SpoolConfig, TransmitterConfig};
pub use telemetry::{Exception, Item, Telemetry};
