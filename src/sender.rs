//! The HTTP seam between the transmitter and the wire.
//!
//! Delivery outcomes are explicit variants, not exceptions: the transmitter
//! matches on `Delivery` and dispatches. `HttpPoster` is the production
//! implementation; tests inject scripted senders to exercise every branch of
//! the drain loop without a listening endpoint.

use reqwest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use transmission::Transmission;

/// Total POST attempts made through `HttpPoster`.
pub static SENDER_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

/// How one delivery attempt went.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// The receiver accepted the payload. The spool file can go.
    Delivered,
    /// The receiver rejected the payload for good -- a 4xx outside the
    /// retry set. Retrying an identical payload cannot help; the file is
    /// dropped and the status retained for the log line.
    Rejected(u16),
    /// Worth another attempt later: 408, 429, any 5xx, a transport error or
    /// a timeout. The reason string feeds the retry log line.
    Retryable(String),
}

/// A thing that can POST one transmission.
pub trait HttpSender: Send + Sync {
    /// Attempt delivery of `transmission` to its endpoint. Must not panic;
    /// all failures map into a `Delivery` variant.
    fn post(&self, transmission: &Transmission) -> Delivery;
}

/// Classify an HTTP status per the retry policy.
pub fn classify(status: u16) -> Delivery {
    match status {
        200...299 => Delivery::Delivered,
        408 | 429 => Delivery::Retryable(format!("status {}", status)),
        500...599 => Delivery::Retryable(format!("status {}", status)),
        status => Delivery::Rejected(status),
    }
}

/// The production sender: a pooled, synchronous `reqwest` client.
pub struct HttpPoster {
    client: reqwest::Client,
}

impl HttpPoster {
    /// Build a sender whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<HttpPoster, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("could not create http client: {}", e))?;
        Ok(HttpPoster { client: client })
    }
}

impl HttpSender for HttpPoster {
    fn post(&self, transmission: &Transmission) -> Delivery {
        SENDER_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
        let mut req = self.client
            .post(transmission.endpoint_url().as_str())
            .header("Content-Type", transmission.content_type())
            .body(transmission.payload().to_vec());
        if !transmission.content_encoding().is_empty() {
            req = req.header("Content-Encoding", transmission.content_encoding());
        }
        match req.send() {
            Ok(resp) => classify(resp.status().as_u16()),
            Err(e) => Delivery::Retryable(e.to_string()),
        }
    }
}
