//! The in-memory telemetry items producers hand to a `Channel`.
//!
//! Two kinds exist: named events and exception reports. Both carry free-form
//! string properties and numeric measurements. Items are plain data; the
//! channel owns context merging and wire encoding, so nothing here touches
//! the disk or the network.

use chrono::DateTime;
use chrono::offset::Utc;
use std::collections::HashMap;
use uuid::Uuid;

/// A named application event.
///
/// ```text
/// let t = Telemetry::new("app.startup")
///     .property("region", "us-west")
///     .measurement("boot_ms", 412.0);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// The event name. User-provided, dotted by convention.
    pub name: String,
    /// The moment the producer observed the event, UTC.
    pub timestamp: DateTime<Utc>,
    /// Free-form string context attached by the producer.
    pub properties: HashMap<String, String>,
    /// Numeric samples attached by the producer.
    pub measurements: HashMap<String, f64>,
}

impl Telemetry {
    /// Create a new event named `name`, stamped now.
    pub fn new<S>(name: S) -> Telemetry
    where
        S: Into<String>,
    {
        Telemetry {
            name: name.into(),
            timestamp: Utc::now(),
            properties: HashMap::new(),
            measurements: HashMap::new(),
        }
    }

    /// Attach a string property, replacing any previous value for the key.
    pub fn property<K, V>(mut self, key: K, value: V) -> Telemetry
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Attach a numeric measurement, replacing any previous value for the
    /// key.
    pub fn measurement<K>(mut self, key: K, value: f64) -> Telemetry
    where
        K: Into<String>,
    {
        self.measurements.insert(key.into(), value);
        self
    }

    /// Override the observation stamp. Mostly useful for replay and tests.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Telemetry {
        self.timestamp = timestamp;
        self
    }
}

/// An exception report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    /// The exception's type name, e.g. `io::Error`.
    pub exception_type: String,
    /// The human-facing message.
    pub message: String,
    /// A backtrace rendering, when the producer has one.
    pub stack: Option<String>,
    /// The moment the producer observed the failure, UTC.
    pub timestamp: DateTime<Utc>,
    /// Free-form string context attached by the producer.
    pub properties: HashMap<String, String>,
    /// Numeric samples attached by the producer.
    pub measurements: HashMap<String, f64>,
}

impl Exception {
    /// Create a new exception report, stamped now.
    pub fn new<T, M>(exception_type: T, message: M) -> Exception
    where
        T: Into<String>,
        M: Into<String>,
    {
        Exception {
            exception_type: exception_type.into(),
            message: message.into(),
            stack: None,
            timestamp: Utc::now(),
            properties: HashMap::new(),
            measurements: HashMap::new(),
        }
    }

    /// Attach a backtrace rendering.
    pub fn stack<S>(mut self, stack: S) -> Exception
    where
        S: Into<String>,
    {
        self.stack = Some(stack.into());
        self
    }

    /// Attach a string property, replacing any previous value for the key.
    pub fn property<K, V>(mut self, key: K, value: V) -> Exception
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Attach a numeric measurement, replacing any previous value for the
    /// key.
    pub fn measurement<K>(mut self, key: K, value: f64) -> Exception
    where
        K: Into<String>,
    {
        self.measurements.insert(key.into(), value);
        self
    }
}

/// Item: the enumeration a `Channel` accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Item {
    /// A wrapper for `Telemetry`. See its documentation for more detail.
    Event(Telemetry),
    /// A wrapper for `Exception`. See its documentation for more detail.
    Exception(Exception),
}

impl From<Telemetry> for Item {
    fn from(event: Telemetry) -> Item {
        Item::Event(event)
    }
}

impl From<Exception> for Item {
    fn from(exception: Exception) -> Item {
        Item::Exception(exception)
    }
}

impl Item {
    /// The item's name: the event name, or the exception's type name.
    pub fn name(&self) -> &str {
        match *self {
            Item::Event(ref event) => &event.name,
            Item::Exception(ref exception) => &exception.exception_type,
        }
    }

    /// Flatten the item into its wire `Envelope`, merging the channel's
    /// common context underneath the producer's own keys. Producer keys win
    /// on collision.
    pub fn into_envelope(self, common: &HashMap<String, String>) -> Envelope {
        let mut properties = common.clone();
        match self {
            Item::Event(event) => {
                for (key, value) in event.properties {
                    properties.insert(key, value);
                }
                Envelope {
                    id: Uuid::new_v4().simple().to_string(),
                    name: event.name,
                    time: event.timestamp.to_rfc3339(),
                    kind: EnvelopeKind::Event,
                    properties: properties,
                    measurements: event.measurements,
                    exception: None,
                }
            }
            Item::Exception(exception) => {
                for (key, value) in exception.properties {
                    properties.insert(key, value);
                }
                Envelope {
                    id: Uuid::new_v4().simple().to_string(),
                    name: exception.exception_type.clone(),
                    time: exception.timestamp.to_rfc3339(),
                    kind: EnvelopeKind::Exception,
                    properties: properties,
                    measurements: exception.measurements,
                    exception: Some(ExceptionDetails {
                        exception_type: exception.exception_type,
                        message: exception.message,
                        stack: exception.stack,
                    }),
                }
            }
        }
    }
}

/// Discriminates event envelopes from exception envelopes on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A named application event.
    Event,
    /// An exception report.
    Exception,
}

/// Exception-specific fields of an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionDetails {
    /// The exception's type name.
    #[serde(rename = "type")]
    pub exception_type: String,
    /// The human-facing message.
    pub message: String,
    /// A backtrace rendering, when one was captured.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stack: Option<String>,
}

/// The wire shape of one item: what actually lands in the JSON payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// A fresh 128-bit id, hex encoded; useful for server-side dedup under
    /// at-least-once delivery.
    pub id: String,
    /// The item name.
    pub name: String,
    /// Observation time, RFC 3339.
    pub time: String,
    /// Event or exception.
    pub kind: EnvelopeKind,
    /// Merged properties: channel context underneath, producer keys on top.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub properties: HashMap<String, String>,
    /// Producer measurements.
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub measurements: HashMap<String, f64>,
    /// Present on exception envelopes only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exception: Option<ExceptionDetails>,
}
