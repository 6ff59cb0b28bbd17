//! The unit of delivery and its on-disk frame.
//!
//! A `Transmission` is one opaque payload plus everything the transmitter
//! needs to deliver it: the ingest URL, the media type, the transfer
//! encoding and the moment it was first accepted. Transmissions are frozen
//! at construction; the spool serializes them into single-transmission
//! binary frames and the transmitter replays them byte-for-byte, so a
//! payload POSTs identically whether it was written by this process an hour
//! ago or by another process before a reboot.
//!
//! The frame is deliberately dumb: a version byte, big-endian
//! length-prefixed fields, the creation stamp in milliseconds and a CRC32C
//! trailer over everything that came before. Anything that fails the
//! checks -- bad version, oversized length, broken UTF-8, short read, CRC
//! mismatch -- is a corrupt frame and the caller quarantines the file. A
//! frame is never partially decoded.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use chrono::DateTime;
use chrono::LocalResult;
use chrono::TimeZone;
use chrono::offset::Utc;
use crc32c::crc32c;
use std::fmt;
use std::io;
use std::io::Read;
use std::io::Write;
use url::Url;

/// The frame layout revision this build writes and the only one it reads.
pub const FRAME_VERSION: u8 = 1;

/// Upper bound on any single length-prefixed field, payload included. A
/// length beyond this is treated as corruption, not as a large frame.
pub const MAX_FIELD_BYTES: u32 = 64 * 1024 * 1024;

/// One opaque payload plus the endpoint and headers needed to deliver it.
///
/// Immutable once created. The creation stamp is truncated to millisecond
/// precision at construction so that a transmission compares equal to its
/// own decoded frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Transmission {
    endpoint_url: Url,
    payload: Vec<u8>,
    content_type: String,
    content_encoding: String,
    created_at_utc: DateTime<Utc>,
}

impl Transmission {
    /// Construct a new `Transmission`. `content_encoding` may be empty to
    /// signal no transfer encoding.
    pub fn new(
        endpoint_url: Url,
        payload: Vec<u8>,
        content_type: &str,
        content_encoding: &str,
        created_at_utc: DateTime<Utc>,
    ) -> Transmission {
        let ms = created_at_utc.timestamp_millis();
        Transmission {
            endpoint_url: endpoint_url,
            payload: payload,
            content_type: content_type.to_string(),
            content_encoding: content_encoding.to_string(),
            created_at_utc: from_millis(ms),
        }
    }

    /// The absolute URL of the ingest receiver.
    pub fn endpoint_url(&self) -> &Url {
        &self.endpoint_url
    }

    /// The opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload media type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The transfer encoding, empty when none applies.
    pub fn content_encoding(&self) -> &str {
        &self.content_encoding
    }

    /// The wall-clock moment of first enqueue, millisecond precision.
    pub fn created_at_utc(&self) -> DateTime<Utc> {
        self.created_at_utc
    }
}

/// The ways framing can fail.
#[derive(Debug)]
pub enum FrameError {
    /// The output stream rejected bytes mid-write. The caller owns cleanup
    /// of whatever partial file resulted.
    Write(io::Error),
    /// The input stream could not be read at all.
    Read(io::Error),
    /// The bytes are not a well-formed version-1 frame. The reason string
    /// names the first check that failed and the file it failed in.
    Corrupt(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FrameError::Write(ref e) => write!(f, "frame write failed: {}", e),
            FrameError::Read(ref e) => write!(f, "frame read failed: {}", e),
            FrameError::Corrupt(ref reason) => write!(f, "corrupt frame: {}", reason),
        }
    }
}

#[inline]
fn from_millis(ms: i64) -> DateTime<Utc> {
    let secs = ms.div_euclid(1_000);
    let nanos = (ms.rem_euclid(1_000) * 1_000_000) as u32;
    Utc.timestamp(secs, nanos)
}

fn frame_bytes(transmission: &Transmission) -> io::Result<Vec<u8>> {
    let url = transmission.endpoint_url.as_str().as_bytes();
    let ctype = transmission.content_type.as_bytes();
    let cenc = transmission.content_encoding.as_bytes();
    let payload = &transmission.payload;
    for field in &[url, ctype, cenc, &payload[..]] {
        if field.len() > MAX_FIELD_BYTES as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame field exceeds 64 MiB",
            ));
        }
    }

    let mut buf = Vec::with_capacity(4 * 4 + 8 + 1 + url.len() + ctype.len() + cenc.len() + payload.len() + 4);
    buf.write_u8(FRAME_VERSION)?;
    buf.write_u32::<BigEndian>(url.len() as u32)?;
    buf.extend_from_slice(url);
    buf.write_u32::<BigEndian>(ctype.len() as u32)?;
    buf.extend_from_slice(ctype);
    buf.write_u32::<BigEndian>(cenc.len() as u32)?;
    buf.extend_from_slice(cenc);
    buf.write_u64::<BigEndian>(transmission.created_at_utc.timestamp_millis() as u64)?;
    buf.write_u32::<BigEndian>(payload.len() as u32)?;
    buf.extend_from_slice(payload);
    let crc = crc32c(&buf);
    buf.write_u32::<BigEndian>(crc)?;
    Ok(buf)
}

/// Serialize one `Transmission` into `out`.
///
/// There is no partial-write recovery here; the spool's write-to-tmp then
/// rename discipline makes a torn write invisible to readers.
pub fn write<W>(transmission: &Transmission, out: &mut W) -> Result<(), FrameError>
where
    W: Write,
{
    let buf = frame_bytes(transmission).map_err(FrameError::Write)?;
    out.write_all(&buf).map_err(FrameError::Write)?;
    out.flush().map_err(FrameError::Write)
}

/// Deserialize one `Transmission` out of `stream`. `origin` names the
/// source -- usually a spool filename -- for corruption diagnostics.
pub fn read<R>(stream: &mut R, origin: &str) -> Result<Transmission, FrameError>
where
    R: Read,
{
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).map_err(FrameError::Read)?;
    decode(&bytes, origin)
}

/// Deserialize one `Transmission` out of a complete in-memory frame.
pub fn decode(bytes: &[u8], origin: &str) -> Result<Transmission, FrameError> {
    let corrupt = |reason: &str| FrameError::Corrupt(format!("{}: {}", origin, reason));

    if bytes.is_empty() {
        return Err(corrupt("empty"));
    }
    if bytes[0] != FRAME_VERSION {
        return Err(corrupt("unsupported version"));
    }
    if bytes.len() < 1 + 4 {
        return Err(corrupt("truncated"));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected = BigEndian::read_u32(trailer);
    if crc32c(body) != expected {
        return Err(corrupt("crc mismatch"));
    }

    let mut cur = io::Cursor::new(body);
    // version byte, already validated
    cur.read_u8().map_err(|_| corrupt("truncated"))?;

    let url_raw = read_field(&mut cur, body.len(), &corrupt)?;
    let url_str = String::from_utf8(url_raw).map_err(|_| corrupt("endpoint url is not utf-8"))?;
    let ctype_raw = read_field(&mut cur, body.len(), &corrupt)?;
    let content_type = String::from_utf8(ctype_raw).map_err(|_| corrupt("content type is not utf-8"))?;
    let cenc_raw = read_field(&mut cur, body.len(), &corrupt)?;
    let content_encoding =
        String::from_utf8(cenc_raw).map_err(|_| corrupt("content encoding is not utf-8"))?;

    let created_ms = cur.read_u64::<BigEndian>().map_err(|_| corrupt("truncated"))?;
    let payload = read_field(&mut cur, body.len(), &corrupt)?;

    if cur.position() != body.len() as u64 {
        return Err(corrupt("trailing bytes"));
    }
    let endpoint_url = Url::parse(&url_str).map_err(|_| corrupt("endpoint url unparseable"))?;
    if created_ms > i64::max_value() as u64 {
        return Err(corrupt("creation stamp out of range"));
    }
    let ms = created_ms as i64;
    let created_at_utc = match Utc.timestamp_opt(ms / 1_000, ((ms % 1_000) * 1_000_000) as u32) {
        LocalResult::Single(dt) => dt,
        _ => return Err(corrupt("creation stamp out of range")),
    };

    Ok(Transmission {
        endpoint_url: endpoint_url,
        payload: payload,
        content_type: content_type,
        content_encoding: content_encoding,
        created_at_utc: created_at_utc,
    })
}

fn read_field<F>(
    cur: &mut io::Cursor<&[u8]>,
    body_len: usize,
    corrupt: &F,
) -> Result<Vec<u8>, FrameError>
where
    F: Fn(&str) -> FrameError,
{
    let len = cur.read_u32::<BigEndian>().map_err(|_| corrupt("truncated"))?;
    if len > MAX_FIELD_BYTES {
        return Err(corrupt("field exceeds 64 MiB"));
    }
    let remaining = body_len as u64 - cur.position();
    if u64::from(len) > remaining {
        return Err(corrupt("truncated"));
    }
    let mut field = vec![0u8; len as usize];
    cur.read_exact(&mut field).map_err(|_| corrupt("truncated"))?;
    Ok(field)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use chrono::offset::Utc;
    use quickcheck::{QuickCheck, TestResult};
    use url::Url;

    fn sample() -> Transmission {
        Transmission::new(
            Url::parse("https://ingest.example.com/v2/track").unwrap(),
            b"{\"name\":\"startup\"}".to_vec(),
            "application/json",
            "gzip",
            Utc.ymd(2026, 1, 7).and_hms_milli(12, 0, 0, 250),
        )
    }

    #[test]
    fn round_trip_identity() {
        let t = sample();
        let mut buf = Vec::new();
        write(&t, &mut buf).expect("frame write failed");
        let got = decode(&buf, "test").expect("frame decode failed");
        assert_eq!(t, got);
    }

    #[test]
    fn round_trip_empty_encoding_and_payload() {
        let t = Transmission::new(
            Url::parse("https://ingest.example.com/track").unwrap(),
            Vec::new(),
            "application/json",
            "",
            Utc.ymd(2026, 1, 7).and_hms(12, 0, 0),
        );
        let mut buf = Vec::new();
        write(&t, &mut buf).expect("frame write failed");
        let got = decode(&buf, "test").expect("frame decode failed");
        assert_eq!(t, got);
        assert_eq!("", got.content_encoding());
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let t = sample();
        let mut buf = Vec::new();
        write(&t, &mut buf).expect("frame write failed");
        buf[0] = 2;
        match decode(&buf, "test") {
            Err(FrameError::Corrupt(ref reason)) => {
                assert!(reason.contains("unsupported version"))
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn flipped_bit_is_corrupt() {
        let t = sample();
        let mut buf = Vec::new();
        write(&t, &mut buf).expect("frame write failed");
        let mid = buf.len() / 2;
        buf[mid] ^= 0x40;
        assert!(decode(&buf, "test").is_err());
    }

    #[test]
    fn truncation_is_corrupt() {
        let t = sample();
        let mut buf = Vec::new();
        write(&t, &mut buf).expect("frame write failed");
        for keep in 0..buf.len() {
            assert!(decode(&buf[..keep], "test").is_err());
        }
    }

    #[test]
    fn oversize_length_is_corrupt_not_an_allocation() {
        // version byte plus a field length claiming 4 GiB
        let mut buf = vec![FRAME_VERSION];
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let crc = ::crc32c::crc32c(&buf);
        let mut framed = buf.clone();
        framed.extend_from_slice(&[
            (crc >> 24) as u8,
            (crc >> 16) as u8,
            (crc >> 8) as u8,
            crc as u8,
        ]);
        match decode(&framed, "test") {
            Err(FrameError::Corrupt(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn out_of_range_stamp_is_corrupt() {
        // a structurally valid frame whose creation stamp is absurd
        let mut body = vec![FRAME_VERSION];
        let url = b"https://ingest.example.com/";
        body.write_u32::<BigEndian>(url.len() as u32).unwrap();
        body.extend_from_slice(url);
        body.write_u32::<BigEndian>(0).unwrap();
        body.write_u32::<BigEndian>(0).unwrap();
        body.write_u64::<BigEndian>(9_000_000_000_000_000_000).unwrap();
        body.write_u32::<BigEndian>(0).unwrap();
        let crc = crc32c(&body);
        body.write_u32::<BigEndian>(crc).unwrap();
        match decode(&body, "test") {
            Err(FrameError::Corrupt(ref reason)) => {
                assert!(reason.contains("out of range"))
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn qc_garbage_never_panics() {
        fn inner(bytes: Vec<u8>) -> TestResult {
            let _ = decode(&bytes, "qc");
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(1000)
            .quickcheck(inner as fn(Vec<u8>) -> TestResult);
    }

    #[test]
    fn qc_round_trip() {
        fn inner(payload: Vec<u8>, ms: u32, gzip: bool) -> TestResult {
            let t = Transmission::new(
                Url::parse("https://ingest.example.com/v2/track").unwrap(),
                payload,
                "application/x-json-stream",
                if gzip { "gzip" } else { "" },
                Utc.timestamp(i64::from(ms), 0),
            );
            let mut buf = Vec::new();
            write(&t, &mut buf).expect("frame write failed");
            let got = decode(&buf, "qc").expect("frame decode failed");
            assert_eq!(t, got);
            TestResult::passed()
        }
        QuickCheck::new()
            .tests(100)
            .max_tests(1000)
            .quickcheck(inner as fn(Vec<u8>, u32, bool) -> TestResult);
    }
}
