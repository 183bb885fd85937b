//! Shared wire-format types for skua daemon ↔ helper ↔ client communication.
//!
//! This crate is the single source of truth for the framed protocol spoken
//! on every transport skua uses: the mutually-authenticated TLS sessions of
//! clients and the Unix-domain sockets of the console, log, and statistics
//! helpers. Both the daemon and the helper binaries depend on this to avoid
//! struct duplication.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌───────────────┬────────────┬───────────────┬──────────────────┐
//! │ version (2 B) │ tag (2 B)  │ length (4 B)  │ body (N bytes)   │
//! └───────────────┴────────────┴───────────────┴──────────────────┘
//! ```
//!
//! - **version**: `u16` big-endian, protocol revision ([`WIRE_VERSION`]).
//! - **tag**: `u16` big-endian, mapping to [`Tag`].
//! - **length**: `u32` big-endian, size of the body only (not the 8-byte header).
//! - **body**: JSON-encoded payload (may be empty).
//!
//! At most one command is outstanding per session, so replies correlate with
//! commands by order; no request id is carried on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur while framing or parsing protocol messages.
#[derive(Debug)]
pub enum WireError {
    /// The peer closed the stream between frames.
    Eof,
    /// A frame declared a body larger than [`MAX_BODY`] bytes.
    Oversized(u32),
    /// The tag field does not map to a known [`Tag`].
    UnknownTag(u16),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization of a body failed.
    Json(serde_json::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Eof => write!(f, "end of stream"),
            WireError::Oversized(len) => write!(f, "frame body of {} bytes exceeds limit", len),
            WireError::UnknownTag(t) => write!(f, "unknown tag: {:#06x}", t),
            WireError::Io(e) => write!(f, "IO error: {}", e),
            WireError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Eof
        } else {
            WireError::Io(e)
        }
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 2 (version) + 2 (tag) + 4 (length).
pub const HEADER_SIZE: usize = 8;

/// Current protocol revision carried in every header.
pub const WIRE_VERSION: u16 = 0;

/// Upper bound on body size. VM images travel in create bodies, so the
/// limit is generous; anything above it is a framing error, never an
/// allocation.
pub const MAX_BODY: u32 = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// Frame tags, partitioned into command, reply, event, and helper-control
/// spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum Tag {
    /// List live VMs below the session prefix
    Info = 0x0001,
    /// Commit the VM carried by the session certificate
    Create = 0x0002,
    /// Like Create, but pre-empt an existing VM with the same id
    ForceCreate = 0x0003,
    /// Kill a live VM
    Destroy = 0x0004,
    /// Subscribe to a VM's console stream
    Console = 0x0005,
    /// Subscribe to a VM's log stream
    Log = 0x0006,
    /// Subscribe to a VM's statistics stream
    Statistics = 0x0007,
    /// Download the stored revocation list for an issuer
    CrlFetch = 0x0008,

    /// Command succeeded; body is command-specific
    Success = 0x0100,
    /// Command failed; body carries a human-readable message
    Failure = 0x0101,

    /// A console line produced by a VM
    ConsoleLine = 0x0200,
    /// A log line concerning a VM
    LogLine = 0x0201,
    /// A statistics sample for a VM
    StatSample = 0x0202,

    /// Engine → console helper: start capturing a VM's console
    ConsoleAttach = 0x0300,
    /// Engine → console helper: stop capturing a VM's console
    ConsoleDetach = 0x0301,
    /// Engine → stats helper: track a pid
    StatAdd = 0x0302,
    /// Engine → stats helper: stop tracking a pid
    StatRemove = 0x0303,
    /// Engine → stats helper: sample a VM now
    StatRequest = 0x0304,
}

impl TryFrom<u16> for Tag {
    type Error = WireError;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        match raw {
            0x0001 => Ok(Tag::Info),
            0x0002 => Ok(Tag::Create),
            0x0003 => Ok(Tag::ForceCreate),
            0x0004 => Ok(Tag::Destroy),
            0x0005 => Ok(Tag::Console),
            0x0006 => Ok(Tag::Log),
            0x0007 => Ok(Tag::Statistics),
            0x0008 => Ok(Tag::CrlFetch),
            0x0100 => Ok(Tag::Success),
            0x0101 => Ok(Tag::Failure),
            0x0200 => Ok(Tag::ConsoleLine),
            0x0201 => Ok(Tag::LogLine),
            0x0202 => Ok(Tag::StatSample),
            0x0300 => Ok(Tag::ConsoleAttach),
            0x0301 => Ok(Tag::ConsoleDetach),
            0x0302 => Ok(Tag::StatAdd),
            0x0303 => Ok(Tag::StatRemove),
            0x0304 => Ok(Tag::StatRequest),
            _ => Err(WireError::UnknownTag(raw)),
        }
    }
}

impl Tag {
    /// Whether this tag sits in the command space.
    pub fn is_command(self) -> bool {
        (self as u16) < 0x0100
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A framed protocol message: protocol version, type tag, opaque body.
///
/// Use [`Frame::encode`] / [`Frame::decode`] for in-memory conversion,
/// [`Frame::read_from`] for async streaming, and [`Frame::read_from_sync`]
/// for blocking readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol revision of the sender.
    pub version: u16,
    /// Type of message.
    pub tag: Tag,
    /// Message body (JSON-encoded, may be empty).
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a frame whose body is the JSON encoding of `body`.
    pub fn new<B: Serialize>(tag: Tag, body: &B) -> Result<Self, WireError> {
        Ok(Self {
            version: WIRE_VERSION,
            tag,
            body: serde_json::to_vec(body)?,
        })
    }

    /// Build a frame with an empty body.
    pub fn bare(tag: Tag) -> Self {
        Self {
            version: WIRE_VERSION,
            tag,
            body: Vec::new(),
        }
    }

    /// Construct a failure reply carrying `message`.
    pub fn failure(message: impl Into<String>, version: u16) -> Self {
        let body = FailureBody {
            message: message.into(),
        };
        Self {
            version,
            tag: Tag::Failure,
            // FailureBody serialization cannot fail
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }

    /// Construct a success reply with an empty body.
    pub fn success(version: u16) -> Self {
        Self {
            version,
            tag: Tag::Success,
            body: Vec::new(),
        }
    }

    /// Decode this frame's body as JSON.
    pub fn parse<'a, B: Deserialize<'a>>(&'a self) -> Result<B, WireError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Serialize this frame into a byte buffer (header + body).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.body.len());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&(self.tag as u16).to_be_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Deserialize a frame from a contiguous byte slice.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::Eof);
        }
        let version = u16::from_be_bytes([data[0], data[1]]);
        let tag = Tag::try_from(u16::from_be_bytes([data[2], data[3]]))?;
        let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if length > MAX_BODY {
            return Err(WireError::Oversized(length));
        }
        let length = length as usize;
        if data.len() < HEADER_SIZE + length {
            return Err(WireError::Eof);
        }
        let body = data[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        Ok(Self { version, tag, body })
    }

    /// Read a complete frame from an async stream.
    ///
    /// Short reads are retried by `read_exact` until the header fills and
    /// the declared body length is consumed.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, WireError>
    where
        R: tokio::io::AsyncReadExt + Unpin,
    {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let version = u16::from_be_bytes([header[0], header[1]]);
        let tag = Tag::try_from(u16::from_be_bytes([header[2], header[3]]))?;
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if length > MAX_BODY {
            return Err(WireError::Oversized(length));
        }

        let mut body = vec![0u8; length as usize];
        if length > 0 {
            reader.read_exact(&mut body).await?;
        }
        Ok(Self { version, tag, body })
    }

    /// Write this frame to an async stream, looping until all bytes are out.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), WireError>
    where
        W: tokio::io::AsyncWriteExt + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Read a complete frame from a blocking [`std::io::Read`] stream.
    pub fn read_from_sync<R: std::io::Read>(reader: &mut R) -> Result<Self, WireError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let version = u16::from_be_bytes([header[0], header[1]]);
        let tag = Tag::try_from(u16::from_be_bytes([header[2], header[3]]))?;
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if length > MAX_BODY {
            return Err(WireError::Oversized(length));
        }

        let mut body = vec![0u8; length as usize];
        if length > 0 {
            reader.read_exact(&mut body)?;
        }
        Ok(Self { version, tag, body })
    }
}

// ---------------------------------------------------------------------------
// Body types: commands and replies
// ---------------------------------------------------------------------------

/// Body of Info, Destroy, Console, Statistics, and the helper attach and
/// request frames: a label path, relative to the session prefix for
/// commands and absolute for helper traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathBody {
    /// Label path naming a VM (or, for Info, a subtree; may be empty).
    #[serde(default)]
    pub path: Vec<String>,
}

impl PathBody {
    pub fn new(path: Vec<String>) -> Self {
        Self { path }
    }
}

/// Body of a Log subscription command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSubscribeBody {
    /// Label path naming a VM, relative to the session prefix.
    #[serde(default)]
    pub path: Vec<String>,
    /// Replay retained log lines with a timestamp strictly after this
    /// (milliseconds since the epoch) before live delivery starts.
    #[serde(default)]
    pub since_ms: Option<u64>,
}

/// Body of a Failure reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureBody {
    /// Human-readable description of what went wrong.
    pub message: String,
}

/// One live VM in an Info reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSummary {
    /// Full id of the VM.
    pub id: Vec<String>,
    /// Delegated CPU the VM runs on.
    pub cpuid: u16,
    /// Memory reservation in MB.
    pub memory_mb: u32,
    /// Name of the attached block device, if any.
    pub block_device: Option<String>,
    /// Bridge names the VM is attached to.
    pub networks: Vec<String>,
    /// Wall-clock start, milliseconds since the epoch.
    pub started_ms: u64,
}

/// Body of a successful Info reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoReplyBody {
    pub vms: Vec<VmSummary>,
}

/// Body of a CrlFetch command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlFetchBody {
    /// Common name of the issuer whose revocation list is requested.
    pub issuer: String,
}

/// Body of a successful CrlFetch reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrlReplyBody {
    pub issuer: String,
    /// DER-encoded revocation list.
    pub der: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Body types: events
// ---------------------------------------------------------------------------

/// A console line pushed by the console helper and fanned out to
/// subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLineBody {
    /// Full id of the VM the line belongs to.
    pub id: Vec<String>,
    /// Capture time, milliseconds since the epoch.
    pub ts_ms: u64,
    /// Raw line bytes (console output is not necessarily UTF-8).
    pub line: Vec<u8>,
}

/// A log line concerning a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLineBody {
    /// Full id of the VM the line concerns.
    pub id: Vec<String>,
    /// Event time, milliseconds since the epoch.
    pub ts_ms: u64,
    pub line: String,
}

/// One statistics sample for a tracked pid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSample {
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// Cumulative CPU time in clock ticks (utime + stime).
    pub cpu_ticks: u64,
}

/// A statistics event pushed by the stats helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatSampleBody {
    /// Full id of the VM the sample belongs to.
    pub id: Vec<String>,
    /// Sample time, milliseconds since the epoch.
    pub ts_ms: u64,
    pub sample: StatSample,
}

// ---------------------------------------------------------------------------
// Body types: helper control
// ---------------------------------------------------------------------------

/// Engine → stats helper: start tracking `pid` under `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatAddBody {
    pub id: Vec<String>,
    pub pid: u32,
}

/// Engine → stats helper: stop tracking `pid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRemoveBody {
    pub pid: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(
            Tag::Console,
            &PathBody::new(vec!["tenant".into(), "vm1".into()]),
        )
        .unwrap();
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.tag, Tag::Console);
        assert_eq!(decoded.version, WIRE_VERSION);
        let body: PathBody = decoded.parse().unwrap();
        assert_eq!(body.path, vec!["tenant".to_string(), "vm1".to_string()]);
    }

    #[test]
    fn frame_empty_body() {
        let frame = Frame::bare(Tag::Create);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.tag, Tag::Create);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn header_is_big_endian() {
        let frame = Frame {
            version: 0x0102,
            tag: Tag::Success,
            body: vec![0xAA],
        };
        let bytes = frame.encode();
        assert_eq!(&bytes[..HEADER_SIZE], &[0x01, 0x02, 0x01, 0x00, 0, 0, 0, 1]);
    }

    #[test]
    fn tag_try_from_valid() {
        for &(raw, expected) in &[
            (0x0001u16, Tag::Info),
            (0x0002, Tag::Create),
            (0x0003, Tag::ForceCreate),
            (0x0004, Tag::Destroy),
            (0x0005, Tag::Console),
            (0x0006, Tag::Log),
            (0x0007, Tag::Statistics),
            (0x0008, Tag::CrlFetch),
            (0x0100, Tag::Success),
            (0x0101, Tag::Failure),
            (0x0200, Tag::ConsoleLine),
            (0x0201, Tag::LogLine),
            (0x0202, Tag::StatSample),
            (0x0300, Tag::ConsoleAttach),
            (0x0301, Tag::ConsoleDetach),
            (0x0302, Tag::StatAdd),
            (0x0303, Tag::StatRemove),
            (0x0304, Tag::StatRequest),
        ] {
            assert_eq!(Tag::try_from(raw).unwrap(), expected);
        }
    }

    #[test]
    fn tag_try_from_invalid() {
        assert!(matches!(Tag::try_from(0), Err(WireError::UnknownTag(0))));
        assert!(Tag::try_from(0x0009).is_err());
        assert!(Tag::try_from(0xFFFF).is_err());
    }

    #[test]
    fn tag_spaces() {
        assert!(Tag::Info.is_command());
        assert!(Tag::CrlFetch.is_command());
        assert!(!Tag::Success.is_command());
        assert!(!Tag::ConsoleLine.is_command());
    }

    #[test]
    fn decode_truncated() {
        assert!(matches!(Frame::decode(&[0, 0]), Err(WireError::Eof)));
        // Header says 10 bytes body but only 2 present
        let data = [0, 0, 0, 0x01, 0, 0, 0, 10, 0xAA, 0xBB];
        assert!(matches!(Frame::decode(&data), Err(WireError::Eof)));
    }

    #[test]
    fn decode_oversized() {
        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&(Tag::Create as u16).to_be_bytes());
        data.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Frame::decode(&data),
            Err(WireError::Oversized(u32::MAX))
        ));
    }

    #[test]
    fn two_frames_on_one_stream() {
        let a = Frame::new(Tag::Info, &PathBody::default()).unwrap();
        let b = Frame::failure("no such vm", WIRE_VERSION);
        let mut stream = a.encode();
        stream.extend_from_slice(&b.encode());

        let mut cursor = std::io::Cursor::new(stream);
        let first = Frame::read_from_sync(&mut cursor).unwrap();
        let second = Frame::read_from_sync(&mut cursor).unwrap();
        assert_eq!(first, a);
        assert_eq!(second, b);
        assert!(matches!(
            Frame::read_from_sync(&mut cursor),
            Err(WireError::Eof)
        ));
    }

    #[tokio::test]
    async fn async_read_round_trip() {
        let frame = Frame::new(
            Tag::LogLine,
            &LogLineBody {
                id: vec!["t".into(), "v".into()],
                ts_ms: 1700000000000,
                line: "booted".into(),
            },
        )
        .unwrap();
        let bytes = frame.encode();
        let mut reader: &[u8] = &bytes;
        let decoded = Frame::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn failure_constructor() {
        let frame = Frame::failure("memory: 200 > 128 remaining", 0);
        assert_eq!(frame.tag, Tag::Failure);
        let body: FailureBody = frame.parse().unwrap();
        assert_eq!(body.message, "memory: 200 > 128 remaining");
    }

    #[test]
    fn stat_bodies_round_trip() {
        let body = StatSampleBody {
            id: vec!["tenant".into(), "vm".into()],
            ts_ms: 1,
            sample: StatSample {
                rss_bytes: 4096,
                cpu_ticks: 250,
            },
        };
        let frame = Frame::new(Tag::StatSample, &body).unwrap();
        let parsed: StatSampleBody = Frame::decode(&frame.encode()).unwrap().parse().unwrap();
        assert_eq!(parsed.sample, body.sample);
        assert_eq!(parsed.id, body.id);
    }
}
