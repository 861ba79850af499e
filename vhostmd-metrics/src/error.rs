//! Crate-wide error types.
//!
//! Each subsystem gets its own error enum; [`MetricsError`] aggregates them
//! with `#[from]` conversions so callers can use `?` across module
//! boundaries while still matching on the concrete cause when they need to.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The top-level error type for this crate.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Virtio(#[from] VirtioError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Guest(#[from] GuestError),
}

/// Errors from loading and DTD-checking the `<vhostmd>` configuration
/// document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}", path = path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration document is not well-formed xml")]
    Malformed(#[source] quick_xml::Error),

    #[error("configuration document fails dtd validation: {reason}")]
    DtdValidation { reason: String },

    #[error("globals/disk/size value {value} overflows with unit multiplier {mult}")]
    SizeOverflow { value: u64, mult: u64 },

    #[error("globals/disk/size must be a non-negative integer, got {value:?}")]
    InvalidSize { value: String },

    #[error("globals/disk/size of {value} bytes is outside the allowed range [{min}, {max}]")]
    SizeOutOfRange { value: u64, min: u64, max: u64 },

    #[error("globals/disk/size has an unrecognized unit {unit:?}")]
    UnknownSizeUnit { unit: String },

    #[error("globals/update_period must be a positive integer number of seconds, got {value:?}")]
    InvalidUpdatePeriod { value: String },

    #[error("globals/transport value {value:?} is not one of vbd, xenstore, virtio")]
    UnknownTransport { value: String },
}

/// Errors from evaluating a single metric definition.
#[derive(Error, Debug)]
pub enum MetricError {
    #[error("failed to spawn action {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("action {command:?} exited with status {status}")]
    NonZeroExit { command: String, status: i32 },

    #[error("metric {name}'s xml output failed dtd validation: {reason}")]
    FragmentValidation { name: String, reason: String },
}

/// Errors from the raw metrics disk transport.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to create directory {path}", path = path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open metrics disk {path}", path = path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write metrics disk header")]
    HeaderWrite(#[source] io::Error),

    #[error("failed to write metrics disk payload")]
    PayloadWrite(#[source] io::Error),

    #[error("failed to zero-fill metrics disk payload region")]
    ZeroFill(#[source] io::Error),

    #[error("buffer of {used} bytes does not fit a disk of size {size} bytes (16-byte header)")]
    PayloadTooLarge { used: usize, size: u64 },

    #[error(
        "metrics disk signature mismatch at {path}: expected {expected:#010x}, found {found:#010x}",
        path = path.display()
    )]
    BadSignature {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("metrics disk checksum mismatch: header said {expected:#010x}, computed {found:#010x}")]
    ChecksumMismatch { expected: u32, found: u32 },

    #[error("failed to read metrics disk {path}", path = path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no candidate block device produced a valid vhostmd signature")]
    NoDeviceFound,
}

/// Errors from the virtio channel transport.
#[derive(Error, Debug)]
pub enum VirtioError {
    #[error("channel pool is full (channel_max = {channel_max})")]
    PoolFull { channel_max: usize },

    #[error("failed to create epoll instance")]
    EpollCreate(#[source] nix::Error),

    #[error("epoll_wait failed")]
    EpollWait(#[source] nix::Error),

    #[error("failed to connect channel socket {path}", path = path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("channel send failed")]
    Send(#[source] io::Error),

    #[error("channel recv failed")]
    Recv(#[source] io::Error),

    #[error("channel discovery directory {path} is not readable", path = path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors from the key/value store transport.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("failed to read domain uuid at {path}", path = path.display())]
    ReadUuid {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write metrics key at {path}", path = path.display())]
    WriteMetrics {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read metrics key at {path}", path = path.display())]
    ReadMetrics {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors from the publication loop itself, as opposed to the transports
/// and metrics it drives (those surface through their own enums).
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("no transports are enabled; the daemon would publish nothing")]
    NoTransportsEnabled,

    #[error("failed to enumerate running domains")]
    DomainEnumeration(#[source] io::Error),
}

/// Errors from the guest-side reader.
#[derive(Error, Debug)]
pub enum GuestError {
    #[error("no metrics source is available (tried disk, virtio, kv)")]
    NoSource,

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Virtio(#[from] VirtioError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("metric {name:?} not found for context {context}")]
    MetricNotFound { name: String, context: String },

    #[error("value {value:?} of metric {name:?} failed to parse as {type_str}")]
    ValueParse {
        name: String,
        type_str: String,
        value: String,
    },

    #[error("failed to write output")]
    OutputWrite(#[source] io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MetricsError>;
