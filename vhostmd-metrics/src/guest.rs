//! The guest-side reader (spec.md §4.8): retrieves the `<metrics>` document
//! over whichever transport is available and answers single-metric lookups.
//!
//! Mirrors `libmetrics.c`'s `dump_metrics`/`get_virtio_metrics`/`get_metric`:
//! scan `/sys/block` for the disk signature, fall back to the virtio serial
//! port, then the KV store, and cache the last-seen disk payload so repeated
//! [`MetricsClient::get_metric`] calls don't re-read the disk every time.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::buffer::{checksum_bytes, Buffer};
use crate::disk;
use crate::error::GuestError;
use crate::kv;

/// Default path to the virtio serial port the host exports to this guest.
pub const DEFAULT_VIRTIO_DEV: &str = "/dev/virtio-ports/org.github.vhostmd.1";

const VIRTIO_REQUEST: &[u8] = b"GET /metrics/XML\n\n";
const VIRTIO_END_TOKEN: &[u8] = b"\n\n";
const VIRTIO_INITIAL_BUF: usize = 1 << 16;
const VIRTIO_MAX_BUF: usize = 1 << 24;
const VIRTIO_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Which source a guest-side read should use. `Auto` is the default:
/// disk, then virtio, then kv, matching `vm-dump-metrics/main.c`'s
/// no-flags-given behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Source {
    #[default]
    Auto,
    Disk,
    Virtio,
    Kv,
}

/// A decoded scalar value read back from a `<metric>` element.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Real32(f32),
    Real64(f64),
    String(String),
}

/// Reads the metrics disk by scanning `/sys/block` entries until one
/// produces a valid `vhostmd` signature, matching `dump_metrics`'s device
/// probing loop. Returns the raw XML payload.
pub fn dump_disk() -> Result<Vec<u8>, GuestError> {
    let mut out = Buffer::create(0);
    for candidate in sys_block_candidates()? {
        match disk::read(&candidate, &mut out) {
            Ok(()) => return Ok(out.as_slice().to_vec()),
            Err(_) => continue,
        }
    }
    Err(GuestError::Disk(crate::error::DiskError::NoDeviceFound))
}

fn sys_block_candidates() -> Result<Vec<PathBuf>, GuestError> {
    let sys_block = Path::new("/sys/block");
    let entries = std::fs::read_dir(sys_block).map_err(|source| {
        GuestError::Disk(crate::error::DiskError::Read {
            path: sys_block.to_path_buf(),
            source,
        })
    })?;
    Ok(entries
        .flatten()
        .map(|e| PathBuf::from("/dev").join(e.file_name()))
        .collect())
}

/// Requests the metrics document from the virtio serial channel at `dev`
/// (default [`DEFAULT_VIRTIO_DEV`]), honoring the 30 s overall timeout and
/// 16 MiB response cap that `get_virtio_metrics` uses.
pub fn dump_virtio(dev: Option<&Path>) -> Result<Vec<u8>, GuestError> {
    let path = dev.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_VIRTIO_DEV));
    let mut stream = open_virtio(&path)?;

    write_all_nonblocking(&mut stream, VIRTIO_REQUEST)?;

    let start = Instant::now();
    let mut response = vec![0u8; VIRTIO_INITIAL_BUF];
    let mut pos = 0usize;

    loop {
        match stream.read(&mut response[pos..]) {
            Ok(0) => break,
            Ok(n) => {
                pos += n;
                if pos >= VIRTIO_END_TOKEN.len() && &response[pos - VIRTIO_END_TOKEN.len()..pos] == VIRTIO_END_TOKEN {
                    break;
                }
                if pos + 1 >= response.len() {
                    let next_len = response.len() * 2;
                    if next_len > VIRTIO_MAX_BUF {
                        return Err(GuestError::Virtio(crate::error::VirtioError::Recv(
                            std::io::Error::other("virtio response exceeded 16 MiB cap"),
                        )));
                    }
                    response.resize(next_len, 0);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() > Duration::from_secs(30) {
                    return Err(GuestError::Virtio(crate::error::VirtioError::Recv(
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout after 30s"),
                    )));
                }
                std::thread::sleep(VIRTIO_POLL_INTERVAL);
            }
            Err(source) => return Err(GuestError::Virtio(crate::error::VirtioError::Recv(source))),
        }
    }

    response.truncate(pos);
    Ok(response)
}

fn open_virtio(path: &Path) -> Result<UnixStream, GuestError> {
    UnixStream::connect(path)
        .and_then(|s| {
            s.set_nonblocking(true)?;
            Ok(s)
        })
        .map_err(|source| GuestError::Virtio(crate::error::VirtioError::Connect {
            path: path.to_path_buf(),
            source,
        }))
}

fn write_all_nonblocking(stream: &mut UnixStream, mut buf: &[u8]) -> Result<(), GuestError> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => {
                return Err(GuestError::Virtio(crate::error::VirtioError::Send(
                    std::io::Error::other("write returned 0"),
                )))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(VIRTIO_POLL_INTERVAL);
            }
            Err(source) => return Err(GuestError::Virtio(crate::error::VirtioError::Send(source))),
        }
    }
    Ok(())
}

/// Reads this domain's metrics key from the KV store at `domain_path`.
pub fn dump_kv(domain_path: &Path) -> Result<Vec<u8>, GuestError> {
    Ok(kv::read_metrics(domain_path)?)
}

/// Writes `payload` to `dest`, or to standard output when `dest` is `None`,
/// verbatim.
pub fn write_payload(payload: &[u8], dest: Option<&Path>) -> Result<(), GuestError> {
    match dest {
        Some(path) => std::fs::write(path, payload).map_err(GuestError::OutputWrite),
        None => std::io::stdout().write_all(payload).map_err(GuestError::OutputWrite),
    }
}

/// Caches the last-fetched disk payload and its checksum so repeated
/// [`MetricsClient::get_metric`] calls don't re-read the disk when nothing
/// has changed, matching `libmetrics.c`'s cached `metric_disk` handle.
#[derive(Default)]
pub struct MetricsClient {
    cached: Option<Buffer>,
    cached_sum: Option<u32>,
}

impl MetricsClient {
    pub fn new() -> Self {
        MetricsClient::default()
    }

    /// Fetches and caches the current disk payload if the checksum has
    /// changed since the last call (or if nothing has been fetched yet).
    fn refresh(&mut self) -> Result<(), GuestError> {
        let payload = dump_disk()?;
        let sum = checksum_bytes(&payload);
        if self.cached_sum != Some(sum) {
            let mut buf = Buffer::create(payload.len());
            buf.add(&payload);
            self.cached = Some(buf);
            self.cached_sum = Some(sum);
        }
        Ok(())
    }

    /// Looks up a single metric by `(name, context)` via an XPath-style
    /// scan of the cached document, decoding its `@type` and `<value>`
    /// into the matching [`MetricValue`]. Refreshes the disk cache first.
    pub fn get_metric(&mut self, name: &str, context: &str) -> Result<MetricValue, GuestError> {
        self.refresh()?;
        let buf = self.cached.as_ref().expect("refresh populates cached on success");
        let xml = std::str::from_utf8(buf.as_slice()).unwrap_or_default();
        let (type_str, value_str) = find_metric(xml, name, context).ok_or_else(|| GuestError::MetricNotFound {
            name: name.to_string(),
            context: context.to_string(),
        })?;
        parse_value(&type_str, &value_str).map_err(|e| match e {
            GuestError::ValueParse { type_str, value, .. } => GuestError::ValueParse {
                name: name.to_string(),
                type_str,
                value,
            },
            other => other,
        })
    }
}

/// Scans a `<metrics>` document for `<metric>` elements matching
/// `name`/`context`, returning `(type, value)` for the first match. The
/// original's XPath `//metrics/metric[name=$name][@context=$ctx]` is
/// equivalent to this linear scan since metric names are unique per
/// context.
fn find_metric(xml: &str, name: &str, context: &str) -> Option<(String, String)> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut depth_type: Option<String> = None;
    let mut depth_context: Option<String> = None;
    let mut in_name = false;
    let mut in_value = false;
    let mut seen_name: Option<String> = None;
    let mut seen_value: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if tag == "metric" {
                    depth_type = attr(&e, "type");
                    depth_context = attr(&e, "context");
                    seen_name = None;
                    seen_value = None;
                } else if tag == "name" {
                    in_name = true;
                } else if tag == "value" {
                    in_value = true;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                if in_name {
                    seen_name = Some(text);
                } else if in_value {
                    seen_value = Some(text);
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match tag.as_str() {
                    "name" => in_name = false,
                    "value" => in_value = false,
                    "metric" => {
                        if seen_name.as_deref() == Some(name) && depth_context.as_deref() == Some(context) {
                            if let (Some(ty), Some(val)) = (depth_type.clone(), seen_value.clone()) {
                                return Some((ty, val));
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

fn attr(e: &quick_xml::events::BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key.as_bytes())
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Parses `value` as the scalar type named by `type_str`, rejecting
/// malformed input rather than the original's permissive `atoi`/`atoll`.
fn parse_value(type_str: &str, value: &str) -> Result<MetricValue, GuestError> {
    let parse_err = || GuestError::ValueParse {
        name: String::new(),
        type_str: type_str.to_string(),
        value: value.to_string(),
    };
    match type_str {
        "int32" => value.parse().map(MetricValue::Int32).map_err(|_| parse_err()),
        "uint32" => value.parse().map(MetricValue::Uint32).map_err(|_| parse_err()),
        "int64" => value.parse().map(MetricValue::Int64).map_err(|_| parse_err()),
        "uint64" => value.parse().map(MetricValue::Uint64).map_err(|_| parse_err()),
        "real32" => value.parse().map(MetricValue::Real32).map_err(|_| parse_err()),
        "real64" => value.parse().map(MetricValue::Real64).map_err(|_| parse_err()),
        "string" => Ok(MetricValue::String(value.to_string())),
        _ => Err(parse_err()),
    }
}
