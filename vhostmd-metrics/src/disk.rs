//! The raw metrics block device transport (T-DISK).
//!
//! The wire format is a 16-byte big-endian header — signature, busy flag,
//! checksum, payload length — followed by the XML payload, shared between
//! one writer (the host daemon) and any number of readers (guest clients)
//! with no locking: readers detect a write in progress via the busy flag
//! and a checksum recheck, and retry.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use crate::buffer::{checksum_bytes, Buffer};
use crate::error::DiskError;

/// `"mvbd"` read as a big-endian u32: the metrics disk's magic signature.
pub const SIGNATURE: u32 = 0x6d76_6264;

/// Header size in bytes: signature, busy flag, checksum, length, each a
/// big-endian u32.
pub const HEADER_SIZE: u64 = 16;

pub const MIN_DISK_SIZE: u64 = 1024;
pub const MAX_DISK_SIZE: u64 = 256 * 1024 * 1024;

const ZERO_CHUNK: usize = 1024;
const READ_ALIGNMENT: usize = 65536;
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Creates (or truncates and re-creates) the metrics block device file at
/// `path` with `size` bytes: directory chain, an unset header (`busy=1`
/// until the first [`publish`]), and a zero-filled payload region.
pub fn create(path: &Path, size: u64) -> Result<File, DiskError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        match std::fs::create_dir_all(parent) {
            Ok(()) => {
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(source) => {
                return Err(DiskError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })
            }
        }
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map_err(|source| DiskError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    write_header(&mut file, 0, 1, 0, 0).map_err(DiskError::HeaderWrite)?;
    file.set_len(size).map_err(|source| DiskError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    file.seek(SeekFrom::Start(HEADER_SIZE))
        .map_err(DiskError::ZeroFill)?;
    let zeros = [0u8; ZERO_CHUNK];
    let mut remaining = size.saturating_sub(HEADER_SIZE);
    while remaining > 0 {
        let chunk = remaining.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&zeros[..chunk]).map_err(DiskError::ZeroFill)?;
        remaining -= chunk as u64;
    }
    file.flush().map_err(DiskError::ZeroFill)?;
    Ok(file)
}

/// Publishes `buffer`'s contents to a metrics disk of `size` bytes backed
/// by `file`. Rejects payloads that don't fit before touching the header.
pub fn publish(file: &mut File, size: u64, buffer: &Buffer) -> Result<(), DiskError> {
    let used = buffer.len();
    let capacity = size.saturating_sub(HEADER_SIZE);
    if used as u64 > capacity {
        return Err(DiskError::PayloadTooLarge { used, size });
    }

    let sum = buffer.checksum();
    write_header(file, SIGNATURE, 1, sum, used as u32).map_err(DiskError::HeaderWrite)?;

    file.seek(SeekFrom::Start(HEADER_SIZE))
        .map_err(DiskError::PayloadWrite)?;
    file.write_all(buffer.as_slice())
        .map_err(DiskError::PayloadWrite)?;
    file.flush().map_err(DiskError::PayloadWrite)?;

    write_busy(file, 0).map_err(DiskError::HeaderWrite)?;
    Ok(())
}

fn write_header(file: &mut File, sig: u32, busy: u32, sum: u32, length: u32) -> std::io::Result<()> {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&sig.to_be_bytes());
    header[4..8].copy_from_slice(&busy.to_be_bytes());
    header[8..12].copy_from_slice(&sum.to_be_bytes());
    header[12..16].copy_from_slice(&length.to_be_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    file.flush()
}

fn write_busy(file: &mut File, busy: u32) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(4))?;
    file.write_all(&busy.to_be_bytes())?;
    file.flush()
}

fn decode_header(bytes: &[u8]) -> (u32, u32, u32, u32) {
    (
        u32::from_be_bytes(bytes[0..4].try_into().unwrap()),
        u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
        u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
        u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
    )
}

/// Reads the metrics disk at `path` using `O_DIRECT` and block-aligned
/// buffers, retrying on the busy flag and on a checksum mismatch observed
/// between the payload read and the header recheck.
pub fn read(path: &Path, out: &mut Buffer) -> Result<(), DiskError> {
    read_impl(path, true, out)
}

/// Bypasses `O_DIRECT` for callers exercising the disk transport against a
/// tmpfs- or tempfile-backed fixture, where real `O_DIRECT` support is
/// unreliable. Not part of the production read path.
#[doc(hidden)]
pub fn read_no_direct(path: &Path, out: &mut Buffer) -> Result<(), DiskError> {
    read_impl(path, false, out)
}

fn read_impl(path: &Path, direct: bool, out: &mut Buffer) -> Result<(), DiskError> {
    let mut open_opts = OpenOptions::new();
    open_opts.read(true);
    if direct {
        open_opts.custom_flags(libc::O_DIRECT);
    }
    let file = open_opts.open(path).map_err(|source| DiskError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    loop {
        let mut header_buf = AlignedBuffer::new(HEADER_SIZE as usize);
        read_aligned(&file, 0, header_buf.as_mut_slice()).map_err(|source| DiskError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let (sig, busy, sum, length) = decode_header(header_buf.as_slice());

        if sig != SIGNATURE {
            return Err(DiskError::BadSignature {
                path: path.to_path_buf(),
                expected: SIGNATURE,
                found: sig,
            });
        }
        if busy != 0 {
            sleep(BUSY_RETRY_DELAY);
            continue;
        }

        // `O_DIRECT` requires the file offset to be block-aligned, so the
        // payload can't be read starting at `HEADER_SIZE` (16). Instead,
        // like `odirect_read`, read one aligned buffer from offset 0 that
        // covers header and payload together, then slice the payload back
        // out of it.
        let total_len = HEADER_SIZE as usize + length as usize;
        let mut combined = AlignedBuffer::new(total_len);
        // Read the buffer's full rounded-up length, not just `total_len`:
        // `O_DIRECT` requires the transfer size itself to be block-aligned,
        // not only the offset.
        read_aligned(&file, 0, combined.as_mut_slice()).map_err(|source| DiskError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut recheck = AlignedBuffer::new(HEADER_SIZE as usize);
        read_aligned(&file, 0, recheck.as_mut_slice()).map_err(|source| DiskError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let (_, busy2, sum2, _) = decode_header(recheck.as_slice());
        if busy2 != 0 || sum2 != sum {
            continue;
        }

        let payload = &combined.as_slice()[HEADER_SIZE as usize..total_len];
        if checksum_bytes(payload) != sum {
            continue;
        }

        out.erase();
        out.add(payload);
        return Ok(());
    }
}

fn read_aligned(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut total = 0usize;
    while total < buf.len() {
        let n = file.read_at(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break; // short file: remainder stays zeroed, which is harmless past `length`
        }
        total += n;
    }
    Ok(())
}

/// A heap buffer aligned to [`READ_ALIGNMENT`] (64 KiB) and sized up to
/// the next multiple of it, suitable for `O_DIRECT` reads.
struct AlignedBuffer {
    ptr: std::ptr::NonNull<u8>,
    layout: std::alloc::Layout,
    len: usize,
}

impl AlignedBuffer {
    fn new(min_len: usize) -> Self {
        let rounded = min_len.next_multiple_of(READ_ALIGNMENT).max(READ_ALIGNMENT);
        let layout = std::alloc::Layout::from_size_align(rounded, READ_ALIGNMENT)
            .expect("rounded size and 64 KiB alignment always form a valid layout");
        // SAFETY: `layout` has non-zero size, satisfying `alloc_zeroed`'s precondition.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = std::ptr::NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        AlignedBuffer { ptr, layout, len: rounded }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points to `layout.size()` bytes we own for `self`'s lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: same allocation as `as_slice`; `&mut self` gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`layout` are exactly what `alloc_zeroed` returned and are
        // never reallocated or shared past this point.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_writes_busy_header_and_zeroed_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vhostmd0");
        let mut file = create(&path, 1024).unwrap();

        let meta = file.metadata().unwrap();
        assert_eq!(meta.len(), 1024);

        let mut header = [0u8; 16];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut header).unwrap();
        let (sig, busy, sum, length) = decode_header(&header);
        assert_eq!(sig, 0);
        assert_eq!(busy, 1);
        assert_eq!(sum, 0);
        assert_eq!(length, 0);
    }

    #[test]
    fn publish_then_read_round_trips_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vhostmd0");
        let mut file = create(&path, 4096).unwrap();

        let mut buf = Buffer::create(0);
        buf.add_str("<metrics>\n<metric type='uint64' context='host'><name>UsedMem</name><value>42</value></metric>\n</metrics>\n");
        publish(&mut file, 4096, &buf).unwrap();

        let mut header = [0u8; 16];
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_exact(&mut header).unwrap();
        let (sig, busy, sum, length) = decode_header(&header);
        assert_eq!(sig, SIGNATURE);
        assert_eq!(busy, 0);
        assert_eq!(sum, buf.checksum());
        assert_eq!(length as usize, buf.len());

        let mut out = Buffer::create(0);
        read_impl(&path, false, &mut out).unwrap();
        assert_eq!(out.as_slice(), buf.as_slice());
    }

    #[test]
    fn publish_rejects_oversized_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vhostmd0");
        let mut file = create(&path, 32).unwrap();
        let mut buf = Buffer::create(0);
        buf.add(&[0u8; 100]);
        let err = publish(&mut file, 32, &buf).unwrap_err();
        assert!(matches!(err, DiskError::PayloadTooLarge { .. }));
    }

    #[test]
    fn read_rejects_bad_signature() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vhostmd0");
        let _file = create(&path, 1024).unwrap();
        // `create` leaves sig=0 (no publish has happened yet).
        let mut out = Buffer::create(0);
        let err = read_impl(&path, false, &mut out).unwrap_err();
        assert!(matches!(err, DiskError::BadSignature { .. }));
    }

    #[test]
    fn aligned_buffer_rounds_up_to_64kib() {
        let buf = AlignedBuffer::new(16);
        assert_eq!(buf.len, READ_ALIGNMENT);
        assert_eq!(buf.ptr.as_ptr() as usize % READ_ALIGNMENT, 0);
    }
}
