//! A growable byte buffer with the append/erase/checksum operations the
//! metric engine and transports share.
//!
//! [`Buffer::erase`] zeroes the used region and resets the length but keeps
//! the allocation, so a tick doesn't pay for a fresh allocation every
//! period; [`Buffer::empty`] releases the storage outright for callers that
//! are actually done with it.

/// A growable, reusable byte buffer.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    used: usize,
}

impl Buffer {
    /// Creates a buffer with at least `initial_capacity` bytes reserved.
    pub fn create(initial_capacity: usize) -> Self {
        Buffer {
            storage: vec![0u8; initial_capacity],
            used: 0,
        }
    }

    /// Number of bytes currently in use.
    pub fn len(&self) -> usize {
        self.used
    }

    /// Whether the buffer currently holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.used]
    }

    /// Appends raw bytes, growing storage to exactly fit if needed.
    pub fn add(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.storage[self.used..self.used + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
    }

    /// Appends a `&str`. Convenience wrapper over [`Buffer::add`] for the
    /// common case of appending literal XML fragments.
    pub fn add_str(&mut self, s: &str) {
        self.add(s.as_bytes());
    }

    /// Appends a formatted string, the equivalent of the original buffer's
    /// `vsprintf` append. Call as `buf.vsprintf(format_args!("{name}={val}"))`.
    pub fn vsprintf(&mut self, args: std::fmt::Arguments<'_>) {
        let formatted = std::fmt::format(args);
        self.add(formatted.as_bytes());
    }

    fn reserve(&mut self, need: usize) {
        let required = self.used + need;
        if required > self.storage.len() {
            self.storage.resize(required, 0);
        }
    }

    /// Resets the length to zero and zeroes the bytes that were in use, so
    /// a transport that accidentally reads past `used` never observes a
    /// previous tick's content.
    pub fn erase(&mut self) {
        self.storage[..self.used].fill(0);
        self.used = 0;
    }

    /// Releases the backing storage entirely.
    pub fn empty(&mut self) {
        self.storage = Vec::new();
        self.used = 0;
    }

    /// Arithmetic sum of the bytes in use, modulo 2^32, matching the disk
    /// transport's checksum field.
    pub fn checksum(&self) -> u32 {
        checksum_bytes(self.as_slice())
    }
}

/// Arithmetic byte-sum modulo 2^32, shared by the buffer checksum and the
/// disk transport header.
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_grows_storage() {
        let mut buf = Buffer::create(0);
        buf.add(b"hello");
        assert_eq!(buf.as_slice(), b"hello");
        buf.add(b" world");
        assert_eq!(buf.as_slice(), b"hello world");
    }

    #[test]
    fn vsprintf_appends_formatted_text() {
        let mut buf = Buffer::create(0);
        buf.vsprintf(format_args!("<name>{}</name>", "UsedMem"));
        assert_eq!(buf.as_slice(), b"<name>UsedMem</name>");
    }

    #[test]
    fn erase_zeroes_and_resets_length_but_keeps_capacity() {
        let mut buf = Buffer::create(8);
        buf.add(b"data");
        let cap_before = buf.storage.len();
        buf.erase();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.storage.len(), cap_before);
        assert!(buf.storage.iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_releases_storage() {
        let mut buf = Buffer::create(64);
        buf.add(b"x");
        buf.empty();
        assert_eq!(buf.storage.len(), 0);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn checksum_matches_manual_sum() {
        let mut buf = Buffer::create(0);
        buf.add(&[1, 2, 3, 250]);
        assert_eq!(buf.checksum(), 1 + 2 + 3 + 250);
    }

    #[test]
    fn checksum_wraps_at_u32_boundary() {
        let bytes = vec![255u8; 1 << 20];
        let sum = checksum_bytes(&bytes);
        let expected = ((255u64 * bytes.len() as u64) % (1u64 << 32)) as u32;
        assert_eq!(sum, expected);
    }

    #[test]
    fn reused_buffer_never_leaks_prior_tick_bytes_past_used() {
        let mut buf = Buffer::create(0);
        buf.add(b"first-tick-payload");
        buf.erase();
        buf.add(b"x");
        // Anything beyond `used` must still be zero, not leftover "first-tick" bytes.
        assert!(buf.storage[buf.len()..].iter().all(|&b| b == 0));
    }
}
