//! The virtio channel transport (T-VIO): an epoll-driven, single-threaded
//! reactor that discovers per-domain UNIX sockets exported by the host
//! virtualization stack, serves a line-terminated metrics request, and
//! tracks a bounded pool of channels.
//!
//! Slot 0 is permanently allocated to host metrics and carries no socket.
//! Everything the publication loop and the reactor thread both touch
//! (channel ids, the id-map, per-channel metrics buffers) lives in
//! [`Shared`] behind one mutex; fd state, epoll registration, and the
//! request/response buffers are owned exclusively by the reactor thread
//! in [`SlotIo`], which nothing outside the reactor ever reaches.

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::error::VirtioError;

/// Sentinel marking a free id-map entry or channel slot.
const FREE: i64 = -1;

/// Fixed wall-clock slice the reactor spends in `epoll_wait` before
/// returning to check for shutdown and run channel expiration.
const SLICE: Duration = Duration::from_secs(3);

const REQUEST_BUF_CAP: usize = 256;
const REQUEST_LF: &[u8] = b"GET /metrics/XML\n\n";
const REQUEST_CRLF: &[u8] = b"GET /metrics/XML\r\n\r\n";

/// Host-configurable parameters for the channel pool and discovery.
#[derive(Debug, Clone)]
pub struct VirtioConfig {
    /// Directory the host virtualization stack exports per-domain
    /// channel sockets under, e.g. `/var/lib/libvirt/qemu/channel/target`.
    pub channel_dir: PathBuf,
    /// The exported channel's file name within each domain's directory.
    pub channel_name: String,
    /// Maximum number of concurrent (non-host) channels.
    pub channel_max: usize,
    /// How long a channel may go without a `metrics_update` before the
    /// reactor frees it.
    pub idle_ttl: Duration,
}

impl Default for VirtioConfig {
    fn default() -> Self {
        VirtioConfig {
            channel_dir: PathBuf::from("/var/lib/libvirt/qemu/channel/target"),
            channel_name: "org.github.vhostmd.1".to_string(),
            channel_max: 64,
            idle_ttl: Duration::from_secs(30),
        }
    }
}

/// The reactor's observable lifecycle state (spec.md §4.5/§5): `Init` until
/// the reactor thread's first loop iteration, `Active` for as long as it's
/// polling, `Stop` once shutdown has been signaled and cleanup has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Init = 0,
    Active = 1,
    Stop = 2,
}

impl Status {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Status::Active,
            2 => Status::Stop,
            _ => Status::Init,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IdMapEntry {
    id: i64,
    index: usize,
}

/// The part of each channel both the reactor and the publication loop
/// touch, protected by [`Shared`]'s mutex.
struct SlotShared {
    id: i64,
    domain_name: String,
    metrics: Buffer,
    last_update: Instant,
}

impl SlotShared {
    fn free_at(index: usize) -> Self {
        let _ = index;
        SlotShared {
            id: FREE,
            domain_name: String::new(),
            metrics: Buffer::create(0),
            last_update: Instant::now(),
        }
    }
}

struct Shared {
    /// `channel_max + 1` entries; slot 0 is host metrics.
    slots: Vec<SlotShared>,
    /// `channel_max` entries, always kept sorted with `FREE` last.
    id_map: Vec<IdMapEntry>,
    channel_count: usize,
}

fn sort_id_map(map: &mut [IdMapEntry]) {
    map.sort_by_key(|e| (e.id == FREE, e.id));
}

fn active_len(map: &[IdMapEntry]) -> usize {
    map.partition_point(|e| e.id != FREE)
}

fn find_slot(map: &[IdMapEntry], id: i64) -> Option<usize> {
    let active = &map[..active_len(map)];
    active.binary_search_by_key(&id, |e| e.id).ok().map(|pos| active[pos].index)
}

fn find_or_create(shared: &mut Shared, channel_max: usize, id: i64, name: &str) -> Result<usize, VirtioError> {
    if let Some(index) = find_slot(&shared.id_map, id) {
        return Ok(index);
    }
    if shared.channel_count >= channel_max {
        return Err(VirtioError::PoolFull { channel_max });
    }
    let entry_pos = shared
        .id_map
        .iter()
        .position(|e| e.id == FREE)
        .expect("channel_count < channel_max implies a free id-map entry exists");
    let index = shared.id_map[entry_pos].index;
    shared.id_map[entry_pos].id = id;
    sort_id_map(&mut shared.id_map);
    shared.slots[index] = SlotShared {
        id,
        domain_name: name.to_string(),
        metrics: Buffer::create(0),
        last_update: Instant::now(),
    };
    shared.channel_count += 1;
    Ok(index)
}

/// The part of each channel only the reactor thread ever touches.
struct SlotIo {
    stream: Option<UnixStream>,
    socket_path: Option<PathBuf>,
    request: Buffer,
    response: Buffer,
    response_pos: usize,
}

impl Default for SlotIo {
    fn default() -> Self {
        SlotIo {
            stream: None,
            socket_path: None,
            request: Buffer::create(REQUEST_BUF_CAP),
            response: Buffer::create(0),
            response_pos: 0,
        }
    }
}

enum RequestState {
    Incomplete,
    Valid,
    Invalid,
}

fn classify_request(buf: &[u8]) -> RequestState {
    if buf == REQUEST_LF || buf == REQUEST_CRLF {
        return RequestState::Valid;
    }
    let double_newline = buf.windows(2).any(|w| w == b"\n\n");
    if buf.len() >= REQUEST_BUF_CAP || double_newline {
        RequestState::Invalid
    } else {
        RequestState::Incomplete
    }
}

/// Parses a `domain-<id>-<rest>` discovery directory entry name.
fn parse_domain_entry(name: &str) -> Option<i64> {
    let rest = name.strip_prefix("domain-")?;
    let end = rest.find('-')?;
    rest[..end].parse::<i64>().ok()
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

fn connect_channel(path: &Path) -> std::io::Result<UnixStream> {
    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)?;
    let addr = UnixAddr::new(path)?;
    use std::os::fd::AsRawFd;
    match connect(fd.as_raw_fd(), &addr) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINPROGRESS) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixStream::from(fd))
}

fn epoll_timeout(remaining: Duration) -> EpollTimeout {
    let ms = u16::try_from(remaining.as_millis()).unwrap_or(u16::MAX);
    EpollTimeout::from(ms)
}

/// Owns the epoll instance, the per-channel I/O state, and the reactor
/// loop. Runs entirely on its own thread; created and driven only from
/// [`VirtioServer::start`].
struct Reactor {
    shared: Arc<Mutex<Shared>>,
    status: Arc<AtomicU8>,
    shutdown: Arc<AtomicBool>,
    epoll: Epoll,
    io: Vec<SlotIo>,
    connection_count: usize,
    config: VirtioConfig,
}

impl Reactor {
    fn run(mut self) {
        self.status.store(Status::Active as u8, Ordering::SeqCst);
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.discover() {
                warn!(error = %e, "virtio channel discovery failed");
            }
            if let Err(e) = self.handle_io(SLICE) {
                warn!(error = %e, "virtio epoll wait failed");
            }
            self.expire_idle_channels();
        }
        self.cleanup();
        self.status.store(Status::Init as u8, Ordering::SeqCst);
    }

    fn discover(&mut self) -> Result<(), VirtioError> {
        let channel_count = self.shared.lock().unwrap().channel_count;
        if self.connection_count >= channel_count {
            return Ok(());
        }

        let entries = match std::fs::read_dir(&self.config.channel_dir) {
            Ok(entries) => entries,
            Err(source) => {
                return Err(VirtioError::Discovery {
                    path: self.config.channel_dir.clone(),
                    source,
                })
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(id) = parse_domain_entry(&name) else {
                continue;
            };
            let socket_path = entry.path().join(&self.config.channel_name);
            if !is_socket(&socket_path) {
                continue;
            }

            let index = {
                let mut shared = self.shared.lock().unwrap();
                match find_or_create(&mut shared, self.config.channel_max, id, &name) {
                    Ok(i) => i,
                    Err(_) => {
                        warn!(id, "channel pool exhausted, skipping newly discovered domain");
                        continue;
                    }
                }
            };

            if self.io[index].stream.is_some() {
                continue;
            }

            match connect_channel(&socket_path) {
                Ok(stream) => {
                    let event = EpollEvent::new(EpollFlags::EPOLLIN, index as u64);
                    if let Err(source) = self.epoll.add(stream.as_fd(), event) {
                        warn!(id, error = %source, "epoll_ctl add failed for new channel");
                        continue;
                    }
                    self.io[index].stream = Some(stream);
                    self.io[index].socket_path = Some(socket_path);
                    self.connection_count += 1;
                }
                Err(e) => warn!(id, error = %e, "failed to connect channel socket"),
            }
        }
        Ok(())
    }

    fn handle_io(&mut self, slice: Duration) -> Result<(), VirtioError> {
        let deadline = Instant::now() + slice;
        let mut events = [EpollEvent::empty(); 64];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let n = self
                .epoll
                .wait(&mut events, epoll_timeout(deadline - now))
                .map_err(VirtioError::EpollWait)?;
            for ev in &events[..n] {
                let index = ev.data() as usize;
                let flags = ev.events();
                if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
                    self.disconnect_channel(index);
                } else if flags.contains(EpollFlags::EPOLLIN) {
                    self.recv_and_maybe_respond(index);
                } else if flags.contains(EpollFlags::EPOLLOUT) {
                    self.continue_send(index);
                }
            }
        }
    }

    fn recv_and_maybe_respond(&mut self, index: usize) {
        let mut scratch = [0u8; 4096];
        let read_result = match self.io[index].stream.as_mut() {
            Some(stream) => stream.read(&mut scratch),
            None => return,
        };

        match read_result {
            Ok(0) => {
                self.disconnect_channel(index);
                return;
            }
            Ok(n) => self.io[index].request.add(&scratch[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(_) => {
                self.disconnect_channel(index);
                return;
            }
        }

        match classify_request(self.io[index].request.as_slice()) {
            RequestState::Incomplete => {}
            RequestState::Valid => {
                self.build_response(index, true);
                self.io[index].request.erase();
                self.continue_send(index);
            }
            RequestState::Invalid => {
                self.build_response(index, false);
                self.io[index].request.erase();
                self.continue_send(index);
            }
        }
    }

    fn build_response(&mut self, index: usize, valid: bool) {
        let io = &mut self.io[index];
        io.response.erase();
        io.response_pos = 0;

        if !valid {
            io.response.add_str("INVALID REQUEST\n\n");
            return;
        }

        let shared = self.shared.lock().unwrap();
        io.response.add_str("<metrics>\n");
        if shared.slots[0].metrics.is_empty() {
            io.response.add_str("<!-- host metrics not available -->\n");
        } else {
            io.response.add(shared.slots[0].metrics.as_slice());
        }
        if shared.slots[index].metrics.is_empty() {
            io.response.add_str("<!-- VM metrics not available -->\n");
        } else {
            io.response.add(shared.slots[index].metrics.as_slice());
        }
        io.response.add_str("</metrics>\n\n");
    }

    fn continue_send(&mut self, index: usize) {
        let total = self.io[index].response.len();
        loop {
            let Some(stream) = self.io[index].stream.as_mut() else {
                return;
            };
            if self.io[index].response_pos >= total {
                break;
            }
            let pos = self.io[index].response_pos;
            match stream.write(&self.io[index].response.as_slice()[pos..]) {
                Ok(0) => break,
                Ok(n) => self.io[index].response_pos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.disconnect_channel(index);
                    return;
                }
            }
        }

        let flags = if self.io[index].response_pos < total {
            EpollFlags::EPOLLOUT
        } else {
            EpollFlags::EPOLLIN
        };
        if let Some(stream) = self.io[index].stream.as_ref() {
            let mut event = EpollEvent::new(flags, index as u64);
            if let Err(e) = self.epoll.modify(stream.as_fd(), &mut event) {
                warn!(index, error = %e, "epoll_ctl modify failed");
            }
        }
    }

    /// Closes `index`'s socket on hangup or I/O error. The slot stays
    /// allocated (lifecycle: connected -> disconnected) so discovery can
    /// reconnect the same domain id later without losing its last metrics.
    fn disconnect_channel(&mut self, index: usize) {
        if self.io[index].stream.take().is_some() {
            self.connection_count = self.connection_count.saturating_sub(1);
        }
        self.io[index].socket_path = None;
        self.io[index].request.empty();
        self.io[index].response.empty();
        self.io[index].response_pos = 0;
    }

    /// Frees `index` entirely (lifecycle: connected|disconnected|allocated
    /// -> free): disconnects if still connected, then clears the shared
    /// id/metrics/name and marks the id-map entry `FREE`.
    fn expire_channel(&mut self, index: usize) {
        self.disconnect_channel(index);
        if index == 0 {
            return;
        }
        let mut shared = self.shared.lock().unwrap();
        let id = shared.slots[index].id;
        shared.slots[index] = SlotShared::free_at(index);
        if let Some(entry) = shared.id_map.iter_mut().find(|e| e.index == index && e.id == id) {
            entry.id = FREE;
        }
        sort_id_map(&mut shared.id_map);
        shared.channel_count = shared.channel_count.saturating_sub(1);
    }

    fn expire_idle_channels(&mut self) {
        let now = Instant::now();
        let ttl = self.config.idle_ttl;
        let stale: Vec<usize> = {
            let shared = self.shared.lock().unwrap();
            (1..shared.slots.len())
                .filter(|&i| shared.slots[i].id != FREE && now.duration_since(shared.slots[i].last_update) > ttl)
                .collect()
        };
        for index in stale {
            debug!(index, "expiring idle virtio channel");
            self.expire_channel(index);
        }
    }

    fn cleanup(&mut self) {
        self.status.store(Status::Stop as u8, Ordering::SeqCst);
        for index in 0..self.io.len() {
            self.disconnect_channel(index);
        }
    }
}

/// Owned handle to the running reactor thread. The publication loop talks
/// to it through [`VirtioServer::update`]; [`VirtioServer::stop`] (or
/// dropping it) signals shutdown and joins the reactor thread.
pub struct VirtioServer {
    shared: Arc<Mutex<Shared>>,
    status: Arc<AtomicU8>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl VirtioServer {
    /// Allocates the channel pool and id-map, creates the epoll instance,
    /// and spawns the reactor thread.
    pub fn start(config: VirtioConfig) -> Result<Self, VirtioError> {
        let channel_max = config.channel_max;

        let mut slots = Vec::with_capacity(channel_max + 1);
        slots.push(SlotShared {
            id: 0,
            domain_name: String::new(),
            metrics: Buffer::create(0),
            last_update: Instant::now(),
        });
        for i in 1..=channel_max {
            slots.push(SlotShared::free_at(i));
        }
        let id_map = (0..channel_max).map(|i| IdMapEntry { id: FREE, index: i + 1 }).collect();
        let shared = Arc::new(Mutex::new(Shared {
            slots,
            id_map,
            channel_count: 0,
        }));

        let status = Arc::new(AtomicU8::new(Status::Init as u8));
        let shutdown = Arc::new(AtomicBool::new(false));

        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(VirtioError::EpollCreate)?;
        let io = (0..=channel_max).map(|_| SlotIo::default()).collect();

        let reactor = Reactor {
            shared: Arc::clone(&shared),
            status: Arc::clone(&status),
            shutdown: Arc::clone(&shutdown),
            epoll,
            io,
            connection_count: 0,
            config,
        };

        let thread = std::thread::Builder::new()
            .name("vhostmd-virtio".to_string())
            .spawn(move || reactor.run())
            .expect("failed to spawn the virtio reactor thread");

        Ok(VirtioServer {
            shared,
            status,
            shutdown,
            thread: Some(thread),
        })
    }

    /// The reactor's current lifecycle state.
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Publication-side entry point: replaces `id`'s metrics buffer and
    /// bumps its `last_update_ts`. `id == 0` addresses slot 0 (host
    /// metrics) unconditionally.
    pub fn update(&self, id: u32, name: &str, bytes: &[u8]) -> Result<(), VirtioError> {
        let id = i64::from(id);
        let mut shared = self.shared.lock().unwrap();
        let index = if id == 0 {
            0
        } else {
            let channel_max = shared.id_map.len();
            match find_slot(&shared.id_map, id) {
                Some(i) => i,
                None => find_or_create(&mut shared, channel_max, id, name)?,
            }
        };
        let slot = &mut shared.slots[index];
        slot.metrics.erase();
        slot.metrics.add(bytes);
        slot.last_update = Instant::now();
        Ok(())
    }

    /// Signals the reactor to stop and joins its thread.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VirtioServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_exact_lf_request_is_valid() {
        assert!(matches!(classify_request(REQUEST_LF), RequestState::Valid));
    }

    #[test]
    fn classify_exact_crlf_request_is_valid() {
        assert!(matches!(classify_request(REQUEST_CRLF), RequestState::Valid));
    }

    #[test]
    fn classify_partial_request_is_incomplete() {
        assert!(matches!(classify_request(b"GET /metrics"), RequestState::Incomplete));
    }

    #[test]
    fn classify_garbage_with_terminator_is_invalid() {
        assert!(matches!(classify_request(b"HELLO\n\n"), RequestState::Invalid));
    }

    #[test]
    fn classify_buffer_full_without_match_is_invalid() {
        let buf = vec![b'x'; REQUEST_BUF_CAP];
        assert!(matches!(classify_request(&buf), RequestState::Invalid));
    }

    #[test]
    fn parse_domain_entry_extracts_id() {
        assert_eq!(parse_domain_entry("domain-7-web1"), Some(7));
        assert_eq!(parse_domain_entry("domain-not-a-number-x"), None);
        assert_eq!(parse_domain_entry("not-a-domain-entry"), None);
    }

    #[test]
    fn id_map_keeps_free_sentinels_last_and_supports_binary_search() {
        let mut map = vec![
            IdMapEntry { id: FREE, index: 1 },
            IdMapEntry { id: 5, index: 2 },
            IdMapEntry { id: FREE, index: 3 },
            IdMapEntry { id: 2, index: 4 },
        ];
        sort_id_map(&mut map);
        assert_eq!(active_len(&map), 2);
        assert_eq!(find_slot(&map, 2), Some(4));
        assert_eq!(find_slot(&map, 5), Some(2));
        assert_eq!(find_slot(&map, 99), None);
    }

    #[test]
    fn find_or_create_allocates_then_reuses_the_same_slot() {
        let mut shared = Shared {
            slots: (0..=2).map(SlotShared::free_at).collect(),
            id_map: (0..2).map(|i| IdMapEntry { id: FREE, index: i + 1 }).collect(),
            channel_count: 0,
        };
        let first = find_or_create(&mut shared, 2, 10, "web1").unwrap();
        let second = find_or_create(&mut shared, 2, 10, "web1").unwrap();
        assert_eq!(first, second);
        assert_eq!(shared.channel_count, 1);
    }

    #[test]
    fn find_or_create_rejects_once_pool_is_full() {
        let mut shared = Shared {
            slots: (0..=1).map(SlotShared::free_at).collect(),
            id_map: vec![IdMapEntry { id: FREE, index: 1 }],
            channel_count: 0,
        };
        find_or_create(&mut shared, 1, 1, "a").unwrap();
        let err = find_or_create(&mut shared, 1, 2, "b").unwrap_err();
        assert!(matches!(err, VirtioError::PoolFull { channel_max: 1 }));
    }

    #[test]
    fn update_addresses_slot_zero_for_id_zero() {
        let shared = Arc::new(Mutex::new(Shared {
            slots: (0..=2).map(SlotShared::free_at).collect(),
            id_map: (0..2).map(|i| IdMapEntry { id: FREE, index: i + 1 }).collect(),
            channel_count: 0,
        }));
        let server = VirtioServer {
            shared: Arc::clone(&shared),
            status: Arc::new(AtomicU8::new(Status::Init as u8)),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: None,
        };
        server.update(0, "host", b"<metric/>").unwrap();
        assert_eq!(shared.lock().unwrap().slots[0].metrics.as_slice(), b"<metric/>");
    }

    #[test]
    fn status_reflects_reactor_lifecycle() {
        let server = VirtioServer {
            shared: Arc::new(Mutex::new(Shared {
                slots: (0..=1).map(SlotShared::free_at).collect(),
                id_map: vec![IdMapEntry { id: FREE, index: 1 }],
                channel_count: 0,
            })),
            status: Arc::new(AtomicU8::new(Status::Active as u8)),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: None,
        };
        assert_eq!(server.status(), Status::Active);
    }
}
