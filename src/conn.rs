//! Connection identifiers and the per-connection record

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::buffer::{Buffer, BufferPool};
use crate::clock;

/// Opaque connection identifier: active-table slot index plus a generation
/// discriminator. Zero is reserved as "none", so the raw value packs the
/// generation in the high half and `index + 1` in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64 + 1))
    }

    pub(crate) fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32 - 1
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        Self(token.0 as u64)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle position of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Non-blocking connect issued, completion not yet observed.
    Connecting = 0,
    /// Three-way handshake done; I/O flows.
    Connected = 1,
    /// Being torn down.
    Closing = 2,
    /// Released; sitting in the free pool or GC list.
    Dead = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Closing,
            _ => ConnState::Dead,
        }
    }
}

/// Ordered run of byte buffers awaiting write, chained through the shared
/// buffer pool.
#[derive(Debug, Default)]
pub(crate) struct SendQueue {
    items: VecDeque<Buffer>,
}

impl SendQueue {
    /// Appends `data`, filling the tail item before drawing fresh buffers
    /// from the pool.
    pub(crate) fn append(&mut self, mut data: &[u8], pool: &BufferPool) {
        while !data.is_empty() {
            let take = match self.items.back_mut() {
                Some(tail) if tail.remaining_mut() > 0 => tail.append(data),
                _ => {
                    self.items.push_back(pool.get());
                    continue;
                }
            };
            data = &data[take..];
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<Buffer> {
        self.items.pop_front()
    }

    /// Re-queues a partially written item at the front after `WouldBlock`.
    pub(crate) fn push_front(&mut self, item: Buffer) {
        self.items.push_front(item);
    }

    /// Returns every queued buffer to the pool and reports how many bytes
    /// were discarded.
    pub(crate) fn drain_to(&mut self, pool: &BufferPool) -> usize {
        let mut dropped = 0;
        while let Some(item) = self.items.pop_front() {
            dropped += item.remaining();
            pool.put(item);
        }
        dropped
    }
}

/// Opaque user payload attachable to a connection.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// The per-connection record.
///
/// Shared as `Arc<Conn>` between the active table, the owning worker, and
/// any foreign thread holding a lookup result; the `Arc` strong count is the
/// in-flight reference count that gates release from the GC list. Hot fields
/// are atomics so lookups and the event path stay lock-free; the socket and
/// send queue sit behind their own mutexes.
pub(crate) struct Conn {
    id: AtomicU64,
    fd: AtomicI32,
    state: AtomicU8,
    valid: AtomicBool,
    paused: AtomicBool,
    registered: AtomicBool,
    conn_time: AtomicU64,
    active_time: AtomicU64,
    free_time: AtomicU64,
    pending_bytes: AtomicUsize,
    pub(crate) socket: Mutex<Option<TcpStream>>,
    /// The send critical section; user callbacks never run under it.
    pub(crate) send_queue: Mutex<SendQueue>,
    remote: Mutex<Option<(SocketAddr, String)>>,
    extra: Mutex<Option<UserData>>,
    reserved: Mutex<Option<UserData>>,
    reserved2: Mutex<Option<UserData>>,
}

impl Conn {
    pub(crate) fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            fd: AtomicI32::new(-1),
            state: AtomicU8::new(ConnState::Dead as u8),
            valid: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            conn_time: AtomicU64::new(0),
            active_time: AtomicU64::new(0),
            free_time: AtomicU64::new(0),
            pending_bytes: AtomicUsize::new(0),
            socket: Mutex::new(None),
            send_queue: Mutex::new(SendQueue::default()),
            remote: Mutex::new(None),
            extra: Mutex::new(None),
            reserved: Mutex::new(None),
            reserved2: Mutex::new(None),
        }
    }

    /// Prepares the record for a new life as `id`, entering `Connecting`.
    pub(crate) fn reset(
        &self,
        id: ConnId,
        fd: RawFd,
        remote_addr: SocketAddr,
        remote_host: String,
        extra: Option<UserData>,
    ) {
        let now = clock::now_millis();
        self.id.store(id.token().0 as u64, Ordering::Relaxed);
        self.fd.store(fd, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        self.registered.store(false, Ordering::Relaxed);
        self.conn_time.store(now, Ordering::Relaxed);
        self.active_time.store(now, Ordering::Relaxed);
        self.pending_bytes.store(0, Ordering::Relaxed);
        *self.remote.lock().unwrap() = Some((remote_addr, remote_host));
        *self.extra.lock().unwrap() = extra;
        self.state
            .store(ConnState::Connecting as u8, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Quiesces the record after close: the send queue drains back to the
    /// pool, user slots clear, and the release time is stamped for the
    /// quarantine check.
    pub(crate) fn release(&self, pool: &BufferPool) {
        self.send_queue.lock().unwrap().drain_to(pool);
        self.pending_bytes.store(0, Ordering::Relaxed);
        *self.remote.lock().unwrap() = None;
        *self.extra.lock().unwrap() = None;
        *self.reserved.lock().unwrap() = None;
        *self.reserved2.lock().unwrap() = None;
        self.fd.store(-1, Ordering::Relaxed);
        self.state.store(ConnState::Dead as u8, Ordering::Release);
        self.free_time.store(clock::now_millis(), Ordering::Release);
    }

    pub(crate) fn id(&self) -> ConnId {
        ConnId(self.id.load(Ordering::Relaxed))
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the record invalid exactly once; the caller that wins the race
    /// owns the close path.
    pub(crate) fn invalidate(&self) -> bool {
        self.valid
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    /// Stamps the last-I/O time; only maintained when mark-silence is on.
    pub(crate) fn touch(&self) {
        self.active_time
            .store(clock::now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn conn_time(&self) -> u64 {
        self.conn_time.load(Ordering::Relaxed)
    }

    pub(crate) fn active_time(&self) -> u64 {
        self.active_time.load(Ordering::Relaxed)
    }

    pub(crate) fn free_time(&self) -> u64 {
        self.free_time.load(Ordering::Acquire)
    }

    /// A connection is pending while unsent bytes remain queued.
    pub(crate) fn is_pending(&self) -> bool {
        self.pending_bytes.load(Ordering::Acquire) > 0
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn add_pending(&self, bytes: usize) {
        self.pending_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn sub_pending(&self, bytes: usize) {
        self.pending_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn remote(&self) -> Option<(SocketAddr, String)> {
        self.remote.lock().unwrap().clone()
    }

    pub(crate) fn extra(&self) -> Option<UserData> {
        self.extra.lock().unwrap().clone()
    }

    pub(crate) fn set_extra(&self, value: Option<UserData>) {
        *self.extra.lock().unwrap() = value;
    }

    pub(crate) fn reserved(&self) -> Option<UserData> {
        self.reserved.lock().unwrap().clone()
    }

    pub(crate) fn set_reserved(&self, value: Option<UserData>) {
        *self.reserved.lock().unwrap() = value;
    }

    pub(crate) fn reserved2(&self) -> Option<UserData> {
        self.reserved2.lock().unwrap().clone()
    }

    pub(crate) fn set_reserved2(&self, value: Option<UserData>) {
        *self.reserved2.lock().unwrap() = value;
    }

    /// Readiness interest derived from the paused/pending pair. `None`
    /// means nothing may be armed: the stream is deregistered until a send
    /// or unpause makes the interest non-empty again.
    pub(crate) fn interest(&self) -> Option<Interest> {
        match (self.is_pending(), self.is_paused()) {
            (true, true) => Some(Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE | Interest::WRITABLE),
            (false, false) => Some(Interest::READABLE),
            (false, true) => None,
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id())
            .field("fd", &self.fd())
            .field("state", &self.state())
            .field("valid", &self.is_valid())
            .field("paused", &self.is_paused())
            .field("pending_bytes", &self.pending_bytes())
            .finish()
    }
}
