//! The TCP client agent façade
//!
//! `TcpAgent` validates configuration, initiates outbound connections,
//! routes user API calls to the owning dispatcher worker over the command
//! channel, and surfaces connection events through the [`AgentHandler`].

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferPool;
use crate::clock;
use crate::config::{AgentConfig, ReusePolicy};
use crate::conn::{Conn, ConnId, ConnState, UserData};
use crate::dispatcher::{DispatchContext, DispatchHandler, Dispatcher, Readiness, TimerId};
use crate::error::{cancelled_io_error, AgentError, Result};
use crate::handler::{AgentHandler, HandleResult, Operation};
use crate::table::{ActiveTable, ConnPool};

/// Bounded read drain when the backend is level-triggered; the edge-triggered
/// mio backend drains to `WouldBlock` instead.
const MAX_CONTINUE_READS: usize = 3;
/// Bounded write drain, same trade as [`MAX_CONTINUE_READS`].
const MAX_CONTINUE_WRITES: usize = 8;
/// Readiness notifications a worker accepts per wait.
const MAX_EVENTS_PER_WAIT: usize = 1024;
/// Cadence of the external GC timer worker.
const GC_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Settle delay before `stop` starts disconnecting.
const STOP_SETTLE: Duration = Duration::from_millis(100);
/// Poll interval while `stop` drains the active table.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Lifecycle position of the agent itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    /// Not running.
    Stopped = 0,
    /// `start` in progress.
    Starting = 1,
    /// Accepting `connect` calls.
    Started = 2,
    /// `stop` in progress.
    Stopping = 3,
}

impl AgentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => AgentState::Starting,
            2 => AgentState::Started,
            3 => AgentState::Stopping,
            _ => AgentState::Stopped,
        }
    }
}

/// How a close is reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseFlag {
    /// No `on_close`: the user initiated or already vetoed this connection.
    Silent,
    /// Clean close: `on_close(Operation::Close, None)`.
    Close,
    /// Failure: `on_close(op, err)`.
    Error,
}

/// Commands routed to the worker owning a connection's descriptor.
#[derive(Debug)]
enum AgentCmd {
    Send(ConnId),
    Unpause(ConnId),
    Disconnect(ConnId, bool),
}

/// Optional per-connect parameters.
#[derive(Default)]
pub struct ConnectOptions {
    /// Opaque payload attached to the connection from birth.
    pub extra: Option<UserData>,
    /// Local address to bind instead of the agent-wide default.
    pub local_addr: Option<IpAddr>,
    /// Local port to bind; zero lets the kernel pick.
    pub local_port: u16,
}

/// A long-lived, multi-threaded TCP client agent.
///
/// Cheap to clone; all clones drive the same agent. Public calls are safe
/// from any thread and never block on I/O. The one exception is `stop`,
/// which waits for every connection to drain (with no deadline, so a
/// blocking `on_close` handler stalls shutdown).
pub struct TcpAgent<H: AgentHandler> {
    core: Arc<AgentCore<H>>,
}

impl<H: AgentHandler> Clone for TcpAgent<H> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<H: AgentHandler> TcpAgent<H> {
    /// Builds a stopped agent. The configuration is range-checked here and
    /// again at [`start`](Self::start).
    pub fn new(handler: H, config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let quarantine = config.quarantine_millis();
        let core = AgentCore {
            table: ActiveTable::new(config.max_connection_count),
            conn_pool: ConnPool::new(
                config.free_socket_obj_pool,
                config.free_socket_obj_hold,
                quarantine,
            ),
            buffer_pool: BufferPool::new(
                config.socket_buffer_size,
                config.free_buffer_obj_pool,
                config.free_buffer_obj_hold,
                quarantine,
            ),
            config,
            handler,
            state: Mutex::new(AgentState::Stopped),
            state_cv: Condvar::new(),
            state_cell: AtomicU8::new(AgentState::Stopped as u8),
            async_connect: AtomicBool::new(true),
            bind_addr: Mutex::new(None),
            dispatcher: RwLock::new(None),
            scratch: RwLock::new(Vec::new()),
            gc_timer: Mutex::new(None),
        };
        Ok(Self { core: Arc::new(core) })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        self.core.state()
    }

    /// Spawns the worker pool and readies the agent for `connect` calls.
    ///
    /// `bind_address` is an optional local IP every outbound socket binds to
    /// by default; `async_connect` selects non-blocking connects completed on
    /// a worker versus synchronous connects bounded by the configured
    /// timeout.
    pub fn start(&self, bind_address: Option<&str>, async_connect: bool) -> Result<()> {
        self.core.config.validate()?;
        self.core.transition_starting()?;

        match self.try_start(bind_address, async_connect) {
            Ok(()) => {
                self.core.set_state(AgentState::Started);
                info!(
                    workers = self.core.config.worker_thread_count,
                    max_connections = self.core.config.max_connection_count,
                    async_connect,
                    "agent started"
                );
                Ok(())
            }
            Err(err) => {
                // tear down whatever came up, but report the original failure
                let _ = self.stop();
                Err(err)
            }
        }
    }

    fn try_start(&self, bind_address: Option<&str>, async_connect: bool) -> Result<()> {
        let core = &self.core;
        core.async_connect.store(async_connect, Ordering::Release);

        let worker_total =
            core.config.worker_thread_count + usize::from(core.config.external_gc);
        *core.scratch.write().unwrap() = (0..worker_total)
            .map(|_| Mutex::new(vec![0u8; core.config.socket_buffer_size]))
            .collect();

        *core.bind_addr.lock().unwrap() = match bind_address {
            Some(address) => Some(parse_bind_address(address)?),
            None => None,
        };

        let dispatcher =
            Dispatcher::start(Arc::clone(core), MAX_EVENTS_PER_WAIT, worker_total)
                .map_err(AgentError::WorkerThreadCreate)?;

        if core.config.external_gc {
            let timer = dispatcher
                .add_timer(core.config.worker_thread_count, GC_CHECK_INTERVAL)
                .map_err(AgentError::GcStart)?;
            *core.gc_timer.lock().unwrap() = Some(timer);
        }

        *core.dispatcher.write().unwrap() = Some(dispatcher);
        Ok(())
    }

    /// Disconnects everything, joins the workers, and releases the pools.
    ///
    /// Blocks until the active table drains; there is deliberately no
    /// deadline, matching the cooperative close model.
    pub fn stop(&self) -> Result<()> {
        let core = &self.core;
        core.transition_stopping()?;
        info!("agent stopping");

        thread::sleep(STOP_SETTLE);

        let mut rounds = 0u32;
        while core.table.len() > 0 {
            // re-issue on a coarse cadence so connects that raced the state
            // transition still get torn down
            if rounds % 20 == 0 {
                for id in core.table.ids() {
                    let _ = core.post_command(id, AgentCmd::Disconnect(id, true));
                }
            }
            rounds += 1;
            thread::sleep(STOP_POLL);
        }

        let dispatcher = core.dispatcher.write().unwrap().take();
        if let Some(mut dispatcher) = dispatcher {
            dispatcher.stop();
        }
        *core.gc_timer.lock().unwrap() = None;

        core.handler.on_shutdown();

        core.conn_pool.clear();
        core.conn_pool.sweep(true);
        core.buffer_pool.clear();
        core.buffer_pool.sweep(true);
        *core.scratch.write().unwrap() = Vec::new();
        *core.bind_addr.lock().unwrap() = None;

        core.set_state(AgentState::Stopped);
        info!("agent stopped");
        Ok(())
    }

    /// Blocks the caller until the agent is back in `Stopped`.
    pub fn wait(&self) {
        let core = &self.core;
        let mut state = core.state.lock().unwrap();
        while *state != AgentState::Stopped {
            state = core.state_cv.wait(state).unwrap();
        }
    }

    /// Initiates an outbound connection to `host:port`.
    pub fn connect(&self, host: &str, port: u16) -> Result<ConnId> {
        self.connect_with(host, port, ConnectOptions::default())
    }

    /// [`connect`](Self::connect) with an initial payload and local binding.
    pub fn connect_with(&self, host: &str, port: u16, opts: ConnectOptions) -> Result<ConnId> {
        let core = &self.core;
        if core.state() != AgentState::Started {
            return Err(AgentError::IllegalState);
        }

        let remote = resolve(host, port)?;
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))
            .map_err(AgentError::SocketCreate)?;
        core.apply_socket_options(&socket);
        core.bind_local(&socket, &opts, remote)?;

        let conn_id = core
            .table
            .acquire_slot()
            .ok_or(AgentError::ConnectionCountLimit)?;

        if core.handler.on_prepare_connect(conn_id, &socket) == HandleResult::Error {
            core.table.abandon_pending(conn_id);
            return Err(AgentError::Cancelled);
        }

        let conn = core.obtain_record();
        conn.reset(
            conn_id,
            socket.as_raw_fd(),
            remote,
            host.to_owned(),
            opts.extra,
        );
        core.table.publish(conn_id, Arc::clone(&conn));
        debug!(conn_id = %conn_id, remote = %remote, "connecting");

        let outcome = if core.async_connect.load(Ordering::Acquire) {
            core.connect_async(&conn, socket, remote)
        } else {
            core.connect_sync(&conn, socket, remote)
        };

        match outcome {
            Ok(()) => Ok(conn_id),
            Err(err) => {
                core.close_and_recycle(&conn, CloseFlag::Silent, Operation::Connect, None);
                Err(err)
            }
        }
    }

    /// Queues `data` for transmission on `conn_id`.
    pub fn send(&self, conn_id: ConnId, data: &[u8]) -> Result<()> {
        self.send_slices(conn_id, &[data])
    }

    /// Queues a vector of byte slices as one ordered submission.
    pub fn send_slices(&self, conn_id: ConnId, buffers: &[&[u8]]) -> Result<()> {
        let core = &self.core;
        let conn = core.table.lookup(conn_id).ok_or(AgentError::ObjectNotFound)?;

        let total: usize = buffers.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Err(AgentError::InvalidParam("empty send"));
        }

        let was_pending;
        {
            let mut queue = conn.send_queue.lock().unwrap();
            // revalidate under the send lock so a racing close cannot strand
            // bytes in a recycled record
            if !conn.is_valid() {
                return Err(AgentError::ObjectNotFound);
            }
            if !conn.is_connected() {
                return Err(AgentError::IllegalState);
            }
            was_pending = conn.is_pending();
            for buffer in buffers {
                if !buffer.is_empty() {
                    queue.append(buffer, &core.buffer_pool);
                }
            }
            conn.add_pending(total);
        }

        if !was_pending {
            core.post_command(conn_id, AgentCmd::Send(conn_id))?;
        }
        Ok(())
    }

    /// Requests an asynchronous close; the terminal `on_close` arrives on the
    /// owning worker.
    pub fn disconnect(&self, conn_id: ConnId, force: bool) -> Result<()> {
        self.core
            .post_command(conn_id, AgentCmd::Disconnect(conn_id, force))
    }

    /// Suppresses or resumes `on_receive` delivery.
    pub fn pause_receive(&self, conn_id: ConnId, paused: bool) -> Result<()> {
        let core = &self.core;
        let conn = core.table.lookup(conn_id).ok_or(AgentError::ObjectNotFound)?;
        if !conn.is_connected() {
            return Err(AgentError::IllegalState);
        }
        if conn.is_paused() == paused {
            return Ok(());
        }
        conn.set_paused(paused);
        if !paused {
            // the owning worker must drain whatever the kernel latched while
            // readable readiness was disarmed
            core.post_command(conn_id, AgentCmd::Unpause(conn_id))?;
        }
        Ok(())
    }

    /// Whether `on_receive` delivery is currently suppressed.
    pub fn is_paused(&self, conn_id: ConnId) -> Result<bool> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.is_paused())
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Whether the connection is established and usable.
    pub fn is_connected(&self, conn_id: ConnId) -> bool {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    /// Live connections (including connects still in flight).
    pub fn connection_count(&self) -> usize {
        self.core.table.len()
    }

    /// Snapshot of every live connection identifier.
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.core.table.ids()
    }

    /// Bytes queued but not yet accepted by the kernel.
    pub fn pending_data_len(&self, conn_id: ConnId) -> Result<usize> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.pending_bytes())
            .ok_or(AgentError::ObjectNotFound)
    }

    /// The resolved peer address.
    pub fn remote_addr(&self, conn_id: ConnId) -> Result<SocketAddr> {
        let conn = self
            .core
            .table
            .lookup(conn_id)
            .ok_or(AgentError::ObjectNotFound)?;
        conn.remote()
            .map(|(addr, _)| addr)
            .ok_or(AgentError::ObjectNotFound)
    }

    /// The peer as originally named in `connect`, with the resolved port.
    pub fn remote_host(&self, conn_id: ConnId) -> Result<(String, u16)> {
        let conn = self
            .core
            .table
            .lookup(conn_id)
            .ok_or(AgentError::ObjectNotFound)?;
        conn.remote()
            .map(|(addr, host)| (host, addr.port()))
            .ok_or(AgentError::ObjectNotFound)
    }

    /// The local address the connection's socket is bound to.
    pub fn local_addr(&self, conn_id: ConnId) -> Result<SocketAddr> {
        let conn = self
            .core
            .table
            .lookup(conn_id)
            .ok_or(AgentError::ObjectNotFound)?;
        let guard = conn.socket.lock().unwrap();
        match guard.as_ref() {
            Some(stream) => Ok(stream.local_addr()?),
            None => Err(AgentError::ObjectNotFound),
        }
    }

    /// Time since the connection was initiated.
    pub fn connect_period(&self, conn_id: ConnId) -> Result<Duration> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| Duration::from_millis(clock::millis_since(conn.conn_time())))
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Time since the last I/O; requires `mark_silence`.
    pub fn silence_period(&self, conn_id: ConnId) -> Result<Duration> {
        if !self.core.config.mark_silence {
            return Err(AgentError::InvalidParam("mark_silence is off"));
        }
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| Duration::from_millis(clock::millis_since(conn.active_time())))
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Disconnects every connection older than `period`.
    pub fn disconnect_long_connections(&self, period: Duration, force: bool) -> Result<()> {
        let threshold = period.as_millis() as u64;
        for id in self.core.table.ids() {
            if let Some(conn) = self.core.table.lookup(id) {
                if clock::millis_since(conn.conn_time()) >= threshold {
                    let _ = self.disconnect(id, force);
                }
            }
        }
        Ok(())
    }

    /// Disconnects every connection silent for longer than `period`;
    /// requires `mark_silence`.
    pub fn disconnect_silence_connections(&self, period: Duration, force: bool) -> Result<()> {
        if !self.core.config.mark_silence {
            return Err(AgentError::InvalidParam("mark_silence is off"));
        }
        let threshold = period.as_millis() as u64;
        for id in self.core.table.ids() {
            if let Some(conn) = self.core.table.lookup(id) {
                if clock::millis_since(conn.active_time()) >= threshold {
                    let _ = self.disconnect(id, force);
                }
            }
        }
        Ok(())
    }

    /// The connection's opaque user payload.
    pub fn extra(&self, conn_id: ConnId) -> Result<Option<UserData>> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.extra())
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Replaces the connection's opaque user payload.
    pub fn set_extra(&self, conn_id: ConnId, value: Option<UserData>) -> Result<()> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.set_extra(value))
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Scratch slot for layered protocol wrappers.
    pub fn reserved(&self, conn_id: ConnId) -> Result<Option<UserData>> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.reserved())
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Replaces the first wrapper scratch slot.
    pub fn set_reserved(&self, conn_id: ConnId, value: Option<UserData>) -> Result<()> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.set_reserved(value))
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Second scratch slot for layered protocol wrappers.
    pub fn reserved2(&self, conn_id: ConnId) -> Result<Option<UserData>> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.reserved2())
            .ok_or(AgentError::ObjectNotFound)
    }

    /// Replaces the second wrapper scratch slot.
    pub fn set_reserved2(&self, conn_id: ConnId, value: Option<UserData>) -> Result<()> {
        self.core
            .table
            .lookup(conn_id)
            .map(|conn| conn.set_reserved2(value))
            .ok_or(AgentError::ObjectNotFound)
    }
}

struct AgentCore<H: AgentHandler> {
    config: AgentConfig,
    handler: H,
    state: Mutex<AgentState>,
    state_cv: Condvar,
    state_cell: AtomicU8,
    async_connect: AtomicBool,
    bind_addr: Mutex<Option<SocketAddr>>,
    table: ActiveTable,
    conn_pool: ConnPool,
    buffer_pool: BufferPool,
    dispatcher: RwLock<Option<Dispatcher<AgentCmd>>>,
    scratch: RwLock<Vec<Mutex<Vec<u8>>>>,
    gc_timer: Mutex<Option<TimerId>>,
}

impl<H: AgentHandler> AgentCore<H> {
    fn state(&self) -> AgentState {
        AgentState::from_u8(self.state_cell.load(Ordering::Acquire))
    }

    fn set_state(&self, next: AgentState) {
        let mut state = self.state.lock().unwrap();
        *state = next;
        self.state_cell.store(next as u8, Ordering::Release);
        self.state_cv.notify_all();
    }

    fn transition_starting(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != AgentState::Stopped {
            return Err(AgentError::IllegalState);
        }
        *state = AgentState::Starting;
        self.state_cell
            .store(AgentState::Starting as u8, Ordering::Release);
        Ok(())
    }

    fn transition_stopping(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            AgentState::Starting | AgentState::Started => {
                *state = AgentState::Stopping;
                self.state_cell
                    .store(AgentState::Stopping as u8, Ordering::Release);
                Ok(())
            }
            _ => Err(AgentError::IllegalState),
        }
    }

    fn obtain_record(&self) -> Arc<Conn> {
        self.conn_pool
            .take()
            .unwrap_or_else(|| Arc::new(Conn::new()))
    }

    fn apply_socket_options(&self, socket: &Socket) {
        if self.config.keep_alive_enabled() {
            let keepalive = TcpKeepalive::new()
                .with_time(self.config.keep_alive_time)
                .with_interval(self.config.keep_alive_interval);
            if let Err(err) = socket.set_tcp_keepalive(&keepalive) {
                warn!(error = %err, "failed to set keep-alive parameters");
            }
            if let Err(err) = socket.set_keepalive(true) {
                warn!(error = %err, "failed to enable keep-alive");
            }
        }

        let (reuse_addr, reuse_port) = match self.config.reuse_policy {
            ReusePolicy::None => (false, false),
            ReusePolicy::Address => (true, false),
            ReusePolicy::Port => (false, true),
            ReusePolicy::AddressAndPort => (true, true),
        };
        if reuse_addr {
            if let Err(err) = socket.set_reuse_address(true) {
                warn!(error = %err, "failed to set SO_REUSEADDR");
            }
        }
        #[cfg(unix)]
        if reuse_port {
            if let Err(err) = socket.set_reuse_port(true) {
                warn!(error = %err, "failed to set SO_REUSEPORT");
            }
        }
        #[cfg(not(unix))]
        let _ = reuse_port;

        if let Err(err) = socket.set_nodelay(self.config.no_delay) {
            warn!(error = %err, "failed to set TCP_NODELAY");
        }
    }

    fn bind_local(&self, socket: &Socket, opts: &ConnectOptions, remote: SocketAddr) -> Result<()> {
        let default_ip = self.bind_addr.lock().unwrap().map(|addr| addr.ip());
        let bind_ip = opts.local_addr.or(default_ip);

        if let Some(ip) = bind_ip {
            if ip.is_ipv4() != remote.is_ipv4() {
                return Err(AgentError::InvalidParam("bind address family mismatch"));
            }
        }

        let bind_to = if opts.local_port != 0 {
            let ip = bind_ip.unwrap_or(if remote.is_ipv4() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            });
            Some(SocketAddr::new(ip, opts.local_port))
        } else {
            bind_ip.map(|ip| SocketAddr::new(ip, 0))
        };

        if let Some(addr) = bind_to {
            socket.bind(&addr.into()).map_err(AgentError::SocketBind)?;
        }
        Ok(())
    }

    fn connect_async(&self, conn: &Arc<Conn>, socket: Socket, remote: SocketAddr) -> Result<()> {
        socket.set_nonblocking(true)?;
        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => return Err(AgentError::Io(err)),
        }

        let stream = TcpStream::from_std(socket.into());
        let fd = conn.fd();
        let token = conn.id().token();

        // hold the socket slot across registration so a completion event
        // racing in on the worker cannot observe a half-installed stream
        let mut guard = conn.socket.lock().unwrap();
        *guard = Some(stream);
        self.with_dispatcher(|dispatcher| {
            dispatcher.register_fd(guard.as_mut().unwrap(), fd, token, Interest::WRITABLE)
        })?;
        conn.set_registered(true);
        Ok(())
    }

    fn connect_sync(&self, conn: &Arc<Conn>, socket: Socket, remote: SocketAddr) -> Result<()> {
        socket.connect_timeout(&remote.into(), self.config.sync_connect_timeout)?;
        socket.set_nonblocking(true)?;

        conn.set_state(ConnState::Connected);
        if self.handler.on_connect(conn.id()) == HandleResult::Error {
            return Err(AgentError::Cancelled);
        }

        let stream = TcpStream::from_std(socket.into());
        let fd = conn.fd();
        let token = conn.id().token();

        let mut guard = conn.socket.lock().unwrap();
        *guard = Some(stream);
        if let Some(interest) = conn.interest() {
            self.with_dispatcher(|dispatcher| {
                dispatcher.register_fd(guard.as_mut().unwrap(), fd, token, interest)
            })?;
            conn.set_registered(true);
        }
        Ok(())
    }

    fn with_dispatcher<T>(
        &self,
        f: impl FnOnce(&Dispatcher<AgentCmd>) -> io::Result<T>,
    ) -> Result<T> {
        let guard = self.dispatcher.read().unwrap();
        match guard.as_ref() {
            Some(dispatcher) => f(dispatcher).map_err(AgentError::Io),
            None => Err(AgentError::IllegalState),
        }
    }

    fn post_command(&self, conn_id: ConnId, command: AgentCmd) -> Result<()> {
        let conn = self.table.lookup(conn_id).ok_or(AgentError::ObjectNotFound)?;
        let fd = conn.fd();
        if fd < 0 {
            return Err(AgentError::ObjectNotFound);
        }
        self.with_dispatcher(|dispatcher| dispatcher.send_command_by_fd(fd, command))
    }

    /// Marks the record invalid, fires the terminal event, closes the
    /// socket, frees the slot, and recycles the record through the free
    /// pool or GC list. Safe to call multiple times; only the first caller
    /// acts.
    fn close_and_recycle(
        &self,
        conn: &Arc<Conn>,
        flag: CloseFlag,
        operation: Operation,
        error: Option<io::Error>,
    ) {
        if !conn.invalidate() {
            return;
        }
        let conn_id = conn.id();
        conn.set_state(ConnState::Closing);
        debug!(conn_id = %conn_id, ?flag, ?operation, "closing connection");

        match flag {
            CloseFlag::Close => self.handler.on_close(conn_id, Operation::Close, None),
            CloseFlag::Error => self.handler.on_close(conn_id, operation, error),
            CloseFlag::Silent => {}
        }

        if let Some(mut stream) = conn.socket.lock().unwrap().take() {
            if conn.is_registered() {
                let guard = self.dispatcher.read().unwrap();
                if let Some(dispatcher) = guard.as_ref() {
                    let _ = dispatcher.deregister_fd(&mut stream, conn.fd());
                }
                conn.set_registered(false);
            }
        }

        self.table.remove(conn_id);
        conn.release(&self.buffer_pool);
        self.conn_pool.put(Arc::clone(conn));

        if !self.config.external_gc {
            self.conn_pool.sweep(false);
            self.buffer_pool.sweep(false);
        }
    }

    /// Replaces the armed interest with the paused/pending-derived mask, or
    /// deregisters when nothing may be armed.
    fn rearm(&self, registry: &Registry, conn: &Conn) -> io::Result<()> {
        let token = conn.id().token();
        let mut guard = conn.socket.lock().unwrap();
        let Some(stream) = guard.as_mut() else {
            return Ok(());
        };
        match conn.interest() {
            Some(interest) => {
                if conn.is_registered() {
                    registry.reregister(stream, token, interest)
                } else {
                    registry.register(stream, token, interest)?;
                    conn.set_registered(true);
                    Ok(())
                }
            }
            None => {
                if conn.is_registered() {
                    registry.deregister(stream)?;
                    conn.set_registered(false);
                }
                Ok(())
            }
        }
    }

    fn socket_error(&self, conn: &Conn) -> Option<io::Error> {
        let guard = conn.socket.lock().unwrap();
        guard.as_ref().and_then(|s| s.take_error().ok().flatten())
    }

    /// Connection-completion path for records still in `Connecting`.
    fn handle_connect_ready(
        &self,
        ctx: &DispatchContext<'_, Self>,
        conn: &Arc<Conn>,
        ready: Readiness,
    ) {
        let so_error = self.socket_error(conn);
        if ready.error || so_error.is_some() {
            self.close_and_recycle(conn, CloseFlag::Error, Operation::Connect, so_error);
            return;
        }
        if ready.hangup || ready.readable || !ready.writable {
            self.close_and_recycle(conn, CloseFlag::Close, Operation::Connect, None);
            return;
        }

        conn.set_state(ConnState::Connected);
        trace!(conn_id = %conn.id(), "connection established");
        if self.handler.on_connect(conn.id()) == HandleResult::Error {
            self.close_and_recycle(conn, CloseFlag::Silent, Operation::Connect, None);
            return;
        }

        if let Err(err) = self.rearm(ctx.registry(), conn) {
            self.close_and_recycle(conn, CloseFlag::Error, Operation::Connect, Some(err));
        }
    }

    /// Drains the inbound stream into the worker's scratch buffer,
    /// dispatching each chunk to `on_receive`.
    fn handle_receive(&self, ctx: &DispatchContext<'_, Self>, conn: &Arc<Conn>) -> bool {
        if self.config.mark_silence {
            conn.touch();
        }

        let scratch = self.scratch.read().unwrap();
        let Some(slot) = scratch.get(ctx.worker_index()) else {
            return true;
        };
        let mut buffer = slot.lock().unwrap();

        let limit = (!ctx.edge_triggered()).then_some(MAX_CONTINUE_READS);
        let mut reads = 0;
        loop {
            if limit.is_some_and(|max| reads >= max) {
                break;
            }
            if conn.is_paused() {
                break;
            }

            let result = {
                let mut guard = conn.socket.lock().unwrap();
                match guard.as_mut() {
                    Some(stream) => stream.read(&mut buffer[..]),
                    None => return true,
                }
            };

            match result {
                Ok(0) => {
                    self.close_and_recycle(conn, CloseFlag::Close, Operation::Receive, None);
                    return false;
                }
                Ok(n) => {
                    if self.handler.on_receive(conn.id(), &buffer[..n]) == HandleResult::Error {
                        warn!(conn_id = %conn.id(), "on_receive vetoed, closing connection");
                        self.close_and_recycle(
                            conn,
                            CloseFlag::Error,
                            Operation::Receive,
                            Some(cancelled_io_error()),
                        );
                        return false;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close_and_recycle(conn, CloseFlag::Error, Operation::Receive, Some(err));
                    return false;
                }
            }
            reads += 1;
        }
        true
    }

    /// Flushes the send queue to the socket, one item at a time.
    fn handle_send(&self, ctx: &DispatchContext<'_, Self>, conn: &Arc<Conn>) -> bool {
        if !conn.is_pending() {
            return true;
        }

        let limit = (!ctx.edge_triggered()).then_some(MAX_CONTINUE_WRITES);
        let mut writes = 0;
        loop {
            if limit.is_some_and(|max| writes >= max) {
                break;
            }

            let item = conn.send_queue.lock().unwrap().pop_front();
            let Some(mut item) = item else {
                break;
            };

            match self.send_item(conn, &mut item) {
                SendOutcome::Drained => self.buffer_pool.put(item),
                SendOutcome::Blocked => {
                    // unfinished item goes back to the front so stream order
                    // is preserved for the next writable event
                    conn.send_queue.lock().unwrap().push_front(item);
                    break;
                }
                SendOutcome::Closed => {
                    self.buffer_pool.put(item);
                    return false;
                }
            }
            writes += 1;
        }
        true
    }

    fn send_item(&self, conn: &Arc<Conn>, item: &mut crate::buffer::Buffer) -> SendOutcome {
        while !item.is_empty() {
            let result = {
                let mut guard = conn.socket.lock().unwrap();
                match guard.as_mut() {
                    Some(stream) => stream.write(item.as_slice()),
                    None => return SendOutcome::Closed,
                }
            };

            match result {
                Ok(0) => {
                    self.close_and_recycle(
                        conn,
                        CloseFlag::Error,
                        Operation::Send,
                        Some(io::Error::from(io::ErrorKind::WriteZero)),
                    );
                    return SendOutcome::Closed;
                }
                Ok(n) => {
                    // sends are past the point of no return; a veto here is
                    // reported and otherwise ignored
                    if self.handler.on_send(conn.id(), &item.as_slice()[..n])
                        == HandleResult::Error
                    {
                        warn!(conn_id = %conn.id(), "on_send veto ignored");
                    }
                    item.mark_read(n);
                    conn.sub_pending(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return SendOutcome::Blocked,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.close_and_recycle(conn, CloseFlag::Error, Operation::Send, Some(err));
                    return SendOutcome::Closed;
                }
            }
        }
        SendOutcome::Drained
    }

    fn handle_close_event(&self, token: Token, flag: CloseFlag, ready: Readiness) {
        let Some(conn) = self.table.lookup(ConnId::from_token(token)) else {
            return;
        };
        let operation = if ready.hangup {
            Operation::Close
        } else if ready.readable {
            Operation::Receive
        } else if ready.writable {
            Operation::Send
        } else {
            Operation::Close
        };
        let error = match flag {
            CloseFlag::Error => self.socket_error(&conn),
            _ => None,
        };
        self.close_and_recycle(&conn, flag, operation, error);
    }

    fn before_unpause(&self, conn: &Conn) -> bool {
        conn.is_connected()
    }
}

enum SendOutcome {
    Drained,
    Blocked,
    Closed,
}

impl<H: AgentHandler> DispatchHandler for AgentCore<H> {
    type Command = AgentCmd;

    fn before_process_io(
        &self,
        ctx: &DispatchContext<'_, Self>,
        token: Token,
        ready: Readiness,
    ) -> bool {
        let Some(conn) = self.table.lookup(ConnId::from_token(token)) else {
            return false;
        };
        if conn.state() == ConnState::Connecting {
            // connecting sockets short-circuit to completion handling; the
            // rearm in after_process_io must not run for them
            self.handle_connect_ready(ctx, &conn, ready);
            return false;
        }
        true
    }

    fn on_error(&self, _ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness) -> bool {
        self.handle_close_event(token, CloseFlag::Error, ready);
        false
    }

    fn on_hungup(&self, _ctx: &DispatchContext<'_, Self>, token: Token, ready: Readiness) -> bool {
        self.handle_close_event(token, CloseFlag::Close, ready);
        false
    }

    fn on_ready_write(
        &self,
        ctx: &DispatchContext<'_, Self>,
        token: Token,
        _ready: Readiness,
    ) -> bool {
        match self.table.lookup(ConnId::from_token(token)) {
            Some(conn) => self.handle_send(ctx, &conn),
            None => false,
        }
    }

    fn on_ready_read(
        &self,
        ctx: &DispatchContext<'_, Self>,
        token: Token,
        _ready: Readiness,
    ) -> bool {
        match self.table.lookup(ConnId::from_token(token)) {
            Some(conn) => self.handle_receive(ctx, &conn),
            None => false,
        }
    }

    fn after_process_io(
        &self,
        ctx: &DispatchContext<'_, Self>,
        token: Token,
        _ready: Readiness,
        result: bool,
    ) {
        if !result {
            return;
        }
        if let Some(conn) = self.table.lookup(ConnId::from_token(token)) {
            // the unconditional reregister also replays any readiness edge
            // latched while this event was handled, so single-branch
            // dispatch cannot starve the other direction
            if let Err(err) = self.rearm(ctx.registry(), &conn) {
                warn!(conn_id = %conn.id(), error = %err, "failed to rearm interest");
            }
        }
    }

    fn on_command(&self, ctx: &DispatchContext<'_, Self>, command: AgentCmd) {
        match command {
            AgentCmd::Send(conn_id) => {
                if let Some(conn) = self.table.lookup(conn_id) {
                    if conn.is_pending() {
                        ctx.process_io(conn_id.token(), Readiness::writable());
                    }
                }
            }
            AgentCmd::Unpause(conn_id) => {
                if let Some(conn) = self.table.lookup(conn_id) {
                    if self.before_unpause(&conn) {
                        ctx.process_io(conn_id.token(), Readiness::readable());
                    } else {
                        self.close_and_recycle(
                            &conn,
                            CloseFlag::Error,
                            Operation::Receive,
                            Some(cancelled_io_error()),
                        );
                    }
                }
            }
            AgentCmd::Disconnect(conn_id, force) => {
                if self.table.lookup(conn_id).is_some() {
                    trace!(conn_id = %conn_id, force, "disconnect command");
                    ctx.process_io(conn_id.token(), Readiness::hangup());
                }
            }
        }
    }

    fn on_timer(&self, _ctx: &DispatchContext<'_, Self>, timer: TimerId) {
        if *self.gc_timer.lock().unwrap() == Some(timer) {
            self.conn_pool.sweep(false);
            self.buffer_pool.sweep(false);
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or(AgentError::InvalidParam("remote address"))
}

fn parse_bind_address(address: &str) -> Result<SocketAddr> {
    let ip: IpAddr = address
        .parse()
        .map_err(|_| AgentError::InvalidParam("bind address"))?;
    let addr = SocketAddr::new(ip, 0);

    // probe-bind so an unusable address fails start, not the first connect
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(AgentError::SocketCreate)?;
    socket.bind(&addr.into()).map_err(AgentError::SocketBind)?;
    Ok(addr)
}

#[cfg(unix)]
fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::ErrorKind;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorded {
        connects: AtomicUsize,
        shutdowns: AtomicUsize,
        received: Mutex<Vec<u8>>,
        sent: Mutex<Vec<u8>>,
        closes: Mutex<Vec<(ConnId, Operation, Option<ErrorKind>)>>,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Recorded>);

    impl AgentHandler for Recorder {
        fn on_connect(&self, _conn_id: ConnId) -> HandleResult {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            HandleResult::Continue
        }

        fn on_receive(&self, _conn_id: ConnId, data: &[u8]) -> HandleResult {
            self.0.received.lock().unwrap().extend_from_slice(data);
            HandleResult::Continue
        }

        fn on_send(&self, _conn_id: ConnId, data: &[u8]) -> HandleResult {
            self.0.sent.lock().unwrap().extend_from_slice(data);
            HandleResult::Continue
        }

        fn on_close(&self, conn_id: ConnId, operation: Operation, error: Option<io::Error>) {
            self.0
                .closes
                .lock()
                .unwrap()
                .push((conn_id, operation, error.map(|e| e.kind())));
        }

        fn on_shutdown(&self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_agent(config: AgentConfig) -> (TcpAgent<Recorder>, Arc<Recorded>) {
        let recorder = Recorder::default();
        let recorded = Arc::clone(&recorder.0);
        (TcpAgent::new(recorder, config).unwrap(), recorded)
    }

    fn small_config(workers: usize) -> AgentConfig {
        AgentConfig {
            worker_thread_count: workers,
            max_connection_count: 64,
            ..AgentConfig::default()
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    /// Echo server that serves every accepted connection until EOF.
    fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                thread::spawn(move || {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    /// Server that accepts and parks connections open until the test ends.
    fn spawn_parking_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let mut parked = Vec::new();
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => parked.push(stream),
                    Err(_) => return,
                }
            }
        });
        addr
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn record_addr(agent: &TcpAgent<Recorder>, conn_id: ConnId) -> usize {
        Arc::as_ptr(&agent.core.table.lookup(conn_id).unwrap()) as usize
    }

    #[test]
    fn echo_round_trip_and_clean_disconnect() {
        let addr = spawn_echo_server();
        let (agent, recorded) = make_agent(small_config(2));
        agent.start(None, true).unwrap();

        let id = agent.connect("127.0.0.1", addr.port()).unwrap();
        assert!(wait_until(Duration::from_secs(1), || agent.is_connected(id)));

        agent.send(id, b"ABCD").unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            recorded.received.lock().unwrap().as_slice() == b"ABCD"
        }));
        assert_eq!(b"ABCD", recorded.sent.lock().unwrap().as_slice());

        agent.disconnect(id, true).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            recorded.closes.lock().unwrap().len() == 1
        }));
        let closes = recorded.closes.lock().unwrap();
        assert_eq!((id, Operation::Close, None), closes[0]);
        assert_eq!(1, recorded.connects.load(Ordering::SeqCst));
        drop(closes);

        agent.stop().unwrap();
        assert_eq!(1, recorded.closes.lock().unwrap().len());
    }

    #[test]
    fn refused_connect_surfaces_as_connect_close() {
        // bind-then-drop yields a port with nothing listening
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (agent, recorded) = make_agent(small_config(1));
        agent.start(None, true).unwrap();

        match agent.connect("127.0.0.1", port) {
            Ok(_) => {
                assert!(wait_until(Duration::from_secs(1), || {
                    recorded.closes.lock().unwrap().len() == 1
                }));
                let closes = recorded.closes.lock().unwrap();
                assert_eq!(Operation::Connect, closes[0].1);
                assert_eq!(Some(ErrorKind::ConnectionRefused), closes[0].2);
            }
            // some platforms refuse a loopback connect synchronously
            Err(AgentError::Io(err)) => {
                assert_eq!(ErrorKind::ConnectionRefused, err.kind());
            }
            Err(other) => panic!("unexpected error: {other}"),
        }

        assert_eq!(0, recorded.connects.load(Ordering::SeqCst));
        assert!(wait_until(Duration::from_secs(1), || {
            agent.connection_count() == 0
        }));
        agent.stop().unwrap();
    }

    #[test]
    fn sync_connect_times_out_without_callbacks() {
        let config = AgentConfig {
            sync_connect_timeout: Duration::from_millis(100),
            ..small_config(1)
        };
        let (agent, recorded) = make_agent(config);
        agent.start(None, false).unwrap();

        let started = Instant::now();
        let result = agent.connect("10.255.255.1", 9);
        let elapsed = started.elapsed();

        match result {
            Err(AgentError::Io(err)) if err.kind() == ErrorKind::TimedOut => {
                assert!(elapsed >= Duration::from_millis(90), "returned too early");
                assert!(elapsed < Duration::from_secs(2), "timeout not honored");
            }
            // environments without a blackholed route fail fast instead
            Err(AgentError::Io(_)) => {}
            other => panic!("expected an i/o error, got {other:?}"),
        }

        assert_eq!(0, recorded.connects.load(Ordering::SeqCst));
        assert!(recorded.closes.lock().unwrap().is_empty());
        assert_eq!(0, agent.connection_count());
        agent.stop().unwrap();
    }

    #[test]
    fn paused_connection_buffers_until_unpaused() {
        const PAYLOAD: usize = 1024 * 1024;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            go_rx.recv().unwrap();
            stream.write_all(&pattern(PAYLOAD)).unwrap();
            // park until the agent closes
            let _ = stream.read(&mut [0u8; 16]);
        });

        let (agent, recorded) = make_agent(small_config(1));
        agent.start(None, false).unwrap();

        let id = agent.connect("127.0.0.1", addr.port()).unwrap();
        agent.pause_receive(id, true).unwrap();
        assert!(agent.is_paused(id).unwrap());

        go_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(500));
        assert!(
            recorded.received.lock().unwrap().is_empty(),
            "data delivered while paused"
        );

        agent.pause_receive(id, false).unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            recorded.received.lock().unwrap().len() == PAYLOAD
        }));
        assert_eq!(pattern(PAYLOAD), *recorded.received.lock().unwrap());

        agent.disconnect(id, true).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            agent.connection_count() == 0
        }));
        agent.stop().unwrap();
    }

    #[test]
    fn connection_limit_is_enforced_without_leaking_slots() {
        let addr = spawn_parking_server();
        let config = AgentConfig {
            max_connection_count: 4,
            worker_thread_count: 1,
            ..AgentConfig::default()
        };
        let (agent, _) = make_agent(config);
        agent.start(None, false).unwrap();

        let ids: Vec<ConnId> = (0..4)
            .map(|_| agent.connect("127.0.0.1", addr.port()).unwrap())
            .collect();
        assert_eq!(4, agent.connection_count());

        assert!(matches!(
            agent.connect("127.0.0.1", addr.port()),
            Err(AgentError::ConnectionCountLimit)
        ));
        assert_eq!(4, agent.connection_count());

        for id in ids {
            agent.disconnect(id, true).unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || {
            agent.connection_count() == 0
        }));

        // the limit releases with the slots
        let again = agent.connect("127.0.0.1", addr.port()).unwrap();
        agent.disconnect(again, true).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            agent.connection_count() == 0
        }));
        agent.stop().unwrap();
    }

    #[test]
    fn freed_record_sits_in_quarantine_before_reuse() {
        let addr = spawn_parking_server();
        let config = AgentConfig {
            free_socket_obj_pool: 1,
            free_socket_obj_lock_time: Duration::from_millis(2000),
            ..small_config(1)
        };
        let (agent, _) = make_agent(config);
        agent.start(None, false).unwrap();

        let first = agent.connect("127.0.0.1", addr.port()).unwrap();
        let first_record = record_addr(&agent, first);
        agent.disconnect(first, true).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            agent.connection_count() == 0
        }));

        // inside the quarantine the freed record must not come back
        let second = agent.connect("127.0.0.1", addr.port()).unwrap();
        let second_record = record_addr(&agent, second);
        assert_ne!(first_record, second_record);
        agent.disconnect(second, true).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            agent.connection_count() == 0
        }));

        thread::sleep(Duration::from_millis(2100));
        let third = agent.connect("127.0.0.1", addr.port()).unwrap();
        assert_eq!(first_record, record_addr(&agent, third));

        agent.disconnect(third, true).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            agent.connection_count() == 0
        }));
        agent.stop().unwrap();
    }

    #[test]
    fn lifecycle_transitions_are_guarded() {
        let (agent, _) = make_agent(small_config(1));
        assert_eq!(AgentState::Stopped, agent.state());
        assert!(matches!(agent.stop(), Err(AgentError::IllegalState)));

        agent.start(None, true).unwrap();
        assert_eq!(AgentState::Started, agent.state());
        assert!(matches!(
            agent.start(None, true),
            Err(AgentError::IllegalState)
        ));

        agent.stop().unwrap();
        assert_eq!(AgentState::Stopped, agent.state());

        // a stopped agent can be started again
        agent.start(None, true).unwrap();
        agent.stop().unwrap();
    }

    #[test]
    fn api_calls_validate_state_and_arguments() {
        let (agent, _) = make_agent(small_config(1));

        // not started yet
        assert!(matches!(
            agent.connect("127.0.0.1", 9000),
            Err(AgentError::IllegalState)
        ));

        agent.start(None, false).unwrap();

        let bogus = ConnId::new(0, 42);
        assert!(matches!(
            agent.send(bogus, b"x"),
            Err(AgentError::ObjectNotFound)
        ));
        assert!(matches!(
            agent.disconnect(bogus, true),
            Err(AgentError::ObjectNotFound)
        ));
        assert!(matches!(
            agent.pause_receive(bogus, true),
            Err(AgentError::ObjectNotFound)
        ));

        let addr = spawn_parking_server();
        let id = agent.connect("127.0.0.1", addr.port()).unwrap();
        assert!(matches!(
            agent.send_slices(id, &[]),
            Err(AgentError::InvalidParam(_))
        ));
        assert!(matches!(
            agent.send_slices(id, &[b"" as &[u8]]),
            Err(AgentError::InvalidParam(_))
        ));

        agent.disconnect(id, true).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            agent.connection_count() == 0
        }));
        agent.stop().unwrap();
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let config = AgentConfig {
            worker_thread_count: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            TcpAgent::new(Recorder::default(), config),
            Err(AgentError::InvalidParam("worker_thread_count"))
        ));
    }

    #[test]
    fn connection_queries_reflect_the_peer() {
        let addr = spawn_parking_server();
        let (agent, _) = make_agent(small_config(1));
        agent.start(None, false).unwrap();

        let id = agent.connect("127.0.0.1", addr.port()).unwrap();
        assert_eq!(addr, agent.remote_addr(id).unwrap());
        let (host, port) = agent.remote_host(id).unwrap();
        assert_eq!("127.0.0.1", host);
        assert_eq!(addr.port(), port);
        assert!(agent.local_addr(id).unwrap().ip().is_loopback());
        assert_eq!(0, agent.pending_data_len(id).unwrap());
        assert!(agent.connect_period(id).unwrap() < Duration::from_secs(5));
        assert!(agent.silence_period(id).unwrap() < Duration::from_secs(5));
        assert_eq!(vec![id], agent.connection_ids());

        let payload: UserData = Arc::new(7usize);
        agent.set_extra(id, Some(payload)).unwrap();
        let got = agent.extra(id).unwrap().unwrap();
        assert_eq!(Some(&7usize), got.downcast_ref::<usize>());

        agent.disconnect(id, true).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            agent.connection_count() == 0
        }));
        agent.stop().unwrap();
    }

    #[test]
    fn wait_unblocks_when_the_agent_stops() {
        let (agent, _) = make_agent(small_config(1));
        agent.start(None, true).unwrap();

        let waiter = agent.clone();
        let joined = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(50));
        agent.stop().unwrap();
        joined.join().unwrap();
    }

    #[test]
    fn stop_disconnects_everything_and_fires_shutdown() {
        let addr = spawn_parking_server();
        let (agent, recorded) = make_agent(small_config(2));
        agent.start(None, false).unwrap();

        for _ in 0..3 {
            agent.connect("127.0.0.1", addr.port()).unwrap();
        }
        assert_eq!(3, agent.connection_count());

        agent.stop().unwrap();
        assert_eq!(0, agent.connection_count());
        assert_eq!(3, recorded.closes.lock().unwrap().len());
        assert_eq!(1, recorded.shutdowns.load(Ordering::SeqCst));
    }
}
