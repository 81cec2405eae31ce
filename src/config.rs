//! Agent configuration

use std::time::Duration;

use crate::error::{AgentError, Result};

/// Hard platform cap on live connections.
pub const MAX_CONNECTION_COUNT: usize = 1_000_000;
/// Hard cap on dispatcher worker threads.
pub const MAX_WORKER_THREAD_COUNT: usize = 500;
/// Smallest permitted per-worker/socket buffer.
pub const MIN_SOCKET_BUFFER_SIZE: usize = 64;

/// `SO_REUSEADDR` / `SO_REUSEPORT` handling applied to every outbound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusePolicy {
    /// Neither option is set.
    #[default]
    None,
    /// `SO_REUSEADDR` only.
    Address,
    /// `SO_REUSEPORT` only.
    Port,
    /// Both options.
    AddressAndPort,
}

/// Send-path policy carried for API parity with the outer wrappers.
///
/// The core implements `Direct` semantics for all variants; the packing
/// wrappers that give `Pack`/`Safe` their meaning live outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPolicy {
    /// Coalesce small sends (wrapper concern).
    Pack,
    /// Bounded queueing (wrapper concern).
    Safe,
    /// Write-through.
    #[default]
    Direct,
}

/// Everything the agent validates at [`start`](crate::TcpAgent::start).
///
/// Field ranges follow the validation table in the module docs; `validate`
/// rejects the whole configuration on the first field out of range.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hard cap on live connections (1 ..= [`MAX_CONNECTION_COUNT`]).
    pub max_connection_count: usize,
    /// Dispatcher worker threads (1 ..= [`MAX_WORKER_THREAD_COUNT`]).
    pub worker_thread_count: usize,
    /// Per-worker scratch and pool buffer size (>= [`MIN_SOCKET_BUFFER_SIZE`]).
    pub socket_buffer_size: usize,
    /// Cap on a synchronous connect attempt (> 0).
    pub sync_connect_timeout: Duration,
    /// Quarantine: minimum time a released record sits before reuse or
    /// release (>= 1 s).
    pub free_socket_obj_lock_time: Duration,
    /// Connection-record free-list capacity.
    pub free_socket_obj_pool: usize,
    /// Connection GC-list high water; crossing it triggers an eager sweep.
    pub free_socket_obj_hold: usize,
    /// Buffer free-list capacity.
    pub free_buffer_obj_pool: usize,
    /// Buffer GC-list high water.
    pub free_buffer_obj_hold: usize,
    /// TCP keep-alive idle time; zero disables keep-alive (0 or >= 1 s).
    pub keep_alive_time: Duration,
    /// TCP keep-alive probe interval (0 or >= 1 s).
    pub keep_alive_interval: Duration,
    /// `SO_REUSE*` handling.
    pub reuse_policy: ReusePolicy,
    /// `TCP_NODELAY`.
    pub no_delay: bool,
    /// Maintain per-connection last-I/O time for silence sweeps.
    pub mark_silence: bool,
    /// Send-path policy (core applies `Direct` semantics).
    pub send_policy: SendPolicy,
    /// Run record/buffer GC on a dedicated timer worker instead of inline on
    /// every close.
    pub external_gc: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_connection_count: 10_000,
            worker_thread_count: default_worker_count(),
            socket_buffer_size: 4096,
            sync_connect_timeout: Duration::from_secs(5),
            free_socket_obj_lock_time: Duration::from_secs(10),
            free_socket_obj_pool: 600,
            free_socket_obj_hold: 1800,
            free_buffer_obj_pool: 1024,
            free_buffer_obj_hold: 3072,
            keep_alive_time: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(20),
            reuse_policy: ReusePolicy::default(),
            no_delay: false,
            mark_silence: true,
            send_policy: SendPolicy::default(),
            external_gc: false,
        }
    }
}

fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cpus * 2 + 2).min(MAX_WORKER_THREAD_COUNT)
}

impl AgentConfig {
    /// Checks every field against its permitted range.
    pub fn validate(&self) -> Result<()> {
        if self.max_connection_count == 0 || self.max_connection_count > MAX_CONNECTION_COUNT {
            return Err(AgentError::InvalidParam("max_connection_count"));
        }
        if self.worker_thread_count == 0 || self.worker_thread_count > MAX_WORKER_THREAD_COUNT {
            return Err(AgentError::InvalidParam("worker_thread_count"));
        }
        if self.socket_buffer_size < MIN_SOCKET_BUFFER_SIZE {
            return Err(AgentError::InvalidParam("socket_buffer_size"));
        }
        if self.sync_connect_timeout.is_zero() {
            return Err(AgentError::InvalidParam("sync_connect_timeout"));
        }
        if self.free_socket_obj_lock_time < Duration::from_millis(1000) {
            return Err(AgentError::InvalidParam("free_socket_obj_lock_time"));
        }
        if !keep_alive_in_range(self.keep_alive_time) {
            return Err(AgentError::InvalidParam("keep_alive_time"));
        }
        if !keep_alive_in_range(self.keep_alive_interval) {
            return Err(AgentError::InvalidParam("keep_alive_interval"));
        }
        Ok(())
    }

    /// Keep-alive is active only when both the idle time and interval are
    /// non-zero.
    pub(crate) fn keep_alive_enabled(&self) -> bool {
        !self.keep_alive_time.is_zero() && !self.keep_alive_interval.is_zero()
    }

    pub(crate) fn quarantine_millis(&self) -> u64 {
        self.free_socket_obj_lock_time.as_millis() as u64
    }
}

// zero disables, anything else must be at least one second
fn keep_alive_in_range(value: Duration) -> bool {
    value.is_zero() || value >= Duration::from_secs(1)
}
