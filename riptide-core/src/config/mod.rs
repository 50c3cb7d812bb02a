//! Server and runtime configuration.
//!
//! This module provides the configuration records for the server core. It is
//! split the same way the runtime is: [`ServerConfig`] holds the protocol and
//! resource options a listener/connection cares about, while [`RuntimeConfig`]
//! holds the options of the per-worker runtime environment (thread count, I/O
//! driver selection, CPU affinity).
//!
//! # Key Components
//!
//! - [`ServerConfig`]: The single configuration record with every recognized
//!   server option, all defaulted.
//! - [`RuntimeConfig`]: Worker-thread and I/O-driver options.
//! - [`RuntimeType`]: io_uring / legacy driver selection.
use std::{
    net::{SocketAddr, ToSocketAddrs},
    num::NonZeroUsize,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::AnyResult;

// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const FALLBACK_PARALLELISM: NonZeroUsize = match NonZeroUsize::new(1) {
    Some(n) => n,
    None => unreachable!(),
};

/// Configuration record for a server instance.
///
/// Every option is recognized and defaulted; a config file only needs to name
/// the options it wants to change. `bind_port` 0 asks the kernel for a free
/// port at listen time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the listening socket to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port to bind the listening socket to.
    #[serde(default)]
    pub bind_port: u16,

    /// Number of I/O worker threads. Each runs its own event loop.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Listen backlog handed to the kernel.
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,

    /// Cap on the total size of a request head (request line + headers).
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Cap on the request body size (decoded length for chunked bodies).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// How long a keep-alive connection may sit idle between requests.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How long a partially received request head may take to complete.
    #[serde(default = "default_header_timeout_ms")]
    pub header_timeout_ms: u64,

    /// How long a stalled response write may take before the connection is
    /// dropped.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Whether HTTP/1.1 keep-alive is honored at all.
    #[serde(default = "default_keep_alive_enabled")]
    pub keep_alive_enabled: bool,

    /// Initial chunk size of each per-connection request arena.
    #[serde(default = "default_request_arena_chunk")]
    pub request_arena_chunk: usize,

    /// Initial chunk size of each per-connection response arena.
    #[serde(default = "default_response_arena_chunk")]
    pub response_arena_chunk: usize,

    /// Per-worker cap on concurrently open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Bound on queued-but-unflushed response bytes for pipelined requests.
    #[serde(default = "default_write_queue_bytes")]
    pub write_queue_bytes: usize,

    /// Value of the `Server` response header.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Whether worker threads are pinned to CPU cores.
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl ServerConfig {
    pub fn new(bind_port: u16) -> Self {
        ServerConfig {
            bind_host: default_bind_host(),
            bind_port,
            io_threads: default_io_threads(),
            listen_backlog: default_listen_backlog(),
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
            idle_timeout_ms: default_idle_timeout_ms(),
            header_timeout_ms: default_header_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            keep_alive_enabled: default_keep_alive_enabled(),
            request_arena_chunk: default_request_arena_chunk(),
            response_arena_chunk: default_response_arena_chunk(),
            max_connections: default_max_connections(),
            write_queue_bytes: default_write_queue_bytes(),
            server_name: default_server_name(),
            cpu_affinity: default_cpu_affinity(),
        }
    }

    /// Resolve `bind_host`/`bind_port` into a socket address.
    pub fn bind_addr(&self) -> AnyResult<SocketAddr> {
        let mut addrs = (self.bind_host.as_str(), self.bind_port).to_socket_addrs()?;
        match addrs.next() {
            Some(addr) => Ok(addr),
            None => bail_into!("{}:{} resolves to no address", self.bind_host, self.bind_port),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Configuration options for the per-worker runtime environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads for the runtime.
    #[serde(default = "default_io_threads")]
    pub worker_threads: usize,

    /// Number of I/O entries for event handling for io_uring.
    #[serde(default = "default_entries")]
    pub entries: u32,

    /// The type of runtime to use.
    #[serde(default)]
    pub runtime_type: RuntimeType,

    /// Whether to enable CPU affinity for worker threads.
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_io_threads(),
            entries: default_entries(),
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

impl From<&ServerConfig> for RuntimeConfig {
    fn from(cfg: &ServerConfig) -> Self {
        RuntimeConfig {
            worker_threads: cfg.io_threads.max(1),
            entries: default_entries(),
            runtime_type: Default::default(),
            cpu_affinity: cfg.cpu_affinity,
        }
    }
}

/// Enum representing different runtime implementation options.
///
/// This allows for selection between different runtime backends,
/// such as io_uring on Linux or a legacy implementation on other platforms.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    /// io_uring-based runtime (Linux only).
    #[cfg(target_os = "linux")]
    IoUring,

    /// Legacy runtime implementation.
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

fn default_io_threads() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_name() -> String {
    "riptide".to_string()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);
define_const!(default_listen_backlog, 4096, u32);
define_const!(default_max_header_bytes, 64 * 1024, usize);
define_const!(default_max_body_bytes, 1024 * 1024, usize);
define_const!(default_idle_timeout_ms, 30_000, u64);
define_const!(default_header_timeout_ms, 10_000, u64);
define_const!(default_write_timeout_ms, 30_000, u64);
define_const!(default_keep_alive_enabled, true, bool);
define_const!(default_request_arena_chunk, 16 * 1024, usize);
define_const!(default_response_arena_chunk, 16 * 1024, usize);
define_const!(default_max_connections, 10_240, usize);
define_const!(default_write_queue_bytes, 256 * 1024, usize);
