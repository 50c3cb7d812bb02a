use std::{io, net::SocketAddr};

use monoio::net::{ListenerOpts, TcpListener};

/// Deferred TCP listener construction.
///
/// The builder is `Send` and carries no file descriptor, so the acceptor can
/// be described once on the main thread and built inside every worker. Each
/// worker binds its own socket with `SO_REUSEPORT`, letting the kernel spread
/// incoming connections across the workers; a connection then stays pinned to
/// the thread that accepted it.
#[derive(Debug, Clone)]
pub struct ListenerBuilder {
    addr: SocketAddr,
    backlog: u32,
}

impl ListenerBuilder {
    pub fn bind_tcp(addr: SocketAddr, backlog: u32) -> Self {
        Self { addr, backlog }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn build(&self) -> io::Result<TcpListener> {
        let opts = ListenerOpts::default()
            .backlog(self.backlog as _)
            .reuse_addr(true)
            .reuse_port(true);
        TcpListener::bind_with_config(self.addr, &opts)
    }
}
