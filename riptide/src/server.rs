//! Server lifecycle: build, listen, stop, stats.

use std::{
    cell::Cell,
    io,
    net::SocketAddr,
    rc::Rc,
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use futures_channel::oneshot::Receiver as OReceiver;
use riptide_core::{
    bail_into,
    config::{RuntimeConfig, ServerConfig},
    listener::ListenerBuilder,
    memory::{self, ArenaPool},
    metrics::{self, ServerStats},
    orchestrator::WorkerManager,
    AnyResult,
};
use riptide_services::http::{
    DrainFlag, Handler, HttpConnConfig, HttpMethod, HttpServerService, HttpServerTimeout,
    MiddlewareEntry, Router, RouterBuilder,
};
use tracing::{debug, info, warn};

/// Cap on a single connection's request arena: one head, one body, decoded
/// copies and bindings.
const REQUEST_ARENA_SLACK: usize = 64 * 1024;
/// Cap on a single connection's response arena.
const RESPONSE_ARENA_CAP: usize = 64 * 1024 * 1024;

/// Registration surface. Routes and middleware go in, [`build`] freezes
/// them into a [`Server`].
///
/// [`build`]: ServerBuilder::build
pub struct ServerBuilder {
    config: ServerConfig,
    router: RouterBuilder,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: RouterBuilder::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a global middleware entry applied to every route.
    pub fn middleware(&mut self, entry: MiddlewareEntry) -> &mut Self {
        self.router.middleware(entry);
        self
    }

    /// Register a route with no route-local middleware.
    pub fn route(
        &mut self,
        method: HttpMethod,
        pattern: &str,
        handler: Handler,
    ) -> AnyResult<u32> {
        Ok(self.router.add_route(method, pattern, handler, Vec::new())?)
    }

    /// Register a route with its own middleware entries.
    pub fn route_with(
        &mut self,
        method: HttpMethod,
        pattern: &str,
        handler: Handler,
        middleware: Vec<MiddlewareEntry>,
    ) -> AnyResult<u32> {
        Ok(self.router.add_route(method, pattern, handler, middleware)?)
    }

    /// Finalize the route table. The trie becomes immutable and shareable;
    /// no route may be added afterwards.
    pub fn build(self) -> AnyResult<Server> {
        let server_name = memory::intern_static(&self.config.server_name)?;
        let router = Arc::new(self.router.finalize()?);
        Ok(Server {
            config: self.config,
            router,
            server_name,
            manager: None,
            bound_addr: None,
        })
    }
}

/// A built server. `listen` starts the workers; `stop` drains them.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
    server_name: &'static str,
    manager: Option<WorkerManager>,
    bound_addr: Option<SocketAddr>,
}

impl Server {
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Bind `host:port` and start the worker fleet. Port 0 picks a free
    /// port; the chosen address is returned and kept in `local_addr`.
    pub fn listen(&mut self, host: &str, port: u16) -> AnyResult<SocketAddr> {
        if self.manager.is_some() {
            bail_into!("server is already listening");
        }

        self.config.bind_host = host.to_string();
        self.config.bind_port = port;
        let mut addr = self.config.bind_addr()?;
        if addr.port() == 0 {
            // Resolve the wildcard port once so every SO_REUSEPORT worker
            // binds the same one.
            let probe = std::net::TcpListener::bind(addr)?;
            addr.set_port(probe.local_addr()?.port());
        }

        let listener = ListenerBuilder::bind_tcp(addr, self.config.listen_backlog);
        let mut manager = WorkerManager::new(RuntimeConfig::from(&self.config));
        let (ready_tx, ready_rx) = mpsc::channel::<io::Result<SocketAddr>>();

        let worker_cfg = WorkerConfig {
            router: self.router.clone(),
            listener,
            conn: conn_config(&self.config),
            server_name: self.server_name,
            request_arena_chunk: self.config.request_arena_chunk,
            request_arena_cap: self.config.max_header_bytes
                + 2 * self.config.max_body_bytes
                + REQUEST_ARENA_SLACK,
            response_arena_chunk: self.config.response_arena_chunk,
            max_connections: self.config.max_connections,
        };

        manager.spawn_workers(move |worker_id, shutdown_rx| {
            let cfg = worker_cfg.clone();
            let ready_tx = ready_tx.clone();
            async move { worker_main(worker_id, cfg, ready_tx, shutdown_rx).await }
        })?;

        // Every worker reports its bind result before we call the server up.
        for _ in 0..manager.config().worker_threads {
            match ready_rx.recv_timeout(Duration::from_secs(10)) {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    manager.shutdown(Duration::ZERO);
                    return Err(e.into());
                }
                Err(e) => {
                    manager.shutdown(Duration::ZERO);
                    bail_into!("worker startup did not report readiness: {e}");
                }
            }
        }

        info!(
            "listening on {addr} with {} workers",
            manager.config().worker_threads
        );
        self.manager = Some(manager);
        self.bound_addr = Some(addr);
        Ok(addr)
    }

    /// Graceful shutdown: stop accepting, drain in-flight requests for up
    /// to `grace_ms`, then close everything and join the workers.
    pub fn stop(&mut self, grace_ms: u64) {
        if let Some(mut manager) = self.manager.take() {
            manager.shutdown(Duration::from_millis(grace_ms));
            self.bound_addr = None;
        }
    }

    /// Block until the workers exit (via [`stop`](Server::stop) from
    /// another thread, or a worker failure).
    pub fn join(&mut self) {
        if let Some(manager) = self.manager.as_mut() {
            manager.join();
        }
    }

    /// Point-in-time serving statistics, including per-kind arena stats.
    pub fn stats(&self) -> ServerStats {
        metrics::snapshot()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop(0);
    }
}

fn conn_config(config: &ServerConfig) -> HttpConnConfig {
    HttpConnConfig {
        read_buf_init: 8 * 1024,
        max_header_bytes: config.max_header_bytes,
        max_body_bytes: config.max_body_bytes,
        write_queue_bytes: config.write_queue_bytes,
        keep_alive_enabled: config.keep_alive_enabled,
        timeout: HttpServerTimeout {
            keepalive_timeout: Some(config.idle_timeout()),
            read_header_timeout: Some(config.header_timeout()),
            write_timeout: Some(config.write_timeout()),
        },
    }
}

#[derive(Clone)]
struct WorkerConfig {
    router: Arc<Router>,
    listener: ListenerBuilder,
    conn: HttpConnConfig,
    server_name: &'static str,
    request_arena_chunk: usize,
    request_arena_cap: usize,
    response_arena_chunk: usize,
    max_connections: usize,
}

/// One worker: bind, accept until shutdown, then drain within the grace
/// period. Runs inside the worker's own single-threaded runtime.
async fn worker_main(
    worker_id: usize,
    cfg: WorkerConfig,
    ready_tx: mpsc::Sender<io::Result<SocketAddr>>,
    mut shutdown_rx: OReceiver<Duration>,
) {
    let listener = match cfg.listener.build() {
        Ok(listener) => {
            let addr = listener.local_addr().unwrap_or_else(|_| cfg.listener.addr());
            let _ = ready_tx.send(Ok(addr));
            listener
        }
        Err(e) => {
            warn!("worker {worker_id} failed to bind {}: {e}", cfg.listener.addr());
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    drop(ready_tx);

    let pool = ArenaPool::new(
        cfg.request_arena_chunk,
        cfg.request_arena_cap,
        cfg.response_arena_chunk,
        RESPONSE_ARENA_CAP,
    );
    let service = Rc::new(HttpServerService::new(
        cfg.router,
        cfg.conn,
        cfg.server_name,
        pool,
    ));
    let drain = DrainFlag::new();
    let active = Rc::new(Cell::new(0usize));

    let grace = loop {
        monoio::select! {
            grace = &mut shutdown_rx => {
                break grace.unwrap_or_default();
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if active.get() >= cfg.max_connections {
                            debug!("worker {worker_id} at connection cap, dropping {peer}");
                            drop(stream);
                        } else {
                            active.set(active.get() + 1);
                            let service = service.clone();
                            let active = active.clone();
                            let drain = drain.clone();
                            monoio::spawn(async move {
                                service.serve(stream, peer, drain).await;
                                active.set(active.get() - 1);
                            });
                        }
                    }
                    Err(e) => {
                        warn!("worker {worker_id} accept error: {e}");
                    }
                }
            }
        }
    };

    // Stop accepting, let in-flight work finish within the grace period.
    // The drain flag ends keep-alive and raises the cooperative cancel
    // signal; whatever is still running when the runtime drops is cut off
    // without a response.
    drain.set();
    if active.get() > 0 {
        debug!(
            "worker {worker_id} draining {} connections for {:?}",
            active.get(),
            grace
        );
        let deadline = Instant::now() + grace;
        while active.get() > 0 && Instant::now() < deadline {
            monoio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
