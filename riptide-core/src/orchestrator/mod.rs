//! Worker-thread orchestration.
//!
//! The server runs N parallel I/O threads, each driving a single-threaded
//! cooperative event loop. [`WorkerManager`] spawns those threads, optionally
//! pins them to CPU cores, and owns the shutdown channel of each worker.
//!
//! A worker is described by a factory closure: the manager clones it into
//! every thread, where it produces the worker's main future. The future is
//! then driven by a freshly built [`RuntimeWrapper`]. Because the future is
//! created inside its thread it never has to be `Send`, and per-connection
//! state stays thread-local by construction.
//!
//! Shutdown is a oneshot message carrying the grace period; each worker is
//! expected to stop accepting, drain in-flight work up to the grace deadline
//! and return, at which point the manager joins the thread.
mod runtime;

use std::{thread::JoinHandle, time::Duration};

use futures_channel::oneshot::{channel, Receiver as OReceiver};
use monoio::utils::bind_to_cpu_set;
use tracing::warn;

pub use self::runtime::RuntimeWrapper;
use crate::{config::RuntimeConfig, AnyResult};

struct WorkerHandle {
    join: JoinHandle<()>,
    shutdown: Option<futures_channel::oneshot::Sender<Duration>>,
}

/// Spawns and manages the fleet of worker threads.
pub struct WorkerManager {
    runtime_config: RuntimeConfig,
    workers: Vec<WorkerHandle>,
}

impl WorkerManager {
    pub fn new(runtime_config: RuntimeConfig) -> Self {
        Self {
            runtime_config,
            workers: Vec::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.runtime_config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Start the configured number of workers.
    ///
    /// `make_worker` is cloned into each thread and called there with the
    /// worker id and the shutdown receiver; the future it returns becomes the
    /// worker's main loop.
    pub fn spawn_workers<F, Fut>(&mut self, make_worker: F) -> AnyResult<()>
    where
        F: FnOnce(usize, OReceiver<Duration>) -> Fut + Clone + Send + 'static,
        Fut: std::future::Future<Output = ()>,
    {
        let cores = if self.runtime_config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };

        for worker_id in 0..self.runtime_config.worker_threads {
            let (shutdown_tx, shutdown_rx) = channel::<Duration>();
            let runtime_config = self.runtime_config.clone();
            let factory = make_worker.clone();
            let join = std::thread::Builder::new()
                .name(format!("riptide-worker-{worker_id}"))
                .spawn(move || {
                    if let Some(cores) = cores {
                        let core = worker_id % cores.get();
                        if let Err(e) = bind_to_cpu_set([core]) {
                            warn!("bind thread {worker_id} to core {core} failed: {e}");
                        }
                    }
                    let mut runtime = RuntimeWrapper::from(&runtime_config);
                    runtime.block_on(factory(worker_id, shutdown_rx));
                })?;
            self.workers.push(WorkerHandle {
                join,
                shutdown: Some(shutdown_tx),
            });
        }
        Ok(())
    }

    /// Signal every worker to drain within `grace` and join the threads.
    pub fn shutdown(&mut self, grace: Duration) {
        for worker in &mut self.workers {
            if let Some(tx) = worker.shutdown.take() {
                let _ = tx.send(grace);
            }
        }
        self.join();
    }

    /// Block until every worker thread has returned.
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}
