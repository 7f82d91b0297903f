// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The root of the runtime kernel: owns a fixed pool of [`Worker`]s, hands
//! out [`WorkerHandle`]s for off-worker code to dispatch through, and binds
//! servers by spawning an [`Acceptor`] per listener.
//!
//! One pool of workers backs any number of bound servers and outgoing
//! client connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use mio::event::Source;

use crate::config::Config;
use crate::error::ColossusError;
use crate::initializer::Initializer;
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::net::{TcpListener, TcpStream};
use crate::server::{Acceptor, ServerRef, ServerState};
use crate::worker::{HandlerFactory, ServerId, Worker, WorkerCommand, WorkerHandle, WorkerSender};

/// Owns a fixed pool of single-threaded [`Worker`]s. Every
/// accepted or outgoing connection, and every non-connection
/// [`crate::context::WorkerItem`], lives on exactly one of them for its
/// whole lifetime.
///
/// `IOSystem` is generic over the transport `S` for the same reason `Worker`
/// is: it owns the `std::thread::Builder::spawn` calls that construct
/// concrete, `S`-typed workers. Most embedders only ever instantiate
/// `IOSystem<mio::net::TcpStream>`; the `std::net` instantiation exists for
/// tests that want a worker pool without touching a real socket.
pub struct IOSystem<S> {
    name: String,
    config: Arc<Config>,
    workers: Vec<WorkerSender<S>>,
    handles: Vec<WorkerHandle>,
    metrics: Vec<Arc<WorkerMetrics>>,
    next_worker: AtomicUsize,
    next_server_id: std::sync::atomic::AtomicU64,
    shutdown: Vec<std::thread::JoinHandle<()>>,
}

impl<S> IOSystem<S>
where
    S: TcpStream + std::io::Read + std::io::Write + Source + Send + 'static,
{
    /// Spawn `config.num_workers` worker threads and block until every one
    /// of them has entered its event loop. This uses a synchronous
    /// rendezvous rather than a busy-wait: each worker thread sends exactly
    /// one message on a zero-capacity channel right before calling
    /// [`Worker::run`], and this constructor receives one per worker before
    /// returning.
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, ColossusError> {
        config.validate()?;
        let name = name.into();
        let config = Arc::new(config);
        let next_context_id = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let mut workers = Vec::with_capacity(config.num_workers);
        let mut handles = Vec::with_capacity(config.num_workers);
        let mut metrics = Vec::with_capacity(config.num_workers);
        let mut shutdown = Vec::with_capacity(config.num_workers);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(0);

        for id in 0..config.num_workers {
            let next_id = next_context_id.clone();
            let worker_config = config.clone();
            let worker_metrics = Arc::new(WorkerMetrics::new());
            metrics.push(worker_metrics.clone());
            let ready_tx = ready_tx.clone();

            let mut worker = Worker::<S>::new(id, next_id, worker_config, worker_metrics)
                .map_err(ColossusError::Io)?;
            workers.push(worker.sender());
            handles.push(worker.handle());

            let thread_name = format!("{name}-worker-{id}");
            let join = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let _ = ready_tx.send(());
                    worker.run();
                })
                .map_err(ColossusError::Io)?;
            shutdown.push(join);
        }

        for _ in 0..config.num_workers {
            // A worker thread that panics before sending drops `ready_tx`'s
            // clone, which closes the channel rather than hanging this recv
            // forever.
            if ready_rx.recv().is_err() {
                return Err(ColossusError::Fatal("a worker thread failed to start".into()));
            }
        }

        log::info!("iosystem {name}: {} workers ready", config.num_workers);

        Ok(Self {
            name,
            config,
            workers,
            handles,
            metrics,
            next_worker: AtomicUsize::new(0),
            next_server_id: std::sync::atomic::AtomicU64::new(0),
            shutdown,
        })
    }

    /// This system's name, used to prefix worker thread names and log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// The configuration this system was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The transport-erased handle for worker `id`, or `None` if out of
    /// range.
    pub fn worker_handle(&self, id: usize) -> Option<WorkerHandle> {
        self.handles.get(id).cloned()
    }

    fn next_worker_index(&self) -> usize {
        self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Bind a listener at `addr` and start routing accepted connections,
    /// round-robin, to every worker in the pool. `make_initializer`
    /// is called once per worker, letting each build its own
    /// [`Initializer`] (and whatever worker-scoped state it wants to close
    /// over) rather than sharing one across threads.
    pub fn bind_server<T, F, I>(&self, name: impl Into<String>, addr: SocketAddr, mut make_initializer: F) -> Result<ServerRef, ColossusError>
    where
        T: TcpListener<S> + Source + Send + 'static,
        F: FnMut() -> I,
        I: Initializer<S> + 'static,
    {
        let name = name.into();
        let id = ServerId(self.next_server_id.fetch_add(1, Ordering::Relaxed));

        for worker in &self.workers {
            worker.send(WorkerCommand::RegisterInitializer(id, Box::new(make_initializer())));
        }

        let state = Arc::new(AtomicU8::new(ServerState::Initializing as u8));
        let (mut acceptor, control) = Acceptor::<T, S>::bind(id, name.clone(), addr, self.workers.clone(), state.clone())
            .map_err(ColossusError::Io)?;
        let local_addr = acceptor.local_addr().map_err(ColossusError::Io)?;

        let thread_name = format!("{}-acceptor-{name}", self.name);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || acceptor.run())
            .map_err(ColossusError::Io)?;

        log::info!("iosystem {}: server '{name}' bound on {local_addr}", self.name);
        Ok(ServerRef::new(id, name, local_addr, state, control))
    }

    /// Begin an outgoing connection to `addr`, round-robining across the
    /// pool the same way accepted connections are. `build` constructs the client-side
    /// [`crate::connection::ConnectionHandler`] once the connect completes.
    pub fn connect(&self, addr: SocketAddr, build: HandlerFactory) -> WorkerHandle {
        let idx = self.next_worker_index();
        self.workers[idx].send(WorkerCommand::Connect { addr, build });
        self.handles[idx].clone()
    }

    /// Merge every worker's [`crate::metrics::MetricsSnapshot`] into one
    /// system-wide total.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut total = MetricsSnapshot::default();
        for worker in &self.metrics {
            total = total.merge(worker.snapshot());
        }
        total
    }

    /// Ask every worker to finish in-flight work and stop, then join their
    /// threads. Acceptor threads are left running; callers that bound
    /// servers should [`ServerRef::stop`] them first.
    pub fn shutdown(mut self) {
        for worker in &self.workers {
            worker.send(WorkerCommand::Shutdown);
        }
        for join in self.shutdown.drain(..) {
            let _ = join.join();
        }
        log::info!("iosystem {}: all workers stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpStream as MioTcpStream;

    // `Worker<S>`/`IOSystem<S>` never construct an `S` in these tests, the
    // pool only needs the type to satisfy its trait bounds, not a live
    // socket, so `mio::net::TcpStream` (which implements `mio::event::Source`,
    // unlike `std::net::TcpStream`) is the instantiation these tests use.

    #[test]
    fn new_rejects_zero_workers_before_spawning_threads() {
        let config = Config::builder().num_workers(0).build();
        assert!(config.is_err(), "builder itself rejects this, same invariant IOSystem::new relies on");
    }

    #[test]
    fn pool_starts_with_requested_worker_count_and_exposes_handles() {
        let config = Config::builder().num_workers(2).build().unwrap();
        let system = IOSystem::<MioTcpStream>::new("test", config).unwrap();
        assert_eq!(system.num_workers(), 2);
        assert!(system.worker_handle(0).is_some());
        assert!(system.worker_handle(1).is_some());
        assert!(system.worker_handle(2).is_none());
        system.shutdown();
    }

    #[test]
    fn metrics_snapshot_starts_empty() {
        let config = Config::builder().num_workers(1).build().unwrap();
        let system = IOSystem::<MioTcpStream>::new("test", config).unwrap();
        let snapshot = system.metrics_snapshot();
        assert_eq!(snapshot.connections_opened, 0);
        system.shutdown();
    }
}
