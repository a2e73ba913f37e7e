//! Server assembly: accept loop, thread pools and graceful shutdown
//!
//! The server runs a two-stage pipeline. The accept thread pushes new
//! sockets into the bounded connection queue; a fixed pool of client
//! handlers owns the connections and feeds parsed tasks into the bounded
//! task queue; a fixed pool of workers executes them. Shutdown drains the
//! pipeline in order: stop accepting, signal both queues, unblock handlers
//! stuck in `recv`, join the pools, then drop the metadata store.

use std::fs;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use nix::sys::signal::{signal, SigHandler, Signal};

use crate::handler;
use crate::locks::{FileLockRegistry, MAX_FILE_LOCKS};
use crate::queue::{BoundedQueue, PushError};
use crate::request::Task;
use crate::session::{SessionManager, MAX_SESSIONS};
use crate::store::MetaStore;
use crate::worker;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 10985;
/// Default capacity of the accepted-connection queue.
pub const DEFAULT_CONN_QUEUE_CAPACITY: usize = 64;
/// Default capacity of the task queue.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 128;
/// Default size of the client handler pool.
pub const DEFAULT_CLIENT_THREADS: usize = 4;
/// Default size of the worker pool.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Name of the metadata database inside the storage root.
const DB_FILENAME: &str = "stash.db";

/// Tunables for a server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Capacity of the accepted-connection queue.
    pub conn_queue_capacity: usize,
    /// Capacity of the task queue.
    pub task_queue_capacity: usize,
    /// Number of client handler threads.
    pub client_threads: usize,
    /// Number of worker threads.
    pub worker_threads: usize,
    /// Directory holding per-user subdirectories and the metadata database.
    pub storage_root: PathBuf,
    /// Capacity of the session table.
    pub max_sessions: usize,
    /// Capacity of the file lock registry.
    pub max_file_locks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            conn_queue_capacity: DEFAULT_CONN_QUEUE_CAPACITY,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            client_threads: DEFAULT_CLIENT_THREADS,
            worker_threads: DEFAULT_WORKER_THREADS,
            storage_root: PathBuf::from("storage"),
            max_sessions: MAX_SESSIONS,
            max_file_locks: MAX_FILE_LOCKS,
        }
    }
}

impl ServerConfig {
    /// Reject configurations that cannot run.
    pub fn validate(&self) -> io::Result<()> {
        if self.conn_queue_capacity == 0
            || self.task_queue_capacity == 0
            || self.max_sessions == 0
            || self.max_file_locks == 0
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "queue and table capacities must be at least 1",
            ));
        }
        if self.client_threads == 0 || self.worker_threads == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "thread pools must have at least 1 thread",
            ));
        }
        Ok(())
    }
}

/// Everything the three thread groups share.
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) conn_queue: BoundedQueue<TcpStream>,
    pub(crate) task_queue: BoundedQueue<Task>,
    pub(crate) sessions: SessionManager,
    pub(crate) locks: FileLockRegistry,
    pub(crate) store: MetaStore,
    pub(crate) running: AtomicBool,
}

impl ServerState {
    /// Stop the pipeline: refuse new work and wake every blocked thread.
    /// Safe to call more than once.
    pub(crate) fn begin_shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.conn_queue.signal_shutdown();
        self.task_queue.signal_shutdown();
        self.sessions.interrupt_all();
    }

    #[cfg(test)]
    pub(crate) fn for_tests(storage_root: PathBuf) -> ServerState {
        let config = ServerConfig {
            storage_root,
            ..ServerConfig::default()
        };
        ServerState {
            conn_queue: BoundedQueue::new(config.conn_queue_capacity),
            task_queue: BoundedQueue::new(config.task_queue_capacity),
            sessions: SessionManager::new(config.max_sessions),
            locks: FileLockRegistry::new(config.max_file_locks),
            store: MetaStore::open_in_memory().expect("in-memory store"),
            running: AtomicBool::new(true),
            config,
        }
    }
}

/// A bound, not-yet-running server.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Prepare the storage root, open the metadata store and bind the
    /// listening socket. SIGPIPE is suppressed process-wide here so writes
    /// to a vanished client surface as ordinary errors.
    pub fn bind(config: ServerConfig) -> io::Result<Server> {
        config.validate()?;
        ignore_sigpipe();

        fs::create_dir_all(&config.storage_root)?;
        let store = MetaStore::open(&config.storage_root.join(DB_FILENAME))
            .map_err(|err| io::Error::other(format!("cannot open metadata store: {}", err)))?;

        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        info!("listening on {}", listener.local_addr()?);

        let state = Arc::new(ServerState {
            conn_queue: BoundedQueue::new(config.conn_queue_capacity),
            task_queue: BoundedQueue::new(config.task_queue_capacity),
            sessions: SessionManager::new(config.max_sessions),
            locks: FileLockRegistry::new(config.max_file_locks),
            store,
            running: AtomicBool::new(true),
            config,
        });
        Ok(Server { listener, state })
    }

    /// Address the server is bound to (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for requesting a graceful shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: Arc::clone(&self.state),
            listener_fd: self.listener.as_raw_fd(),
        }
    }

    /// Spawn the pools and run the accept loop until shutdown, then drain:
    /// signal the queues, unblock the sessions, join every thread.
    pub fn run(self) -> io::Result<()> {
        let Server { listener, state } = self;

        let mut workers = Vec::with_capacity(state.config.worker_threads);
        for i in 0..state.config.worker_threads {
            let state = Arc::clone(&state);
            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || worker::worker_loop(&state))?,
            );
        }
        let mut handlers = Vec::with_capacity(state.config.client_threads);
        for i in 0..state.config.client_threads {
            let state = Arc::clone(&state);
            handlers.push(
                thread::Builder::new()
                    .name(format!("client-{}", i))
                    .spawn(move || handler::client_loop(&state))?,
            );
        }

        while state.running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    match state.conn_queue.try_push(stream) {
                        Ok(()) => {}
                        Err(PushError::Full(mut stream)) => {
                            warn!("connection queue full, turning {} away", addr);
                            let _ = stream.write_all(b"ERROR: server busy\n");
                        }
                        Err(PushError::Shutdown(_)) => break,
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if state.running.load(Ordering::Acquire) {
                        error!("accept failed: {}", err);
                    }
                    break;
                }
            }
        }

        info!("draining: signalling queues and unblocking sessions");
        state.begin_shutdown();
        drop(listener);
        for handle in handlers {
            let _ = handle.join();
        }
        for handle in workers {
            let _ = handle.join();
        }
        let stats = state.sessions.stats();
        info!(
            "shutdown complete ({} sessions served, peak {} concurrent)",
            stats.total_created, stats.peak
        );
        Ok(())
    }
}

/// Requests a graceful drain of a running [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle {
    state: Arc<ServerState>,
    listener_fd: RawFd,
}

impl ShutdownHandle {
    /// Stop accepting, release every blocked thread and let in-flight work
    /// finish. Only the first call acts; later calls are no-ops.
    pub fn shutdown(&self) {
        if self.state.running.swap(false, Ordering::AcqRel) {
            info!("shutdown requested");
            // Unblocks an accept() in progress; the loop then observes the
            // cleared running flag.
            unsafe {
                libc::shutdown(self.listener_fd, libc::SHUT_RDWR);
            }
            self.state.begin_shutdown();
        }
    }
}

fn ignore_sigpipe() {
    // A client that disappears mid-send must not take the process down.
    unsafe {
        if let Err(err) = signal(Signal::SIGPIPE, SigHandler::SigIgn) {
            warn!("could not ignore SIGPIPE: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let mut config = ServerConfig::default();
        config.conn_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.worker_threads = 0;
        assert!(config.validate().is_err());
    }
}
