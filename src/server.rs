//! Mock push server lifecycle
//!
//! Binds the TLS listener, hands every accepted socket to the connection
//! negotiator, and closes everything down again.
//!
//! Worker pool ownership decides what `shutdown` means:
//! - Pool supplied by the caller: shutdown closes the listener and all
//!   connections, leaves the pool running, and the server can be started
//!   again.
//! - Pool created by the server: shutdown additionally terminates the pool
//!   once connections are closed. The server cannot be restarted.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{mpsc, Arc, OnceLock};
use std::time::Duration;

use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::runtime::{Handle, Runtime};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::completion::{Completer, Completion};
use crate::handler::{HandlerFactory, IdleHandlerFactory};
use crate::negotiator::ConnectionNegotiator;
use crate::state::GatewayState;

// ============================================================================
// Constants
// ============================================================================

/// Worker threads of a server-owned pool
const DEFAULT_WORKER_THREADS: usize = 1;

/// How long an owned pool gets to finish outstanding work when terminated
const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Errors
// ============================================================================

/// Errors from starting or stopping the server
#[derive(Debug)]
pub enum LifecycleError {
    /// Server owned its worker pool and was shut down; it cannot restart
    Terminated,
    /// `start` called while the server is already running
    AlreadyRunning,
    /// Listener could not be bound
    Bind(io::Error),
    /// Worker pool could not be created
    Runtime(io::Error),
    /// The task driving the operation went away before reporting back
    Abandoned,
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::Terminated => write!(f, "server has been shut down permanently"),
            LifecycleError::AlreadyRunning => write!(f, "server is already running"),
            LifecycleError::Bind(e) => write!(f, "failed to bind listener: {}", e),
            LifecycleError::Runtime(e) => write!(f, "failed to create worker pool: {}", e),
            LifecycleError::Abandoned => write!(f, "operation abandoned before completion"),
        }
    }
}

impl std::error::Error for LifecycleError {}

// ============================================================================
// Builder
// ============================================================================

/// Configures a [`MockPushServer`]
pub struct MockPushServerBuilder {
    tls_config: Arc<ServerConfig>,
    worker_pool: Option<Handle>,
    worker_threads: usize,
    handler_factory: Arc<dyn HandlerFactory>,
    state: Arc<GatewayState>,
    bind_address: IpAddr,
}

impl MockPushServerBuilder {
    /// Run on a caller-owned runtime instead of creating one. The runtime is
    /// never shut down by the server.
    pub fn worker_pool(mut self, handle: Handle) -> Self {
        self.worker_pool = Some(handle);
        self
    }

    /// Worker threads of the server-owned pool (ignored with `worker_pool`)
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Protocol handler installed on negotiated connections
    pub fn handler_factory(mut self, factory: Arc<dyn HandlerFactory>) -> Self {
        self.handler_factory = factory;
        self
    }

    /// Share registries with another server or with test code
    pub fn state(mut self, state: Arc<GatewayState>) -> Self {
        self.state = state;
        self
    }

    /// Address the listener binds to (default `0.0.0.0`)
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn build(self) -> Result<MockPushServer, LifecycleError> {
        let pool = match self.worker_pool {
            Some(handle) => WorkerPool::Shared(handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(self.worker_threads)
                    .thread_name("push-gateway-worker")
                    .enable_all()
                    .build()
                    .map_err(LifecycleError::Runtime)?;
                WorkerPool::Owned(Some(runtime))
            }
        };

        Ok(MockPushServer {
            acceptor: TlsAcceptor::from(self.tls_config),
            handler_factory: self.handler_factory,
            state: self.state,
            bind_address: self.bind_address,
            pool,
            running: None,
        })
    }
}

// ============================================================================
// Server Structure
// ============================================================================

enum WorkerPool {
    /// Created by the server; `None` once terminated
    Owned(Option<Runtime>),
    /// Supplied by the caller
    Shared(Handle),
}

/// Listener and connections of a started server
struct Running {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: Arc<OnceLock<SocketAddr>>,
}

/// A mock push server accepting TLS connections with token or certificate
/// authentication
pub struct MockPushServer {
    acceptor: TlsAcceptor,
    handler_factory: Arc<dyn HandlerFactory>,
    state: Arc<GatewayState>,
    bind_address: IpAddr,
    pool: WorkerPool,
    running: Option<Running>,
}

impl MockPushServer {
    pub fn builder(tls_config: ServerConfig) -> MockPushServerBuilder {
        MockPushServerBuilder {
            tls_config: Arc::new(tls_config),
            worker_pool: None,
            worker_threads: DEFAULT_WORKER_THREADS,
            handler_factory: Arc::new(IdleHandlerFactory),
            state: Arc::new(GatewayState::new()),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Registries shared with every connection
    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Address the listener is bound to, once `start` has completed
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .as_ref()
            .and_then(|running| running.local_addr.get().copied())
    }

    /// Whether the listener is started. A start that failed to bind counts
    /// as stopped.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.shutdown.is_cancelled())
    }

    /// Whether an owned pool has been shut down
    pub fn is_terminated(&self) -> bool {
        matches!(self.pool, WorkerPool::Owned(None))
    }

    /// Start listening on `port` (0 picks a free port). The returned
    /// completion resolves with the bound address once the listener is
    /// ready to accept connections.
    pub fn start(&mut self, port: u16) -> Result<Completion<SocketAddr>, LifecycleError> {
        if self.is_running() {
            return Err(LifecycleError::AlreadyRunning);
        }

        let handle = match &self.pool {
            WorkerPool::Owned(Some(runtime)) => runtime.handle().clone(),
            WorkerPool::Owned(None) => return Err(LifecycleError::Terminated),
            WorkerPool::Shared(handle) => handle.clone(),
        };

        let running = Running {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: Arc::new(OnceLock::new()),
        };

        let negotiator = Arc::new(ConnectionNegotiator::new(
            self.acceptor.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.handler_factory),
        ));

        let (completer, completion) = Completion::channel();
        let addr = SocketAddr::new(self.bind_address, port);

        running.tracker.spawn_on(
            listen(
                addr,
                negotiator,
                running.tracker.clone(),
                running.shutdown.clone(),
                Arc::clone(&running.local_addr),
                completer,
            ),
            &handle,
        );

        self.running = Some(running);
        Ok(completion)
    }

    /// Close the listener and every connection.
    ///
    /// With an owned pool the completion resolves only after the pool has
    /// also been terminated. Calling this on a stopped server resolves
    /// immediately.
    pub fn shutdown(&mut self) -> Completion<()> {
        let tracker = self.running.take().map(|running| {
            log::info!("Shutting down mock push server");
            running.shutdown.cancel();
            running.tracker.close();
            running.tracker
        });

        match &mut self.pool {
            WorkerPool::Shared(handle) => match tracker {
                None => Completion::ready(Ok(())),
                Some(tracker) => {
                    let (completer, completion) = Completion::channel();
                    handle.spawn(async move {
                        tracker.wait().await;
                        log::info!("All connections closed");
                        completer.complete(Ok(()));
                    });
                    completion
                }
            },
            WorkerPool::Owned(runtime) => match runtime.take() {
                None => Completion::ready(Ok(())),
                Some(runtime) => terminate_pool(runtime, tracker),
            },
        }
    }
}

impl Drop for MockPushServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
        }
        if let WorkerPool::Owned(runtime) = &mut self.pool {
            if let Some(runtime) = runtime.take() {
                runtime.shutdown_background();
            }
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

async fn listen(
    addr: SocketAddr,
    negotiator: Arc<ConnectionNegotiator>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    bound: Arc<OnceLock<SocketAddr>>,
    completer: Completer<SocketAddr>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {}", addr, e);
            shutdown.cancel();
            completer.complete(Err(LifecycleError::Bind(e)));
            return;
        }
    };

    let local_addr = match listener.local_addr() {
        Ok(local_addr) => local_addr,
        Err(e) => {
            shutdown.cancel();
            completer.complete(Err(LifecycleError::Bind(e)));
            return;
        }
    };

    let _ = bound.set(local_addr);
    log::info!("Mock push server listening on {}", local_addr);
    completer.complete(Ok(local_addr));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    log::debug!("Accepted connection from {}", peer_addr);
                    tracker.spawn(Arc::clone(&negotiator).run(
                        stream,
                        peer_addr,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                }
            },
        }
    }

    log::info!("Listener on {} closed", local_addr);
}

/// Work run on the shutdown thread
type ShutdownJob = Box<dyn FnOnce() + Send + 'static>;

/// What the shutdown thread needs once it is running
struct PoolHandoff {
    runtime: Runtime,
    tracker: Option<TaskTracker>,
    completer: Completer<()>,
}

/// Wait for connections to close on the pool, then terminate it. Runs on a
/// dedicated thread because a runtime cannot be shut down from inside one.
fn terminate_pool(runtime: Runtime, tracker: Option<TaskTracker>) -> Completion<()> {
    terminate_pool_with(runtime, tracker, |job| {
        std::thread::Builder::new()
            .name("push-gateway-shutdown".to_string())
            .spawn(job)
            .map(drop)
    })
}

/// The runtime only moves to the shutdown thread after `spawn` succeeded, so
/// it is never dropped on the caller's thread, which may be async.
fn terminate_pool_with<S>(runtime: Runtime, tracker: Option<TaskTracker>, spawn: S) -> Completion<()>
where
    S: FnOnce(ShutdownJob) -> io::Result<()>,
{
    let (completer, completion) = Completion::channel();
    let (handoff_tx, handoff_rx) = mpsc::sync_channel::<PoolHandoff>(1);

    let job: ShutdownJob = Box::new(move || {
        let Ok(PoolHandoff {
            runtime,
            tracker,
            completer,
        }) = handoff_rx.recv()
        else {
            return;
        };

        if let Some(tracker) = tracker {
            runtime.block_on(tracker.wait());
            log::info!("All connections closed");
        }
        runtime.shutdown_timeout(POOL_SHUTDOWN_GRACE);
        log::info!("Worker pool terminated");
        completer.complete(Ok(()));
    });

    let handoff = PoolHandoff {
        runtime,
        tracker,
        completer,
    };

    match spawn(job) {
        Ok(()) => {
            if let Err(mpsc::SendError(handoff)) = handoff_tx.send(handoff) {
                log::error!("Shutdown thread exited early; abandoning worker pool");
                handoff.runtime.shutdown_background();
                handoff.completer.complete(Err(LifecycleError::Abandoned));
            }
        }
        Err(e) => {
            log::error!("Failed to spawn shutdown thread: {}", e);
            handoff.runtime.shutdown_background();
            handoff.completer.complete(Err(LifecycleError::Runtime(e)));
        }
    }

    completion
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned_runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_terminate_pool_waits_for_tracked_tasks() {
        let runtime = owned_runtime();
        let tracker = TaskTracker::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tracker.spawn_on(
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(());
            },
            runtime.handle(),
        );
        tracker.close();

        terminate_pool(runtime, Some(tracker)).await.unwrap();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_terminate_pool_without_shutdown_thread() {
        let runtime = owned_runtime();

        let result = terminate_pool_with(runtime, None, |_job| {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no threads left"))
        })
        .await;

        assert!(matches!(result, Err(LifecycleError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_terminate_pool_when_job_is_discarded() {
        let runtime = owned_runtime();

        let result = terminate_pool_with(runtime, None, |job| {
            drop(job);
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(LifecycleError::Abandoned)));
    }
}
