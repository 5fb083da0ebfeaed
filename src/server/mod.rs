//! Protocol-accurate control-plane test double.
//!
//! Serves the runtime protocol over real HTTP connections, including
//! keep-alive and pipelined requests. Each accepted connection is handled
//! by one task that owns its decoder and pipeline buffer outright, so the
//! reassembly queue needs no locking; the behavior is the only shared
//! state and is a trait object chosen at construction.

pub mod decoder;
pub mod pipeline;
pub mod response;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::decoder::HttpDecoder;
use self::pipeline::RequestBuffer;
use self::response::write_response;
use self::router::{ControlPlaneBehavior, RouteOutcome, SimulationHook, route};

/// Errors from starting or running the test double.
///
/// Programmer misuse (double start, stop while stopped) is not an error
/// value: it panics, since the single-threaded ownership model makes it a
/// bug rather than a race.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listen socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other I/O fault on the listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the test double.
///
/// Host/port and keep-alive affect only connection lifecycle, never
/// protocol semantics. `failure_simulation` arms the reserved sentinel
/// request ids and must stay off outside protocol-conformance tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen host.
    pub host: String,
    /// Listen port; 0 binds an ephemeral port.
    pub port: u16,
    /// Reuse connections across exchanges; when false, every response
    /// carries `Connection: close` and the socket is shut down after it.
    pub keep_alive: bool,
    /// Honor the `"timeout"` / `"disconnect"` sentinel request ids.
    pub failure_simulation: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 7000,
            keep_alive: true,
            failure_simulation: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RUNTIME_API_HOST` (default: "127.0.0.1"): listen host
    /// - `RUNTIME_API_PORT` (default: 7000): listen port
    /// - `RUNTIME_API_KEEP_ALIVE` (default: true): connection reuse
    pub fn from_env() -> Self {
        let host =
            std::env::var("RUNTIME_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());

        let port: u16 = std::env::var("RUNTIME_API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(7000);

        let keep_alive: bool = std::env::var("RUNTIME_API_KEEP_ALIVE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(true);

        Self {
            host,
            port,
            keep_alive,
            ..Default::default()
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// The test double's top-level controller; exclusively owns the listen
/// socket while running.
pub struct MockControlPlane {
    config: ServerConfig,
    behavior: Arc<dyn ControlPlaneBehavior>,
    running: Option<Running>,
}

impl MockControlPlane {
    /// Create a stopped control plane with the given behavior.
    pub fn new(config: ServerConfig, behavior: Arc<dyn ControlPlaneBehavior>) -> Self {
        Self {
            config,
            behavior,
            running: None,
        }
    }

    /// Bind the listen socket and start accepting connections.
    ///
    /// Returns the bound address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the address cannot be bound.
    ///
    /// # Panics
    ///
    /// Panics if the control plane is already started.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        assert!(
            self.running.is_none(),
            "mock control plane already started"
        );

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            keep_alive = self.config.keep_alive,
            failure_simulation = self.config.failure_simulation,
            "mock control plane listening"
        );

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.behavior.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stop accepting connections and close the listen socket.
    ///
    /// Connections already being served run to completion on their own
    /// tasks.
    ///
    /// # Panics
    ///
    /// Panics if the control plane is not running.
    pub async fn stop(&mut self) {
        let running = self
            .running
            .take()
            .expect("mock control plane is not running");
        running.shutdown.cancel();
        let _ = running.accept_task.await;
        info!("mock control plane stopped");
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }
}

async fn accept_loop(
    listener: TcpListener,
    behavior: Arc<dyn ControlPlaneBehavior>,
    config: ServerConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "connection accepted");
                    let behavior = behavior.clone();
                    let keep_alive = config.keep_alive;
                    let failure_simulation = config.failure_simulation;
                    tokio::spawn(async move {
                        handle_connection(stream, behavior, keep_alive, failure_simulation).await;
                        debug!(peer = %peer_addr, "connection closed");
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            },
        }
    }
}

/// Serve one connection: read, decode into framing events, reassemble,
/// route, respond. The decoder and pipeline buffer are owned here and
/// never shared; routing is synchronous, so the only awaits are the
/// socket operations and the simulated delay.
async fn handle_connection(
    mut stream: TcpStream,
    behavior: Arc<dyn ControlPlaneBehavior>,
    keep_alive: bool,
    failure_simulation: bool,
) {
    let mut decoder = HttpDecoder::new();
    let mut pending = RequestBuffer::new();
    let mut read_buf = [0u8; 8 * 1024];

    loop {
        let n = match stream.read(&mut read_buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "read failed");
                return;
            }
        };

        let parts = match decoder.push(&read_buf[..n]) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "malformed request, closing connection");
                return;
            }
        };

        for part in parts {
            let Some(request) = pending.push(part) else {
                continue;
            };

            match route(&request, behavior.as_ref(), failure_simulation) {
                RouteOutcome::Respond(response) => {
                    write_response(&mut stream, &response, keep_alive).await;
                    if !keep_alive {
                        // close only after the final write attempt finished
                        let _ = stream.shutdown().await;
                        return;
                    }
                }
                RouteOutcome::Hook(SimulationHook::DelayThenClose(delay)) => {
                    debug!(delay_ms = delay.as_millis() as u64, "simulating stalled response");
                    sleep(delay).await;
                    return;
                }
                RouteOutcome::Hook(SimulationHook::Disconnect) => {
                    debug!("simulating mid-flight disconnect");
                    return;
                }
            }
        }
    }
}
