//! Listener manager: one capture loop, one frame buffer, any number of
//! HTTP/HTTPS listeners serving it.
//!
//! Shutdown order: stop accepting, stop capture (source released), close
//! the buffer so streams end, then wait for connections up to the drain
//! deadline before aborting whatever is left.

pub mod listener;
pub mod routes;
pub mod stream;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::auth::AuthGate;
use crate::capture::{CaptureLoop, CaptureStatus};
use crate::config::{ListenerConfig, ServerConfig, Transport};
use crate::error::ServerError;
use crate::frame::SharedFrameBuffer;
use crate::source::{self, FrameSource};

use listener::{PeerAddr, PlainListener, TlsListener};
use routes::AppState;
use stream::ClientStats;

/// Grace period for aborted connections to unwind after the drain deadline
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// A listener that is up and serving
#[derive(Debug, Clone, Copy)]
pub struct ActiveListener {
    pub transport: Transport,
    pub addr: SocketAddr,
}

impl ActiveListener {
    pub fn url(&self) -> String {
        format!("{}://{}", self.transport.scheme(), self.addr)
    }
}

pub struct ListenerManager {
    config: ServerConfig,
}

impl ListenerManager {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Open the configured frame source and start serving.
    pub async fn start(self) -> Result<RunningServer, ServerError> {
        let source_config = self.config.source.clone();
        let fallback = self.config.capture.fallback;
        let source = tokio::task::spawn_blocking(move || source::open_or_fallback(&source_config, fallback))
            .await
            .map_err(|e| ServerError::Capture(e.to_string()))??;
        self.start_with_source(source).await
    }

    /// Start serving frames from an already opened source.
    pub async fn start_with_source(self, source: Box<dyn FrameSource>) -> Result<RunningServer, ServerError> {
        let config = self.config;
        let gate = AuthGate::new(config.auth, config.credentials.clone())
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let buffer = Arc::new(SharedFrameBuffer::new());
        let capture = CaptureLoop::start(
            source,
            config.source.clone(),
            config.capture.clone(),
            Arc::clone(&buffer),
        )
        .map_err(|e| ServerError::Capture(e.to_string()))?;
        let capture_status = capture.status();

        let stop = CancellationToken::new();
        let kill = CancellationToken::new();
        let tracker = TaskTracker::new();
        let clients = Arc::new(ClientStats::default());
        let gate = Arc::new(gate);

        let mut active = Vec::new();
        for listener in &config.listeners {
            let state = AppState {
                buffer: Arc::clone(&buffer),
                gate: Arc::clone(&gate),
                capture: Arc::clone(&capture_status),
                clients: Arc::clone(&clients),
                transport: listener.transport,
                port: 0,
                stream_poll: config.stream_poll,
            };
            match spawn_listener(listener, state, &stop, &kill, &tracker).await {
                Ok(bound) => {
                    info!("📡 Listening on {}", bound.url());
                    active.push(bound);
                }
                Err(e) => error!("{} listener disabled: {}", listener.transport.scheme().to_uppercase(), e),
            }
        }
        tracker.close();

        let mut running = RunningServer {
            listeners: active,
            capture: Some(capture),
            capture_status,
            buffer,
            clients,
            stop,
            kill,
            tracker,
            drain_deadline: config.drain_deadline,
        };

        if running.listeners.is_empty() {
            running.shutdown().await;
            return Err(ServerError::NoListeners);
        }
        info!("🔑 Authentication: {}", gate.scheme());
        Ok(running)
    }
}

async fn spawn_listener(
    config: &ListenerConfig,
    mut state: AppState,
    stop: &CancellationToken,
    kill: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<ActiveListener, ServerError> {
    // Load certificates before binding so a bad pair leaves the port free
    let tls = match (&config.transport, &config.tls) {
        (Transport::Secure, Some(files)) => Some(tls::prepare(files)?),
        (Transport::Secure, None) => {
            return Err(ServerError::certificate("", "secure listener without certificate files"))
        }
        (Transport::Plain, _) => None,
    };

    let tcp = TcpListener::bind(config.addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.addr,
            source,
        })?;
    let addr = tcp.local_addr().map_err(|source| ServerError::Bind {
        addr: config.addr,
        source,
    })?;
    // Port 0 asks the OS for one; the page must show the real port
    state.port = addr.port();

    let app = routes::router(state).into_make_service_with_connect_info::<PeerAddr>();
    let shutdown = stop.clone().cancelled_owned();
    let transport = config.transport;

    match tls {
        Some(tls) => {
            let listener = TlsListener::new(tcp, tls, stop.clone(), kill.clone()).map_err(|source| {
                ServerError::Bind {
                    addr: config.addr,
                    source,
                }
            })?;
            tracker.spawn(async move {
                if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                    error!("HTTPS server on {} failed: {}", addr, e);
                }
                debug!("HTTPS server on {} stopped", addr);
            });
        }
        None => {
            let listener = PlainListener::new(tcp, kill.clone());
            tracker.spawn(async move {
                if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                    error!("HTTP server on {} failed: {}", addr, e);
                }
                debug!("HTTP server on {} stopped", addr);
            });
        }
    }

    Ok(ActiveListener { transport, addr })
}

/// Handle to a running server
pub struct RunningServer {
    listeners: Vec<ActiveListener>,
    capture: Option<CaptureLoop>,
    capture_status: Arc<CaptureStatus>,
    buffer: Arc<SharedFrameBuffer>,
    clients: Arc<ClientStats>,
    stop: CancellationToken,
    kill: CancellationToken,
    tracker: TaskTracker,
    drain_deadline: Duration,
}

impl RunningServer {
    pub fn listeners(&self) -> &[ActiveListener] {
        &self.listeners
    }

    #[cfg(test)]
    pub fn local_addr(&self, transport: Transport) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.transport == transport)
            .map(|l| l.addr)
    }

    pub fn capture_status(&self) -> Arc<CaptureStatus> {
        Arc::clone(&self.capture_status)
    }

    pub fn buffer(&self) -> Arc<SharedFrameBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn clients(&self) -> Arc<ClientStats> {
        Arc::clone(&self.clients)
    }

    /// Stop everything. Returns once every listener task has finished,
    /// at most the drain deadline plus a short grace period.
    pub async fn shutdown(&mut self) {
        info!("Shutting down...");
        self.stop.cancel();

        // Stopping capture joins a thread; keep it off the runtime workers
        if let Some(mut capture) = self.capture.take() {
            if tokio::task::spawn_blocking(move || capture.stop()).await.is_err() {
                error!("Capture shutdown task panicked");
            }
        }
        self.buffer.close();

        let active = self.clients.active();
        if active > 0 {
            info!("Waiting up to {:?} for {} client(s) to finish", self.drain_deadline, active);
        }
        if tokio::time::timeout(self.drain_deadline, self.tracker.wait()).await.is_err() {
            warn!(
                "Drain deadline of {:?} passed, closing {} remaining connection(s)",
                self.drain_deadline,
                self.clients.active()
            );
            self.kill.cancel();
            if tokio::time::timeout(ABORT_GRACE, self.tracker.wait()).await.is_err() {
                warn!("Listener tasks still running after forced close");
            }
        }
        info!("Shutdown complete");
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.stop.cancel();
        self.buffer.close();
        self.kill.cancel();
    }
}
