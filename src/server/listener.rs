//! Accept loops for the plaintext and TLS listeners.
//!
//! Every accepted connection is wrapped in [`Guarded`] so shutdown can
//! abort it once the drain deadline has passed.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

/// Pause after a failed accept (usually fd exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshaken TLS connections waiting to be served
const HANDSHAKE_QUEUE: usize = 64;

/// Remote address of a connection, available to handlers via `ConnectInfo`
#[derive(Clone, Copy, Debug)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, PlainListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, PlainListener>) -> Self {
        PeerAddr(*stream.remote_addr())
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        PeerAddr(*stream.remote_addr())
    }
}

/// Connection I/O that fails with `ConnectionAborted` once `kill` fires.
pub struct Guarded<Io> {
    io: Io,
    kill: CancellationToken,
    killed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<Io> Guarded<Io> {
    pub fn new(io: Io, kill: &CancellationToken) -> Self {
        Self {
            io,
            kill: kill.clone(),
            killed: Box::pin(kill.clone().cancelled_owned()),
        }
    }

    /// Registers the waker so a pending read or write is woken by the kill.
    fn poll_killed(&mut self, cx: &mut Context<'_>) -> bool {
        self.kill.is_cancelled() || self.killed.as_mut().poll(cx).is_ready()
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "drain deadline passed")
}

impl<Io: AsyncRead + Unpin> AsyncRead for Guarded<Io> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_killed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<Io: AsyncWrite + Unpin> AsyncWrite for Guarded<Io> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_killed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_killed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Plaintext HTTP listener
pub struct PlainListener {
    inner: TcpListener,
    kill: CancellationToken,
}

impl PlainListener {
    pub fn new(inner: TcpListener, kill: CancellationToken) -> Self {
        Self { inner, kill }
    }
}

impl Listener for PlainListener {
    type Io = Guarded<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    return (Guarded::new(stream, &self.kill), peer);
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// HTTPS listener. Handshakes run in their own tasks so a slow client
/// cannot hold up the accept loop.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    kill: CancellationToken,
}

impl TlsListener {
    /// Start accepting on `inner`. The socket is closed once `stop` fires.
    pub fn new(
        inner: TcpListener,
        config: Arc<rustls::ServerConfig>,
        stop: CancellationToken,
        kill: CancellationToken,
    ) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        let acceptor = TlsAcceptor::from(config);
        let (tx, ready) = mpsc::channel(HANDSHAKE_QUEUE);

        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = inner.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    },
                };
                let _ = stream.set_nodelay(true);

                let acceptor = acceptor.clone();
                let tx = tx.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream));
                    let tls = tokio::select! {
                        _ = stop.cancelled() => return,
                        result = handshake => match result {
                            Ok(Ok(tls)) => tls,
                            Ok(Err(e)) => {
                                // Browsers rejecting the self-signed certificate land here
                                debug!("TLS handshake with {} failed: {}", peer, e);
                                return;
                            }
                            Err(_) => {
                                debug!("TLS handshake with {} timed out", peer);
                                return;
                            }
                        },
                    };
                    let _ = tx.send((tls, peer)).await;
                });
            }
            debug!("TLS accept loop on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            ready,
            kill,
        })
    }
}

impl Listener for TlsListener {
    type Io = Guarded<TlsStream<TcpStream>>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some((tls, peer)) => (Guarded::new(tls, &self.kill), peer),
            // Accept loop gone; only graceful shutdown ends serving now
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
