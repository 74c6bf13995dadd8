//! Generic forwarder: pairs sockets produced by a [`Downstream`] with
//! sockets produced by a matching [`Upstream`], then splices them together
//! with a [`Pipe`].
//!
//! Sockets are always created by the downstream side first; the upstream
//! side is then asked to produce a matching socket for the same peer
//! endpoint. This mirrors the client side (downstream = a worker popped off
//! the rendezvous queue, upstream = a freshly dialed local service) and the
//! server side (downstream = a newly accepted public connection, upstream =
//! a worker popped off the rendezvous queue) with the same code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::Result;
use crate::exec::PipeExecutor;
use crate::pipe::Pipe;

/// Produces the "passive" side of each forwarded connection.
#[async_trait]
pub trait Downstream: Send + Sync + 'static {
    async fn get_socket(&self) -> Result<(TcpStream, SocketAddr)>;

    /// Best-effort cooperative shutdown. Default no-op, matching the
    /// original's `IsTryStoppable` opt-in concept check.
    async fn try_stop(&self) {}
}

/// Produces the "active" side of each forwarded connection, given the peer
/// endpoint the downstream socket reported.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn get_socket(&self, peer: SocketAddr) -> Result<TcpStream>;

    async fn try_stop(&self) {}
}

/// Drives a [`Downstream`] accept loop, pairing each socket it produces with
/// one from an [`Upstream`] and splicing the two together.
pub struct Forwarder<U, D> {
    name: String,
    ups: U,
    dow: D,
    token: CancellationToken,
    pipes: Mutex<HashMap<u64, Weak<Pipe>>>,
    next_pipe_id: AtomicU64,
    pipe_exec: PipeExecutor,
}

impl<U, D> Forwarder<U, D>
where
    U: Upstream,
    D: Downstream,
{
    pub fn new(name: impl Into<String>, ups: U, dow: D) -> Arc<Self> {
        Self::new_with_executor(name, ups, dow, PipeExecutor::Inline)
    }

    /// Like [`Forwarder::new`], but spawns each accepted connection's pipe
    /// task onto `pipe_exec` instead of always spawning inline.
    pub fn new_with_executor(
        name: impl Into<String>,
        ups: U,
        dow: D,
        pipe_exec: PipeExecutor,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ups,
            dow,
            token: CancellationToken::new(),
            pipes: Mutex::new(HashMap::new()),
            next_pipe_id: AtomicU64::new(0),
            pipe_exec,
        })
    }

    /// Spawn the accept loop on the current runtime. Returns immediately.
    pub fn run(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.forward().await;
        });
    }

    /// Cancel the accept loop, stop both sides, and stop every live pipe.
    pub async fn try_stop(&self) {
        self.token.cancel();
        self.dow.try_stop().await;
        self.ups.try_stop().await;

        let pipes = self.pipes.lock().await;
        for weak in pipes.values() {
            if let Some(pipe) = weak.upgrade() {
                pipe.try_stop();
            }
        }
    }

    async fn forward(self: Arc<Self>) {
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                res = self.dow.get_socket() => res,
            };

            match accepted {
                Ok((sock, peer)) => {
                    let this = self.clone();
                    self.pipe_exec.spawn_pipe(async move {
                        this.handle_socket(sock, peer).await;
                    });
                }
                Err(e) => {
                    if !self.token.is_cancelled() {
                        warn!(forwarder = %self.name, error = %e, "downstream accept failed, stopping");
                        self.try_stop().await;
                    }
                    break;
                }
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, d_sock: TcpStream, peer: SocketAddr) {
        let u_sock = match self.ups.get_socket(peer).await {
            Ok(s) => s,
            Err(e) => {
                warn!(forwarder = %self.name, %peer, error = %e, "upstream socket failed, closing downstream");
                return;
            }
        };

        let id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed);
        let pipe = Arc::new(Pipe::new());
        {
            let mut pipes = self.pipes.lock().await;
            pipes.insert(id, Arc::downgrade(&pipe));
        }

        trace!(forwarder = %self.name, pipe_id = id, %peer, "piping");
        pipe.run(d_sock, u_sock).await;

        let mut pipes = self.pipes.lock().await;
        pipes.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct AcceptDownstream {
        listener: TcpListener,
    }

    #[async_trait]
    impl Downstream for AcceptDownstream {
        async fn get_socket(&self) -> Result<(TcpStream, SocketAddr)> {
            let (sock, addr) = self.listener.accept().await?;
            Ok((sock, addr))
        }
    }

    struct DialUpstream {
        target: SocketAddr,
    }

    #[async_trait]
    impl Upstream for DialUpstream {
        async fn get_socket(&self, _peer: SocketAddr) -> Result<TcpStream> {
            Ok(TcpStream::connect(self.target).await?)
        }
    }

    #[tokio::test]
    async fn forwards_bytes_end_to_end() {
        // Upstream target: an echo server.
        let echo_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = echo_listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Downstream: accept loop on an ephemeral port.
        let down_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let down_addr = down_listener.local_addr().unwrap();

        let fwd = Forwarder::new(
            "test",
            DialUpstream { target: echo_addr },
            AcceptDownstream {
                listener: down_listener,
            },
        );
        fwd.run();

        let mut client = TcpStream::connect(down_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn upstream_failure_closes_downstream_without_stopping_forwarder() {
        struct FailingUpstream;
        #[async_trait]
        impl Upstream for FailingUpstream {
            async fn get_socket(&self, _peer: SocketAddr) -> Result<TcpStream> {
                Err(crate::error::Error::Other("no upstream".into()))
            }
        }

        let down_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let down_addr = down_listener.local_addr().unwrap();
        let fwd = Forwarder::new(
            "test",
            FailingUpstream,
            AcceptDownstream {
                listener: down_listener,
            },
        );
        fwd.run();

        let mut client = TcpStream::connect(down_addr).await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        // forwarder should still accept further connections
        assert!(!fwd.token.is_cancelled());
    }
}
