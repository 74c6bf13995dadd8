//! Full-duplex byte pump between two already-connected TCP sockets.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

pub const PIPE_BUFFER_SIZE: usize = 8192;

/// Splices `lhs` and `rhs` in both directions until either half sees EOF or
/// a fatal error. Retired once both halves have exited.
pub struct Pipe {
    token: CancellationToken,
}

impl Pipe {
    /// Create an idle pipe handle. Call [`Pipe::run`] to actually splice a
    /// pair of sockets through it.
    pub fn new() -> Self {
        Pipe {
            token: CancellationToken::new(),
        }
    }

    /// Splice the two sockets together until either half sees EOF or a
    /// fatal error, or [`Pipe::try_stop`] is called. Consumes both sockets.
    pub async fn run(&self, lhs: TcpStream, rhs: TcpStream) {
        let (lhs_r, lhs_w) = lhs.into_split();
        let (rhs_r, rhs_w) = rhs.into_split();

        let t1 = self.token.clone();
        let t2 = self.token.clone();
        let fwd = tokio::spawn(Self::half_pipe(lhs_r, rhs_w, t1));
        let bwd = tokio::spawn(Self::half_pipe(rhs_r, lhs_w, t2));

        let _ = tokio::join!(fwd, bwd);
    }

    /// Cooperatively stop both halves (closes both sockets' read sides by
    /// cancelling the in-flight reads).
    pub fn try_stop(&self) {
        self.token.cancel();
    }

    async fn half_pipe<R, W>(mut read_half: R, mut write_half: W, token: CancellationToken)
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut buf = [0u8; PIPE_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("half-pipe cancelled");
                    break;
                }
                res = read_half.read(&mut buf) => {
                    match res {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Err(e) = write_half.write_all(&buf[..n]).await {
                                if !is_benign_close(&e) {
                                    warn!(error = %e, "pipe write error, stopping");
                                    token.cancel();
                                }
                                break;
                            }
                        }
                        Err(e) => {
                            if !is_benign_close(&e) {
                                warn!(error = %e, "pipe read error, stopping");
                                token.cancel();
                            }
                            break;
                        }
                    }
                }
            }
        }
        let _ = write_half.shutdown().await;
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

fn is_benign_close(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
    )
}
