//! A connection parked by a client, waiting to be handed a visitor. Mirrors
//! [`zrp_core::Rendezvous`] to hand itself to a share's queue once hello'd,
//! and exposes [`Worker::visit`] for the forwarder's upstream side to call
//! once a public visitor needs piping through.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use zrp_core::{codec, Deadline, Message, MsgKind, Result as ZrpResult, TcpEndpoint};

struct VisitRequest {
    peer: SocketAddr,
    reply: oneshot::Sender<ZrpResult<TcpStream>>,
}

pub struct Worker {
    pub share_id: String,
    pub worker_id: i64,
    nr_workers: Arc<AtomicI64>,
    deadline: Deadline,
    visited: AtomicBool,
    visited_confirmed: AtomicBool,
    stopping: AtomicBool,
    token: CancellationToken,
    visit_tx: mpsc::UnboundedSender<VisitRequest>,
    next_epoch: AtomicU64,
}

impl Worker {
    pub fn new(
        share_id: String,
        worker_id: i64,
        nr_workers: Arc<AtomicI64>,
        sock: TcpStream,
    ) -> Arc<Self> {
        nr_workers.fetch_add(1, Ordering::SeqCst);
        let (visit_tx, visit_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Self {
            share_id,
            worker_id,
            nr_workers,
            deadline: Deadline::new(),
            visited: AtomicBool::new(false),
            visited_confirmed: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            token: CancellationToken::new(),
            visit_tx,
            next_epoch: AtomicU64::new(0),
        });
        worker.clone().spawn(sock, visit_rx);
        worker
    }

    pub fn try_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Hand this worker a visitor. Sends `visit_tcp_share` down the wire and
    /// waits for `visit_confirmed`, discarding any stray `ping` in between.
    /// Returns the worker's socket, ready to be spliced to the visitor.
    pub async fn visit(&self, peer: SocketAddr) -> ZrpResult<TcpStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.visit_tx
            .send(VisitRequest {
                peer,
                reply: reply_tx,
            })
            .map_err(|_| zrp_core::Error::Cancelled)?;
        reply_rx.await.map_err(|_| zrp_core::Error::Cancelled)?
    }

    fn spawn(self: Arc<Self>, sock: TcpStream, visit_rx: mpsc::UnboundedReceiver<VisitRequest>) {
        let (read_half, write_half) = sock.into_split();
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        let send_handle = tokio::spawn(send_msgs(write_half, send_rx));

        let ddl_this = self.clone();
        tokio::spawn(async move { ddl_this.ddl_actor().await });

        tokio::spawn(async move {
            self.recv_and_visit(read_half, send_tx, send_handle, visit_rx)
                .await;
        });
    }

    async fn ddl_actor(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.deadline.wait_expired() => {}
                _ = self.token.cancelled() => return,
            }
            if self.stopping.load(Ordering::SeqCst) || self.visited_confirmed.load(Ordering::SeqCst) {
                return;
            }
            warn!(share = %self.share_id, worker = self.worker_id, "timeout exceeded, stopping worker");
            self.try_stop();
            return;
        }
    }

    async fn recv_and_visit(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        send_tx: mpsc::UnboundedSender<Message>,
        send_handle: tokio::task::JoinHandle<OwnedWriteHalf>,
        mut visit_rx: mpsc::UnboundedReceiver<VisitRequest>,
    ) {
        let req = loop {
            self.deadline.arm(Duration::from_secs(60));
            tokio::select! {
                _ = self.token.cancelled() => return,
                req = visit_rx.recv() => {
                    match req {
                        Some(req) => break req,
                        None => return,
                    }
                }
                msg = codec::read_expect(&mut read_half, &[MsgKind::Ping]) => {
                    match msg {
                        Ok(Message::Ping {}) => {
                            trace!(share = %self.share_id, worker = self.worker_id, "recv a ping");
                            if send_tx.send(Message::Pong {}).is_err() {
                                return;
                            }
                        }
                        Ok(_) => unreachable!("read_expect filtered to ping"),
                        Err(e) => {
                            if !self.stopping.load(Ordering::SeqCst) {
                                warn!(share = %self.share_id, worker = self.worker_id, error = %e, "worker recv failed");
                            }
                            return;
                        }
                    }
                }
            }
        };

        self.visited.store(true, Ordering::SeqCst);
        self.deadline.arm(Duration::from_secs(20));

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let visit_msg = Message::VisitTcpShare {
            epoch,
            peer: TcpEndpoint {
                ip: req.peer.ip().to_string(),
                port: req.peer.port(),
            },
        };
        if send_tx.send(visit_msg).is_err() {
            let _ = req.reply.send(Err(zrp_core::Error::Cancelled));
            return;
        }
        // No more outgoing messages on this worker; dropping the sender lets
        // send_msgs drain and return the write half.
        drop(send_tx);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    let _ = req.reply.send(Err(zrp_core::Error::Cancelled));
                    return;
                }
                msg = codec::read_expect(&mut read_half, &[MsgKind::Ping, MsgKind::VisitConfirmed]) => {
                    match msg {
                        Ok(Message::Ping {}) => continue,
                        Ok(Message::VisitConfirmed {}) => break,
                        Ok(_) => unreachable!("read_expect filtered to ping/visit_confirmed"),
                        Err(e) => {
                            let _ = req.reply.send(Err(e));
                            return;
                        }
                    }
                }
            }
        }

        self.visited_confirmed.store(true, Ordering::SeqCst);
        self.deadline.disable();

        let write_half = match send_handle.await {
            Ok(w) => w,
            Err(_) => {
                let _ = req.reply.send(Err(zrp_core::Error::Cancelled));
                return;
            }
        };
        match read_half.reunite(write_half) {
            Ok(sock) => {
                let _ = req.reply.send(Ok(sock));
            }
            Err(e) => {
                let _ = req.reply.send(Err(zrp_core::Error::Other(e.to_string())));
            }
        }
    }
}

async fn send_msgs(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> OwnedWriteHalf {
    while let Some(msg) = rx.recv().await {
        if codec::send_message(&mut write_half, &msg).await.is_err() {
            break;
        }
    }
    write_half
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.nr_workers.fetch_sub(1, Ordering::SeqCst);
    }
}
