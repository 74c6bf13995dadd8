//! A single connection the client keeps parked at the server, waiting to be
//! handed a visitor and spliced into a local TCP share.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{trace, warn};
use zrp_core::{codec, Deadline, Message, MsgKind};

use crate::share::TcpShare;

/// A worker connection parked at the server. Decrements its share's
/// `nr_workers` counter on drop, mirroring the original's constructor/
/// destructor `nr_workers_++`/`--` pairing.
pub struct Worker {
    pub share_id: String,
    pub worker_id: i64,
    nr_workers: Arc<AtomicI64>,
    ping_deadline: Deadline,
    visited: AtomicBool,
    stopping: AtomicBool,
    visited_notify: Notify,
}

impl Worker {
    pub fn new(share_id: String, worker_id: i64, nr_workers: Arc<AtomicI64>) -> Arc<Self> {
        nr_workers.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            share_id,
            worker_id,
            nr_workers,
            ping_deadline: Deadline::new(),
            visited: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            visited_notify: Notify::new(),
        })
    }

    pub fn try_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.ping_deadline.disable();
        self.visited_notify.notify_one();
    }

    /// Spawn the worker's two tasks (message loop, idle-ping actor) against
    /// `sock`. Once the server visits it, the reunited socket is handed to
    /// `share`'s rendezvous queue.
    pub fn run(self: &Arc<Self>, sock: TcpStream, share: Arc<TcpShare>) {
        let (read_half, write_half) = sock.into_split();
        let write_half = Arc::new(Mutex::new(write_half));

        let ping_this = self.clone();
        let ping_write = write_half.clone();
        let ping_handle = tokio::spawn(async move {
            ping_this.ping_actor(ping_write).await;
        });

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this
                .send_and_recv_msgs(read_half, write_half, share, ping_handle)
                .await
            {
                warn!(share = %this.share_id, worker = this.worker_id, error = %e, "worker message loop exited");
            }
        });
    }

    async fn send_and_recv_msgs(
        &self,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        write_half: Arc<Mutex<OwnedWriteHalf>>,
        share: Arc<TcpShare>,
        ping_handle: tokio::task::JoinHandle<()>,
    ) -> zrp_core::Result<()> {
        {
            let mut w = write_half.lock().await;
            codec::send_message(
                &mut *w,
                &Message::TcpShareWorkerHello {
                    tcp_share_id: self.share_id.clone(),
                    worker_id: self.worker_id,
                },
            )
            .await?;
        }

        loop {
            self.ping_deadline.arm(Duration::from_secs(20));
            let msg =
                codec::read_expect(&mut read_half, &[MsgKind::VisitTcpShare, MsgKind::Pong])
                    .await?;
            match msg {
                Message::VisitTcpShare { .. } => {
                    trace!(share = %self.share_id, worker = self.worker_id, "was visited");
                    self.visited.store(true, Ordering::SeqCst);
                    self.ping_deadline.disable();
                    self.visited_notify.notify_one();

                    {
                        let mut w = write_half.lock().await;
                        codec::send_message(&mut *w, &Message::VisitConfirmed {}).await?;
                    }

                    // Wait for the ping actor to drop its clone of the write
                    // half so we can reunite the two halves into one socket.
                    let _ = ping_handle.await;
                    let write_half = Arc::try_unwrap(write_half)
                        .unwrap_or_else(|_| panic!("ping actor still holds the write half"))
                        .into_inner();
                    let sock = read_half
                        .reunite(write_half)
                        .map_err(|e| zrp_core::Error::Other(e.to_string()))?;

                    share.deliver_visited_socket(sock).await;
                    return Ok(());
                }
                Message::Pong {} => {
                    trace!(share = %self.share_id, worker = self.worker_id, "recv a pong");
                }
                _ => unreachable!("read_expect filtered to the two listed kinds"),
            }
        }
    }

    async fn ping_actor(&self, write_half: Arc<Mutex<OwnedWriteHalf>>) {
        loop {
            tokio::select! {
                _ = self.ping_deadline.wait_expired() => {}
                _ = self.visited_notify.notified() => return,
            }
            if self.stopping.load(Ordering::SeqCst) || self.visited.load(Ordering::SeqCst) {
                return;
            }
            self.ping_deadline.disable();
            let mut w = write_half.lock().await;
            if codec::send_message(&mut *w, &Message::Ping {}).await.is_err() {
                return;
            }
            drop(w);
            trace!(share = %self.share_id, worker = self.worker_id, "sent a ping");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.nr_workers.fetch_sub(1, Ordering::SeqCst);
    }
}
