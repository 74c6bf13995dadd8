//! A single local service exposed through the tunnel: dials a local address
//! on the upstream side, and hands out sockets popped off the rendezvous
//! queue (workers that have been visited by a remote peer) on the downstream
//! side.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{trace, warn};
use zrp_core::{Downstream, Forwarder, PipeExecutor, Rendezvous, Result as ZrpResult, Upstream};

use crate::controller::Controller;
use crate::worker::Worker;

pub struct TcpShare {
    pub share_id: String,
    local_addr: SocketAddr,
    pub remote_port: u16,
    ctrl: Weak<Controller>,
    server_addr: SocketAddr,
    queue: Rendezvous<TcpStream>,
    workers: Mutex<HashMap<i64, Weak<Worker>>>,
    next_worker_id: AtomicI64,
    nr_workers: Arc<AtomicI64>,
    worker_count_low: usize,
    worker_count_more: usize,
    closing: AtomicBool,
    fwd: Mutex<Option<Weak<Forwarder<ShareUpstream, ShareDownstream>>>>,
    pipe_exec: PipeExecutor,
}

impl TcpShare {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctrl: Weak<Controller>,
        share_id: String,
        local_addr: SocketAddr,
        remote_port: u16,
        server_addr: SocketAddr,
        worker_count_low: usize,
        worker_count_more: usize,
        pipe_exec: PipeExecutor,
    ) -> Arc<Self> {
        Arc::new(Self {
            share_id,
            local_addr,
            remote_port,
            ctrl,
            server_addr,
            queue: Rendezvous::new(),
            workers: Mutex::new(HashMap::new()),
            next_worker_id: AtomicI64::new(0),
            nr_workers: Arc::new(AtomicI64::new(0)),
            worker_count_low,
            worker_count_more,
            closing: AtomicBool::new(false),
            fwd: Mutex::new(None),
            pipe_exec,
        })
    }

    pub fn run(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_forwarder().await;
        });
    }

    /// Count of currently-live parked workers.
    pub fn worker_count(&self) -> i64 {
        self.nr_workers.load(Ordering::SeqCst)
    }

    async fn run_forwarder(self: Arc<Self>) {
        let fwd = Forwarder::new_with_executor(
            self.share_id.clone(),
            ShareUpstream { share: self.clone() },
            ShareDownstream { share: self.clone() },
            self.pipe_exec.clone(),
        );
        *self.fwd.lock().await = Some(Arc::downgrade(&fwd));
        fwd.run();
    }

    pub async fn try_stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(fwd) = self.fwd.lock().await.as_ref().and_then(Weak::upgrade) {
            fwd.try_stop().await;
        }
        self.queue.close();
        let workers = self.workers.lock().await;
        for w in workers.values() {
            if let Some(w) = w.upgrade() {
                w.try_stop();
            }
        }
    }

    async fn handle_error(&self) {
        if !self.closing.load(Ordering::SeqCst) {
            warn!(share = %self.share_id, "tcp share failed, stopping whole client");
            if let Some(ctrl) = self.ctrl.upgrade() {
                ctrl.try_stop().await;
            }
        }
    }

    pub async fn deliver_visited_socket(&self, sock: TcpStream) {
        if self.queue.provide(sock).await.is_err() {
            trace!(share = %self.share_id, "queue closed while delivering visited socket");
        }
    }

    /// Called whenever a socket is popped from the queue: if the live worker
    /// count is below the low watermark, replenish up to `worker_count_more`
    /// more. Consumption-triggered only — see controller's initial fill for
    /// the other trigger.
    fn chk_need_workers(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.nr_workers.load(Ordering::SeqCst) < self.worker_count_low as i64 {
            let this = self.clone();
            tokio::spawn(async move {
                this.chk_need_workers_coro().await;
            });
        }
    }

    async fn chk_need_workers_coro(self: Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.nr_workers.load(Ordering::SeqCst) < self.worker_count_low as i64 {
            trace!(share = %self.share_id, nr_workers = self.nr_workers.load(Ordering::SeqCst), "getting more workers");
            self.add_workers(self.worker_count_more).await;
        }
    }

    pub async fn add_workers(self: &Arc<Self>, count: usize) {
        self.cleanup_workers().await;
        for _ in 0..count {
            if let Err(e) = self.add_worker().await {
                warn!(share = %self.share_id, error = %e, "failed to add worker");
                self.handle_error().await;
                return;
            }
        }
        trace!(share = %self.share_id, count, "got more workers");
    }

    async fn add_worker(self: &Arc<Self>) -> ZrpResult<()> {
        let sock = TcpStream::connect(self.server_addr).await?;
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let worker = Worker::new(self.share_id.clone(), worker_id, self.nr_workers.clone());
        worker.run(sock, self.clone());
        self.workers
            .lock()
            .await
            .insert(worker_id, Arc::downgrade(&worker));
        Ok(())
    }

    async fn cleanup_workers(&self) {
        self.workers.lock().await.retain(|_, w| w.strong_count() > 0);
    }
}

pub struct ShareUpstream {
    share: Arc<TcpShare>,
}

#[async_trait]
impl Upstream for ShareUpstream {
    async fn get_socket(&self, _peer: SocketAddr) -> ZrpResult<TcpStream> {
        Ok(TcpStream::connect(self.share.local_addr).await?)
    }
}

pub struct ShareDownstream {
    share: Arc<TcpShare>,
}

#[async_trait]
impl Downstream for ShareDownstream {
    async fn get_socket(&self) -> ZrpResult<(TcpStream, SocketAddr)> {
        let sock = self.share.queue.wait().await?;
        self.share.chk_need_workers();
        let peer = sock
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        Ok((sock, peer))
    }

    async fn try_stop(&self) {
        self.share.queue.close();
    }
}
