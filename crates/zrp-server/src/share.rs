//! A public port exposing one tunnel: visitors connecting to the port are
//! paired with a worker parked by the owning client. Workers arrive via
//! [`TcpShare::got_worker`] (called once a worker's hello has been read) and
//! wait in a rendezvous queue until a visitor needs one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use zrp_core::{Downstream, Forwarder, PipeExecutor, Rendezvous, Result as ZrpResult, Upstream};

use crate::controller::ControllerSocket;
use crate::worker::Worker;

pub struct TcpShare {
    pub share_id: String,
    pub listen_port: u16,
    listen_host: String,
    ctrl: Weak<ControllerSocket>,
    queue: Rendezvous<Weak<Worker>>,
    workers: Mutex<HashMap<i64, Weak<Worker>>>,
    nr_workers: Arc<AtomicI64>,
    closing: AtomicBool,
    listen_token: CancellationToken,
    fwd: Mutex<Option<Weak<Forwarder<ShareUpstream, ShareDownstream>>>>,
    pipe_exec: PipeExecutor,
}

impl TcpShare {
    pub fn new(
        ctrl: Weak<ControllerSocket>,
        share_id: String,
        listen_host: String,
        listen_port: u16,
        pipe_exec: PipeExecutor,
    ) -> Arc<Self> {
        Arc::new(Self {
            share_id,
            listen_port,
            listen_host,
            ctrl,
            queue: Rendezvous::new(),
            workers: Mutex::new(HashMap::new()),
            nr_workers: Arc::new(AtomicI64::new(0)),
            closing: AtomicBool::new(false),
            listen_token: CancellationToken::new(),
            fwd: Mutex::new(None),
            pipe_exec,
        })
    }

    pub async fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind((self.listen_host.as_str(), self.listen_port)).await?;
        let this = self.clone();
        tokio::spawn(async move {
            this.run_forwarder(listener).await;
        });
        Ok(())
    }

    async fn run_forwarder(self: Arc<Self>, listener: TcpListener) {
        let fwd = Forwarder::new_with_executor(
            self.share_id.clone(),
            ShareUpstream {
                share: self.clone(),
            },
            ShareDownstream {
                share: self.clone(),
                listener,
                token: self.listen_token.clone(),
            },
            self.pipe_exec.clone(),
        );
        *self.fwd.lock().await = Some(Arc::downgrade(&fwd));
        fwd.run();
    }

    pub async fn try_stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.listen_token.cancel();
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
            warn!(share = %self.share_id, "tcp share failed, stopping its controller");
            if let Some(ctrl) = self.ctrl.upgrade() {
                ctrl.try_stop().await;
            }
        }
    }

    /// Register a freshly hello'd worker connection and offer it to the
    /// rendezvous queue. Blocks (in its own task) until a visitor claims it
    /// or the share closes.
    pub async fn got_worker(self: &Arc<Self>, worker_id: i64, sock: TcpStream) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        self.cleanup_workers().await;
        let worker = Worker::new(self.share_id.clone(), worker_id, self.nr_workers.clone(), sock);
        self.workers
            .lock()
            .await
            .insert(worker_id, Arc::downgrade(&worker));

        let this = self.clone();
        tokio::spawn(async move {
            if this.queue.provide(Arc::downgrade(&worker)).await.is_err() {
                trace!(share = %this.share_id, worker_id, "queue closed before worker was claimed");
            }
        });
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
    /// Pop the next live worker off the queue and hand it the visitor's
    /// address, skipping any worker whose weak handle has already expired.
    async fn get_socket(&self, peer: SocketAddr) -> ZrpResult<TcpStream> {
        loop {
            let weak = self.share.queue.wait().await?;
            if let Some(worker) = weak.upgrade() {
                return worker.visit(peer).await;
            }
        }
    }

    async fn try_stop(&self) {
        self.share.handle_error().await;
    }
}

pub struct ShareDownstream {
    share: Arc<TcpShare>,
    listener: TcpListener,
    token: CancellationToken,
}

#[async_trait]
impl Downstream for ShareDownstream {
    async fn get_socket(&self) -> ZrpResult<(TcpStream, SocketAddr)> {
        tokio::select! {
            _ = self.token.cancelled() => Err(zrp_core::Error::Cancelled),
            res = self.listener.accept() => Ok(res?),
        }
    }

    async fn try_stop(&self) {
        self.token.cancel();
    }
}
