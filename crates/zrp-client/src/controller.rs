//! The client's single control connection to the server: sends
//! `client_hello`, announces every configured TCP share, and keeps the
//! connection alive with idle pings.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, trace, warn};
use uuid::Uuid;
use zrp_core::{codec, Deadline, Message, MsgKind, PipeExecutor, TcpShareAnnounce, PROTOCOL_VERSION};

use crate::config::ClientConfig;
use crate::share::TcpShare;

pub struct Controller {
    pub client_uuid: String,
    server_addr: SocketAddr,
    cfg: ClientConfig,
    shares: Mutex<HashMap<String, Weak<TcpShare>>>,
    ping_deadline: Deadline,
    stopping: AtomicBool,
    pipe_exec: PipeExecutor,
}

impl Controller {
    pub fn new(server_addr: SocketAddr, cfg: ClientConfig) -> Arc<Self> {
        let client_uuid = Uuid::new_v4().to_string();
        info!(client_uuid = %client_uuid, "client uuid");
        let pipe_exec = PipeExecutor::from_forwarder_threads(cfg.forwarder_threads);
        Arc::new(Self {
            client_uuid,
            server_addr,
            cfg,
            shares: Mutex::new(HashMap::new()),
            ping_deadline: Deadline::new(),
            stopping: AtomicBool::new(false),
            pipe_exec,
        })
    }

    /// Build a [`TcpShare`] for every configured share, returning the
    /// `client_hello` announcements to send once connected.
    pub async fn init(self: &Arc<Self>) -> Vec<TcpShareAnnounce> {
        let mut announces = Vec::new();
        for (id, share_cfg) in self.cfg.tcp_shares.clone() {
            let local_addr: SocketAddr = match format!(
                "{}:{}",
                share_cfg.local_host, share_cfg.local_port
            )
            .parse()
            {
                Ok(a) => a,
                Err(e) => {
                    warn!(share = %id, error = %e, "bad local address for tcp share, skipping");
                    continue;
                }
            };

            let share = TcpShare::new(
                Arc::downgrade(self),
                id.clone(),
                local_addr,
                share_cfg.remote_port,
                self.server_addr,
                self.cfg.worker_count_low,
                self.cfg.worker_count_more,
                self.pipe_exec.clone(),
            );
            share.run();
            self.shares.lock().await.insert(id.clone(), Arc::downgrade(&share));
            info!(share = %id, "added tcp share");
            announces.push(TcpShareAnnounce {
                id,
                port: share_cfg.remote_port,
            });
        }
        announces
    }

    pub async fn try_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.ping_deadline.disable();
        let shares = self.shares.lock().await;
        for s in shares.values() {
            if let Some(s) = s.upgrade() {
                s.try_stop().await;
            }
        }
    }

    fn handle_error(&self) {
        if !self.stopping.load(Ordering::SeqCst) {
            warn!(client_uuid = %self.client_uuid, "controller connection failed, stopping client");
        }
    }

    /// Connect, exchange hellos, prime every share's initial worker pool,
    /// then loop receiving pongs until the connection drops.
    pub async fn run(self: &Arc<Self>, announces: Vec<TcpShareAnnounce>) -> zrp_core::Result<()> {
        let mut sock = TcpStream::connect(self.server_addr).await?;

        let hello = Message::ClientHello {
            version: PROTOCOL_VERSION,
            client_uuid: self.client_uuid.clone(),
            tcp_shares: announces,
        };
        codec::send_message(&mut sock, &hello).await?;

        let server_hello = codec::read_expect(&mut sock, &[MsgKind::ServerHello]).await?;
        if let Message::ServerHello { version, welcome } = server_hello {
            info!(server_version = version, %welcome, "connected to server");
        }

        for (_, share) in self.shares.lock().await.iter() {
            if let Some(share) = share.upgrade() {
                share.add_workers(self.cfg.worker_count_initial).await;
            }
        }

        let this = self.clone();
        let (read_half, write_half) = sock.into_split();
        let write_half = Arc::new(Mutex::new(write_half));
        let ping_handle = tokio::spawn({
            let this = this.clone();
            let write_half = write_half.clone();
            async move { this.ping_actor(write_half).await }
        });

        let result = self.recv_loop(read_half).await;
        self.try_stop().await;
        ping_handle.abort();
        result
    }

    async fn recv_loop(&self, mut read_half: tokio::net::tcp::OwnedReadHalf) -> zrp_core::Result<()> {
        loop {
            self.ping_deadline.arm(Duration::from_secs(20));
            let msg = codec::read_expect(&mut read_half, &[MsgKind::Pong]).await;
            match msg {
                Ok(Message::Pong {}) => {
                    trace!(client_uuid = %self.client_uuid, "recv a pong");
                }
                Ok(_) => unreachable!("read_expect filtered to pong"),
                Err(e) => {
                    self.handle_error();
                    return Err(e);
                }
            }
        }
    }

    async fn ping_actor(&self, write_half: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>) {
        loop {
            self.ping_deadline.wait_expired().await;
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            self.ping_deadline.disable();
            let mut w = write_half.lock().await;
            if codec::send_message(&mut *w, &Message::Ping {}).await.is_err() {
                return;
            }
            drop(w);
            trace!(client_uuid = %self.client_uuid, "sent a ping");
        }
    }
}
