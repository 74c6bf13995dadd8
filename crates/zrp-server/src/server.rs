//! Top-level server: accepts control-port connections, promotes each one to
//! either a client controller or a worker hello, and keeps the registries
//! (`ctrls` by client uuid, `tcp_shares` by share id) that let a freshly
//! arrived worker be routed to the share it belongs to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zrp_core::{PipeExecutor, Result as ZrpResult};

use crate::config::ServerConfig;
use crate::controller::ControllerSocket;
use crate::hello;
use crate::share::TcpShare;

pub struct Server {
    pub cfg: ServerConfig,
    ctrls: std::sync::Mutex<HashMap<String, Weak<ControllerSocket>>>,
    tcp_shares: std::sync::Mutex<HashMap<String, Weak<TcpShare>>>,
    token: CancellationToken,
    stopping: AtomicBool,
    pub pipe_exec: PipeExecutor,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        let pipe_exec = PipeExecutor::from_forwarder_threads(cfg.forwarder_threads);
        Arc::new(Self {
            cfg,
            ctrls: std::sync::Mutex::new(HashMap::new()),
            tcp_shares: std::sync::Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            pipe_exec,
        })
    }

    pub async fn try_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.token.cancel();
        let ctrls: Vec<_> = self
            .ctrls
            .lock()
            .expect("mutex poisoned")
            .values()
            .cloned()
            .collect();
        for c in ctrls {
            if let Some(c) = c.upgrade() {
                c.try_stop().await;
            }
        }
    }

    /// Claim a client uuid, replacing any prior registration whose
    /// controller has already gone away. Fails with `DuplicateClient` if a
    /// live controller still holds the uuid.
    pub fn claim_client(&self, client_uuid: &str, ctrl: Weak<ControllerSocket>) -> ZrpResult<()> {
        let mut ctrls = self.ctrls.lock().expect("mutex poisoned");
        if let Some(existing) = ctrls.get(client_uuid) {
            if existing.strong_count() > 0 {
                return Err(zrp_core::Error::DuplicateClient);
            }
        }
        ctrls.insert(client_uuid.to_string(), ctrl);
        Ok(())
    }

    /// Claim a tcp share id server-wide, replacing any prior registration
    /// whose share has already gone away.
    pub fn register_tcp_share(&self, share_id: String, share: Weak<TcpShare>) -> ZrpResult<()> {
        let mut shares = self.tcp_shares.lock().expect("mutex poisoned");
        if let Some(existing) = shares.get(&share_id) {
            if existing.strong_count() > 0 {
                return Err(zrp_core::Error::DuplicateTcpShare(share_id));
            }
        }
        shares.insert(share_id, share);
        Ok(())
    }

    pub fn find_tcp_share(&self, share_id: &str) -> Option<Arc<TcpShare>> {
        self.tcp_shares
            .lock()
            .expect("mutex poisoned")
            .get(share_id)
            .and_then(Weak::upgrade)
    }

    /// Bind the control port and accept connections until stopped.
    pub async fn run(self: &Arc<Self>) -> std::io::Result<()> {
        let addr = (self.cfg.server_host.as_str(), self.cfg.server_port);
        let listener = TcpListener::bind(addr).await?;
        info!(host = %self.cfg.server_host, port = self.cfg.server_port, "listening for control connections");

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((sock, peer)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.handle_socket(sock, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, sock: TcpStream, peer: std::net::SocketAddr) {
        if let Err(e) = hello::promote(self, sock).await {
            warn!(%peer, error = %e, "hello handshake failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ServerConfig {
        ServerConfig {
            server_host: "127.0.0.1".into(),
            server_port: 0,
            sharing_host: "127.0.0.1".into(),
            welcome: "welcome".into(),
            forwarder_threads: -1,
            access_log: true,
            rlimit_nofile: 1024,
        }
    }

    #[test]
    fn claim_client_rejects_a_live_duplicate() {
        let server = Server::new(cfg());
        let ctrl = ControllerSocket::new("u1".into(), "w".into(), "h".into(), Arc::downgrade(&server));
        server.claim_client("u1", Arc::downgrade(&ctrl)).unwrap();

        let err = server
            .claim_client("u1", Arc::downgrade(&ctrl))
            .unwrap_err();
        assert!(matches!(err, zrp_core::Error::DuplicateClient));
    }

    #[test]
    fn claim_client_replaces_an_expired_registration() {
        let server = Server::new(cfg());
        {
            let ctrl = ControllerSocket::new("u1".into(), "w".into(), "h".into(), Arc::downgrade(&server));
            server.claim_client("u1", Arc::downgrade(&ctrl)).unwrap();
        } // ctrl dropped, weak now expired

        let ctrl2 = ControllerSocket::new("u1".into(), "w".into(), "h".into(), Arc::downgrade(&server));
        assert!(server.claim_client("u1", Arc::downgrade(&ctrl2)).is_ok());
    }

    #[test]
    fn register_tcp_share_rejects_a_live_duplicate() {
        let server = Server::new(cfg());
        let ctrl = ControllerSocket::new("u1".into(), "w".into(), "h".into(), Arc::downgrade(&server));
        let share = TcpShare::new(Arc::downgrade(&ctrl), "s1".into(), "127.0.0.1".into(), 9000, zrp_core::PipeExecutor::Inline);
        server
            .register_tcp_share("s1".into(), Arc::downgrade(&share))
            .unwrap();

        let err = server
            .register_tcp_share("s1".into(), Arc::downgrade(&share))
            .unwrap_err();
        assert!(matches!(err, zrp_core::Error::DuplicateTcpShare(ref id) if id == "s1"));
    }

    #[test]
    fn find_tcp_share_returns_none_for_unknown_id() {
        let server = Server::new(cfg());
        assert!(server.find_tcp_share("nope").is_none());
    }
}
