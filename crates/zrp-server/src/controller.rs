//! The server-side counterpart of a client's control connection: sends
//! `server_hello` first, then answers idle pings with pongs until the client
//! disconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use zrp_core::{codec, Deadline, Message, MsgKind, Result as ZrpResult, PROTOCOL_VERSION};

use crate::server::Server;
use crate::share::TcpShare;

pub struct ControllerSocket {
    pub client_uuid: String,
    welcome: String,
    sharing_host: String,
    server: Weak<Server>,
    shares: std::sync::Mutex<HashMap<String, Weak<TcpShare>>>,
    deadline: Deadline,
    stopping: AtomicBool,
    send_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl ControllerSocket {
    pub fn new(
        client_uuid: String,
        welcome: String,
        sharing_host: String,
        server: Weak<Server>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_uuid,
            welcome,
            sharing_host,
            server,
            shares: std::sync::Mutex::new(HashMap::new()),
            deadline: Deadline::new(),
            stopping: AtomicBool::new(false),
            send_tx: std::sync::Mutex::new(None),
        })
    }

    pub async fn try_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.deadline.disable();
        if let Some(tx) = self.send_tx.lock().expect("mutex poisoned").take() {
            drop(tx);
        }
        let shares: Vec<_> = self
            .shares
            .lock()
            .expect("mutex poisoned")
            .values()
            .cloned()
            .collect();
        for s in shares {
            if let Some(s) = s.upgrade() {
                s.try_stop().await;
            }
        }
    }

    /// Bind and start a tcp share announced in this client's `client_hello`.
    /// Fails with `DuplicateTcpShare` if the id is already bound server-wide.
    pub async fn add_tcp_share(self: &Arc<Self>, share_id: String, port: u16) -> ZrpResult<()> {
        let server = self
            .server
            .upgrade()
            .ok_or_else(|| zrp_core::Error::Other("server shutting down".into()))?;

        let share = TcpShare::new(
            Arc::downgrade(self),
            share_id.clone(),
            self.sharing_host.clone(),
            port,
            server.pipe_exec.clone(),
        );
        server.register_tcp_share(share_id.clone(), Arc::downgrade(&share))?;
        share.run().await?;
        self.shares
            .lock()
            .expect("mutex poisoned")
            .insert(share_id, Arc::downgrade(&share));
        Ok(())
    }

    /// Drive the connection: `server_hello` first, then alternate pinging
    /// for liveness and answering client pings, until the socket errs out.
    pub async fn run(self: &Arc<Self>, sock: TcpStream) {
        let (read_half, write_half) = sock.into_split();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        *self.send_tx.lock().expect("mutex poisoned") = Some(send_tx.clone());

        let hello = Message::ServerHello {
            version: PROTOCOL_VERSION,
            welcome: self.welcome.clone(),
        };
        if send_tx.send(hello).is_err() {
            return;
        }

        let send_handle = tokio::spawn(send_msgs(write_half, send_rx));

        let this = self.clone();
        tokio::spawn(async move { this.ddl_actor().await });

        let result = self.recv_loop(read_half, &send_tx).await;
        if let Err(e) = result {
            if !self.stopping.load(Ordering::SeqCst) {
                warn!(client_uuid = %self.client_uuid, error = %e, "controller connection failed");
            }
        }
        self.try_stop().await;
        drop(send_tx);
        let _ = send_handle.await;
    }

    async fn recv_loop(
        &self,
        mut read_half: OwnedReadHalf,
        send_tx: &mpsc::UnboundedSender<Message>,
    ) -> ZrpResult<()> {
        loop {
            self.deadline.arm(Duration::from_secs(60));
            let msg = codec::read_expect(&mut read_half, &[MsgKind::Ping]).await?;
            match msg {
                Message::Ping {} => {
                    trace!(client_uuid = %self.client_uuid, "recv a ping");
                    if send_tx.send(Message::Pong {}).is_err() {
                        return Ok(());
                    }
                }
                _ => unreachable!("read_expect filtered to ping"),
            }
        }
    }

    async fn ddl_actor(self: Arc<Self>) {
        self.deadline.wait_expired().await;
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        warn!(client_uuid = %self.client_uuid, "controller idle timeout, stopping client");
        self.try_stop().await;
    }
}

async fn send_msgs(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if codec::send_message(&mut write_half, &msg).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn sends_server_hello_first_then_answers_pings() {
        let (server_sock, mut remote) = tcp_pair().await;
        let ctrl = ControllerSocket::new(
            "client-1".into(),
            "welcome to the test".into(),
            "0.0.0.0".into(),
            Weak::new(),
        );
        let run_ctrl = ctrl.clone();
        let run_handle = tokio::spawn(async move { run_ctrl.run(server_sock).await });

        let hello = codec::read_expect(&mut remote, &[MsgKind::ServerHello])
            .await
            .unwrap();
        match hello {
            Message::ServerHello { welcome, .. } => assert_eq!(welcome, "welcome to the test"),
            _ => panic!("expected server_hello"),
        }

        codec::send_message(&mut remote, &Message::Ping {}).await.unwrap();
        let reply = codec::read_expect(&mut remote, &[MsgKind::Pong]).await.unwrap();
        assert_eq!(reply, Message::Pong {});

        ctrl.try_stop().await;
        drop(remote);
        let _ = run_handle.await;
    }

    #[tokio::test]
    async fn add_tcp_share_fails_without_a_live_server() {
        let ctrl = ControllerSocket::new(
            "client-2".into(),
            "welcome".into(),
            "127.0.0.1".into(),
            Weak::new(),
        );
        let err = ctrl.add_tcp_share("share-x".into(), 0).await.unwrap_err();
        assert!(matches!(err, zrp_core::Error::Other(_)));
    }
}
