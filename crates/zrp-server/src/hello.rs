//! Promotes a freshly accepted control-port socket: the first message must
//! arrive within 30s and decides whether the connection becomes a client
//! controller or a parked tcp-share worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zrp_core::{codec, with_timeout, Message, MsgKind, Result as ZrpResult};

use crate::controller::ControllerSocket;
use crate::server::Server;

const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn promote(server: Arc<Server>, mut sock: TcpStream) -> ZrpResult<()> {
    let token = CancellationToken::new();
    let msg = with_timeout(
        codec::read_expect(&mut sock, &[MsgKind::ClientHello, MsgKind::TcpShareWorkerHello]),
        &token,
        HELLO_TIMEOUT,
    )
    .await?;

    match msg {
        Message::ClientHello {
            client_uuid,
            tcp_shares,
            ..
        } => handle_client_hello(server, sock, client_uuid, tcp_shares).await,
        Message::TcpShareWorkerHello {
            tcp_share_id,
            worker_id,
        } => handle_worker_hello(&server, sock, tcp_share_id, worker_id).await,
        _ => unreachable!("read_expect filtered to client_hello/tcp_share_worker_hello"),
    }
}

async fn handle_client_hello(
    server: Arc<Server>,
    sock: TcpStream,
    client_uuid: String,
    tcp_shares: Vec<zrp_core::TcpShareAnnounce>,
) -> ZrpResult<()> {
    let ctrl = ControllerSocket::new(
        client_uuid.clone(),
        server.cfg.welcome.clone(),
        server.cfg.sharing_host.clone(),
        Arc::downgrade(&server),
    );
    server.claim_client(&client_uuid, Arc::downgrade(&ctrl))?;

    for announce in tcp_shares {
        if let Err(e) = ctrl.add_tcp_share(announce.id.clone(), announce.port).await {
            warn!(client_uuid = %client_uuid, share = %announce.id, error = %e, "failed to add tcp share");
            return Err(e);
        }
    }

    info!(client_uuid = %client_uuid, "client connected");
    ctrl.run(sock).await;
    Ok(())
}

async fn handle_worker_hello(
    server: &Arc<Server>,
    sock: TcpStream,
    tcp_share_id: String,
    worker_id: i64,
) -> ZrpResult<()> {
    let share = server
        .find_tcp_share(&tcp_share_id)
        .ok_or_else(|| zrp_core::Error::TcpShareClosed(tcp_share_id.clone()))?;
    share.got_worker(worker_id, sock).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use tokio::net::TcpListener;

    fn cfg() -> ServerConfig {
        ServerConfig {
            server_host: "127.0.0.1".into(),
            server_port: 0,
            sharing_host: "127.0.0.1".into(),
            welcome: "hi there".into(),
            forwarder_threads: -1,
            access_log: true,
            rlimit_nofile: 1024,
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        (accepted.unwrap().0, connected.unwrap())
    }

    #[tokio::test]
    async fn client_hello_promotes_to_a_registered_controller() {
        let server = Server::new(cfg());
        let (control_sock, mut remote) = tcp_pair().await;

        codec::send_message(
            &mut remote,
            &Message::ClientHello {
                version: zrp_core::PROTOCOL_VERSION,
                client_uuid: "client-x".into(),
                tcp_shares: vec![],
            },
        )
        .await
        .unwrap();

        let server_for_promote = server.clone();
        let promote_handle = tokio::spawn(async move { promote(server_for_promote, control_sock).await });

        let hello = codec::read_expect(&mut remote, &[MsgKind::ServerHello])
            .await
            .unwrap();
        assert!(matches!(hello, Message::ServerHello { .. }));

        // the controller is now registered server-wide
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let err = server.claim_client("client-x", std::sync::Weak::new());
        assert!(matches!(err, Err(zrp_core::Error::DuplicateClient)));

        drop(remote);
        let _ = promote_handle.await;
    }

    /// Two real controller connections announcing the same client uuid
    /// sequentially: the second's hello handshake is rejected while the
    /// first keeps answering pings.
    #[tokio::test]
    async fn duplicate_client_uuid_rejects_the_second_connection() {
        let server = Server::new(cfg());

        let (first_sock, mut first_remote) = tcp_pair().await;
        codec::send_message(
            &mut first_remote,
            &Message::ClientHello {
                version: zrp_core::PROTOCOL_VERSION,
                client_uuid: "dup-client".into(),
                tcp_shares: vec![],
            },
        )
        .await
        .unwrap();
        let server_for_first = server.clone();
        let first_handle = tokio::spawn(async move { promote(server_for_first, first_sock).await });
        let hello = codec::read_expect(&mut first_remote, &[MsgKind::ServerHello])
            .await
            .unwrap();
        assert!(matches!(hello, Message::ServerHello { .. }));

        let (second_sock, mut second_remote) = tcp_pair().await;
        codec::send_message(
            &mut second_remote,
            &Message::ClientHello {
                version: zrp_core::PROTOCOL_VERSION,
                client_uuid: "dup-client".into(),
                tcp_shares: vec![],
            },
        )
        .await
        .unwrap();
        let err = promote(server.clone(), second_sock).await.unwrap_err();
        assert!(matches!(err, zrp_core::Error::DuplicateClient));

        // the first connection is unaffected by the rejected duplicate
        codec::send_message(&mut first_remote, &Message::Ping {}).await.unwrap();
        let pong = codec::read_expect(&mut first_remote, &[MsgKind::Pong]).await.unwrap();
        assert_eq!(pong, Message::Pong {});

        drop(first_remote);
        let _ = first_handle.await;
    }

    #[tokio::test]
    async fn worker_hello_for_unknown_share_fails() {
        let server = Server::new(cfg());
        let (control_sock, mut remote) = tcp_pair().await;

        codec::send_message(
            &mut remote,
            &Message::TcpShareWorkerHello {
                tcp_share_id: "no-such-share".into(),
                worker_id: 0,
            },
        )
        .await
        .unwrap();

        let err = promote(server, control_sock).await.unwrap_err();
        assert!(matches!(err, zrp_core::Error::TcpShareClosed(ref id) if id == "no-such-share"));
    }
}
