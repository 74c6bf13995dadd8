//! Control-plane wire messages.
//!
//! Every message is a JSON object carrying a `msg_type` string discriminant
//! (see [`crate::codec`] for the length-prefixed framing around it).

use serde::{Deserialize, Serialize};

/// A TCP share announced in a `client_hello`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpShareAnnounce {
    pub id: String,
    pub port: u16,
}

/// The peer endpoint reported to a worker being activated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpEndpoint {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum Message {
    ClientHello {
        version: i32,
        client_uuid: String,
        tcp_shares: Vec<TcpShareAnnounce>,
    },
    TcpShareWorkerHello {
        tcp_share_id: String,
        worker_id: i64,
    },
    Ping {},
    VisitConfirmed {},
    ServerHello {
        version: i32,
        welcome: String,
    },
    Pong {},
    VisitTcpShare {
        epoch: u64,
        peer: TcpEndpoint,
    },
}

/// Discriminant-only view of [`Message`], used by [`crate::codec::read_expect`]
/// to check an incoming message's type against an expected set without
/// needing to know its payload shape yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    ClientHello,
    TcpShareWorkerHello,
    Ping,
    VisitConfirmed,
    ServerHello,
    Pong,
    VisitTcpShare,
}

impl Message {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::ClientHello { .. } => MsgKind::ClientHello,
            Message::TcpShareWorkerHello { .. } => MsgKind::TcpShareWorkerHello,
            Message::Ping {} => MsgKind::Ping,
            Message::VisitConfirmed {} => MsgKind::VisitConfirmed,
            Message::ServerHello { .. } => MsgKind::ServerHello,
            Message::Pong {} => MsgKind::Pong,
            Message::VisitTcpShare { .. } => MsgKind::VisitTcpShare,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            Message::ClientHello { .. } => "client_hello",
            Message::TcpShareWorkerHello { .. } => "tcp_share_worker_hello",
            Message::Ping {} => "ping",
            Message::VisitConfirmed {} => "visit_confirmed",
            Message::ServerHello { .. } => "server_hello",
            Message::Pong {} => "pong",
            Message::VisitTcpShare { .. } => "visit_tcp_share",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_round_trips_and_tags_msg_type() {
        let m = Message::ClientHello {
            version: 0,
            client_uuid: "abc".into(),
            tcp_shares: vec![TcpShareAnnounce {
                id: "ssh".into(),
                port: 9022,
            }],
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["msg_type"], "client_hello");
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn ping_serializes_to_empty_object_plus_tag() {
        let v = serde_json::to_value(Message::Ping {}).unwrap();
        assert_eq!(v, serde_json::json!({"msg_type": "ping"}));
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Message::Pong {}.kind(), MsgKind::Pong);
        assert_eq!(Message::Pong {}.type_str(), "pong");
    }
}
