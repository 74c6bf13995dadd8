use thiserror::Error;

/// Errors produced by the zrp protocol and connection-brokering layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("message exceeds max frame size ({len} > {max})")]
    MsgTooBig { len: u64, max: u64 },

    #[error("unexpected msg_type: {0}")]
    UnexpectedMsgType(String),

    #[error("same client already connected")]
    DuplicateClient,

    #[error("tcp share id is taken: {0}")]
    DuplicateTcpShare(String),

    #[error("tcp share already closed: {0}")]
    TcpShareClosed(String),

    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
