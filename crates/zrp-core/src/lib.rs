//! zrp-core: shared protocol library for zrp.
//!
//! Provides the length-framed JSON control messages, the rendezvous queue
//! used to hand worker sockets between tasks, deadline timers for liveness
//! checking, the bidirectional pipe, and the generic forwarder that ties
//! them together.

pub mod codec;
pub mod deadline;
pub mod error;
pub mod exec;
pub mod forwarder;
pub mod message;
pub mod pipe;
pub mod rendezvous;
pub mod rlimit;

pub use codec::{read_expect, read_frame, recv_message, send_message, write_frame, MAX_FRAME_BODY};
pub use deadline::{with_timeout, Deadline};
pub use error::{Error, Result};
pub use exec::PipeExecutor;
pub use forwarder::{Downstream, Forwarder, Upstream};
pub use message::{Message, MsgKind, TcpEndpoint, TcpShareAnnounce};
pub use pipe::{Pipe, PIPE_BUFFER_SIZE};
pub use rendezvous::Rendezvous;
pub use rlimit::try_set_rlimit_nofile;

/// Control-protocol version field. Always 0 and never checked on either
/// side, matching the original's hardcoded `version = 0`.
pub const PROTOCOL_VERSION: i32 = 0;
