//! Length-framed JSON control-plane codec.
//!
//! Wire format: `[8-byte big-endian length][JSON payload]`. Body length must
//! be `<= MAX_FRAME_BODY` or the frame is rejected with `msg_too_big` before
//! its body is read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::{Message, MsgKind};

pub const MAX_FRAME_BODY: u64 = 8192;
const READ_CHUNK: usize = 4096;

/// Read one length-prefixed frame body (undecoded JSON bytes).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 8];
    r.read_exact(&mut len_buf).await?;
    let len = u64::from_be_bytes(len_buf);
    debug!(len, "read frame length");

    if len > MAX_FRAME_BODY {
        return Err(Error::MsgTooBig {
            len,
            max: MAX_FRAME_BODY,
        });
    }

    let mut body = Vec::with_capacity(len as usize);
    let mut remaining = len as usize;
    while remaining > 0 {
        let chunk = remaining.min(READ_CHUNK);
        let start = body.len();
        body.resize(start + chunk, 0);
        r.read_exact(&mut body[start..start + chunk]).await?;
        remaining -= chunk;
    }
    Ok(body)
}

/// Write one length-prefixed frame body.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<()> {
    let len = body.len() as u64;
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    w.write_all(&frame).await?;
    Ok(())
}

/// Read one frame and decode it as a [`Message`].
pub async fn recv_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message> {
    let body = read_frame(r).await?;
    let msg: Message = serde_json::from_slice(&body)?;
    Ok(msg)
}

/// Encode a [`Message`] and write it as one frame.
pub async fn send_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    write_frame(w, &body).await
}

/// Read one frame and check its `msg_type` against an ordered set of
/// expected kinds, failing with `unexpected_msg_type` otherwise.
pub async fn read_expect<R: AsyncRead + Unpin>(
    r: &mut R,
    expected: &[MsgKind],
) -> Result<Message> {
    let msg = recv_message(r).await?;
    if expected.contains(&msg.kind()) {
        Ok(msg)
    } else {
        Err(Error::UnexpectedMsgType(msg.type_str().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_single_message() {
        let msg = Message::Ping {};
        let mut buf = Vec::new();
        send_message(&mut buf, &msg).await.unwrap();

        let mut cur = Cursor::new(buf);
        let decoded = recv_message(&mut cur).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn header_is_big_endian_length_of_body() {
        let msg = Message::Pong {};
        let mut buf = Vec::new();
        send_message(&mut buf, &msg).await.unwrap();

        let body_len = serde_json::to_vec(&msg).unwrap().len() as u64;
        assert_eq!(u64::from_be_bytes(buf[0..8].try_into().unwrap()), body_len);
        assert_eq!(buf.len() as u64, 8 + body_len);
    }

    #[tokio::test]
    async fn oversize_frame_fails_before_reading_body() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&9000u64.to_be_bytes());
        // deliberately no body bytes: if read_frame tried to read the body
        // it would block/err on EOF instead of failing fast on the length.
        let mut cur = Cursor::new(buf);
        let err = read_frame(&mut cur).await.unwrap_err();
        assert!(matches!(err, Error::MsgTooBig { len: 9000, .. }));
    }

    #[tokio::test]
    async fn read_expect_rejects_unlisted_kind() {
        let mut buf = Vec::new();
        send_message(&mut buf, &Message::Ping {}).await.unwrap();
        let mut cur = Cursor::new(buf);
        let err = read_expect(&mut cur, &[MsgKind::Pong]).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedMsgType(ref s) if s == "ping"));
    }

    #[tokio::test]
    async fn read_expect_accepts_listed_kind() {
        let mut buf = Vec::new();
        send_message(&mut buf, &Message::Pong {}).await.unwrap();
        let mut cur = Cursor::new(buf);
        let msg = read_expect(&mut cur, &[MsgKind::Ping, MsgKind::Pong])
            .await
            .unwrap();
        assert_eq!(msg, Message::Pong {});
    }
}
