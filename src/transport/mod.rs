//! Framed request/response and event-broadcast transport between a master
//! process and its workers.
//!
//! Two message patterns ride on the same wire format:
//!
//! - **Command**: the initiator opens a connection, sends one framed
//!   [`Envelope`], blocks for exactly one framed reply, then closes. See
//!   [`send_command`](command::send_command) and
//!   [`CommandServer`](command::CommandServer).
//! - **Event**: a long-lived [`EventDispatcher`](event::EventDispatcher)
//!   accepts persistent connections and pushes events to all of them,
//!   collecting one reply per recipient; workers run a reconnecting
//!   [`EventListener`](event::EventListener).
//!
//! Frames are a 4-byte big-endian length prefix followed by exactly that
//! many payload bytes. A short read before the full length arrives is a
//! protocol error, never a silent truncation. Payload serialization is the
//! caller's business; the transport moves opaque bytes.

pub mod command;
pub mod event;

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use command::{CommandHandler, CommandServer, send_command};
pub use event::{EventDispatcher, EventDispatcherConfig, EventHandler, EventListener,
    EventListenerConfig, PeerId};

/// Upper bound on a single frame; anything larger is a protocol error.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("malformed envelope")]
    MalformedEnvelope,
    #[error("correlation id mismatch: sent {sent}, received {received}")]
    CorrelationMismatch { sent: u64, received: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Kind tag carried by every [`Envelope`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvelopeKind {
    Command,
    CommandReply,
    Event,
    EventReply,
}

impl EnvelopeKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Command),
            1 => Some(Self::CommandReply),
            2 => Some(Self::Event),
            3 => Some(Self::EventReply),
            _ => None,
        }
    }
}

/// One transport message: a kind tag, the initiator-generated correlation
/// id (echoed back unchanged in replies), and an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub correlation_id: u64,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, correlation_id: u64, payload: Bytes) -> Self {
        Self {
            kind,
            correlation_id,
            payload,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9 + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.correlation_id);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, TransportError> {
        if frame.len() < 9 {
            return Err(TransportError::MalformedEnvelope);
        }
        let kind =
            EnvelopeKind::from_u8(frame.get_u8()).ok_or(TransportError::MalformedEnvelope)?;
        let correlation_id = frame.get_u64();
        Ok(Self {
            kind,
            correlation_id,
            payload: frame,
        })
    }
}

pub(crate) fn next_correlation_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Bytes, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(reset_on_eof)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(reset_on_eof)?;
    Ok(Bytes::from(payload))
}

fn reset_on_eof(error: std::io::Error) -> TransportError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionReset
    } else {
        TransportError::Io(error)
    }
}
