use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;

use super::{
    Envelope, EnvelopeKind, TransportError, next_correlation_id, read_frame, write_frame,
};

/// Server-side command processing: one call per received command payload,
/// producing the single reply payload.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: Bytes) -> Bytes;
}

/// Send one command and block for its reply.
///
/// Opens a fresh connection, writes one framed envelope, reads exactly one
/// framed reply (which must echo the correlation id), and closes. A
/// connection lost mid-exchange surfaces as an error; the command is never
/// retried here, that decision belongs to the caller.
pub async fn send_command(
    addr: impl ToSocketAddrs,
    payload: Bytes,
) -> Result<Bytes, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    let correlation_id = next_correlation_id();
    let envelope = Envelope::new(EnvelopeKind::Command, correlation_id, payload);
    write_frame(&mut stream, &envelope.encode()).await?;
    let reply = Envelope::decode(read_frame(&mut stream).await?)?;
    if reply.kind != EnvelopeKind::CommandReply {
        return Err(TransportError::MalformedEnvelope);
    }
    if reply.correlation_id != correlation_id {
        return Err(TransportError::CorrelationMismatch {
            sent: correlation_id,
            received: reply.correlation_id,
        });
    }
    Ok(reply.payload)
}

/// Accepts command connections and answers each with the handler's reply.
///
/// Every connection carries exactly one exchange: read one framed command,
/// invoke the handler, write one framed reply, close. Malformed traffic
/// closes that connection only.
pub struct CommandServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl CommandServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        tracing::info!(%local_addr, "command server listening");
        tokio::spawn(accept_loop(listener, handler, shutdown_rx));
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn CommandHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(error) = serve_one(stream, handler).await {
                            tracing::debug!(%peer, %error, "command connection closed");
                        }
                    });
                }
                Err(error) => tracing::warn!(%error, "failed to accept command connection"),
            },
        }
    }
}

async fn serve_one(
    mut stream: TcpStream,
    handler: Arc<dyn CommandHandler>,
) -> Result<(), TransportError> {
    let envelope = Envelope::decode(read_frame(&mut stream).await?)?;
    if envelope.kind != EnvelopeKind::Command {
        return Err(TransportError::MalformedEnvelope);
    }
    let response = handler.handle(envelope.payload).await;
    let reply = Envelope::new(EnvelopeKind::CommandReply, envelope.correlation_id, response);
    write_frame(&mut stream, &reply.encode()).await
}
