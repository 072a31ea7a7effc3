use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use typed_builder::TypedBuilder;

use super::{
    Envelope, EnvelopeKind, TransportError, next_correlation_id, read_frame, write_frame,
};

/// Identity of one event-channel connection, as seen by the dispatcher.
pub type PeerId = SocketAddr;

#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct EventDispatcherConfig {
    /// How long `dispatch` waits for each recipient before yielding a null
    /// result for it. One slow or vanished peer never stalls the others.
    #[builder(default = Duration::from_secs(30))]
    pub recipient_timeout: Duration,
}

impl Default for EventDispatcherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct Delivery {
    envelope: Envelope,
    reply: oneshot::Sender<Option<Bytes>>,
}

/// Master side of the event channel.
///
/// Accepts many concurrent persistent connections; each is represented as
/// an outbound delivery queue. [`dispatch`](Self::dispatch) enqueues an
/// event to every currently-connected queue; each connection's handling
/// loop writes the event on the wire, reads back exactly one reply frame,
/// and resolves that recipient's result.
pub struct EventDispatcher {
    local_addr: SocketAddr,
    connections: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Delivery>>>>,
    recipient_timeout: Duration,
    shutdown: watch::Sender<bool>,
}

impl EventDispatcher {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: EventDispatcherConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let connections = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        tracing::info!(%local_addr, "event dispatcher listening");
        tokio::spawn(accept_loop(listener, Arc::clone(&connections), shutdown_rx));
        Ok(Self {
            local_addr,
            connections,
            recipient_timeout: config.recipient_timeout,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections
            .lock()
            .expect("connection registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Push `event` to every recipient connected right now and collect one
    /// reply per recipient.
    ///
    /// A recipient that fails or does not answer within the configured
    /// timeout yields `None`; results for the others are unaffected.
    pub async fn dispatch(&self, event: Bytes) -> Vec<(PeerId, Option<Bytes>)> {
        let correlation_id = next_correlation_id();
        let targets: Vec<(PeerId, mpsc::UnboundedSender<Delivery>)> = self
            .connections
            .lock()
            .expect("connection registry lock poisoned")
            .iter()
            .map(|(peer, tx)| (*peer, tx.clone()))
            .collect();

        let mut results = Vec::new();
        let mut pending = Vec::new();
        for (peer, tx) in targets {
            let (reply_tx, reply_rx) = oneshot::channel();
            let delivery = Delivery {
                envelope: Envelope::new(EnvelopeKind::Event, correlation_id, event.clone()),
                reply: reply_tx,
            };
            if tx.send(delivery).is_ok() {
                pending.push((peer, reply_rx));
            } else {
                // The connection task is already gone.
                results.push((peer, None));
            }
        }

        let timeout = self.recipient_timeout;
        let collected = join_all(pending.into_iter().map(|(peer, reply_rx)| async move {
            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(response)) => (peer, response),
                Ok(Err(_)) | Err(_) => (peer, None),
            }
        }))
        .await;
        results.extend(collected);
        results
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Delivery>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    connections
                        .lock()
                        .expect("connection registry lock poisoned")
                        .insert(peer, tx);
                    tracing::info!(%peer, "event channel peer connected");
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        rx,
                        Arc::clone(&connections),
                        shutdown.clone(),
                    ));
                }
                Err(error) => tracing::warn!(%error, "failed to accept event connection"),
            },
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: PeerId,
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    connections: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Delivery>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            delivery = deliveries.recv() => {
                let Some(Delivery { envelope, reply }) = delivery else { break };
                match exchange(&mut stream, &envelope).await {
                    Ok(response) => {
                        let _ = reply.send(Some(response));
                    }
                    Err(error) => {
                        // The in-flight event is lost; the caller sees a
                        // null result and the peer must re-register.
                        tracing::info!(%peer, %error, "event channel peer lost");
                        let _ = reply.send(None);
                        break;
                    }
                }
            }
        }
    }
    connections
        .lock()
        .expect("connection registry lock poisoned")
        .remove(&peer);
}

async fn exchange(stream: &mut TcpStream, envelope: &Envelope) -> Result<Bytes, TransportError> {
    write_frame(stream, &envelope.encode()).await?;
    let reply = Envelope::decode(read_frame(stream).await?)?;
    if reply.kind != EnvelopeKind::EventReply {
        return Err(TransportError::MalformedEnvelope);
    }
    if reply.correlation_id != envelope.correlation_id {
        return Err(TransportError::CorrelationMismatch {
            sent: envelope.correlation_id,
            received: reply.correlation_id,
        });
    }
    Ok(reply.payload)
}

/// Worker-side event processing: called once per received event, producing
/// the reply payload (typically a serialized stats snapshot).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: Bytes) -> Bytes;
}

#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct EventListenerConfig {
    /// Fixed delay between reconnection attempts after a connect failure or
    /// a lost connection.
    #[builder(default = Duration::from_secs(1))]
    pub retry_delay: Duration,
}

impl Default for EventListenerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Worker side of the event channel: a persistent connection to the
/// dispatcher, answering every event with the handler's reply.
///
/// On connection loss the listener reconnects after the configured retry
/// delay, producing a fresh registration on the dispatcher. Exchanges that
/// were in flight at the moment of disconnect are lost, not retried.
pub struct EventListener {
    shutdown: watch::Sender<bool>,
}

impl EventListener {
    pub fn connect(
        addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
        config: EventListenerConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(listen_loop(addr, handler, config.retry_delay, shutdown_rx));
        Self { shutdown }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen_loop(
    addr: SocketAddr,
    handler: Arc<dyn EventHandler>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                tracing::info!(%addr, "event channel connected");
                if let Err(error) = serve_events(&mut stream, &handler, &mut shutdown).await {
                    tracing::warn!(%addr, %error, "event channel lost");
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            Err(error) => tracing::debug!(%addr, %error, "event channel connect failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(retry_delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
}

async fn serve_events(
    stream: &mut TcpStream,
    handler: &Arc<dyn EventHandler>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(()),
            frame = read_frame(stream) => {
                let envelope = Envelope::decode(frame?)?;
                if envelope.kind != EnvelopeKind::Event {
                    return Err(TransportError::MalformedEnvelope);
                }
                let response = handler.on_event(envelope.payload).await;
                let reply =
                    Envelope::new(EnvelopeKind::EventReply, envelope.correlation_id, response);
                write_frame(stream, &reply.encode()).await?;
            }
        }
    }
}
