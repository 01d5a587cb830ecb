//! Server session runtime
//!
//! The server accepts connections, authenticates each peer once before any
//! worker starts, and runs one session per connection: a reader feeding the
//! bounded dispatch queue, a single dispatcher applying the state machine
//! in arrival order, and a writer that drains the outgoing queue and
//! resolves lazy property-change payloads at write time. All three run
//! inside a span carrying the session id and authenticated principal.

use crate::auth::{AllowAll, Authenticator, Principal};
use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::host::HostObject;
use crate::server::dispatch::{render_property_change, DelegateMap, Outgoing, SessionDispatch};
use crate::server::resolver::ServerResolver;
use crate::server::SessionId;
use objex_wire::{EnvelopeTransport, WireError};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};

/// Server statistics
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_failed: AtomicU64,
    pub notifications_sent: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of server statistics
#[derive(Debug, Clone)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub requests_received: u64,
    pub requests_failed: u64,
    pub notifications_sent: u64,
}

/// A server exposing one root object to any number of sessions.
pub struct ObjectServer {
    root: Arc<dyn HostObject>,
    resolver: Arc<ServerResolver>,
    codec: Arc<dyn PayloadCodec>,
    authenticator: Arc<dyn Authenticator>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    next_session: AtomicU64,
}

impl ObjectServer {
    /// Create a server around the given root object. Every client's root
    /// query resolves to this instance, so all clients observe the same
    /// root identifier.
    pub fn new(root: Arc<dyn HostObject>) -> Self {
        Self {
            root,
            resolver: ServerResolver::new(),
            codec: Arc::new(JsonCodec),
            authenticator: Arc::new(AllowAll),
            config: ServerConfig::default(),
            stats: Arc::new(ServerStats::default()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// The shared strong identifier table.
    pub fn resolver(&self) -> &Arc<ServerResolver> {
        &self.resolver
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(WireError::Io)?;
        info!(
            "objex server listening on {addr} (max_connections: {})",
            self.config.max_connections
        );
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            let (stream, peer) = listener.accept().await.map_err(WireError::Io)?;
            self.accept_connection(stream, peer, &semaphore);
        }
    }

    /// Accept connections until `shutdown` completes.
    pub async fn run_until<F: Future<Output = ()>>(
        &self,
        addr: SocketAddr,
        shutdown: F,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(WireError::Io)?;
        info!(
            "objex server listening on {addr} (max_connections: {})",
            self.config.max_connections
        );
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("objex server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.map_err(WireError::Io)?;
                    self.accept_connection(stream, peer, &semaphore);
                }
            }
        }
    }

    /// Run one session over an existing duplex stream under the given
    /// principal, to completion.
    pub async fn serve_stream<S>(&self, stream: S, principal: Principal) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let parts = self.session_parts();
        let span = info_span!("session", id = %parts.id, principal = %principal);
        run_session(parts, stream).instrument(span).await
    }

    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr, semaphore: &Arc<Semaphore>) {
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                warn!("connection limit reached, rejecting connection from {peer}");
                return;
            }
        };

        // Authenticate before any worker starts.
        let Some(principal) = self.authenticator.principal(peer) else {
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            warn!("unauthorized connection from {peer}");
            return;
        };

        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!("accepted connection from {peer}");

        let parts = self.session_parts();
        let stats = self.stats.clone();
        let span = info_span!("session", id = %parts.id, peer = %peer, principal = %principal);

        tokio::spawn(
            async move {
                let _permit = permit;
                let result = run_session(parts, stream).await;
                stats.connections_active.fetch_sub(1, Ordering::Relaxed);

                match result {
                    Ok(()) => debug!("session ended"),
                    Err(e) => warn!("session failed: {e}"),
                }
            }
            .instrument(span),
        );
    }

    fn session_parts(&self) -> SessionParts {
        SessionParts {
            id: SessionId(self.next_session.fetch_add(1, Ordering::SeqCst)),
            root: self.root.clone(),
            resolver: self.resolver.clone(),
            codec: self.codec.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Shutdown signal plus the first fault recorded for a session. A trip
/// without a reason is a clean close; the first recorded reason becomes
/// the session's result, so a queue overflow surfaces as `Congestion`
/// rather than a plain close.
pub(crate) struct FaultHandle {
    shutdown: watch::Sender<bool>,
    reason: Mutex<Option<Error>>,
}

impl FaultHandle {
    fn new() -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, receiver) = watch::channel(false);
        (
            Arc::new(Self {
                shutdown,
                reason: Mutex::new(None),
            }),
            receiver,
        )
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the session without recording an error.
    pub(crate) fn trip(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Fail the session; later faults keep the first reason.
    pub(crate) fn fault(&self, error: Error) {
        self.reason.lock().unwrap().get_or_insert(error);
        let _ = self.shutdown.send(true);
    }

    fn take_reason(&self) -> Option<Error> {
        self.reason.lock().unwrap().take()
    }
}

/// Everything one session borrows from its server.
struct SessionParts {
    id: SessionId,
    root: Arc<dyn HostObject>,
    resolver: Arc<ServerResolver>,
    codec: Arc<dyn PayloadCodec>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
}

async fn run_session<S>(parts: SessionParts, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let read_transport =
        EnvelopeTransport::new(read_half).with_max_frame_size(parts.config.max_frame_size);
    let write_transport =
        EnvelopeTransport::new(write_half).with_max_frame_size(parts.config.max_frame_size);

    let (outgoing_tx, outgoing_rx) = mpsc::channel(parts.config.max_queue);
    let (dispatch_tx, dispatch_rx) = mpsc::channel(parts.config.max_queue);
    let (fault, mut fault_rx) = FaultHandle::new();
    let delegates: DelegateMap = Arc::new(Mutex::new(HashMap::new()));

    // This session's property-change sink: forward changes of objects the
    // client subscribed to into the write queue, lazily.
    let sink_token = {
        let delegates = delegates.clone();
        let outgoing = outgoing_tx.clone();
        let fault = fault.clone();
        parts.resolver.subscribe_changes(Arc::new(move |dto, property| {
            let subscribed = delegates
                .lock()
                .unwrap()
                .contains_key(&(dto, crate::host::PROPERTY_CHANGED.to_string()));
            if !subscribed {
                return;
            }
            let queued = Outgoing::PropertyChanged {
                dto,
                property: property.to_string(),
            };
            if outgoing.try_send(queued).is_err() {
                warn!("write queue overflow on property change, closing session");
                fault.fault(Error::Congestion);
            }
        }))
    };

    let dispatch = SessionDispatch {
        session: parts.id,
        root: parts.root.clone(),
        resolver: parts.resolver.clone(),
        codec: parts.codec.clone(),
        delegates: delegates.clone(),
        outgoing: outgoing_tx.clone(),
        fault: fault.clone(),
        stats: parts.stats.clone(),
    };

    let reader = tokio::spawn(
        reader_task(read_transport, dispatch_tx, fault.clone(), fault.subscribe())
            .in_current_span(),
    );
    let writer = tokio::spawn(
        writer_task(
            write_transport,
            outgoing_rx,
            parts.resolver.clone(),
            parts.codec.clone(),
            parts.id,
            parts.stats.clone(),
            fault.clone(),
            fault.subscribe(),
        )
        .in_current_span(),
    );

    // Dispatcher: strict FIFO, one envelope at a time.
    let mut dispatch_rx = dispatch_rx;
    loop {
        tokio::select! {
            _ = fault_rx.changed() => break,
            envelope = dispatch_rx.recv() => match envelope {
                Some(envelope) => dispatch.handle(envelope),
                None => break,
            },
        }
    }

    fault.trip();
    let _ = reader.await;
    let _ = writer.await;

    // Teardown: detach the sink, drop delegates, release exposures.
    parts.resolver.unsubscribe_changes(sink_token);
    release_delegates(&parts.resolver, &delegates);
    parts.resolver.release_session(parts.id);

    match fault.take_reason() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn release_delegates(resolver: &Arc<ServerResolver>, delegates: &DelegateMap) {
    let drained: Vec<((objex_wire::ObjectId, String), Option<crate::host::SubscriptionId>)> = {
        let mut delegates = delegates.lock().unwrap();
        delegates.drain().collect()
    };
    for ((dto, event), subscription) in drained {
        if let Some(subscription) = subscription {
            if let Some(obj) = resolver.resolve_reference(dto) {
                obj.core().unsubscribe(&event, subscription);
            }
        }
    }
}

async fn reader_task<R: AsyncRead + Unpin>(
    mut transport: EnvelopeTransport<R>,
    dispatch: mpsc::Sender<objex_wire::Envelope>,
    fault: Arc<FaultHandle>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = transport.read_envelope() => match result {
                Ok(envelope) => {
                    if dispatch.try_send(envelope).is_err() {
                        warn!("dispatch queue overflow, closing session");
                        fault.fault(Error::Congestion);
                        break;
                    }
                }
                Err(e) => {
                    if !e.is_connection_closed() {
                        warn!("read failed: {e}");
                    }
                    break;
                }
            },
        }
    }
    fault.trip();
}

#[allow(clippy::too_many_arguments)]
async fn writer_task<W: AsyncWrite + Unpin>(
    mut transport: EnvelopeTransport<W>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    resolver: Arc<ServerResolver>,
    codec: Arc<dyn PayloadCodec>,
    session: SessionId,
    stats: Arc<ServerStats>,
    fault: Arc<FaultHandle>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            queued = outgoing.recv() => match queued {
                Some(queued) => {
                    let envelope = match resolve_outgoing(queued, &resolver, &codec, session, &stats) {
                        Some(envelope) => envelope,
                        None => continue,
                    };
                    if let Err(e) = transport.write_envelope(&envelope).await {
                        warn!("write failed: {e}");
                        fault.trip();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // Drain once on shutdown.
    while let Ok(queued) = outgoing.try_recv() {
        if let Some(envelope) = resolve_outgoing(queued, &resolver, &codec, session, &stats) {
            if transport.write_envelope(&envelope).await.is_err() {
                break;
            }
        }
    }
}

fn resolve_outgoing(
    queued: Outgoing,
    resolver: &Arc<ServerResolver>,
    codec: &Arc<dyn PayloadCodec>,
    session: SessionId,
    stats: &Arc<ServerStats>,
) -> Option<objex_wire::Envelope> {
    match queued {
        Outgoing::Envelope(envelope) => Some(envelope),
        Outgoing::PropertyChanged { dto, property } => {
            render_property_change(resolver, codec, session, stats, dto, &property)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_handle_keeps_first_reason() {
        let (fault, mut receiver) = FaultHandle::new();
        fault.fault(Error::Congestion);
        fault.fault(Error::SessionClosed);

        assert!(receiver.has_changed().unwrap());
        match fault.take_reason() {
            Some(Error::Congestion) => {}
            other => panic!("expected congestion, got {other:?}"),
        }
    }

    #[test]
    fn test_trip_records_no_reason() {
        let (fault, _receiver) = FaultHandle::new();
        fault.trip();
        assert!(fault.take_reason().is_none());
    }
}
