//! Client session runtime
//!
//! A client session owns one duplex stream and runs four workers: a reader
//! feeding the bounded dispatch queue, a single dispatcher routing replies
//! and notifications in arrival order, a writer draining the outgoing
//! queue, and the finalization pump. Requests register a completion slot
//! keyed by message id and suspend the caller until the response,
//! exception, deadline, or session teardown.

use crate::client::finalize;
use crate::client::proxy::ObjectProxy;
use crate::client::resolver::ClientResolver;
use crate::codec::{DecodeRefs, JsonCodec, PayloadCodec};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::value::{ObjectRef, Value};
use bytes::Bytes;
use objex_wire::{Envelope, EnvelopeTransport, MessageId, MessageType, ObjectId};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

type CompletionSlot = oneshot::Sender<Result<Bytes>>;

/// Builder for client sessions
pub struct ClientBuilder {
    config: ClientConfig,
    codec: Arc<dyn PayloadCodec>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            codec: Arc::new(JsonCodec),
        }
    }

    /// Set the per-request deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the finalization quiescence window and pump tick
    pub fn finalize_windows(mut self, quiescence: Duration, tick: Duration) -> Self {
        self.config.finalize_quiescence = quiescence;
        self.config.finalize_tick = tick;
        self
    }

    /// Replace the payload codec
    pub fn codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Connect over TCP
    pub async fn connect(self, addr: SocketAddr) -> Result<ClientSession> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(objex_wire::WireError::Io)?;
        Ok(self.from_stream(stream))
    }

    /// Run the session over an existing duplex stream
    pub fn from_stream<S>(self, stream: S) -> ClientSession
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let read_transport =
            EnvelopeTransport::new(read_half).with_max_frame_size(self.config.max_frame_size);
        let write_transport =
            EnvelopeTransport::new(write_half).with_max_frame_size(self.config.max_frame_size);

        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.config.max_queue);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.config.max_queue);
        let (shutdown_tx, _) = watch::channel(false);

        let core = Arc::new_cyclic(|weak_self| ClientCore {
            config: self.config,
            codec: self.codec,
            resolver: ClientResolver::new(),
            outgoing: outgoing_tx,
            pending: Mutex::new(HashMap::new()),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
            congested: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        tokio::spawn(reader_task(
            core.clone(),
            read_transport,
            dispatch_tx,
            core.shutdown.subscribe(),
        ));
        tokio::spawn(dispatcher_task(
            core.clone(),
            dispatch_rx,
            core.shutdown.subscribe(),
        ));
        tokio::spawn(writer_task(
            core.clone(),
            write_transport,
            outgoing_rx,
            core.shutdown.subscribe(),
        ));
        tokio::spawn(pump_task(core.clone(), core.shutdown.subscribe()));

        ClientSession { core }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one client session
#[derive(Clone)]
pub struct ClientSession {
    core: Arc<ClientCore>,
}

impl ClientSession {
    /// Connect with default configuration
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        ClientBuilder::new().connect(addr).await
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Fetch the server's root object.
    pub async fn root(&self) -> Result<Arc<ObjectProxy>> {
        let value = self
            .core
            .request(Envelope::root_query(MessageId::generate()))
            .await?;
        value.into_proxy()
    }

    /// Tear the session down: workers stop, outstanding requests fail with
    /// `SessionClosed`.
    pub fn close(&self) {
        self.core.fault();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// The session's weak identifier table.
    pub fn resolver(&self) -> &ClientResolver {
        &self.core.resolver
    }
}

/// Shared state behind every proxy and worker of one session.
pub(crate) struct ClientCore {
    pub(crate) config: ClientConfig,
    codec: Arc<dyn PayloadCodec>,
    pub(crate) resolver: ClientResolver,
    outgoing: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<MessageId, CompletionSlot>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    // Set when the session died of queue overflow, so callers see
    // `Congestion` rather than a plain close.
    congested: AtomicBool,
    // Handed to proxies admitted during decode; weak, so the table never
    // keeps its own session alive.
    weak_self: std::sync::Weak<ClientCore>,
}

impl ClientCore {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn resolver(&self) -> &ClientResolver {
        &self.resolver
    }

    /// The error a dead session hands out: `Congestion` when it died of
    /// queue overflow, `SessionClosed` otherwise.
    fn close_error(&self) -> Error {
        if self.congested.load(Ordering::SeqCst) {
            Error::Congestion
        } else {
            Error::SessionClosed
        }
    }

    /// Send one request and suspend until its reply, the deadline, or
    /// session teardown.
    pub(crate) async fn request(&self, envelope: Envelope) -> Result<Value> {
        if self.is_closed() {
            return Err(self.close_error());
        }

        let message_id = envelope.message_id;
        let (slot_tx, slot_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(message_id, slot_tx);

        if self.outgoing.send(envelope).await.is_err() {
            self.pending.lock().unwrap().remove(&message_id);
            return Err(self.close_error());
        }

        let payload = match tokio::time::timeout(self.config.request_timeout, slot_rx).await {
            Err(_) => {
                self.pending.lock().unwrap().remove(&message_id);
                return Err(Error::Timeout);
            }
            Ok(Err(_)) => return Err(self.close_error()),
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Ok(Ok(payload))) => payload,
        };

        self.decode_payload(&payload)
    }

    /// Fire-and-forget release of a reclaimed proxy's identifier.
    pub(crate) async fn send_finalized(&self, id: ObjectId) {
        let envelope = Envelope::proxy_finalized(MessageId::generate(), id);
        let _ = self.outgoing.send(envelope).await;
    }

    pub(crate) fn encode_payload(&self, value: &Value) -> Result<Bytes> {
        self.codec.encode(value, &self.resolver)
    }

    /// Decode one top-level payload and populate every proxy it admitted.
    pub(crate) fn decode_payload(&self, data: &[u8]) -> Result<Value> {
        let core = self.weak_self.upgrade().ok_or(Error::SessionClosed)?;
        let _gate = self.resolver.decode_gate();
        let refs = ClientDecodeRefs { core };
        let value = self.codec.decode(data, &refs)?;
        for (proxy, state) in self.resolver.take_proxies_to_populate() {
            proxy.apply_population(state);
        }
        Ok(value)
    }

    /// Route one incoming envelope.
    fn dispatch(&self, envelope: Envelope) {
        match envelope.message_type {
            MessageType::Response => {
                let slot = self.pending.lock().unwrap().remove(&envelope.message_id);
                match slot {
                    Some(slot) => {
                        let _ = slot.send(Ok(envelope.value));
                    }
                    None => debug!(message_id = %envelope.message_id, "response without a slot, dropped"),
                }
            }
            MessageType::Exception => {
                let slot = self.pending.lock().unwrap().remove(&envelope.message_id);
                match slot {
                    Some(slot) => {
                        let _ = slot.send(Err(decode_exception(&envelope.value)));
                    }
                    None => debug!(message_id = %envelope.message_id, "exception without a slot, dropped"),
                }
            }
            MessageType::EventNotification => {
                // A reclaimed target means the client is racing its own
                // release; the notification is dropped without resurrection.
                let Some(proxy) = self.resolver.peek(envelope.dto_id) else {
                    debug!(dto = %envelope.dto_id, event = %envelope.member, "notification for reclaimed proxy, dropped");
                    return;
                };
                match self.decode_payload(&envelope.value) {
                    Ok(args) => proxy.deliver(&envelope.member, &args),
                    Err(e) => warn!(event = %envelope.member, "bad notification payload: {e}"),
                }
            }
            other => warn!(?other, "unexpected message type on client, dropped"),
        }
    }

    /// Tear down: stop workers and fail every outstanding slot.
    pub(crate) fn fault(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let slots: Vec<CompletionSlot> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let _ = slot.send(Err(self.close_error()));
        }

        finalize::purge_session(self);
    }

    /// Tear down after a queue overflow: outstanding and subsequent
    /// requests fail with `Congestion` instead of a plain close.
    pub(crate) fn congestion_fault(&self) {
        self.congested.store(true, Ordering::SeqCst);
        self.fault();
    }
}

/// Decode hooks binding the resolver to this session, so admitted proxies
/// know where to send their operations.
struct ClientDecodeRefs {
    core: Arc<ClientCore>,
}

impl DecodeRefs for ClientDecodeRefs {
    fn admit(
        &self,
        id: ObjectId,
        class: Option<&str>,
        state: Option<BTreeMap<String, Value>>,
    ) -> Result<Option<ObjectRef>> {
        let proxy = self.core.resolver.admit(&self.core, id, class, state);
        Ok(Some(ObjectRef::Remote(proxy)))
    }
}

fn decode_exception(data: &[u8]) -> Error {
    let summary: serde_json::Value = match serde_json::from_slice(data) {
        Ok(v) => v,
        Err(_) => return Error::Remote {
            message: "malformed exception payload".to_string(),
            inner: None,
        },
    };
    Error::Remote {
        message: summary
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
        inner: summary
            .get("inner")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    }
}

async fn reader_task<R: AsyncRead + Unpin>(
    core: Arc<ClientCore>,
    mut transport: EnvelopeTransport<R>,
    dispatch: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = transport.read_envelope() => match result {
                Ok(envelope) => {
                    if dispatch.try_send(envelope).is_err() {
                        warn!("client dispatch queue overflow, closing session");
                        core.congestion_fault();
                        break;
                    }
                }
                Err(e) => {
                    if !e.is_connection_closed() {
                        warn!("client read failed: {e}");
                    }
                    break;
                }
            },
        }
    }
    core.fault();
}

async fn dispatcher_task(
    core: Arc<ClientCore>,
    mut dispatch: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            envelope = dispatch.recv() => match envelope {
                Some(envelope) => core.dispatch(envelope),
                None => break,
            },
        }
    }
}

async fn writer_task<W: AsyncWrite + Unpin>(
    core: Arc<ClientCore>,
    mut transport: EnvelopeTransport<W>,
    mut outgoing: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            envelope = outgoing.recv() => match envelope {
                Some(envelope) => {
                    if let Err(e) = transport.write_envelope(&envelope).await {
                        warn!("client write failed: {e}");
                        core.fault();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    // Drain once on shutdown.
    while let Ok(envelope) = outgoing.try_recv() {
        if transport.write_envelope(&envelope).await.is_err() {
            break;
        }
    }
}

async fn pump_task(core: Arc<ClientCore>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(core.config.finalize_tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                for id in finalize::due(&core, core.config.finalize_quiescence) {
                    if core.resolver.reap(id) {
                        debug!(%id, "releasing reclaimed proxy");
                        core.send_finalized(id).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn detached_core() -> Arc<ClientCore> {
    let (outgoing, _outgoing_rx) = mpsc::channel(16);
    let (shutdown, _) = watch::channel(false);
    Arc::new_cyclic(|weak_self| ClientCore {
        config: ClientConfig::default(),
        codec: Arc::new(JsonCodec),
        resolver: ClientResolver::new(),
        outgoing,
        pending: Mutex::new(HashMap::new()),
        shutdown,
        closed: AtomicBool::new(false),
        congested: AtomicBool::new(false),
        weak_self: weak_self.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::finalize;

    #[test]
    fn test_admit_is_idempotent() {
        let core = detached_core();
        let id = ObjectId::generate();

        let a = core.resolver.admit(&core, id, Some("Widget"), None);
        let b = core.resolver.admit(&core, id, Some("Widget"), None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(core.resolver.len(), 1);
    }

    #[test]
    fn test_dead_entry_resurrects_with_same_identity() {
        let core = detached_core();
        let id = ObjectId::generate();

        let proxy = core.resolver.admit(&core, id, Some("Widget"), None);
        drop(proxy);
        assert!(finalize::contains(id));

        // The identifier arrives again before the pump fires.
        let revived = core.resolver.resolve_reference(id).unwrap();
        assert_eq!(revived.id(), id);
        assert_eq!(revived.class_name(), "Widget");
        assert!(!finalize::contains(id));
    }

    #[test]
    fn test_reap_only_when_dead() {
        let core = detached_core();
        let id = ObjectId::generate();

        let proxy = core.resolver.admit(&core, id, Some("Widget"), None);
        assert!(!core.resolver.reap(id));

        drop(proxy);
        assert!(core.resolver.reap(id));
        // The entry is consumed; a second reap has nothing to release.
        assert!(!core.resolver.reap(id));
    }

    #[test]
    fn test_get_reference_sentinel() {
        let core = detached_core();
        let id = ObjectId::generate();
        let proxy = core.resolver.admit(&core, id, Some("Widget"), None);

        assert_eq!(
            ClientResolver::get_reference(&Value::remote(proxy)),
            id.to_string()
        );
        // Not a reference: serialize inline.
        assert_eq!(ClientResolver::get_reference(&Value::Int(1)), "");
        assert!(!ClientResolver::is_referenced(&Value::Int(1)));
    }

    #[test]
    fn test_peek_never_resurrects() {
        let core = detached_core();
        let id = ObjectId::generate();

        let proxy = core.resolver.admit(&core, id, Some("Widget"), None);
        drop(proxy);

        assert!(core.resolver.peek(id).is_none());
        assert!(finalize::contains(id));
        finalize::cancel(id);
    }

    #[tokio::test]
    async fn test_congestion_fault_surfaces_distinctly() {
        let core = detached_core();
        core.congestion_fault();
        assert!(core.is_closed());

        match core
            .request(Envelope::root_query(MessageId::generate()))
            .await
        {
            Err(Error::Congestion) => {}
            other => panic!("expected congestion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plain_fault_reports_session_closed() {
        let core = detached_core();
        core.fault();

        match core
            .request(Envelope::root_query(MessageId::generate()))
            .await
        {
            Err(Error::SessionClosed) => {}
            other => panic!("expected session closed, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_exception_summary() {
        let err = decode_exception(br#"{"message":"boom","inner":"cause"}"#);
        match err {
            Error::Remote { message, inner } => {
                assert_eq!(message, "boom");
                assert_eq!(inner.as_deref(), Some("cause"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }
}
