//! Server dispatch state machine
//!
//! One [`SessionDispatch`] per session maps incoming envelopes to
//! property/method/event operations on resolved objects and queues the
//! replies. Targets that fail to resolve yield a null response and a log
//! line; member errors travel back as exception envelopes and the session
//! continues.

use crate::codec::PayloadCodec;
use crate::error::Error;
use crate::host::{HostObject, SubscriptionId, CHANGE_PROPERTY_KEY, CHANGE_VALUE_KEY, PROPERTY_CHANGED};
use crate::server::resolver::{ServerDecodeRefs, ServerEncodeRefs, ServerResolver};
use crate::server::session::{FaultHandle, ServerStats};
use crate::server::SessionId;
use crate::value::Value;
use bytes::Bytes;
use objex_wire::{Envelope, MessageId, MessageType, ObjectId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// One queued outgoing message. Property-change notifications stay lazy
/// until the writer serializes them, so the client sees the value that is
/// live when the notification is sent, not when it was queued.
pub(crate) enum Outgoing {
    Envelope(Envelope),
    PropertyChanged { dto: ObjectId, property: String },
}

/// Remote event subscriptions held by one session, keyed by target and
/// event name. `PropertyChanged` routes through the resolver's change sink
/// and holds no per-object subscription.
pub(crate) type DelegateMap = Arc<Mutex<HashMap<(ObjectId, String), Option<SubscriptionId>>>>;

pub(crate) struct SessionDispatch {
    pub(crate) session: SessionId,
    pub(crate) root: Arc<dyn HostObject>,
    pub(crate) resolver: Arc<ServerResolver>,
    pub(crate) codec: Arc<dyn PayloadCodec>,
    pub(crate) delegates: DelegateMap,
    pub(crate) outgoing: mpsc::Sender<Outgoing>,
    pub(crate) fault: Arc<FaultHandle>,
    pub(crate) stats: Arc<ServerStats>,
}

impl SessionDispatch {
    pub(crate) fn handle(&self, envelope: Envelope) {
        self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

        let reply = match envelope.message_type {
            MessageType::RootQuery => Some(self.on_root_query(&envelope)),
            MessageType::Query => Some(self.on_query(&envelope)),
            MessageType::Get => Some(self.on_get(&envelope)),
            MessageType::Set => Some(self.on_set(&envelope)),
            MessageType::EventAdd => Some(self.on_event_add(&envelope)),
            MessageType::EventRemove => Some(self.on_event_remove(&envelope)),
            MessageType::ProxyFinalized => Some(self.on_proxy_finalized(&envelope)),
            other => {
                warn!(?other, "unexpected message type on server, dropped");
                None
            }
        };

        if let Some(reply) = reply {
            self.send(reply);
        }
    }

    fn on_root_query(&self, envelope: &Envelope) -> Envelope {
        self.respond(envelope.message_id, &Value::host(self.root.clone()))
    }

    fn on_query(&self, envelope: &Envelope) -> Envelope {
        let Some(obj) = self.resolver.resolve_reference(envelope.dto_id) else {
            warn!(dto = %envelope.dto_id, method = %envelope.member, "query for unknown object");
            return self.respond(envelope.message_id, &Value::Null);
        };

        let args = match self.decode(&envelope.value) {
            Ok(Value::Null) => Vec::new(),
            Ok(Value::List(args)) => args,
            Ok(other) => {
                return self.exception(
                    envelope.message_id,
                    &Error::Codec(format!("arguments must be a list, got {}", other.kind())),
                )
            }
            Err(e) => return self.exception(envelope.message_id, &e),
        };

        match obj.invoke(&envelope.member, envelope.parameters, args) {
            Ok(value) => self.respond(envelope.message_id, &value),
            Err(e) => {
                // Surfaced to the operator as well as the calling client.
                error!(method = %envelope.member, "invocation failed: {e}");
                self.exception(envelope.message_id, &e)
            }
        }
    }

    fn on_get(&self, envelope: &Envelope) -> Envelope {
        let Some(obj) = self.resolver.resolve_reference(envelope.dto_id) else {
            warn!(dto = %envelope.dto_id, property = %envelope.member, "get for unknown object");
            return self.respond(envelope.message_id, &Value::Null);
        };

        match obj.get_property(&envelope.member) {
            Ok(value) => self.respond(envelope.message_id, &value),
            Err(e) => self.exception(envelope.message_id, &e),
        }
    }

    fn on_set(&self, envelope: &Envelope) -> Envelope {
        let Some(obj) = self.resolver.resolve_reference(envelope.dto_id) else {
            warn!(dto = %envelope.dto_id, property = %envelope.member, "set for unknown object");
            return self.respond(envelope.message_id, &Value::Null);
        };

        let value = match self.decode(&envelope.value) {
            Ok(value) => value,
            Err(e) => return self.exception(envelope.message_id, &e),
        };

        match obj.set_property(&envelope.member, value) {
            Ok(()) => self.ack(envelope.message_id),
            Err(e) => self.exception(envelope.message_id, &e),
        }
    }

    fn on_event_add(&self, envelope: &Envelope) -> Envelope {
        let Some(obj) = self.resolver.resolve_reference(envelope.dto_id) else {
            warn!(dto = %envelope.dto_id, event = %envelope.member, "event add for unknown object");
            return self.respond(envelope.message_id, &Value::Null);
        };

        if !obj.class().has_event(&envelope.member) {
            return self.exception(
                envelope.message_id,
                &Error::UnknownMember(format!("unknown event: {}", envelope.member)),
            );
        }

        let key = (envelope.dto_id, envelope.member.clone());
        let mut delegates = self.delegates.lock().unwrap();
        if delegates.contains_key(&key) {
            // Duplicate add is a no-op.
            return self.ack(envelope.message_id);
        }

        if envelope.member == PROPERTY_CHANGED {
            delegates.insert(key, None);
        } else {
            let subscription = obj.core().subscribe(&envelope.member, self.event_delegate(&envelope.member, envelope.dto_id));
            delegates.insert(key, Some(subscription));
        }
        self.ack(envelope.message_id)
    }

    fn on_event_remove(&self, envelope: &Envelope) -> Envelope {
        let key = (envelope.dto_id, envelope.member.clone());
        let removed = self.delegates.lock().unwrap().remove(&key);

        if let Some(Some(subscription)) = removed {
            if let Some(obj) = self.resolver.resolve_reference(envelope.dto_id) {
                obj.core().unsubscribe(&envelope.member, subscription);
            }
        }
        // No-op if absent.
        self.ack(envelope.message_id)
    }

    fn on_proxy_finalized(&self, envelope: &Envelope) -> Envelope {
        let id = envelope.dto_id;
        let removed: Vec<(String, SubscriptionId)> = {
            let mut delegates = self.delegates.lock().unwrap();
            let keys: Vec<(ObjectId, String)> = delegates
                .keys()
                .filter(|(dto, _)| *dto == id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    let subscription = delegates.remove(&key).flatten();
                    subscription.map(|s| (key.1, s))
                })
                .collect()
        };

        if let Some(obj) = self.resolver.resolve_reference(id) {
            for (event, subscription) in removed {
                obj.core().unsubscribe(&event, subscription);
            }
        }

        self.resolver.release(id, self.session);
        debug!(dto = %id, "released by client finalization");
        // An unknown identifier is acknowledged all the same.
        self.ack(envelope.message_id)
    }

    /// Delegate attached to a host object's custom event: serializes the
    /// arguments and queues a notification for this session's client.
    fn event_delegate(
        &self,
        event: &str,
        dto: ObjectId,
    ) -> Arc<dyn Fn(&Value) + Send + Sync> {
        let outgoing = self.outgoing.clone();
        let codec = self.codec.clone();
        let resolver = self.resolver.clone();
        let session = self.session;
        let fault = self.fault.clone();
        let stats = self.stats.clone();
        let event = event.to_string();

        Arc::new(move |args| {
            let refs = ServerEncodeRefs {
                resolver: resolver.clone(),
                session,
            };
            let payload = match codec.encode(args, &refs) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(event = %event, "could not serialize event arguments: {e}");
                    return;
                }
            };
            let envelope = Envelope::notification(dto, event.clone(), payload);
            if outgoing.try_send(Outgoing::Envelope(envelope)).is_err() {
                warn!("write queue overflow on event notification, closing session");
                fault.fault(Error::Congestion);
                return;
            }
            stats.notifications_sent.fetch_add(1, Ordering::Relaxed);
        })
    }

    fn decode(&self, data: &[u8]) -> crate::error::Result<Value> {
        let refs = ServerDecodeRefs {
            resolver: self.resolver.clone(),
        };
        self.codec.decode(data, &refs)
    }

    fn respond(&self, message_id: MessageId, value: &Value) -> Envelope {
        let refs = ServerEncodeRefs {
            resolver: self.resolver.clone(),
            session: self.session,
        };
        match self.codec.encode(value, &refs) {
            Ok(payload) => Envelope::response(message_id, payload),
            Err(e) => {
                error!("could not serialize response: {e}");
                self.exception(message_id, &e)
            }
        }
    }

    fn ack(&self, message_id: MessageId) -> Envelope {
        Envelope::response(message_id, Bytes::new())
    }

    fn exception(&self, message_id: MessageId, err: &Error) -> Envelope {
        self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        let (message, inner) = err.summary();
        let payload = serde_json::json!({ "message": message, "inner": inner });
        let raw = serde_json::to_vec(&payload).unwrap_or_default();
        Envelope::exception(message_id, Bytes::from(raw))
    }

    fn send(&self, envelope: Envelope) {
        if self.outgoing.try_send(Outgoing::Envelope(envelope)).is_err() {
            warn!("write queue overflow, closing session");
            self.fault.fault(Error::Congestion);
        }
    }
}

/// Resolve a queued property-change notification into an envelope at write
/// time. Reads the property's current value; a target or property that has
/// meanwhile disappeared drops the notification.
pub(crate) fn render_property_change(
    resolver: &Arc<ServerResolver>,
    codec: &Arc<dyn PayloadCodec>,
    session: SessionId,
    stats: &Arc<ServerStats>,
    dto: ObjectId,
    property: &str,
) -> Option<Envelope> {
    let obj = resolver.resolve_reference(dto)?;
    let value = match obj.get_property(property) {
        Ok(value) => value,
        Err(e) => {
            debug!(dto = %dto, property = %property, "dropping property change: {e}");
            return None;
        }
    };

    let mut args = BTreeMap::new();
    args.insert(CHANGE_PROPERTY_KEY.to_string(), Value::Str(property.to_string()));
    args.insert(CHANGE_VALUE_KEY.to_string(), value);

    let refs = ServerEncodeRefs {
        resolver: resolver.clone(),
        session,
    };
    let payload = match codec.encode(&Value::Map(args), &refs) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(property = %property, "could not serialize property change: {e}");
            return None;
        }
    };

    stats.notifications_sent.fetch_add(1, Ordering::Relaxed);
    Some(Envelope::notification(dto, PROPERTY_CHANGED, payload))
}
