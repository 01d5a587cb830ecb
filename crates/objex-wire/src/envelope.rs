//! Message envelope types
//!
//! Every message on the wire is one envelope: a fixed header naming the
//! target object, the addressed member, and the correlation id, followed by
//! an opaque value stream. The object layer decides what the value stream
//! means per message type.

use crate::error::{Result, WireError};
use crate::id::{MessageId, ObjectId};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Envelope message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Ask the server for its root object
    RootQuery = 0,
    /// Invoke a method on the target object
    Query = 1,
    /// Read a property of the target object
    Get = 2,
    /// Write a property of the target object
    Set = 3,
    /// Attach a remote event subscription
    EventAdd = 4,
    /// Detach a remote event subscription
    EventRemove = 5,
    /// Unsolicited server-to-client event delivery
    EventNotification = 6,
    /// Client-side proxy was reclaimed; release the server reference
    ProxyFinalized = 7,
    /// Successful reply to a request
    Response = 8,
    /// Failed reply to a request
    Exception = 9,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::RootQuery),
            1 => Some(Self::Query),
            2 => Some(Self::Get),
            3 => Some(Self::Set),
            4 => Some(Self::EventAdd),
            5 => Some(Self::EventRemove),
            6 => Some(Self::EventNotification),
            7 => Some(Self::ProxyFinalized),
            8 => Some(Self::Response),
            9 => Some(Self::Exception),
            _ => None,
        }
    }
}

/// One framed message.
///
/// `dto_id` is [`ObjectId::NIL`] for root queries, replies, and
/// notifications not bound to an object. `member` is empty where the message
/// type implies it. `parameters` is the arity hint used to disambiguate
/// method overloads.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: MessageId,
    pub dto_id: ObjectId,
    pub message_type: MessageType,
    pub member: String,
    pub parameters: u16,
    pub value: Bytes,
}

impl Envelope {
    /// Header size without the variable-length member name
    pub const MIN_SIZE: usize = MessageId::SIZE + ObjectId::SIZE + 1 + 2 + 2;

    pub fn new(
        message_id: MessageId,
        dto_id: ObjectId,
        message_type: MessageType,
        member: impl Into<String>,
        parameters: u16,
        value: Bytes,
    ) -> Self {
        Self {
            message_id,
            dto_id,
            message_type,
            member: member.into(),
            parameters,
            value,
        }
    }

    pub fn root_query(message_id: MessageId) -> Self {
        Self::new(
            message_id,
            ObjectId::NIL,
            MessageType::RootQuery,
            "",
            0,
            Bytes::new(),
        )
    }

    pub fn query(
        message_id: MessageId,
        dto_id: ObjectId,
        method: impl Into<String>,
        parameters: u16,
        args: Bytes,
    ) -> Self {
        Self::new(message_id, dto_id, MessageType::Query, method, parameters, args)
    }

    pub fn get(message_id: MessageId, dto_id: ObjectId, property: impl Into<String>) -> Self {
        Self::new(message_id, dto_id, MessageType::Get, property, 0, Bytes::new())
    }

    pub fn set(
        message_id: MessageId,
        dto_id: ObjectId,
        property: impl Into<String>,
        value: Bytes,
    ) -> Self {
        Self::new(message_id, dto_id, MessageType::Set, property, 1, value)
    }

    pub fn event_add(message_id: MessageId, dto_id: ObjectId, event: impl Into<String>) -> Self {
        Self::new(message_id, dto_id, MessageType::EventAdd, event, 0, Bytes::new())
    }

    pub fn event_remove(message_id: MessageId, dto_id: ObjectId, event: impl Into<String>) -> Self {
        Self::new(message_id, dto_id, MessageType::EventRemove, event, 0, Bytes::new())
    }

    pub fn notification(dto_id: ObjectId, event: impl Into<String>, args: Bytes) -> Self {
        Self::new(
            MessageId::generate(),
            dto_id,
            MessageType::EventNotification,
            event,
            0,
            args,
        )
    }

    pub fn proxy_finalized(message_id: MessageId, dto_id: ObjectId) -> Self {
        Self::new(
            message_id,
            dto_id,
            MessageType::ProxyFinalized,
            "",
            0,
            Bytes::new(),
        )
    }

    pub fn response(message_id: MessageId, value: Bytes) -> Self {
        Self::new(message_id, ObjectId::NIL, MessageType::Response, "", 0, value)
    }

    pub fn exception(message_id: MessageId, value: Bytes) -> Self {
        Self::new(message_id, ObjectId::NIL, MessageType::Exception, "", 0, value)
    }

    /// Encoded size of the frame body (without the length prefix)
    pub fn encoded_len(&self) -> usize {
        Self::MIN_SIZE + self.member.len() + self.value.len()
    }

    /// Encode the frame body (without the length prefix)
    pub fn encode(&self) -> Result<Bytes> {
        let member = self.member.as_bytes();
        if member.len() > u16::MAX as usize {
            return Err(WireError::InvalidEnvelope(format!(
                "member name too long: {} bytes",
                member.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.message_id.encode(&mut buf);
        self.dto_id.encode(&mut buf);
        buf.put_u8(self.message_type as u8);
        buf.put_u16(self.parameters);
        buf.put_u16(member.len() as u16);
        buf.put_slice(member);
        buf.put_slice(&self.value);
        Ok(buf.freeze())
    }

    /// Decode a complete frame body (without the length prefix)
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < Self::MIN_SIZE {
            return Err(WireError::InvalidEnvelope(format!(
                "frame too short: {} bytes",
                buf.remaining()
            )));
        }

        let message_id = MessageId::decode(&mut buf)?;
        let dto_id = ObjectId::decode(&mut buf)?;
        let raw_type = buf.get_u8();
        let message_type = MessageType::from_u8(raw_type)
            .ok_or_else(|| WireError::InvalidEnvelope(format!("unknown message type {raw_type}")))?;
        let parameters = buf.get_u16();

        let member_len = buf.get_u16() as usize;
        if buf.remaining() < member_len {
            return Err(WireError::InvalidEnvelope(format!(
                "member name overruns frame: need {member_len}, have {}",
                buf.remaining()
            )));
        }
        let member_raw = buf.split_to(member_len);
        let member = std::str::from_utf8(&member_raw)
            .map_err(|_| WireError::InvalidEnvelope("member name is not UTF-8".to_string()))?
            .to_string();

        Ok(Self {
            message_id,
            dto_id,
            message_type,
            member,
            parameters,
            value: buf,
        })
    }
}
