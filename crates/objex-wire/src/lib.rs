//! Wire layer for the objex remote-object transport.
//!
//! This crate implements the framed, ordered message channel that the object
//! layer rides on: identifier types, the message envelope, and a transport
//! that reads and writes self-delimited envelopes over any async byte stream.
//!
//! The payload of an envelope (`value`) is opaque at this layer; the object
//! layer routes it through a pluggable codec.
//!
//! # Frame format
//!
//! ```text
//! +--------+--------+--------+--------+
//! |   total length (u32, big-endian)  |   excludes itself
//! +--------+--------+--------+--------+
//! |        message id (16 bytes)      |
//! |        dto id     (16 bytes)      |   nil = unbound
//! +--------+--------+--------+--------+
//! | mtype  |  parameters     | m_len  |
//! +--------+-----------------+--------+
//! |   member name (m_len bytes UTF-8) |
//! +-----------------------------------+
//! |   value stream (rest of frame)    |
//! +-----------------------------------+
//! ```

pub mod envelope;
pub mod error;
pub mod id;
pub mod transport;

pub use envelope::{Envelope, MessageType};
pub use error::{Result, WireError};
pub use id::{MessageId, ObjectId};
pub use transport::{EnvelopeTransport, DEFAULT_MAX_FRAME_SIZE};
