//! Framed envelope transport
//!
//! Envelopes are self-delimited by a 4-byte big-endian length prefix that
//! excludes itself. Partial reads reassemble deterministically; a stream
//! that ends mid-frame yields [`WireError::FrameTruncated`] and the session
//! owning the transport faults.

use crate::envelope::Envelope;
use crate::error::{Result, WireError};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MiB default)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// Transport for reading/writing envelopes over a byte stream
pub struct EnvelopeTransport<T> {
    inner: T,
    max_frame_size: usize,
    read_buf: BytesMut,
}

impl<T> EnvelopeTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_frame_size(mut self, max_size: usize) -> Self {
        self.max_frame_size = max_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: AsyncRead + Unpin> EnvelopeTransport<T> {
    /// Read one complete envelope
    pub async fn read_envelope(&mut self) -> Result<Envelope> {
        // Length prefix first
        while self.read_buf.len() < LENGTH_PREFIX_SIZE {
            let n = self.fill_buf().await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Err(WireError::ConnectionClosed);
                }
                return Err(WireError::FrameTruncated);
            }
        }

        let frame_len = {
            let mut prefix = &self.read_buf[..LENGTH_PREFIX_SIZE];
            prefix.get_u32() as usize
        };

        if frame_len < Envelope::MIN_SIZE {
            return Err(WireError::InvalidEnvelope(format!(
                "frame length {frame_len} below header size"
            )));
        }
        if frame_len > self.max_frame_size {
            return Err(WireError::ProtocolLimit {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        // Rest of the frame
        while self.read_buf.len() < LENGTH_PREFIX_SIZE + frame_len {
            let n = self.fill_buf().await?;
            if n == 0 {
                return Err(WireError::FrameTruncated);
            }
        }

        self.read_buf.advance(LENGTH_PREFIX_SIZE);
        let frame = self.read_buf.split_to(frame_len).freeze();
        Envelope::decode(frame)
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        let n = self.inner.read_buf(&mut self.read_buf).await?;
        Ok(n)
    }
}

impl<T: AsyncWrite + Unpin> EnvelopeTransport<T> {
    /// Encode and write one envelope
    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let body = envelope.encode()?;
        if body.len() > self.max_frame_size {
            return Err(WireError::ProtocolLimit {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use crate::id::{MessageId, ObjectId};
    use bytes::Bytes;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_envelope_transport_roundtrip() {
        let (client, server) = duplex(1024);
        let mut client_transport = EnvelopeTransport::new(client);
        let mut server_transport = EnvelopeTransport::new(server);

        let write_handle = tokio::spawn(async move {
            let envelope = Envelope::query(
                MessageId::generate(),
                ObjectId::generate(),
                "Echo",
                1,
                Bytes::from_static(b"[\"hello\"]"),
            );
            client_transport.write_envelope(&envelope).await.unwrap();
            envelope
        });

        let received = server_transport.read_envelope().await.unwrap();
        let sent = write_handle.await.unwrap();

        assert_eq!(received.message_id, sent.message_id);
        assert_eq!(received.message_type, MessageType::Query);
        assert_eq!(received.member, "Echo");
        assert_eq!(received.value, sent.value);
    }

    #[tokio::test]
    async fn test_multiple_envelopes_in_order() {
        let (client, server) = duplex(4096);
        let mut client_transport = EnvelopeTransport::new(client);
        let mut server_transport = EnvelopeTransport::new(server);

        let write_handle = tokio::spawn(async move {
            for i in 0..3u16 {
                let envelope = Envelope::query(
                    MessageId::generate(),
                    ObjectId::generate(),
                    format!("Op{i}"),
                    i,
                    Bytes::new(),
                );
                client_transport.write_envelope(&envelope).await.unwrap();
            }
        });

        for i in 0..3u16 {
            let envelope = server_transport.read_envelope().await.unwrap();
            assert_eq!(envelope.member, format!("Op{i}"));
            assert_eq!(envelope.parameters, i);
        }

        write_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let (client, server) = duplex(4096);
        let mut client_transport = EnvelopeTransport::new(client);
        let mut server_transport = EnvelopeTransport::new(server).with_max_frame_size(64);

        tokio::spawn(async move {
            let envelope = Envelope::response(MessageId::generate(), Bytes::from(vec![0u8; 256]));
            // Writer side has the default bound; the reader enforces its own.
            client_transport.write_envelope(&envelope).await.unwrap();
        });

        match server_transport.read_envelope().await {
            Err(WireError::ProtocolLimit { size, max }) => {
                assert!(size > max);
                assert_eq!(max, 64);
            }
            other => panic!("expected protocol limit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_stream_faults() {
        let (client, server) = duplex(1024);
        let mut server_transport = EnvelopeTransport::new(server);

        tokio::spawn(async move {
            let mut client = client;
            // A length prefix promising more bytes than ever arrive.
            client.write_all(&[0x00, 0x00, 0x01, 0x00]).await.unwrap();
            client.write_all(b"partial").await.unwrap();
            drop(client);
        });

        match server_transport.read_envelope().await {
            Err(WireError::FrameTruncated) => {}
            other => panic!("expected truncated frame error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let (client, server) = duplex(64);
        drop(client);
        let mut server_transport = EnvelopeTransport::new(server);

        match server_transport.read_envelope().await {
            Err(e) => assert!(e.is_connection_closed()),
            Ok(_) => panic!("expected connection closed"),
        }
    }
}
