//! Per-connection request loop.
//!
//! A [`Session`] reads envelopes from one client, decodes them and hands every
//! accepted message to its [`Sink`]. It cycles through three steps until the
//! connection ends:
//!
//! 1. read the 4-byte envelope length
//! 2. read exactly that many bytes
//! 3. decode the request and write its messages to the sink, in order
//!
//! The protocol has no error response. Any decode, transport or sink failure
//! ends the session, and the caller closes the connection. Peer EOF before a
//! new envelope is a clean close.

use bytes::BytesMut;
use metrics::counter;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec;
use crate::error::{Error, ProtocolError};
use crate::sink::Sink;
use crate::types::LENGTH_PREFIX_SIZE;

/// Default upper bound on an envelope body: 64 MiB.
pub const DEFAULT_MAX_ENVELOPE_SIZE: usize = 64 * 1024 * 1024;

/// Tunables applied to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Largest envelope body accepted, in bytes.
    pub max_envelope_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
        }
    }
}

/// One client connection's request loop.
pub struct Session<S> {
    sink: S,
    settings: SessionSettings,
}

impl<S: Sink> Session<S> {
    /// Create a session that writes accepted messages to `sink`.
    pub fn new(sink: S, settings: SessionSettings) -> Self {
        Self { sink, settings }
    }

    /// Serve requests from `stream` until the peer disconnects or an error occurs.
    ///
    /// Messages of a request reach the sink only after the whole request has
    /// decoded successfully.
    ///
    /// # Returns
    ///
    /// `Ok(())` when the peer closed the connection between envelopes.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if a read fails or the stream ends inside an envelope.
    /// - [`Error::Protocol`] for an oversized or malformed envelope.
    /// - [`Error::UnsupportedRequest`] for a request type this broker does not serve.
    /// - Whatever the sink returned if a write failed.
    pub async fn run<T>(&self, stream: &mut T) -> Result<(), Error>
    where
        T: AsyncRead + Unpin + Send,
    {
        loop {
            let Some(len) = read_envelope_len(stream).await? else {
                return Ok(());
            };
            if len > self.settings.max_envelope_size {
                return Err(ProtocolError::EnvelopeTooLarge {
                    size: len,
                    max: self.settings.max_envelope_size,
                }
                .into());
            }

            let mut envelope = BytesMut::zeroed(len);
            stream.read_exact(&mut envelope).await?;

            let request = codec::decode_request(envelope.freeze())?;
            for message in request.messages {
                let size = message.framed.len();
                self.sink
                    .write(&request.topic, request.partition, message.framed)
                    .await?;
                tracing::debug!(
                    topic = %request.topic,
                    partition = request.partition,
                    bytes = size,
                    "accepted message"
                );
                counter!("k2_messages_accepted_total", "topic" => request.topic.clone())
                    .increment(1);
            }
        }
    }
}

/// Read the big-endian envelope length.
///
/// Returns `Ok(None)` if the stream ends before any length byte arrives.
async fn read_envelope_len<T>(stream: &mut T) -> Result<Option<usize>, Error>
where
    T: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = stream.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("connection closed after {filled} of {LENGTH_PREFIX_SIZE} length bytes"),
            )
            .into());
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(len_buf) as usize))
}
