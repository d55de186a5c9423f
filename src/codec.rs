//! Wire codec for the k2 produce protocol.
//!
//! This module turns envelope bytes into validated messages and back. It is
//! pure data transformation -- no socket I/O, no async, no file handling.
//!
//! All integers are big-endian. A request body starts with a fixed header
//! (`u16 request type | u16 topic length | topic | u32 partition`); a produce
//! body follows with `u32 batch length` and a run of messages, each framed as
//! `u32 length | magic | [attributes] | u32 crc32 | payload`.
//!
//! Decoding works on [`Bytes`] so that every accepted message keeps a zero-copy
//! handle on its exact on-wire frame. Partition log files are a plain
//! concatenation of those frames, so [`decode_messages`] also replays them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::checksum;
use crate::error::{Error, ProtocolError};
use crate::types::{
    DecodedMessage, FramedMessage, LENGTH_PREFIX_SIZE, MAGIC_V0, MAGIC_V1, Magic, ProduceRequest,
    RequestHeader, RequestType,
};

/// Size of the checksum field inside a message body.
const CHECKSUM_SIZE: usize = 4;

/// Ensure `buf` holds at least `needed` bytes before reading `field`.
fn require(buf: &Bytes, needed: usize, field: &'static str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Validate a topic name taken from the wire.
///
/// A produce topic becomes part of a file name, so it must be UTF-8 and must
/// not contain path separators or NUL, nor be `.` or `..`. The empty topic is
/// allowed and maps to `-<partition>.k2`.
fn validate_topic(raw: &[u8]) -> Result<String, ProtocolError> {
    let topic = std::str::from_utf8(raw)
        .map_err(|e| ProtocolError::InvalidTopic(format!("not UTF-8: {e}")))?;
    if topic == "." || topic == ".." || topic.contains(['/', '\\', '\0']) {
        return Err(ProtocolError::InvalidTopic(format!("{topic:?}")));
    }
    Ok(topic.to_string())
}

/// Decode one message starting at its length prefix, advancing `buf` past it.
///
/// `buf` holds the unread remainder of the batch. On success the returned
/// [`FramedMessage::framed`] is the exact slice consumed, prefix included.
///
/// A version 1 message with a non-zero attributes byte is accepted; the byte is
/// passed through unchanged and a warning is logged.
///
/// # Errors
///
/// - [`ProtocolError::TruncatedMessage`] if fewer than 4 bytes remain or the
///   length prefix exceeds what follows it.
/// - [`ProtocolError::Truncated`] if the message body is too short for its header.
/// - [`ProtocolError::UnsupportedMagic`] for a magic byte other than 0 or 1.
/// - [`ProtocolError::ChecksumMismatch`] if the payload does not match its CRC.
pub fn decode_message(buf: &mut Bytes) -> Result<FramedMessage, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::TruncatedMessage {
            declared: LENGTH_PREFIX_SIZE,
            available: buf.len(),
        });
    }
    let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let available = buf.len() - LENGTH_PREFIX_SIZE;
    if msg_len > available {
        return Err(ProtocolError::TruncatedMessage {
            declared: msg_len,
            available,
        });
    }

    let framed = buf.split_to(LENGTH_PREFIX_SIZE + msg_len);
    let mut body = framed.slice(LENGTH_PREFIX_SIZE..);

    require(&body, 1, "magic")?;
    let magic = match body.get_u8() {
        MAGIC_V0 => Magic::V0,
        MAGIC_V1 => {
            require(&body, 1, "attributes")?;
            let attributes = body.get_u8();
            if attributes != 0 {
                tracing::warn!("unsupported attributes: {attributes:#04x}");
            }
            Magic::V1 { attributes }
        }
        other => return Err(ProtocolError::UnsupportedMagic(other)),
    };

    require(&body, CHECKSUM_SIZE, "checksum")?;
    let claimed = body.get_u32();
    let payload = body;

    if !checksum::verify(&payload, claimed) {
        return Err(ProtocolError::ChecksumMismatch {
            claimed,
            computed: checksum::compute(&payload),
        });
    }

    Ok(FramedMessage {
        message: DecodedMessage {
            magic,
            checksum: claimed,
            payload,
        },
        framed,
    })
}

/// Decode a concatenation of framed messages.
///
/// Messages are decoded while more than 4 bytes remain; any remainder after
/// that is rejected. The first error aborts the whole run and no messages are
/// returned, so a caller never sees a partially decoded batch.
///
/// # Errors
///
/// Any error from [`decode_message`], or [`ProtocolError::TrailingBytes`] if
/// 1 to 4 bytes are left after the last message.
pub fn decode_messages(mut buf: Bytes) -> Result<Vec<FramedMessage>, ProtocolError> {
    let mut messages = Vec::new();
    while buf.len() > LENGTH_PREFIX_SIZE {
        messages.push(decode_message(&mut buf)?);
    }
    if !buf.is_empty() {
        return Err(ProtocolError::TrailingBytes(buf.len()));
    }
    Ok(messages)
}

/// Decode the fixed request header, advancing `buf` past it.
///
/// # Errors
///
/// - [`ProtocolError::Truncated`] if the envelope ends inside the header.
/// - [`ProtocolError::UnknownRequestType`] for a request type outside 0..=4.
/// - [`ProtocolError::InvalidTopic`] if a produce topic cannot name a
///   partition log. Topics of other request types are only decoded, lossily.
pub fn decode_header(buf: &mut Bytes) -> Result<RequestHeader, ProtocolError> {
    require(buf, 2, "request type")?;
    let raw_type = buf.get_u16();

    require(buf, 2, "topic length")?;
    let topic_len = buf.get_u16() as usize;

    require(buf, topic_len, "topic")?;
    let topic_bytes = buf.split_to(topic_len);

    require(buf, 4, "partition")?;
    let partition = buf.get_u32();

    let request_type = RequestType::try_from(raw_type)?;
    let topic = match request_type {
        RequestType::Produce => validate_topic(&topic_bytes)?,
        _ => String::from_utf8_lossy(&topic_bytes).into_owned(),
    };

    Ok(RequestHeader {
        request_type,
        topic,
        partition,
    })
}

/// Decode the body of a produce request that follows the header.
///
/// # Errors
///
/// - [`ProtocolError::Truncated`] if the batch length field is missing.
/// - [`ProtocolError::LengthMismatch`] if the batch length does not equal the
///   bytes remaining in the envelope.
/// - Any error from [`decode_messages`].
fn decode_produce_body(mut buf: Bytes) -> Result<Vec<FramedMessage>, ProtocolError> {
    require(&buf, LENGTH_PREFIX_SIZE, "batch length")?;
    let declared = buf.get_u32() as usize;
    if declared != buf.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }
    decode_messages(buf)
}

/// Decode a whole envelope (without its length prefix) into a produce request.
///
/// The request is returned only if every message in the batch is valid.
///
/// # Errors
///
/// - [`Error::Protocol`] for any framing, length or checksum violation.
/// - [`Error::UnsupportedRequest`] for fetch, multi-fetch, multi-produce and
///   offsets requests; their bodies are not examined.
pub fn decode_request(mut envelope: Bytes) -> Result<ProduceRequest, Error> {
    let header = decode_header(&mut envelope)?;
    match header.request_type {
        RequestType::Produce => {
            let messages = decode_produce_body(envelope)?;
            Ok(ProduceRequest {
                topic: header.topic,
                partition: header.partition,
                messages,
            })
        }
        other => Err(Error::UnsupportedRequest(other)),
    }
}

/// Encode one message frame, length prefix included, computing its checksum.
pub fn encode_message(magic: Magic, payload: &[u8]) -> Bytes {
    let body_len = magic.header_len() + CHECKSUM_SIZE + payload.len();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(magic.byte());
    if let Some(attributes) = magic.attributes() {
        buf.put_u8(attributes);
    }
    buf.put_u32(checksum::compute(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a request header.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the topic is longer than `u16::MAX` bytes.
pub fn encode_header(
    request_type: RequestType,
    topic: &str,
    partition: u32,
) -> Result<BytesMut, Error> {
    let topic_len = u16::try_from(topic.len()).map_err(|_| {
        Error::InvalidArgument(format!("topic of {} bytes exceeds u16 length", topic.len()))
    })?;
    let mut buf = BytesMut::with_capacity(2 + 2 + topic.len() + 4);
    buf.put_u16(request_type as u16);
    buf.put_u16(topic_len);
    buf.put_slice(topic.as_bytes());
    buf.put_u32(partition);
    Ok(buf)
}

/// Encode a produce request body from already framed messages.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the topic is too long or the batch
/// exceeds `u32::MAX` bytes.
pub fn encode_produce_request<M: AsRef<[u8]>>(
    topic: &str,
    partition: u32,
    frames: &[M],
) -> Result<Bytes, Error> {
    let batch_len: usize = frames.iter().map(|f| f.as_ref().len()).sum();
    let batch_len_u32 = u32::try_from(batch_len)
        .map_err(|_| Error::InvalidArgument(format!("batch of {batch_len} bytes too large")))?;

    let mut buf = encode_header(RequestType::Produce, topic, partition)?;
    buf.reserve(LENGTH_PREFIX_SIZE + batch_len);
    buf.put_u32(batch_len_u32);
    for frame in frames {
        buf.put_slice(frame.as_ref());
    }
    Ok(buf.freeze())
}

/// Prefix a request body with its big-endian envelope length.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the body exceeds `u32::MAX` bytes.
pub fn encode_envelope(body: &[u8]) -> Result<Bytes, Error> {
    let len = u32::try_from(body.len()).map_err(|_| {
        Error::InvalidArgument(format!("envelope of {} bytes too large", body.len()))
    })?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(len);
    buf.put_slice(body);
    Ok(buf.freeze())
}
