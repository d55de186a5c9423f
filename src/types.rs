//! Core domain types for k2.
//!
//! This module defines the data types shared by the decoder, the connection
//! session and the sinks: request types, the decoded request header, decoded
//! messages together with their on-wire framed span, and the partition key used
//! to address a partition log file.

use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;

/// Magic byte selecting the header layout without an attributes byte.
pub const MAGIC_V0: u8 = 0;

/// Magic byte selecting the header layout with an attributes byte.
pub const MAGIC_V1: u8 = 1;

/// Size of every length prefix on the wire (envelope, batch and message).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Extension of partition log files.
pub const PARTITION_FILE_EXTENSION: &str = "k2";

/// The kind of request carried by an envelope.
///
/// Only [`RequestType::Produce`] is served; every other type is recognized so
/// that it can be reported by name before the session is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestType {
    /// Append a batch of messages to one partition.
    Produce = 0,
    /// Read messages from one partition.
    Fetch = 1,
    /// Read messages from several partitions.
    MultiFetch = 2,
    /// Append batches to several partitions.
    MultiProduce = 3,
    /// Query partition offsets.
    Offsets = 4,
}

impl RequestType {
    /// Lowercase name used in log lines and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Produce => "produce",
            RequestType::Fetch => "fetch",
            RequestType::MultiFetch => "multifetch",
            RequestType::MultiProduce => "multiproduce",
            RequestType::Offsets => "offsets",
        }
    }
}

impl TryFrom<u16> for RequestType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestType::Produce),
            1 => Ok(RequestType::Fetch),
            2 => Ok(RequestType::MultiFetch),
            3 => Ok(RequestType::MultiProduce),
            4 => Ok(RequestType::Offsets),
            other => Err(ProtocolError::UnknownRequestType(other)),
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed prefix of every request body.
///
/// Constructed once per envelope and consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Kind of request.
    pub request_type: RequestType,
    /// Topic name (UTF-8, validated).
    pub topic: String,
    /// Partition identifier within the topic.
    pub partition: u32,
}

/// Header layout of a single message, selected by its magic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// `magic | checksum | payload`
    V0,
    /// `magic | attributes | checksum | payload`
    V1 {
        /// Attribute flags. No bits have assigned meaning.
        attributes: u8,
    },
}

impl Magic {
    /// The magic byte as it appears on the wire.
    pub fn byte(self) -> u8 {
        match self {
            Magic::V0 => MAGIC_V0,
            Magic::V1 { .. } => MAGIC_V1,
        }
    }

    /// The attributes byte, present only for version 1.
    pub fn attributes(self) -> Option<u8> {
        match self {
            Magic::V0 => None,
            Magic::V1 { attributes } => Some(attributes),
        }
    }

    /// Bytes between the start of the message body and the checksum.
    pub(crate) fn header_len(self) -> usize {
        match self {
            Magic::V0 => 1,
            Magic::V1 { .. } => 2,
        }
    }
}

/// A validated message whose checksum matched its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    /// Header layout and attributes.
    pub magic: Magic,
    /// CRC-32 (IEEE) of `payload`, as sent by the client.
    pub checksum: u32,
    /// Opaque message contents.
    pub payload: Bytes,
}

/// A decoded message together with the exact bytes it arrived as.
///
/// `framed` starts at the message's own length prefix and is what gets
/// persisted; it is never re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    /// The validated message.
    pub message: DecodedMessage,
    /// The full on-wire frame: length prefix, header and payload.
    pub framed: Bytes,
}

/// A fully validated produce request. Produced only when every message in the
/// batch decoded successfully, so nothing from a bad batch reaches a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    /// Target topic.
    pub topic: String,
    /// Target partition.
    pub partition: u32,
    /// Messages in arrival order.
    pub messages: Vec<FramedMessage>,
}

/// Identifies one partition log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    /// Topic name.
    pub topic: String,
    /// Partition within the topic.
    pub partition: u32,
}

impl PartitionKey {
    /// Create a key for the given topic and partition.
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// File name of this partition's log, e.g. `orders-3.k2`.
    pub fn file_name(&self) -> String {
        format!("{self}.{PARTITION_FILE_EXTENSION}")
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}
