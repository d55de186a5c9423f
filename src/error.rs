//! Error types for k2.
//!
//! This module defines the unified error enum used throughout the crate and the
//! protocol error taxonomy produced by the wire decoder. All fallible operations
//! return `Result<T, Error>`. Because the protocol has no error-response frame,
//! every error that reaches a connection session ends that session; the variant
//! only decides how the failure is logged and whether it is process-wide.
//!
//! - `Protocol` -> per-connection, session closed
//! - `UnsupportedRequest` -> per-connection, controlled close
//! - `Io` -> per-connection transport failure
//! - `Storage` -> process-wide, the log writer has stopped
//! - `WriterClosed` -> process-wide, the log writer is gone
//! - `InvalidArgument` -> caller misuse of a local API

use std::path::PathBuf;

use crate::types::RequestType;

/// A violation of the wire format. Any of these aborts the whole request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The envelope ended before a header field could be read.
    #[error("truncated request: needed {needed} bytes for {field}, {available} available")]
    Truncated {
        /// Name of the field being read.
        field: &'static str,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes left in the envelope.
        available: usize,
    },

    /// A message length prefix or message header runs past the end of the batch.
    #[error("truncated message: message size {declared} with only {available} bytes remaining")]
    TruncatedMessage {
        /// Length the frame claims.
        declared: usize,
        /// Bytes actually left.
        available: usize,
    },

    /// The batch length field disagrees with the bytes actually received.
    #[error("client specifies {declared} bytes of messages but sent {actual}")]
    LengthMismatch {
        /// Value of the batch length field.
        declared: usize,
        /// Bytes remaining in the envelope after the field.
        actual: usize,
    },

    /// The first byte of a message body is not a known magic value.
    #[error("incorrect/unsupported magic: {0:#04x}")]
    UnsupportedMagic(u8),

    /// The CRC-32 carried by the message does not match its payload.
    #[error("checksum mismatch: client={claimed:#010x} computed={computed:#010x}")]
    ChecksumMismatch {
        /// Checksum sent by the client.
        claimed: u32,
        /// Checksum computed over the received payload.
        computed: u32,
    },

    /// Bytes were left over after the last complete message in a batch.
    #[error("unexpected trailing bytes: {0} bytes after last message")]
    TrailingBytes(usize),

    /// The request type field holds a value outside the known set.
    #[error("invalid request type: {0}")]
    UnknownRequestType(u16),

    /// The topic name cannot be used to address a partition log.
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),

    /// The envelope length prefix exceeds the configured maximum.
    #[error("envelope of {size} bytes exceeds {max} byte limit")]
    EnvelopeTooLarge {
        /// Length announced by the client.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl ProtocolError {
    /// Short stable label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::Truncated { .. } => "truncated",
            ProtocolError::TruncatedMessage { .. } => "truncated_message",
            ProtocolError::LengthMismatch { .. } => "length_mismatch",
            ProtocolError::UnsupportedMagic(_) => "unsupported_magic",
            ProtocolError::ChecksumMismatch { .. } => "checksum_mismatch",
            ProtocolError::TrailingBytes(_) => "trailing_bytes",
            ProtocolError::UnknownRequestType(_) => "unknown_request_type",
            ProtocolError::InvalidTopic(_) => "invalid_topic",
            ProtocolError::EnvelopeTooLarge { .. } => "envelope_too_large",
        }
    }
}

/// Unified error type for all k2 operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client sent bytes that do not follow the wire format.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client sent a well-formed request of a type this broker does not serve.
    #[error("unsupported {0} request")]
    UnsupportedRequest(RequestType),

    /// A socket read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The log writer could not create or append to a partition file.
    #[error("storage error on {}: {source}", path.display())]
    Storage {
        /// Partition file that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The log writer task is no longer accepting requests.
    #[error("log writer closed")]
    WriterClosed,

    /// A local API was called with an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Returns `true` for failures that concern the whole process rather than a
    /// single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::WriterClosed)
    }
}
