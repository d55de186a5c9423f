//! k2: the ingestion path of a minimal message broker.
//!
//! Clients send length-framed produce requests over TCP; each validated message
//! is appended, byte for byte, to the log file of its topic partition by a
//! single writer task.

pub mod checksum;
pub mod codec;
pub mod error;
pub mod metrics;
pub mod server;
pub mod session;
pub mod sink;
pub mod types;
pub mod writer;

pub use error::{Error, ProtocolError};
pub use server::serve;
pub use session::{DEFAULT_MAX_ENVELOPE_SIZE, Session, SessionSettings};
pub use sink::{DiscardSink, Sink};
pub use types::{
    DecodedMessage, FramedMessage, Magic, PartitionKey, ProduceRequest, RequestHeader, RequestType,
};
pub use writer::{PartitionLogs, WriterHandle, spawn_writer};

#[cfg(test)]
mod tests {
    // Tests use fully-qualified `crate::` paths to confirm re-exports resolve.

    #[test]
    fn reexport_request_type() {
        assert_eq!(crate::RequestType::Produce as u16, 0);
    }

    #[test]
    fn reexport_partition_key() {
        assert_eq!(crate::PartitionKey::new("t", 0).to_string(), "t-0");
    }

    #[test]
    fn reexport_error() {
        let err = crate::Error::from(crate::ProtocolError::UnsupportedMagic(9));
        assert!(err.to_string().contains("0x09"));
    }

    #[test]
    fn reexport_session_settings_default() {
        assert_eq!(
            crate::SessionSettings::default().max_envelope_size,
            crate::DEFAULT_MAX_ENVELOPE_SIZE
        );
    }
}
