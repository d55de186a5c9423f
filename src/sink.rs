//! Storage capability used by connection sessions.
//!
//! A [`Sink`] receives every accepted message exactly as it arrived on the
//! wire. Two implementations exist: [`WriterHandle`](crate::writer::WriterHandle)
//! appends to per-partition log files, and [`DiscardSink`] only logs.

use std::future::Future;

use bytes::Bytes;

use crate::error::Error;

/// Destination for accepted messages.
///
/// Sessions call [`write`](Sink::write) once per message, in batch order, and
/// wait for it to resolve before submitting the next one. An `Err` ends the
/// session that made the call.
pub trait Sink: Clone + Send + Sync + 'static {
    /// Record one framed message for `topic`/`partition`.
    ///
    /// `message` is the full frame, length prefix included. Implementations
    /// must store it unchanged.
    fn write(
        &self,
        topic: &str,
        partition: u32,
        message: Bytes,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A sink that logs each message and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl Sink for DiscardSink {
    async fn write(&self, topic: &str, partition: u32, message: Bytes) -> Result<(), Error> {
        tracing::info!(topic, partition, bytes = message.len(), "discarding message");
        Ok(())
    }
}
