//! TCP accept loop for k2.
//!
//! [`serve`] accepts connections on a bound listener and runs one [`Session`]
//! task per connection. Sessions share nothing but a clone of the sink. When
//! the shutdown future resolves, the loop stops accepting and aborts every
//! session still running, which drops their sink clones.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::error::Error;
use crate::session::{Session, SessionSettings};
use crate::sink::Sink;

/// RAII guard that increments the `k2_connections_active` gauge on creation
/// and decrements it on drop, including when a session task is aborted.
struct ConnectionGauge;

impl ConnectionGauge {
    fn new() -> Self {
        counter!("k2_connections_total").increment(1);
        gauge!("k2_connections_active").increment(1.0);
        Self
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        gauge!("k2_connections_active").decrement(1.0);
    }
}

/// Pause after a failed `accept` before trying again. Failures such as fd
/// exhaustion repeat immediately, so retrying without a pause would spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Source of incoming connections.
trait Acceptor {
    type Stream: AsyncRead + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accept connections until `shutdown` resolves.
///
/// Accept failures are logged and the loop keeps going after
/// a short pause.
///
/// # Arguments
///
/// * `listener` - Bound TCP listener.
/// * `sink` - Destination for accepted messages; cloned into every session.
/// * `settings` - Per-session limits.
/// * `shutdown` - Resolves when the server should stop.
pub async fn serve<S, F>(listener: TcpListener, sink: S, settings: SessionSettings, shutdown: F)
where
    S: Sink,
    F: Future<Output = ()> + Send,
{
    accept_loop(&listener, sink, settings, shutdown).await;
}

async fn accept_loop<A, S, F>(acceptor: &A, sink: S, settings: SessionSettings, shutdown: F)
where
    A: Acceptor,
    S: Sink,
    F: Future<Output = ()> + Send,
{
    let mut sessions = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = acceptor.accept() => match accepted {
                Ok((stream, peer)) => {
                    let session = Session::new(sink.clone(), settings.clone());
                    sessions.spawn(
                        handle_connection(stream, session)
                            .instrument(tracing::info_span!("connection", peer = %peer)),
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    tokio::select! {
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                match joined {
                    Err(e) if e.is_panic() => {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                    _ => {}
                }
            }
        }
    }

    tracing::info!(open = sessions.len(), "stopped accepting connections");
    sessions.shutdown().await;
}

/// Run one session to completion and log how it ended.
async fn handle_connection<T, S>(mut stream: T, session: Session<S>)
where
    T: AsyncRead + Unpin + Send,
    S: Sink,
{
    let _gauge = ConnectionGauge::new();
    tracing::info!("accepted connection");

    let result = session.run(&mut stream).await;
    log_outcome(&result);
}

/// Log a finished session. Each connection ends with exactly one line.
fn log_outcome(result: &Result<(), Error>) {
    match result {
        Ok(()) => tracing::info!("client closed connection"),
        Err(Error::UnsupportedRequest(request)) => {
            counter!("k2_unsupported_requests_total", "request" => request.as_str()).increment(1);
            tracing::warn!("client sent unsupported {request} request");
        }
        Err(Error::Protocol(e)) => {
            counter!("k2_protocol_errors_total", "kind" => e.kind()).increment(1);
            tracing::error!(error = %e, "error handling request, closing connection");
        }
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "sink failed, closing connection");
        }
        Err(e) => tracing::error!(error = %e, "connection error"),
    }
}

/// Bind a listener on `addr`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    Ok(TcpListener::bind(addr).await?)
}
