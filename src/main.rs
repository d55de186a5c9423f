use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;

use k2::{DiscardSink, SessionSettings, Sink, spawn_writer};

/// Which sink receives accepted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkKind {
    /// Append to per-partition log files through the writer task.
    Log,
    /// Log each message and store nothing.
    Discard,
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(SinkKind::Log),
            "discard" => Ok(SinkKind::Discard),
            other => Err(format!(
                "K2_SINK must be \"log\" or \"discard\", got {other:?}"
            )),
        }
    }
}

/// Server configuration parsed from environment variables.
///
/// # Environment Variables
///
/// | Variable               | Required | Default          | Description                          |
/// |------------------------|----------|------------------|--------------------------------------|
/// | `K2_LISTEN`            | No       | `127.0.0.1:9092` | Socket address to listen on          |
/// | `K2_DATA_DIR`          | No       | `.`              | Directory for partition log files    |
/// | `K2_SINK`              | No       | `log`            | `log` or `discard`                   |
/// | `K2_WRITER_CAPACITY`   | No       | `64`             | Log writer channel bound             |
/// | `K2_MAX_ENVELOPE_SIZE` | No       | `67108864`       | Largest accepted envelope in bytes   |
/// | `K2_METRICS_LISTEN`    | No       | --               | Prometheus endpoint (enables metrics)|
#[derive(Debug, Clone, PartialEq)]
struct Config {
    /// Socket address the broker listens on.
    listen_addr: SocketAddr,
    /// Directory holding partition log files.
    data_dir: PathBuf,
    /// Sink selected at startup.
    sink: SinkKind,
    /// Bound on the log writer channel.
    writer_capacity: NonZeroUsize,
    /// Largest envelope body accepted from a client.
    max_envelope_size: usize,
    /// Address for the metrics endpoint. `None` disables metrics.
    metrics_addr: Option<SocketAddr>,
}

/// Default socket address when `K2_LISTEN` is not set.
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9092";

/// Default log writer channel bound when `K2_WRITER_CAPACITY` is not set.
const DEFAULT_WRITER_CAPACITY: usize = 64;

impl Config {
    /// Parse server configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` naming the offending variable if any set value
    /// fails to parse, or if `K2_WRITER_CAPACITY` is zero.
    fn from_env() -> Result<Config, String> {
        let listen_addr = std::env::var("K2_LISTEN")
            .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| format!("K2_LISTEN is not a valid socket address: {e}"))?;

        let data_dir = std::env::var("K2_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let sink = match std::env::var("K2_SINK") {
            Ok(val) => val.parse::<SinkKind>()?,
            Err(_) => SinkKind::Log,
        };

        let writer_capacity = match std::env::var("K2_WRITER_CAPACITY") {
            Ok(val) => {
                let raw: usize = val
                    .parse()
                    .map_err(|e| format!("K2_WRITER_CAPACITY is not a valid usize: {e}"))?;
                NonZeroUsize::new(raw)
                    .ok_or_else(|| "K2_WRITER_CAPACITY must be nonzero".to_string())?
            }
            Err(_) => NonZeroUsize::new(DEFAULT_WRITER_CAPACITY)
                .ok_or_else(|| "default writer capacity must be nonzero".to_string())?,
        };

        let max_envelope_size = match std::env::var("K2_MAX_ENVELOPE_SIZE") {
            Ok(val) => val
                .parse::<usize>()
                .map_err(|e| format!("K2_MAX_ENVELOPE_SIZE is not a valid usize: {e}"))?,
            Err(_) => k2::DEFAULT_MAX_ENVELOPE_SIZE,
        };

        let metrics_addr = match std::env::var("K2_METRICS_LISTEN") {
            Ok(val) => Some(
                val.parse::<SocketAddr>()
                    .map_err(|e| format!("K2_METRICS_LISTEN is not a valid socket address: {e}"))?,
            ),
            Err(_) => None,
        };

        Ok(Config {
            listen_addr,
            data_dir,
            sink,
            writer_capacity,
            max_envelope_size,
            metrics_addr,
        })
    }
}

/// Initialize the global `tracing` subscriber with an `EnvFilter`.
///
/// Reads `RUST_LOG`, defaulting to `"info"`. Uses `try_init()` so repeated
/// calls are a silent no-op.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for a shutdown signal: SIGINT on all platforms, plus SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Serve with the durable log writer until a signal arrives or the writer fails.
///
/// Returns the process exit code.
async fn run_with_log_writer(
    listener: tokio::net::TcpListener,
    config: &Config,
    settings: SessionSettings,
) -> i32 {
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!(
            path = %config.data_dir.display(),
            error = %e,
            "Failed to create data directory"
        );
        return 1;
    }

    let (writer, mut writer_join) = spawn_writer(&config.data_dir, config.writer_capacity);

    let mut server = Box::pin(k2::serve(listener, writer.clone(), settings, shutdown_signal()));

    // The writer only stops on its own after a storage failure.
    let early_exit = tokio::select! {
        _ = &mut server => None,
        result = &mut writer_join => Some(result),
    };

    tracing::info!("Shutting down");
    drop(server);
    drop(writer);

    let result = match early_exit {
        Some(result) => result,
        None => writer_join.await,
    };

    match result {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Log writer failed");
            1
        }
        Err(e) => {
            tracing::error!(error = %e, "Log writer task panicked");
            1
        }
    }
}

/// Serve with a sink that has no failure mode of its own.
async fn run_with_sink<S: Sink>(
    listener: tokio::net::TcpListener,
    sink: S,
    settings: SessionSettings,
) -> i32 {
    k2::serve(listener, sink, settings, shutdown_signal()).await;
    tracing::info!("Shutting down");
    0
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    tracing::info!(listen_addr = %config.listen_addr, "Listen address");
    tracing::info!(data_dir = %config.data_dir.display(), "Data directory");
    tracing::info!(sink = ?config.sink, "Sink");
    tracing::info!(writer_capacity = %config.writer_capacity, "Writer capacity");
    tracing::info!(max_envelope_size = config.max_envelope_size, "Max envelope size");

    if let Some(addr) = config.metrics_addr {
        match k2::metrics::install_recorder() {
            Ok(handle) => {
                k2::metrics::serve_metrics(handle, addr);
            }
            Err(e) => tracing::warn!(error = %e, "Metrics disabled"),
        }
    }

    let listener = match k2::server::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.listen_addr, error = %e, "Failed to bind listener");
            std::process::exit(1);
        }
    };
    match listener.local_addr() {
        Ok(addr) => tracing::info!("Server listening on {addr}"),
        Err(e) => tracing::warn!(error = %e, "Listener has no local address"),
    }

    let settings = SessionSettings {
        max_envelope_size: config.max_envelope_size,
    };

    let code = match config.sink {
        SinkKind::Log => run_with_log_writer(listener, &config, settings).await,
        SinkKind::Discard => run_with_sink(listener, DiscardSink, settings).await,
    };

    if code != 0 {
        std::process::exit(code);
    }
}
