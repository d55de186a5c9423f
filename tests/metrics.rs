//! Integration tests for the Prometheus metrics endpoint.
//!
//! Each test starts an in-process broker and a metrics HTTP endpoint on
//! ephemeral ports, drives the broker over raw TCP and scrapes `GET /metrics`.
//!
//! All tests use `#[serial]` because the metrics recorder is process-global.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use bytes::Bytes;
use k2::codec::{encode_envelope, encode_header, encode_message, encode_produce_request};
use k2::{Magic, RequestType, SessionSettings, metrics, spawn_writer};
use serial_test::serial;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Return value from `start_metrics_test_server`.
struct TestServer {
    /// Address of the broker listener.
    broker_addr: SocketAddr,
    /// Address of the metrics HTTP endpoint.
    metrics_addr: SocketAddr,
    /// Temp directory holding the partition files (must be kept alive).
    _dir: TempDir,
}

/// Spin up a broker and a metrics endpoint, both on ephemeral ports.
///
/// The metrics recorder is installed, or the existing one is reused if an
/// earlier test in this process installed it.
async fn start_metrics_test_server() -> TestServer {
    let _ = metrics::install_recorder();
    let handle = metrics::get_installed_handle()
        .expect("metrics recorder should be installed after install_recorder() call");

    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let (writer_handle, _writer_join) =
        spawn_writer(dir.path(), NonZeroUsize::new(64).expect("nonzero"));

    let listener = k2::server::bind("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("broker bind should succeed");
    let broker_addr = listener.local_addr().expect("should have local addr");
    tokio::spawn(k2::serve(
        listener,
        writer_handle,
        SessionSettings::default(),
        std::future::pending(),
    ));

    let metrics_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("metrics bind should succeed");
    let metrics_addr = metrics_listener
        .local_addr()
        .expect("should have local addr");
    metrics::serve_metrics_on_listener(handle, metrics_listener);

    TestServer {
        broker_addr,
        metrics_addr,
        _dir: dir,
    }
}

/// Send `wire` on a fresh connection and wait until the broker closes it.
async fn send(addr: SocketAddr, wire: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(wire).await.expect("write");
    let _ = stream.shutdown().await;
    let mut buf = [0u8; 1];
    let _ = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
}

async fn scrape_raw(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("should connect to metrics endpoint");

    let request = format!("GET /metrics HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("should write request");

    let mut buf = Vec::with_capacity(4096);
    stream
        .read_to_end(&mut buf)
        .await
        .expect("should read response");

    String::from_utf8(buf).expect("response should be valid UTF-8")
}

/// Scrape `GET /metrics` and return only the body (after the blank line).
async fn scrape_body(addr: SocketAddr) -> String {
    let raw = scrape_raw(addr).await;
    raw.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

/// Extract the numeric value for a metric line from Prometheus-format text.
///
/// Searches for a line starting with `prefix` (e.g.
/// `k2_messages_accepted_total{topic="orders"} `) and returns its value.
fn parse_metric_value(rendered: &str, prefix: &str) -> Option<f64> {
    rendered.lines().find_map(|line| {
        line.strip_prefix(prefix)
            .and_then(|rest| rest.trim().parse::<f64>().ok())
    })
}

fn produce(topic: &str, frames: &[Bytes]) -> Bytes {
    let body = encode_produce_request(topic, 0, frames).expect("encode body");
    encode_envelope(&body).expect("encode envelope")
}

#[tokio::test]
#[serial]
async fn metrics_endpoint_returns_200_with_prometheus_content_type() {
    let server = start_metrics_test_server().await;

    let raw = scrape_raw(server.metrics_addr).await;

    assert!(raw.starts_with("HTTP/1.1 200"), "response: {raw}");
    assert!(
        raw.to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"),
        "response: {raw}"
    );
}

#[tokio::test]
#[serial]
async fn accepted_messages_and_bytes_are_counted() {
    let server = start_metrics_test_server().await;

    let frames = vec![
        encode_message(Magic::V0, b"one"),
        encode_message(Magic::V0, b"two"),
        encode_message(Magic::V0, b"three"),
    ];
    let total_bytes: usize = frames.iter().map(Bytes::len).sum();
    send(server.broker_addr, &produce("metrics-accepted", &frames)).await;

    let body = scrape_body(server.metrics_addr).await;

    let accepted = parse_metric_value(
        &body,
        "k2_messages_accepted_total{topic=\"metrics-accepted\"} ",
    );
    assert_eq!(accepted, Some(3.0), "body: {body}");

    let appended = parse_metric_value(&body, "k2_bytes_appended_total ").unwrap_or(0.0);
    assert!(
        appended >= total_bytes as f64,
        "expected at least {total_bytes} bytes appended, body: {body}"
    );

    let opened = parse_metric_value(&body, "k2_partition_files_opened_total ").unwrap_or(0.0);
    assert!(opened >= 1.0, "body: {body}");

    let connections = parse_metric_value(&body, "k2_connections_total ").unwrap_or(0.0);
    assert!(connections >= 1.0, "body: {body}");
}

#[tokio::test]
#[serial]
async fn protocol_errors_are_counted_by_kind() {
    let server = start_metrics_test_server().await;

    let before = parse_metric_value(
        &scrape_body(server.metrics_addr).await,
        "k2_protocol_errors_total{kind=\"checksum_mismatch\"} ",
    )
    .unwrap_or(0.0);

    let mut frame = encode_message(Magic::V0, b"corrupt").to_vec();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    send(server.broker_addr, &produce("metrics-errors", &[Bytes::from(frame)])).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let body = scrape_body(server.metrics_addr).await;
    let after = parse_metric_value(
        &body,
        "k2_protocol_errors_total{kind=\"checksum_mismatch\"} ",
    )
    .unwrap_or(0.0);
    assert_eq!(after, before + 1.0, "body: {body}");
}

#[tokio::test]
#[serial]
async fn unsupported_requests_are_counted_by_type() {
    let server = start_metrics_test_server().await;

    let header = encode_header(RequestType::MultiFetch, "metrics-unsupported", 0).expect("header");
    send(server.broker_addr, &encode_envelope(&header).expect("envelope")).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let body = scrape_body(server.metrics_addr).await;
    let count = parse_metric_value(
        &body,
        "k2_unsupported_requests_total{request=\"multifetch\"} ",
    );
    assert!(count.is_some_and(|c| c >= 1.0), "body: {body}");
}
