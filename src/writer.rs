//! Single-writer log task for k2.
//!
//! This module provides the `WriteRequest` struct, the `WriterHandle` that
//! connection sessions use to submit messages, and the writer task that owns
//! every partition log file. Sessions never touch files: all appends flow
//! through one bounded `tokio::mpsc` channel and are applied in channel order.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::sink::Sink;
use crate::types::PartitionKey;

/// A request to append one framed message, sent to the writer task.
///
/// # Fields
///
/// * `key` - Partition whose log receives the message.
/// * `message` - Full on-wire frame to append verbatim.
/// * `response_tx` - Oneshot channel for sending the result back to the caller.
pub struct WriteRequest {
    /// Partition whose log receives the message.
    pub key: PartitionKey,
    /// Full on-wire frame to append verbatim.
    pub message: Bytes,
    /// Oneshot channel for sending the result back to the caller.
    pub response_tx: oneshot::Sender<Result<(), Error>>,
}

/// Cloneable handle for submitting appends to the writer task.
///
/// Every connection session holds a clone. The writer task processes requests
/// sequentially on the other end of the bounded channel, so a full channel
/// makes `append` wait until the writer catches up.
#[derive(Clone)]
pub struct WriterHandle {
    /// Sender half of the bounded mpsc channel to the writer task.
    tx: mpsc::Sender<WriteRequest>,
}

impl WriterHandle {
    /// Create a new `WriterHandle` from the sender half of an mpsc channel.
    pub fn new(tx: mpsc::Sender<WriteRequest>) -> Self {
        Self { tx }
    }

    /// Submit one message to the writer task and await the append result.
    ///
    /// # Errors
    ///
    /// - Returns the writer's [`Error::Storage`] if the append itself failed.
    /// - Returns [`Error::WriterClosed`] if the writer task has stopped.
    pub async fn append(&self, key: PartitionKey, message: Bytes) -> Result<(), Error> {
        let (response_tx, response_rx) = oneshot::channel();

        let request = WriteRequest {
            key,
            message,
            response_tx,
        };

        self.tx
            .send(request)
            .await
            .map_err(|_| Error::WriterClosed)?;

        // A dropped oneshot means the writer stopped before reaching this request.
        response_rx.await.map_err(|_| Error::WriterClosed)?
    }
}

impl Sink for WriterHandle {
    async fn write(&self, topic: &str, partition: u32, message: Bytes) -> Result<(), Error> {
        self.append(PartitionKey::new(topic, partition), message).await
    }
}

/// The set of open partition log files.
///
/// Owned exclusively by the writer task. Files are opened lazily on the first
/// message for a partition, in create + append mode, and stay open until the
/// writer exits.
#[derive(Debug)]
pub struct PartitionLogs {
    /// Directory holding every partition file.
    dir: PathBuf,
    /// Open append handles, keyed by partition.
    files: HashMap<PartitionKey, File>,
}

impl PartitionLogs {
    /// Create an empty set rooted at `dir`. No files are touched.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: HashMap::new(),
        }
    }

    /// Path of the log file for `key`.
    pub fn path_for(&self, key: &PartitionKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Number of partition files currently open.
    pub fn open_count(&self) -> usize {
        self.files.len()
    }

    /// Append `message` to the log for `key`, opening the file if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be opened or written.
    pub fn append(&mut self, key: &PartitionKey, message: &[u8]) -> Result<(), Error> {
        let path = self.path_for(key);
        let file = match self.files.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = open_partition_file(&path)?;
                tracing::info!(path = %path.display(), "created partition log");
                counter!("k2_partition_files_opened_total").increment(1);
                entry.insert(file)
            }
        };

        file.write_all(message)
            .map_err(|source| Error::Storage { path, source })?;
        counter!("k2_bytes_appended_total").increment(message.len() as u64);
        Ok(())
    }

    /// Flush every open file to stable storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for the first file that fails to sync.
    pub fn sync_all(&self) -> Result<(), Error> {
        for (key, file) in &self.files {
            file.sync_all().map_err(|source| Error::Storage {
                path: self.dir.join(key.file_name()),
                source,
            })?;
        }
        Ok(())
    }
}

/// Open (or create) a partition file for appending.
fn open_partition_file(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| Error::Storage {
            path: path.to_path_buf(),
            source,
        })
}

/// Build the error reported to the session whose append failed.
///
/// `std::io::Error` is not `Clone`, so the session receives a copy carrying the
/// same kind and message while the original is returned from the task.
fn reply_for(err: &Error) -> Error {
    match err {
        Error::Storage { path, source } => Error::Storage {
            path: path.clone(),
            source: std::io::Error::new(source.kind(), source.to_string()),
        },
        _ => Error::WriterClosed,
    }
}

/// Run the writer task loop.
///
/// Receives `WriteRequest`s from the channel and appends each one in order.
/// On each iteration the first request is received with `recv()`, then any
/// already queued requests are drained with `try_recv()`.
///
/// A storage failure is fatal: the failing request is answered with the error,
/// every other queued request observes [`Error::WriterClosed`], and the task
/// returns the error so the supervisor can shut the process down. When all
/// handles are dropped the loop syncs every open file and returns `Ok`.
///
/// # Errors
///
/// Returns [`Error::Storage`] for the first failed open, write or final sync.
pub(crate) async fn run_writer(
    mut logs: PartitionLogs,
    mut rx: mpsc::Receiver<WriteRequest>,
) -> Result<(), Error> {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(req) = rx.try_recv() {
            batch.push(req);
        }

        for req in batch {
            if let Err(err) = logs.append(&req.key, &req.message) {
                tracing::error!(partition = %req.key, error = %err, "log writer failed, stopping");
                let _ = req.response_tx.send(Err(reply_for(&err)));
                return Err(err);
            }

            if req.response_tx.send(Ok(())).is_err() {
                tracing::warn!(partition = %req.key, "writer: response receiver dropped");
            }
        }
    }

    // Channel closed -- every WriterHandle has been dropped.
    logs.sync_all()?;
    tracing::info!(files = logs.open_count(), "log writer stopped");
    Ok(())
}

/// Spawn the writer task on the tokio runtime.
///
/// # Arguments
///
/// * `data_dir` - Existing directory that holds the partition files.
/// * `channel_capacity` - Bound on the mpsc channel. Controls backpressure.
///
/// # Returns
///
/// A tuple of:
/// - `WriterHandle` -- cloneable sender for submitting appends.
/// - `JoinHandle<Result<(), Error>>` -- resolves when the writer exits, with the
///   fatal storage error if there was one.
pub fn spawn_writer(
    data_dir: impl Into<PathBuf>,
    channel_capacity: NonZeroUsize,
) -> (WriterHandle, JoinHandle<Result<(), Error>>) {
    let logs = PartitionLogs::new(data_dir);
    let (tx, rx) = mpsc::channel(channel_capacity.get());
    let join_handle = tokio::spawn(run_writer(logs, rx));
    (WriterHandle::new(tx), join_handle)
}
