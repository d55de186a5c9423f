//! Integration tests for the log writer public API.
//!
//! Verifies that `WriterHandle`, `PartitionLogs` and `spawn_writer` are
//! accessible at the crate root and work together end-to-end: spawn the writer
//! against a tempdir, append messages, and replay the partition files.

use std::num::NonZeroUsize;

use k2::codec::{decode_messages, encode_message};
use k2::{Error, Magic, PartitionKey, PartitionLogs, Sink, WriterHandle, spawn_writer};

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).expect("nonzero")
}

#[tokio::test]
async fn spawn_writer_append_then_replay() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let (handle, join_handle) = spawn_writer(dir.path(), capacity(8));

    // Proves the crate-root re-export.
    let _: &WriterHandle = &handle;

    let first = encode_message(Magic::V0, b"first");
    let second = encode_message(Magic::V1 { attributes: 0 }, b"second");

    handle
        .append(PartitionKey::new("orders", 0), first.clone())
        .await
        .expect("first append should succeed");
    handle
        .write("orders", 0, second.clone())
        .await
        .expect("second append should succeed");

    drop(handle);
    join_handle
        .await
        .expect("writer task should not panic")
        .expect("writer should exit cleanly");

    let path = PartitionLogs::new(dir.path()).path_for(&PartitionKey::new("orders", 0));
    assert_eq!(path, dir.path().join("orders-0.k2"));

    let contents = std::fs::read(&path).expect("partition file should exist");
    assert_eq!(contents, [&first[..], &second[..]].concat());

    let replayed = decode_messages(contents.into()).expect("log should replay");
    let payloads: Vec<&[u8]> = replayed.iter().map(|m| &m.message.payload[..]).collect();
    assert_eq!(payloads, vec![&b"first"[..], &b"second"[..]]);
}

#[tokio::test]
async fn partitions_get_separate_files() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let (handle, join_handle) = spawn_writer(dir.path(), capacity(4));

    let a = encode_message(Magic::V0, b"a");
    let b = encode_message(Magic::V0, b"b");
    let c = encode_message(Magic::V0, b"c");

    handle.write("t", 0, a.clone()).await.expect("append a");
    handle.write("t", 1, b.clone()).await.expect("append b");
    handle.write("u", 0, c.clone()).await.expect("append c");

    drop(handle);
    join_handle.await.expect("no panic").expect("clean exit");

    assert_eq!(std::fs::read(dir.path().join("t-0.k2")).expect("t-0"), a.to_vec());
    assert_eq!(std::fs::read(dir.path().join("t-1.k2")).expect("t-1"), b.to_vec());
    assert_eq!(std::fs::read(dir.path().join("u-0.k2")).expect("u-0"), c.to_vec());
}

#[tokio::test]
async fn restart_appends_to_existing_log() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let before = encode_message(Magic::V0, b"before restart");
    let after = encode_message(Magic::V0, b"after restart");

    {
        let (handle, join_handle) = spawn_writer(dir.path(), capacity(4));
        handle.write("t", 0, before.clone()).await.expect("append");
        drop(handle);
        join_handle.await.expect("no panic").expect("clean exit");
    }
    {
        let (handle, join_handle) = spawn_writer(dir.path(), capacity(4));
        handle.write("t", 0, after.clone()).await.expect("append");
        drop(handle);
        join_handle.await.expect("no panic").expect("clean exit");
    }

    let contents = std::fs::read(dir.path().join("t-0.k2")).expect("partition file");
    let replayed = decode_messages(contents.into()).expect("log should replay");
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].framed, before);
    assert_eq!(replayed[1].framed, after);
}

#[tokio::test]
async fn missing_data_dir_fails_writer() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let missing = dir.path().join("does-not-exist");
    let (handle, join_handle) = spawn_writer(&missing, capacity(4));

    let err = handle
        .write("t", 0, encode_message(Magic::V0, b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Storage { .. }), "got: {err:?}");

    let exit = join_handle.await.expect("writer task should not panic");
    assert!(
        matches!(exit, Err(Error::Storage { .. })),
        "writer should report the storage failure, got: {exit:?}"
    );

    // Every later append sees a closed writer.
    let err = handle
        .write("t", 0, encode_message(Magic::V0, b"y"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WriterClosed), "got: {err:?}");
}
