//! Integration tests for block chains sharing one container file.
//!
//! Covers the on-disk format against a hand-built fixture, reopening a
//! container, first-fit reuse of freed blocks and concurrent writers.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use kakera_blocks::{AccessMode, BlockStore, StoreConfig, VirtualStream};

// ============================================================================
// Helpers
// ============================================================================

fn open(path: &Path, block_size: u64) -> Arc<BlockStore> {
    let config = StoreConfig::new().with_block_size(block_size);
    Arc::new(BlockStore::open(path, &config).unwrap())
}

fn write_stream(store: &Arc<BlockStore>, data: &[u8]) -> i64 {
    let mut stream = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
    stream.write_all(data).unwrap();
    stream.close().unwrap().head
}

fn read_stream(store: &Arc<BlockStore>, head: i64) -> Vec<u8> {
    let mut stream = VirtualStream::open(store.clone(), head, AccessMode::ReadOnly).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

/// A 32-byte-block container holding one stream with the bytes 1..=8.
fn fixture_bytes() -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&32i64.to_be_bytes());
    bytes.extend_from_slice(&0x2fi64.to_be_bytes());
    bytes.extend_from_slice(&(-1i64).to_be_bytes());
    bytes.extend_from_slice(&8i64.to_be_bytes());
    bytes.extend_from_slice(&8i64.to_be_bytes());
    bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    bytes.extend_from_slice(&[0; 8]);
    bytes
}

// ============================================================================
// Format
// ============================================================================

#[test]
fn test_reads_existing_fixture() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.kkr");
    std::fs::write(&path, fixture_bytes()).unwrap();

    // The block size in the header wins over the configured one.
    let store = open(&path, 1024);
    assert_eq!(store.block_size(), 32);
    assert_eq!(read_stream(&store, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_writes_fixture_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("written.kkr");
    let store = open(&path, 32);

    let head = write_stream(&store, &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(head, 8);
    assert_eq!(std::fs::read(&path).unwrap(), fixture_bytes());
}

#[test]
fn test_hello_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.kkr");

    let head = {
        let store = open(&path, 64);
        write_stream(&store, b"hello")
    };

    let store = open(&path, 64);
    assert_eq!(read_stream(&store, head), b"hello");
}

// ============================================================================
// Multiple chains
// ============================================================================

#[test]
fn test_interleaved_streams_stay_separate() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("two.kkr"), 32);

    let mut a = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
    let mut b = VirtualStream::open(store.clone(), -1, AccessMode::ReadWrite).unwrap();
    for i in 0..10u8 {
        a.write_all(&[b'a'; 13]).unwrap();
        b.write_all(&[i; 7]).unwrap();
    }
    let head_a = a.close().unwrap().head;
    let head_b = b.close().unwrap().head;
    assert_ne!(head_a, head_b);

    assert_eq!(read_stream(&store, head_a), vec![b'a'; 130]);
    let expected_b: Vec<u8> = (0..10u8).flat_map(|i| [i; 7]).collect();
    assert_eq!(read_stream(&store, head_b), expected_b);
}

#[test]
fn test_deleted_chain_is_reused_first() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("reuse.kkr"), 32);

    let first = write_stream(&store, b"first");
    let second = write_stream(&store, b"second");
    let len_before = store.file_len().unwrap();

    store.free_chain(first as u64).unwrap();
    let third = write_stream(&store, b"third");
    assert_eq!(third, first);
    assert_eq!(store.file_len().unwrap(), len_before);

    assert_eq!(read_stream(&store, second), b"second");
    assert_eq!(read_stream(&store, third), b"third");
}

#[test]
fn test_random_access_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seek.kkr");
    let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    let head = write_stream(&open(&path, 48), &data);

    let store = open(&path, 48);
    let mut stream = VirtualStream::open(store, head, AccessMode::ReadOnly).unwrap();
    for offset in [0u64, 31, 32, 33, 500, 999] {
        stream.seek(SeekFrom::Start(offset)).unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, &data[offset as usize..], "offset {offset}");
    }
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_writers_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("threads.kkr"), 32);

    let handles: Vec<_> = (0..8u8)
        .map(|n| {
            let store = store.clone();
            thread::spawn(move || {
                let data: Vec<u8> = (0..300u32).map(|i| (i as u8).wrapping_mul(n + 1)).collect();
                let mut stream =
                    VirtualStream::open(store, -1, AccessMode::ReadWrite).unwrap();
                for chunk in data.chunks(11) {
                    stream.write_all(chunk).unwrap();
                }
                (stream.close().unwrap().head, data)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (head, data) in &results {
        assert_eq!(&read_stream(&store, *head), data);
    }

    let mut heads: Vec<_> = results.iter().map(|(head, _)| *head).collect();
    heads.sort();
    heads.dedup();
    assert_eq!(heads.len(), 8);

    let stats = store.stats().unwrap();
    assert_eq!(stats.free_blocks, 0);
}
