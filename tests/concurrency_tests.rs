//! Concurrent access to the overlay: the dispatcher table and the per-node
//! locks must keep parallel callers consistent.

use std::fs;
use std::sync::Arc;
use std::thread;

use driftfs::overlay::CallCtx;
use driftfs::overlay_stack;

fn ctx() -> CallCtx {
    CallCtx::new(1000, 1000)
}

#[test]
fn test_parallel_writers_to_distinct_files() {
    let origin = tempfile::tempdir().unwrap();
    let fs_ = overlay_stack(origin.path()).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let fs_ = Arc::clone(&fs_);
        handles.push(thread::spawn(move || {
            let name = format!("file-{}", i);
            let handle = fs_.create(&name, 0, 0o644, &ctx()).unwrap();
            for round in 0..32u64 {
                handle.write(format!("{}:{};", i, round).as_bytes(), round * 8).unwrap();
            }
            name
        }));
    }

    for h in handles {
        let name = h.join().unwrap();
        let attr = fs_.getattr(&name).unwrap();
        assert!(attr.size > 0);
    }
    assert_eq!(fs_.open_dir("").unwrap().len(), 8);
}

#[test]
fn test_parallel_writers_to_one_file_keep_it_coherent() {
    let origin = tempfile::tempdir().unwrap();
    let fs_ = overlay_stack(origin.path()).unwrap();
    let handle = fs_.create("shared", 0, 0o644, &ctx()).unwrap();

    // Each thread owns a disjoint 64-byte region, so whatever the
    // interleaving, the final bytes are fully determined.
    let mut workers = Vec::new();
    for i in 0..4u64 {
        let handle = handle.clone();
        workers.push(thread::spawn(move || {
            let payload = vec![b'a' + i as u8; 64];
            handle.write(&payload, i * 64).unwrap();
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    let data = handle.read(256, 0).unwrap();
    assert_eq!(data.len(), 256);
    for i in 0..4usize {
        assert!(data[i * 64..(i + 1) * 64]
            .iter()
            .all(|&b| b == b'a' + i as u8));
    }
}

#[test]
fn test_readers_see_writes_on_same_path() {
    let origin = tempfile::tempdir().unwrap();
    fs::write(origin.path().join("a"), b"0000000000").unwrap();
    let fs_ = overlay_stack(origin.path()).unwrap();

    let writer = fs_.open("a", libc::O_RDWR, &ctx()).unwrap();
    writer.write(b"1111", 3).unwrap();

    // A second open of the same path shares the same overlay node
    let reader = fs_.open("a", libc::O_RDONLY, &ctx()).unwrap();
    assert_eq!(reader.read(10, 0).unwrap(), b"0001111000");
}

#[test]
fn test_parallel_materialization_of_one_path() {
    let origin = tempfile::tempdir().unwrap();
    fs::write(origin.path().join("a"), b"hello").unwrap();
    let fs_ = overlay_stack(origin.path()).unwrap();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let fs_ = Arc::clone(&fs_);
        workers.push(thread::spawn(move || {
            fs_.open("a", libc::O_RDONLY, &ctx()).unwrap().read(5, 0).unwrap()
        }));
    }
    for w in workers {
        assert_eq!(w.join().unwrap(), b"hello");
    }
}

#[test]
fn test_parallel_unlinks_of_one_path() {
    let origin = tempfile::tempdir().unwrap();
    fs::write(origin.path().join("victim"), b"x").unwrap();
    let fs_ = overlay_stack(origin.path()).unwrap();

    let mut workers = Vec::new();
    for _ in 0..8 {
        let fs_ = Arc::clone(&fs_);
        workers.push(thread::spawn(move || fs_.unlink("victim", &ctx())));
    }
    for w in workers {
        // Removal is idempotent: every racer reports success
        assert!(w.join().unwrap().is_ok());
    }
    assert_eq!(fs_.getattr("victim").unwrap_err(), libc::ENOENT);
    assert!(origin.path().join("victim").exists());
}
