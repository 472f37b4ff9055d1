//! Reopening containers and the metadata collaborator.

use std::fs;
use std::sync::Arc;

use kakera_blocks::{BlockStore, StoreConfig};
use kakera_vfs::{
    AccessMode, Container, ContainerConfig, MemoryMetadata, MetadataStore, VfsError, VfsNode,
};

fn config() -> ContainerConfig {
    ContainerConfig::new().with_block_size(48).with_os_locks(false)
}

#[test]
fn test_hello_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("hello.kkr");

    {
        let c = Container::open_with(&path, &config()).unwrap();
        let file = c.touch("hello.txt").unwrap();
        let mut handle = file.open(AccessMode::ReadWrite).unwrap();
        handle.write(b"hello").unwrap();
        handle.close().unwrap();
        c.close().unwrap();
    }

    let c = Container::open_with(&path, &config()).unwrap();
    let file = c.file_at("/hello.txt").unwrap();
    let mut handle = file.open(AccessMode::ReadOnly).unwrap();
    assert_eq!(handle.read_to_end().unwrap(), b"hello");
}

#[test]
fn test_tree_reloads_with_timestamps() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("tree.kkr");

    let (created, modified, head) = {
        let c = Container::open_with(&path, &config()).unwrap();
        let docs = c.mkdir("docs").unwrap();
        docs.mkdir("empty").unwrap();
        let file = docs.touch("a.txt").unwrap();
        let mut handle = file.open(AccessMode::ReadWrite).unwrap();
        handle.write(&[1u8; 200]).unwrap();
        handle.close().unwrap();
        c.touch("top").unwrap();
        (file.created_at(), file.modified_at(), file.head_block_position())
    };

    let c = Container::open_with(&path, &config()).unwrap();
    assert_eq!(c.root().name(), "root");
    let docs = c.directory_at("docs").unwrap();
    assert!(docs.directory("empty").is_ok());
    let file = docs.file("a.txt").unwrap();
    assert_eq!(file.created_at(), created);
    assert_eq!(file.modified_at(), modified);
    assert_eq!(file.head_block_position(), head);
    assert_eq!(file.len().unwrap(), 200);
    assert_eq!(c.file_at("top").unwrap().head_block_position(), -1);
}

#[test]
fn test_block_size_comes_from_header() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("sized.kkr");

    Container::open_with(&path, &config()).unwrap();
    let c = Container::open_with(&path, &config().with_block_size(4096)).unwrap();
    assert_eq!(c.store().block_size(), 48);
    assert_eq!(fs::read(&path).unwrap()[..8], 48i64.to_be_bytes());
}

#[test]
fn test_busy_tree_defers_persist() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(
        BlockStore::open(
            tmp.path().join("deferred.kkr"),
            &StoreConfig::new().with_os_locks(false),
        )
        .unwrap(),
    );
    let metadata = Arc::new(MemoryMetadata::new());
    let c = Container::with_metadata(store, metadata.clone()).unwrap();
    assert_eq!(metadata.persist_count(), 1);

    let file = c.touch("open.txt").unwrap();
    assert_eq!(metadata.persist_count(), 2);

    let mut handle = file.open(AccessMode::ReadWrite).unwrap();
    c.mkdir("made-while-busy").unwrap();
    assert!(c.has_pending_persist());
    assert_eq!(metadata.persist_count(), 2);
    assert!(matches!(c.close(), Err(VfsError::Locked(_))));

    handle.write(b"x").unwrap();
    handle.close().unwrap();
    assert!(!c.has_pending_persist());
    assert_eq!(metadata.persist_count(), 3);

    let snapshot = metadata.load().unwrap().unwrap();
    assert_eq!(snapshot.root.directories[0].name, "made-while-busy");
    assert_ne!(snapshot.root.files[0].head, -1);
}

#[test]
fn test_manual_persist_mode() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("manual.kkr");

    {
        let c = Container::open_with(&path, &config().with_persist(false)).unwrap();
        c.mkdir("kept").unwrap();
        assert!(c.has_pending_persist());
        c.sync().unwrap();
        assert!(!c.has_pending_persist());
        c.mkdir("saved-on-drop").unwrap();
    }

    let c = Container::open_with(&path, &config()).unwrap();
    let dirs: Vec<String> = c.directories().unwrap().iter().map(|d| d.name()).collect();
    assert_eq!(dirs, ["kept", "saved-on-drop"]);
}

#[test]
fn test_removed_content_is_reused() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(
        BlockStore::open(
            tmp.path().join("reuse.kkr"),
            &StoreConfig::new().with_block_size(48).with_os_locks(false),
        )
        .unwrap(),
    );
    // Tree metadata kept off the block store so only content allocates.
    let c = Container::with_metadata(store, MemoryMetadata::new()).unwrap();

    let old = c.touch("old").unwrap();
    let mut handle = old.open(AccessMode::ReadWrite).unwrap();
    handle.write(&[9u8; 100]).unwrap();
    handle.close().unwrap();
    let old_head = old.head_block_position();
    let len_before = c.stats().unwrap().file_len;
    old.remove().unwrap();
    assert_eq!(c.stats().unwrap().free_blocks, 3);

    let new = c.touch("new").unwrap();
    let mut handle = new.open(AccessMode::ReadWrite).unwrap();
    handle.write(&[3u8; 100]).unwrap();
    handle.close().unwrap();
    assert_eq!(new.head_block_position(), old_head);
    assert_eq!(c.stats().unwrap().file_len, len_before);
    assert_eq!(c.stats().unwrap().free_blocks, 0);
}

#[test]
fn test_host_folder_round_trip() {
    let host = tempfile::tempdir().unwrap();
    fs::write(host.path().join("a.txt"), b"alpha").unwrap();
    fs::create_dir(host.path().join("sub")).unwrap();
    fs::write(host.path().join("sub").join("b.txt"), b"beta").unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let c = Container::open_with(tmp.path().join("host.kkr"), &config()).unwrap();
    c.mkdir("sub").unwrap().touch("already-here").unwrap();

    c.import_folder(host.path()).unwrap();
    let a = c.file_at("a.txt").unwrap();
    assert_eq!(
        a.modified_at(),
        fs::metadata(host.path().join("a.txt")).unwrap().modified().unwrap()
    );
    let sub = c.directory_at("sub").unwrap();
    let names: Vec<String> = sub.files().unwrap().iter().map(|f| f.name()).collect();
    assert_eq!(names, ["already-here", "b.txt"]);
    assert!(matches!(
        c.import_folder(host.path()),
        Err(VfsError::NotUnique(_))
    ));

    let out = tmp.path().join("export");
    c.export_folder(&out).unwrap();
    assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(fs::read(out.join("sub").join("b.txt")).unwrap(), b"beta");
    assert_eq!(fs::read(out.join("sub").join("already-here")).unwrap(), b"");

    assert!(matches!(
        c.export_folder(out.join("a.txt")),
        Err(VfsError::NotADirectory(_))
    ));
}
