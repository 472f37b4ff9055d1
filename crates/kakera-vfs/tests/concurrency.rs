//! Several threads working on one container.

use std::sync::Arc;
use std::thread;

use kakera_vfs::{AccessMode, Container, ContainerConfig, VfsNode, VfsResult};

fn retry<T>(mut op: impl FnMut() -> VfsResult<T>) -> VfsResult<T> {
    loop {
        match op() {
            Err(e) if e.is_retryable() => thread::yield_now(),
            other => return other,
        }
    }
}

fn content(i: usize) -> Vec<u8> {
    (0..150 + i * 37).map(|n| (n * (i + 1) % 256) as u8).collect()
}

#[test]
fn test_writers_on_distinct_files() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("threads.kkr");
    let config = ContainerConfig::new()
        .with_block_size(32)
        .with_os_locks(false);
    let container = Arc::new(Container::open_with(&path, &config).unwrap());

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let container = container.clone();
            thread::spawn(move || {
                let name = format!("worker-{i}.bin");
                let file = retry(|| container.touch(&name)).unwrap();
                let mut handle = retry(|| file.open(AccessMode::ReadWrite)).unwrap();
                for chunk in content(i).chunks(13) {
                    handle.write(chunk).unwrap();
                }
                handle.close().unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    retry(|| container.sync()).unwrap();
    drop(container);

    let container = Container::open_with(&path, &config).unwrap();
    assert_eq!(container.files().unwrap().len(), 8);
    for i in 0..8 {
        let file = container.file_at(&format!("worker-{i}.bin")).unwrap();
        let mut handle = file.open(AccessMode::ReadOnly).unwrap();
        assert_eq!(handle.read_to_end().unwrap(), content(i), "worker {i}");
    }
}

#[test]
fn test_mkdir_race_has_one_winner() {
    let tmp = tempfile::tempdir().unwrap();
    let container = Arc::new(
        Container::open_with(
            tmp.path().join("race.kkr"),
            &ContainerConfig::new().with_os_locks(false),
        )
        .unwrap(),
    );

    let racers: Vec<_> = (0..6)
        .map(|_| {
            let container = container.clone();
            thread::spawn(move || retry(|| container.mkdir("shared")).is_ok())
        })
        .collect();
    let winners = racers
        .into_iter()
        .map(|racer| racer.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    let names: Vec<String> = container
        .directories()
        .unwrap()
        .iter()
        .map(|d| d.name())
        .collect();
    assert_eq!(names, ["shared"]);
}

#[test]
fn test_readers_alongside_a_mover() {
    let tmp = tempfile::tempdir().unwrap();
    let container = Arc::new(
        Container::open_with(
            tmp.path().join("move.kkr"),
            &ContainerConfig::new().with_os_locks(false),
        )
        .unwrap(),
    );
    let left = container.mkdir("left").unwrap();
    let right = container.mkdir("right").unwrap();
    let file = left.touch("ball").unwrap();

    let mover = {
        let (left, right, file) = (left.clone(), right.clone(), file.clone());
        thread::spawn(move || {
            for round in 0..50 {
                let dest = if round % 2 == 0 { &right } else { &left };
                retry(|| file.move_to(dest)).unwrap();
            }
        })
    };
    let reader = {
        let (container, file) = (container.clone(), file.clone());
        thread::spawn(move || {
            for _ in 0..200 {
                let path = file.path();
                assert!(path == "/left/ball" || path == "/right/ball", "{path}");
                if let Ok(matches) = container.find_name("ball") {
                    for found in matches.filter_map(Result::ok) {
                        assert!(found.ptr_eq(&file));
                    }
                }
            }
        })
    };
    mover.join().unwrap();
    reader.join().unwrap();

    assert_eq!(file.parent().unwrap(), left);
    assert!(right.files().unwrap().is_empty());
}
