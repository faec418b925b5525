mod common;

use std::path::Path;

use ase_backup::dump::DumpEngine;
use ase_backup::transfer::{CopyThenDelete, PendingSet, TransferCoordinator};
use ase_backup::{ErrorKind, Kind};

use common::{Fault, FaultyStore, ScriptedEngine, dir_entries, fixed_clock, keys, ts};

fn run_streaming(store: &FaultyStore, work: &Path, stripes: u32) -> ase_backup::Result<usize> {
    let coord = TransferCoordinator::new(store, "dest", "temp", fixed_clock("20180601_120000"))
        .with_finalizer(Box::new(CopyThenDelete {
            timeout: std::time::Duration::from_secs(5),
            poll_interval: std::time::Duration::from_millis(10),
        }));
    let set = PendingSet::new("AZU", Kind::Full, ts("20180601_110000"), stripes);
    let engine = ScriptedEngine::new(&["AZU"], stripes);
    coord
        .upload_streaming(&set, work, |pipes| {
            engine.dump("AZU", Kind::Full, pipes).map(|_| ())
        })
        .map(|done| done.len())
}

fn assert_nothing_left(store: &FaultyStore, work: &Path) {
    assert_eq!(keys(store, "dest"), Vec::<String>::new());
    assert_eq!(keys(store, "temp"), Vec::<String>::new());
    assert_eq!(dir_entries(work), Vec::<String>::new());
}

#[test]
fn healthy_store_commits_every_stripe() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FaultyStore::new(&tmp.path().join("store"), Fault::Put, "no-such-key");
    let work = tmp.path().join("work");
    assert_eq!(run_streaming(&store, &work, 3).unwrap(), 3);
    assert_eq!(
        keys(&store, "dest"),
        vec![
            "AZU_full_20180601_110000--20180601_120000_S001-003.cdmp",
            "AZU_full_20180601_110000--20180601_120000_S002-003.cdmp",
            "AZU_full_20180601_110000--20180601_120000_S003-003.cdmp",
        ]
    );
    assert!(keys(&store, "temp").is_empty());
    assert!(dir_entries(&work).is_empty());
}

#[test]
fn failed_stripe_upload_leaves_nothing_behind() {
    for stripe in ["_S001-", "_S002-", "_S003-"] {
        let tmp = tempfile::tempdir().unwrap();
        let store = FaultyStore::new(&tmp.path().join("store"), Fault::Put, stripe);
        let work = tmp.path().join("work");
        let err = run_streaming(&store, &work, 3).unwrap_err();
        // The engine may also see a broken pipe; the injected failure is always reported.
        assert!(err.message().contains("injected"), "{stripe}: {err}");
        assert_nothing_left(&store, &work);
    }
}

#[test]
fn failed_copy_rolls_back_already_finalized_stripes() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FaultyStore::new(&tmp.path().join("store"), Fault::Copy, "_S002-");
    let work = tmp.path().join("work");
    let err = run_streaming(&store, &work, 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferFailed);
    assert_nothing_left(&store, &work);
}

#[test]
fn copy_reported_failed_rolls_back_the_set() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FaultyStore::new(&tmp.path().join("store"), Fault::CopyStatusFailed, "_S003-");
    let work = tmp.path().join("work");
    let err = run_streaming(&store, &work, 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferFailed);
    assert!(err.message().contains("injected"), "{err}");
    assert_nothing_left(&store, &work);
}

#[test]
fn failed_dump_removes_partial_uploads() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FaultyStore::new(&tmp.path().join("store"), Fault::Put, "no-such-key");
    let work = tmp.path().join("work");
    let coord = TransferCoordinator::new(&store, "dest", "temp", fixed_clock("20180601_120000"));
    let set = PendingSet::new("AZU", Kind::Incremental, ts("20180601_110000"), 2);
    let err = coord
        .upload_streaming(&set, &work, |pipes| {
            use std::io::Write;
            let mut w = std::fs::OpenOptions::new().write(true).open(&pipes[0])?;
            w.write_all(b"half a dump")?;
            Err(ase_backup::Error::new(ErrorKind::FilesystemFull, "No space left on device"))
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FilesystemFull);
    assert_nothing_left(&store, &work);
}

#[test]
fn failed_file_mode_upload_removes_local_files() {
    let tmp = tempfile::tempdir().unwrap();
    let store = FaultyStore::new(&tmp.path().join("store"), Fault::Put, "_S002-");
    let out = tmp.path().join("out");
    let coord = TransferCoordinator::new(&store, "dest", "temp", fixed_clock("20180601_120000"));
    let set = PendingSet::new("AZU", Kind::Full, ts("20180601_110000"), 2);
    let engine = ScriptedEngine::new(&["AZU"], 2);
    let err = coord
        .upload_files(
            &set,
            &out,
            |files| engine.dump("AZU", Kind::Full, files).map(|_| ()),
            false,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransferFailed);
    assert_eq!(keys(&store, "dest"), Vec::<String>::new());
    assert_eq!(dir_entries(&out), Vec::<String>::new());
}

#[test]
fn failed_stripe_stops_its_siblings_while_the_dump_runs() {
    use std::io::Write;

    let tmp = tempfile::tempdir().unwrap();
    let store = FaultyStore::new(&tmp.path().join("store"), Fault::Put, "_S001-");
    let work = tmp.path().join("work");
    let coord = TransferCoordinator::new(&store, "dest", "temp", fixed_clock("20180601_120000"));
    let set = PendingSet::new("AZU", Kind::Full, ts("20180601_110000"), 2);

    // Without the stop signal the second reader drains everything written.
    const LIMIT: usize = 64 << 20;
    let mut written = 0usize;
    let mut broken_pipe = false;
    let err = coord
        .upload_streaming(&set, &work, |pipes| {
            // The first stripe's upload is refused as soon as its reader attaches.
            let first = std::fs::OpenOptions::new().write(true).open(&pipes[0])?;
            drop(first);
            let mut second = std::fs::OpenOptions::new().write(true).open(&pipes[1])?;
            let chunk = vec![0u8; 64 << 10];
            while written < LIMIT {
                match second.write_all(&chunk) {
                    Ok(()) => written += chunk.len(),
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        broken_pipe = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .unwrap_err();
    assert!(broken_pipe, "second stripe kept reading {written} bytes");
    assert!(err.message().contains("injected"), "{err}");
    assert_nothing_left(&store, &work);
}
