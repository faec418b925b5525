mod common;

use std::path::PathBuf;
use std::sync::Arc;

use ase_backup::agent::RunLock;
use ase_backup::store::{FsObjectStore, ObjectStore};
use ase_backup::timing::parse_duration;
use ase_backup::{BackupAgent, BackupRequest, ErrorKind, Kind};

use common::{
    Fault, FaultyStore, ScriptedEngine, agent_config, artifact_keys, dir_entries, fixed_clock,
    keys, ts,
};

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    store: Arc<FsObjectStore>,
    engine: Arc<ScriptedEngine>,
}

impl Fixture {
    fn new(engine: ScriptedEngine) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        Self {
            store: Arc::new(FsObjectStore::new(root.join("store"))),
            engine: Arc::new(engine),
            root,
            _tmp: tmp,
        }
    }

    fn agent_at(&self, now: &str) -> BackupAgent {
        BackupAgent::new(agent_config(&self.root), self.store.clone(), self.engine.clone())
            .with_clock(fixed_clock(now))
    }

    /// Agent over the same store directory, with one operation failing.
    fn faulty_agent_at(&self, now: &str, fault: Fault, needle: &str) -> BackupAgent {
        let store = Arc::new(FaultyStore::new(&self.root.join("store"), fault, needle));
        BackupAgent::new(agent_config(&self.root), store, self.engine.clone())
            .with_clock(fixed_clock(now))
    }

    fn out(&self) -> PathBuf {
        self.root.join("out")
    }

    fn request(&self, databases: &[&str]) -> BackupRequest {
        BackupRequest {
            databases: databases.iter().map(|s| s.to_string()).collect(),
            force: false,
            skip_upload: false,
            streaming: true,
            output_dir: self.out(),
        }
    }

    fn dest(&self) -> Vec<String> {
        artifact_keys(self.store.as_ref(), "backups")
    }

    fn schemas(&self) -> Vec<String> {
        keys(self.store.as_ref(), "backups")
            .into_iter()
            .filter(|k| k.ends_with(".sql"))
            .collect()
    }

    /// Leaves a finished, final-named stripe set in `out/` as a skip-upload run would.
    fn leave_files(&self, database: &str, start: &str, end: &str, stripes: u32) {
        std::fs::create_dir_all(self.out()).unwrap();
        for i in 1..=stripes {
            let name = format!("{database}_full_{start}--{end}_S{i:03}-{stripes:03}.cdmp");
            std::fs::write(self.out().join(name), format!("{database} stripe {i}\n")).unwrap();
        }
    }
}

#[test]
fn one_failing_database_does_not_stop_the_others() {
    let fx = Fixture::new(
        ScriptedEngine::new(&["AZU", "BWP", "dbccdb"], 2)
            .failing("BWP", "Msg 911: Attempt to locate entry in sysdatabases for database 'BWP' by name failed - no entry found under that name."),
    );
    let report = fx
        .agent_at("20180601_100000")
        .backup(Kind::Full, &fx.request(&[]))
        .unwrap();

    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].0, "AZU");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "BWP");
    assert_eq!(report.failed[0].1.kind(), ErrorKind::UnknownDatabase);
    let dumped: Vec<String> = fx.engine.dumped().into_iter().map(|(db, _, _)| db).collect();
    assert_eq!(dumped, vec!["AZU", "BWP"]);

    assert_eq!(
        fx.dest(),
        vec![
            "AZU_full_20180601_100000--20180601_100000_S001-002.cdmp",
            "AZU_full_20180601_100000--20180601_100000_S002-002.cdmp",
        ]
    );
    assert!(keys(fx.store.as_ref(), "backups-tmp").is_empty());
    assert!(dir_entries(&fx.out()).is_empty());
    assert_eq!(report.into_result().unwrap_err().kind(), ErrorKind::UnknownDatabase);
}

#[test]
fn schedule_skips_until_due_and_force_overrides() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    let req = fx.request(&["AZU"]);
    fx.agent_at("20180601_100000").backup(Kind::Incremental, &req).unwrap();

    let early = fx.agent_at("20180601_101000").backup(Kind::Incremental, &req).unwrap();
    assert_eq!(early.skipped, vec!["AZU"]);
    assert!(early.completed.is_empty());

    let forced = BackupRequest { force: true, ..req.clone() };
    let report = fx.agent_at("20180601_101000").backup(Kind::Incremental, &forced).unwrap();
    assert_eq!(report.completed.len(), 1);

    let due = fx.agent_at("20180601_102600").backup(Kind::Incremental, &req).unwrap();
    assert_eq!(due.completed.len(), 1);
    assert_eq!(fx.dest().len(), 3);
    assert_eq!(
        fx.agent_at("20180601_102600")
            .latest_end("AZU", Kind::Incremental)
            .unwrap(),
        Some(ts("20180601_102600"))
    );
}

#[test]
fn held_lock_skips_the_run() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    let _held = RunLock::acquire(&fx.root.join("lock"), Kind::Full).unwrap().unwrap();
    let report = fx
        .agent_at("20180601_100000")
        .backup(Kind::Full, &fx.request(&["AZU"]))
        .unwrap();
    assert!(report.completed.is_empty() && report.failed.is_empty());
    assert!(fx.engine.dumped().is_empty());
    // The other kind is not blocked.
    let report = fx
        .agent_at("20180601_100000")
        .backup(Kind::Incremental, &fx.request(&["AZU"]))
        .unwrap();
    assert_eq!(report.completed.len(), 1);
}

#[test]
fn restore_downloads_the_chain_for_the_target() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 2));
    let req = BackupRequest { force: true, ..fx.request(&["AZU"]) };
    fx.agent_at("20180601_100000").backup(Kind::Full, &req).unwrap();
    fx.agent_at("20180601_101500").backup(Kind::Incremental, &req).unwrap();
    fx.agent_at("20180601_103000").backup(Kind::Incremental, &req).unwrap();
    fx.agent_at("20180601_104500").backup(Kind::Incremental, &req).unwrap();

    let restore_dir = fx.root.join("restore");
    let report = fx
        .agent_at("20180601_110000")
        .restore(ts("20180601_102000"), &["AZU".to_string()], &restore_dir)
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.completed[0].1.len(), 6);
    assert_eq!(
        dir_entries(&restore_dir),
        vec![
            "AZU_ddlgen_20180601_100000.sql",
            "AZU_full_20180601_100000_S001-002.cdmp",
            "AZU_full_20180601_100000_S002-002.cdmp",
            "AZU_incr_20180601_101500_S001-002.cdmp",
            "AZU_incr_20180601_101500_S002-002.cdmp",
            "AZU_incr_20180601_103000_S001-002.cdmp",
            "AZU_incr_20180601_103000_S002-002.cdmp",
        ]
    );
    let body = std::fs::read_to_string(restore_dir.join("AZU_full_20180601_100000_S002-002.cdmp")).unwrap();
    assert_eq!(body, "AZU stripe 2\n");
    let schema = std::fs::read_to_string(restore_dir.join("AZU_ddlgen_20180601_100000.sql")).unwrap();
    assert_eq!(schema, "create database AZU\n");
}

#[test]
fn restore_before_first_full_is_unreachable_and_writes_nothing() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    let req = BackupRequest { force: true, ..fx.request(&["AZU"]) };
    fx.agent_at("20180601_100000").backup(Kind::Full, &req).unwrap();

    let restore_dir = fx.root.join("restore");
    let report = fx
        .agent_at("20180601_110000")
        .restore(ts("20180601_090000"), &["AZU".to_string()], &restore_dir)
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].1.kind(), ErrorKind::RestorePointUnreachable);
    assert!(!restore_dir.exists());
}

#[test]
fn incomplete_sets_are_not_used_for_restore() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 2));
    let req = BackupRequest { force: true, ..fx.request(&["AZU"]) };
    fx.agent_at("20180601_100000").backup(Kind::Full, &req).unwrap();
    fx.store
        .delete("backups", "AZU_full_20180601_100000--20180601_100000_S002-002.cdmp")
        .unwrap();
    let report = fx
        .agent_at("20180601_110000")
        .restore(ts("20180601_100500"), &["AZU".to_string()], &fx.root.join("restore"))
        .unwrap();
    assert_eq!(report.failed[0].1.kind(), ErrorKind::RestorePointUnreachable);

    let sets = fx.agent_at("20180601_110000").list(&[]).unwrap();
    assert_eq!(sets.len(), 1);
    assert!(!sets[0].is_complete());
}

#[test]
fn skip_upload_leaves_files_for_a_later_run() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 2));
    let req = BackupRequest {
        skip_upload: true,
        ..fx.request(&["AZU"])
    };
    fx.agent_at("20180601_100000").backup(Kind::Full, &req).unwrap();
    assert!(fx.dest().is_empty());
    assert_eq!(
        dir_entries(&fx.out()),
        vec![
            "AZU_ddlgen_20180601_100000.sql",
            "AZU_full_20180601_100000--20180601_100000_S001-002.cdmp",
            "AZU_full_20180601_100000--20180601_100000_S002-002.cdmp",
        ]
    );

    let uploaded = fx
        .agent_at("20180601_110000")
        .upload_leftovers(Kind::Full, &fx.out())
        .unwrap();
    assert_eq!(uploaded, 2);
    assert!(dir_entries(&fx.out()).is_empty());
    assert_eq!(fx.dest().len(), 2);
    assert_eq!(fx.schemas(), vec!["AZU_ddlgen_20180601_100000.sql"]);
}

#[test]
fn leftover_set_with_a_failed_stripe_is_withdrawn_and_kept() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    fx.leave_files("AZU", "20180601_110000", "20180601_120000", 3);
    let agent = fx.faulty_agent_at("20180601_130000", Fault::Put, "_S002-");

    let err = agent.upload_leftovers(Kind::Full, &fx.out()).unwrap_err();
    assert!(err.message().contains("injected put failure"), "{err}");
    assert!(err.message().starts_with("AZU: "), "{err}");
    assert!(fx.dest().is_empty());
    assert_eq!(dir_entries(&fx.out()).len(), 3);

    // A healthy store takes the whole set on the next attempt.
    let uploaded = fx
        .agent_at("20180601_140000")
        .upload_leftovers(Kind::Full, &fx.out())
        .unwrap();
    assert_eq!(uploaded, 3);
    assert_eq!(fx.dest().len(), 3);
    assert!(dir_entries(&fx.out()).is_empty());
}

#[test]
fn incomplete_leftover_set_stays_local() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    fx.leave_files("AZU", "20180601_110000", "20180601_120000", 3);
    std::fs::remove_file(fx.out().join("AZU_full_20180601_110000--20180601_120000_S003-003.cdmp"))
        .unwrap();
    fx.leave_files("BWP", "20180601_110000", "20180601_120500", 1);

    let uploaded = fx
        .agent_at("20180601_130000")
        .upload_leftovers(Kind::Full, &fx.out())
        .unwrap();
    assert_eq!(uploaded, 1);
    assert_eq!(
        fx.dest(),
        vec!["BWP_full_20180601_110000--20180601_120500_S001-001.cdmp"]
    );
    assert_eq!(dir_entries(&fx.out()).len(), 2);
    // The other kind is left alone.
    assert_eq!(
        fx.agent_at("20180601_130000")
            .upload_leftovers(Kind::Incremental, &fx.out())
            .unwrap(),
        0
    );
}

#[test]
fn leftover_failure_does_not_block_todays_backups() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    fx.leave_files("BWP", "20180501_110000", "20180501_120000", 2);
    let agent = fx.faulty_agent_at(
        "20180601_100000",
        Fault::Put,
        "BWP_full_20180501_110000--20180501_120000_S002-",
    );

    let report = agent.backup(Kind::Full, &fx.request(&["AZU"])).unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].0, "AZU");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "BWP");
    assert_eq!(
        fx.dest(),
        vec!["AZU_full_20180601_100000--20180601_100000_S001-001.cdmp"]
    );
    assert_eq!(dir_entries(&fx.out()).len(), 2);
    assert!(report.into_result().is_err());

    // Uploads skipped: leftovers are not touched at all.
    let req = BackupRequest { force: true, skip_upload: true, ..fx.request(&["AZU"]) };
    let report = fx.agent_at("20180601_110000").backup(Kind::Full, &req).unwrap();
    assert!(report.is_success());
    assert_eq!(dir_entries(&fx.out()).len(), 4);
}

#[test]
fn full_backups_store_a_schema_description() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    let req = BackupRequest { force: true, ..fx.request(&["AZU"]) };
    fx.agent_at("20180601_100000").backup(Kind::Full, &req).unwrap();
    fx.agent_at("20180601_101500").backup(Kind::Incremental, &req).unwrap();
    assert_eq!(fx.schemas(), vec!["AZU_ddlgen_20180601_100000.sql"]);
    let mut body = Vec::new();
    fx.store
        .get("backups", "AZU_ddlgen_20180601_100000.sql", &mut body)
        .unwrap();
    assert_eq!(body, b"create database AZU\n");
}

#[test]
fn schema_failure_keeps_the_backup() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 2).without_schema());
    let report = fx
        .agent_at("20180601_100000")
        .backup(Kind::Full, &fx.request(&["AZU"]))
        .unwrap();
    assert!(report.is_success());
    assert_eq!(fx.dest().len(), 2);
    assert!(fx.schemas().is_empty());

    let restore_dir = fx.root.join("restore");
    let report = fx
        .agent_at("20180601_110000")
        .restore(ts("20180601_100500"), &["AZU".to_string()], &restore_dir)
        .unwrap();
    assert!(report.is_success());
    assert_eq!(dir_entries(&restore_dir).len(), 2);
}

#[test]
fn prune_refuses_young_ages_and_removes_old_sets() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU", "BWP"], 1));
    let req = BackupRequest { force: true, ..fx.request(&[]) };
    fx.agent_at("20180501_100000").backup(Kind::Full, &req).unwrap();
    fx.agent_at("20180601_100000").backup(Kind::Full, &req).unwrap();
    assert_eq!(fx.dest().len(), 4);

    let agent = fx.agent_at("20180610_000000");
    let err = agent
        .prune(parse_duration("6d 23h").unwrap(), &[], ts("20180610_000000"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(fx.dest().len(), 4);

    let report = agent
        .prune(parse_duration("30d").unwrap(), &["AZU".to_string()], ts("20180610_000000"))
        .unwrap();
    assert_eq!(
        report.deleted,
        vec!["AZU_full_20180501_100000--20180501_100000_S001-001.cdmp"]
    );
    // BWP is outside the filter and not counted.
    assert_eq!(report.kept, 1);
    assert_eq!(fx.dest().len(), 3);
}

#[test]
fn prune_continues_past_a_failed_delete() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU", "BWP"], 2));
    let req = BackupRequest { force: true, ..fx.request(&[]) };
    fx.agent_at("20180501_100000").backup(Kind::Full, &req).unwrap();
    fx.agent_at("20180601_100000").backup(Kind::Full, &req).unwrap();
    assert_eq!(fx.dest().len(), 8);

    let agent = fx.faulty_agent_at(
        "20180610_000000",
        Fault::Delete,
        "AZU_full_20180501_100000--20180501_100000_S001-",
    );
    let err = agent
        .prune(parse_duration("30d").unwrap(), &[], ts("20180610_000000"))
        .unwrap_err();
    assert!(err.message().contains("injected delete failure"), "{err}");
    assert_eq!(
        fx.dest(),
        vec![
            "AZU_full_20180501_100000--20180501_100000_S001-002.cdmp",
            "AZU_full_20180601_100000--20180601_100000_S001-002.cdmp",
            "AZU_full_20180601_100000--20180601_100000_S002-002.cdmp",
            "BWP_full_20180601_100000--20180601_100000_S001-002.cdmp",
            "BWP_full_20180601_100000--20180601_100000_S002-002.cdmp",
        ]
    );

    let report = fx
        .agent_at("20180610_000000")
        .prune(parse_duration("30d").unwrap(), &[], ts("20180610_000000"))
        .unwrap();
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.kept, 4);
}

#[test]
fn invalid_database_name_fails_only_that_database() {
    let fx = Fixture::new(ScriptedEngine::new(&["AZU"], 1));
    let report = fx
        .agent_at("20180601_100000")
        .backup(Kind::Full, &fx.request(&["bad--name", "AZU"]))
        .unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.failed[0].1.kind(), ErrorKind::InvalidName);
}
