//! Backup orchestration: decides what runs, drives the dump engine and the
//! transfer coordinator, and serves restore/list/prune over the catalog.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::TimeDelta;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::dump::{DumpEngine, check_dump_output};
use crate::error::{Error, ErrorKind, Result};
use crate::naming::{self, Artifact, Kind};
use crate::recovery::{StripeSet, group_stripe_sets, select_chain};
use crate::schedule::{should_run_full, should_run_incremental};
use crate::store::{ObjectStore, list_all};
use crate::timing::{Clock, Timestamp, format_duration, system_clock};
use crate::transfer::{CopyThenDelete, PendingSet, TransferCoordinator};

/// Pruning never touches anything younger than this.
pub const MIN_PRUNE_AGE_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    /// Empty means every database the engine reports.
    pub databases: Vec<String>,
    pub force: bool,
    /// Leave final-named files in `output_dir` instead of uploading (file mode only).
    pub skip_upload: bool,
    pub streaming: bool,
    pub output_dir: PathBuf,
}

/// Per-database outcome of a backup or restore run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub completed: Vec<(String, Vec<Artifact>)>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Folds the failures into one error, each prefixed with its database.
    pub fn into_result(self) -> Result<()> {
        let errors = self
            .failed
            .into_iter()
            .map(|(db, e)| e.context(db))
            .collect();
        match Error::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub kept: usize,
}

/// Exclusive per-kind run marker, removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// `Ok(None)` when another live process holds the lock.
    pub fn acquire(dir: &Path, kind: Kind) -> Result<Option<Self>> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::from(e).context(format!("create {}", dir.display())))?;
        let path = dir.join(format!("ase-backup-{}.lock", kind.tag()));
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut f) => {
                    writeln!(f, "{}", std::process::id())?;
                    debug!(lock = %path.display(), "acquired run lock");
                    return Ok(Some(Self { path }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !lock_is_stale(&path) {
                        return Ok(None);
                    }
                    warn!(lock = %path.display(), "removing stale run lock");
                    let _ = fs::remove_file(&path);
                }
                Err(e) => {
                    return Err(Error::from(e).context(format!("create {}", path.display())));
                }
            }
        }
        Ok(None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = raw.trim().parse::<libc::pid_t>() else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    rc != 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

pub struct BackupAgent {
    cfg: AgentConfig,
    store: Arc<dyn ObjectStore>,
    engine: Arc<dyn DumpEngine>,
    clock: Clock,
}

impl BackupAgent {
    pub fn new(cfg: AgentConfig, store: Arc<dyn ObjectStore>, engine: Arc<dyn DumpEngine>) -> Self {
        Self {
            cfg,
            store,
            engine,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    fn coordinator(&self) -> TransferCoordinator<'_> {
        TransferCoordinator::new(
            self.store.as_ref(),
            &self.cfg.store.destination,
            &self.cfg.store.temporary,
            self.clock.clone(),
        )
        .with_finalizer(Box::new(CopyThenDelete {
            timeout: self.cfg.store.copy_timeout,
            poll_interval: self.cfg.store.poll_interval,
        }))
    }

    /// Stored artifacts of one database, chronologically. `kind = None` lists both kinds.
    pub fn catalog(&self, database: &str, kind: Option<Kind>) -> Result<Vec<Artifact>> {
        let prefix = match kind {
            Some(k) => naming::key_prefix(database, k),
            None => naming::database_prefix(database),
        };
        let keys = list_all(self.store.as_ref(), &self.cfg.store.destination, &prefix)?;
        let mut out: Vec<Artifact> = keys
            .iter()
            .filter_map(|k| naming::decode_key(k))
            .filter(|a| a.database == database && kind.is_none_or(|k| a.kind == k))
            .collect();
        out.sort();
        Ok(out)
    }

    /// End time of the newest complete stripe set of this kind.
    pub fn latest_end(&self, database: &str, kind: Kind) -> Result<Option<Timestamp>> {
        let catalog = self.catalog(database, Some(kind))?;
        Ok(group_stripe_sets(&catalog)
            .into_iter()
            .filter(StripeSet::is_complete)
            .filter_map(|s| s.end)
            .max())
    }

    pub fn should_run(&self, database: &str, kind: Kind, force: bool, now: Timestamp) -> Result<bool> {
        if force {
            return Ok(true);
        }
        let last = self.latest_end(database, kind)?;
        Ok(match kind {
            Kind::Full => should_run_full(now, false, last, &self.cfg.full),
            Kind::Incremental => {
                should_run_incremental(now, false, last, self.cfg.incremental.min_interval)
            }
        })
    }

    fn resolve_databases(&self, kind: Kind, requested: &[String]) -> Result<Vec<String>> {
        let all = if requested.is_empty() {
            self.engine.list_databases(kind)?
        } else {
            requested.to_vec()
        };
        Ok(all
            .into_iter()
            .filter(|db| {
                let skip = self.cfg.agent.skip_databases.contains(db);
                if skip {
                    debug!(database = %db, "database is on the skip list");
                }
                !skip
            })
            .collect())
    }

    /// Backs up every selected database; one database failing does not stop the
    /// others. Unless uploads are skipped, finished files left in the output
    /// directory by earlier runs are uploaded afterwards and their failures join
    /// the report.
    pub fn backup(&self, kind: Kind, req: &BackupRequest) -> Result<RunReport> {
        let Some(_lock) = RunLock::acquire(&self.cfg.agent.lock_dir, kind)? else {
            warn!(kind = %kind, "another backup of this kind is running, skipping");
            return Ok(RunReport::default());
        };
        let mut report = RunReport::default();
        for db in self.resolve_databases(kind, &req.databases)? {
            match self.backup_database(&db, kind, req) {
                Ok(Some(artifacts)) => report.completed.push((db, artifacts)),
                Ok(None) => report.skipped.push(db),
                Err(e) => {
                    error!(database = %db, kind = %kind, "backup failed: {e}");
                    report.failed.push((db, e));
                }
            }
        }
        if !req.skip_upload {
            match self.flush_leftovers(kind, &req.output_dir) {
                Ok((uploaded, failed)) => {
                    if uploaded > 0 {
                        info!(kind = %kind, files = uploaded, "uploaded files left by earlier runs");
                    }
                    report.failed.extend(failed);
                }
                Err(e) => {
                    error!(kind = %kind, dir = %req.output_dir.display(), "leftover scan failed: {e}");
                    report.failed.push((req.output_dir.display().to_string(), e));
                }
            }
        }
        Ok(report)
    }

    fn backup_database(
        &self,
        database: &str,
        kind: Kind,
        req: &BackupRequest,
    ) -> Result<Option<Vec<Artifact>>> {
        naming::validate_database(database)?;
        let start = (self.clock)();
        if !self.should_run(database, kind, req.force, start)? {
            info!(database, kind = %kind, "not due, skipping");
            return Ok(None);
        }

        let stripes = self
            .engine
            .stripe_count(database, kind)?
            .clamp(1, self.cfg.dump.max_stripes.max(1));
        let set = PendingSet::new(database, kind, start, stripes);
        let marker = self.cfg.dump.success_marker.as_str();
        let engine = self.engine.as_ref();
        let run_dump = |targets: &[PathBuf]| -> Result<()> {
            let out = engine.dump(database, kind, targets)?;
            out.log(database);
            check_dump_output(&out, marker)
        };

        let streaming = req.streaming && !req.skip_upload;
        info!(
            database,
            kind = %kind,
            start = %start,
            stripes,
            mode = if streaming { "streaming" } else { "file" },
            "starting backup"
        );
        let coordinator = self.coordinator();
        let artifacts = if streaming {
            coordinator.upload_streaming(&set, &req.output_dir, run_dump)?
        } else {
            coordinator.upload_files(&set, &req.output_dir, run_dump, req.skip_upload)?
        };
        if kind == Kind::Full {
            self.save_schema(&coordinator, database, start, req);
        }
        if let Some(end) = artifacts.first().and_then(|a| a.end) {
            info!(
                database,
                kind = %kind,
                start = %start,
                end = %end,
                took = %format_duration(end.since(start)),
                "backup finished"
            );
        }
        Ok(Some(artifacts))
    }

    /// Stores the schema description next to a finished full backup, or leaves
    /// it in the output directory when uploads are skipped. The dump is valid
    /// without it, so failures are only logged.
    fn save_schema(
        &self,
        coordinator: &TransferCoordinator<'_>,
        database: &str,
        start: Timestamp,
        req: &BackupRequest,
    ) {
        let sql = match self.engine.ddlgen(database) {
            Ok(Some(sql)) => sql,
            Ok(None) => {
                debug!(database, "no schema generator configured");
                return;
            }
            Err(e) => {
                warn!(database, "schema description failed: {e}");
                return;
            }
        };
        let saved = naming::ddlgen_name(database, start).and_then(|name| {
            if req.skip_upload {
                let path = req.output_dir.join(&name);
                fs::write(&path, sql.as_bytes())
                    .map_err(|e| Error::from(e).context(format!("write {}", path.display())))?;
                info!(database, path = %path.display(), "wrote schema description");
                Ok(())
            } else {
                coordinator.store_sidecar(&name, sql.into_bytes()).map(|_| ())
            }
        });
        if let Err(e) = saved {
            warn!(database, "schema description not saved: {e}");
        }
    }

    /// Uploads final-named files of `kind` left in `dir` by earlier skip-upload
    /// runs, one stripe set at a time. Returns the number of files uploaded.
    pub fn upload_leftovers(&self, kind: Kind, dir: &Path) -> Result<usize> {
        let (uploaded, failed) = self.flush_leftovers(kind, dir)?;
        let errors = failed.into_iter().map(|(db, e)| e.context(db)).collect();
        match Error::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(uploaded),
        }
    }

    /// Uploaded file count plus the failed sets by database.
    fn flush_leftovers(&self, kind: Kind, dir: &Path) -> Result<(usize, Vec<(String, Error)>)> {
        let entries = match fs::read_dir(dir) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, Vec::new())),
            Err(e) => return Err(Error::from(e).context(format!("read {}", dir.display()))),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(a) = naming::decode_key(&name) else {
                debug!(file = %name, "not a finished backup file");
                continue;
            };
            if a.kind == kind && entry.file_type()?.is_file() {
                found.push(a);
            }
        }

        let coordinator = self.coordinator();
        let mut uploaded = 0usize;
        let mut failed = Vec::new();
        for set in group_stripe_sets(&found) {
            if !set.is_complete() {
                warn!(
                    database = %set.database,
                    kind = %set.kind,
                    start = %set.start,
                    stripes = ?set.stripe_indices(),
                    expected = set.stripe_count,
                    "leftover stripe set is incomplete, keeping it locally"
                );
                continue;
            }
            match coordinator.upload_local_set(dir, &set.members) {
                Ok(()) => {
                    uploaded += set.members.len();
                    if set.kind == Kind::Full {
                        self.upload_leftover_schema(&coordinator, dir, &set);
                    }
                }
                Err(e) => {
                    error!(database = %set.database, start = %set.start, "leftover upload failed: {e}");
                    failed.push((set.database, e));
                }
            }
        }
        Ok((uploaded, failed))
    }

    fn upload_leftover_schema(&self, coordinator: &TransferCoordinator<'_>, dir: &Path, set: &StripeSet) {
        let Ok(name) = naming::ddlgen_name(&set.database, set.start) else {
            return;
        };
        let path = dir.join(&name);
        if !path.is_file() {
            return;
        }
        if let Err(e) = coordinator.upload_sidecar(&path, &name) {
            warn!(database = %set.database, file = %name, "schema description upload failed: {e}");
        }
    }

    /// Downloads, per database, the chain that reconstructs `target` into `dir`.
    pub fn restore(&self, target: Timestamp, databases: &[String], dir: &Path) -> Result<RunReport> {
        let mut report = RunReport::default();
        for db in self.resolve_databases(Kind::Full, databases)? {
            match self.restore_database(&db, target, dir) {
                Ok(chain) => report.completed.push((db, chain)),
                Err(e) => {
                    error!(database = %db, target = %target, "restore failed: {e}");
                    report.failed.push((db, e));
                }
            }
        }
        Ok(report)
    }

    fn restore_database(&self, database: &str, target: Timestamp, dir: &Path) -> Result<Vec<Artifact>> {
        naming::validate_database(database)?;
        let catalog = self.catalog(database, None)?;
        let mut usable = Vec::with_capacity(catalog.len());
        for set in group_stripe_sets(&catalog) {
            if set.is_complete() {
                usable.extend(set.members);
            } else {
                warn!(
                    database,
                    kind = %set.kind,
                    start = %set.start,
                    stripes = ?set.stripe_indices(),
                    expected = set.stripe_count,
                    "ignoring incomplete stripe set"
                );
            }
        }
        let chain = select_chain(&usable, target);
        if chain.is_empty() {
            return Err(Error::new(
                ErrorKind::RestorePointUnreachable,
                format!("no full backup of {database} ends at or before {target}"),
            ));
        }
        info!(database, target = %target, artifacts = chain.len(), "restoring");
        let coordinator = self.coordinator();
        coordinator.download(&chain, dir)?;
        if let Some(full) = chain.iter().find(|a| a.kind == Kind::Full) {
            let name = naming::ddlgen_name(database, full.start)?;
            coordinator.fetch_sidecar(&name, dir)?;
        }
        Ok(chain)
    }

    /// Stripe sets in the destination, chronologically. Empty `databases` lists everything.
    pub fn list(&self, databases: &[String]) -> Result<Vec<StripeSet>> {
        let artifacts: Vec<Artifact> = if databases.is_empty() {
            list_all(self.store.as_ref(), &self.cfg.store.destination, "")?
                .iter()
                .filter_map(|k| naming::decode_key(k))
                .collect()
        } else {
            let mut all = Vec::new();
            for db in databases {
                all.extend(self.catalog(db, None)?);
            }
            all
        };
        Ok(group_stripe_sets(&artifacts))
    }

    /// Deletes stored artifacts whose end time is more than `older_than` before `now`.
    /// A failed delete does not stop the rest; the failures are returned together.
    pub fn prune(&self, older_than: TimeDelta, databases: &[String], now: Timestamp) -> Result<PruneReport> {
        let floor = TimeDelta::try_days(MIN_PRUNE_AGE_DAYS).unwrap_or(TimeDelta::MAX);
        if older_than < floor {
            return Err(Error::config(format!(
                "refusing to prune backups younger than {}; requested {}",
                format_duration(floor),
                format_duration(older_than)
            )));
        }
        let cutoff = now
            .checked_sub(older_than)
            .ok_or_else(|| Error::config("prune age reaches before the representable range"))?;
        warn!(cutoff = %cutoff, "pruning backups that ended before the cutoff");

        let container = self.cfg.store.destination.as_str();
        let mut report = PruneReport::default();
        let mut errors = Vec::new();
        for key in list_all(self.store.as_ref(), container, "")? {
            let Some(a) = naming::decode_key(&key) else {
                continue;
            };
            if !databases.is_empty() && !databases.contains(&a.database) {
                continue;
            }
            if a.end.is_some_and(|end| end < cutoff) {
                warn!(key = %key, container, "deleting");
                match self.store.delete(container, &key) {
                    Ok(()) => report.deleted.push(key),
                    Err(e) => {
                        error!(key = %key, container, "delete failed: {e}");
                        errors.push(e);
                    }
                }
            } else {
                debug!(key = %key, "keeping");
                report.kept += 1;
            }
        }
        match Error::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    pub fn describe(&self) -> Vec<String> {
        self.cfg.describe()
    }
}
