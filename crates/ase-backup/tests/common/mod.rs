#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ase_backup::config::{AgentConfig, ConfigDoc};
use ase_backup::dump::{DumpEngine, DumpOutput};
use ase_backup::store::{CopyStatus, FsObjectStore, ListPage, ObjectStore};
use ase_backup::timing::Clock;
use ase_backup::{Error, ErrorKind, Kind, Result, Timestamp};

pub const MARKER: &str = "ASE_AZURE_BACKUP_SUCCESS";

pub fn ts(s: &str) -> Timestamp {
    Timestamp::parse(s).unwrap()
}

pub fn fixed_clock(s: &str) -> Clock {
    let t = ts(s);
    Arc::new(move || t)
}

/// Agent config rooted in `dir`: fs store under `dir/store`, work files under `dir/out`.
pub fn agent_config(dir: &Path) -> AgentConfig {
    let raw = format!(
        r#"
[agent]
output_dir = "{out}"
lock_dir = "{lock}"
skip_databases = ["dbccdb"]

[schedule.full]
mo = "111111111111111111111111"
tu = "111111111111111111111111"
we = "111111111111111111111111"
th = "111111111111111111111111"
fr = "111111111111111111111111"
sa = "111111111111111111111111"
su = "111111111111111111111111"
min_interval = "1d"
max_interval = "3d"

[schedule.incremental]
min_interval = "15m"

[store]
backend = "fs"
destination = "backups"
temporary = "backups-tmp"
copy_timeout = "5s"
poll_interval = "1s"

[store.fs]
root = "{store}"

[dump]
isql = "/bin/false"
server = "TEST"
user = "sa"
max_stripes = 4
"#,
        out = dir.join("out").display(),
        lock = dir.join("lock").display(),
        store = dir.join("store").display(),
    );
    let doc = ConfigDoc::parse(dir.join("agent.toml"), &raw).unwrap();
    AgentConfig::from_doc(&doc).unwrap()
}

/// Dump engine double: writes `"{db} stripe {i}\n"` into every target and
/// reports success, unless the database has a scripted failure. Its schema
/// description is `"create database {db}\n"`.
pub struct ScriptedEngine {
    pub databases: Vec<String>,
    pub stripes: u32,
    /// Database -> engine output printed instead of the success marker.
    pub failures: BTreeMap<String, String>,
    pub dumped: Mutex<Vec<(String, Kind, usize)>>,
    pub schema_fails: bool,
}

impl ScriptedEngine {
    pub fn new(databases: &[&str], stripes: u32) -> Self {
        Self {
            databases: databases.iter().map(|s| s.to_string()).collect(),
            stripes,
            failures: BTreeMap::new(),
            dumped: Mutex::new(Vec::new()),
            schema_fails: false,
        }
    }

    pub fn without_schema(mut self) -> Self {
        self.schema_fails = true;
        self
    }

    pub fn failing(mut self, database: &str, output: &str) -> Self {
        self.failures.insert(database.to_string(), output.to_string());
        self
    }

    pub fn dumped(&self) -> Vec<(String, Kind, usize)> {
        self.dumped.lock().unwrap().clone()
    }
}

impl DumpEngine for ScriptedEngine {
    fn list_databases(&self, _kind: Kind) -> Result<Vec<String>> {
        Ok(self.databases.clone())
    }

    fn stripe_count(&self, _database: &str, _kind: Kind) -> Result<u32> {
        Ok(self.stripes)
    }

    fn dump(&self, database: &str, kind: Kind, targets: &[PathBuf]) -> Result<DumpOutput> {
        self.dumped
            .lock()
            .unwrap()
            .push((database.to_string(), kind, targets.len()));
        if let Some(out) = self.failures.get(database) {
            return Ok(DumpOutput {
                stdout: out.clone(),
                stderr: String::new(),
                status: Some(1),
            });
        }
        for (i, t) in targets.iter().enumerate() {
            let mut w = OpenOptions::new().write(true).create(true).open(t)?;
            writeln!(w, "{database} stripe {}", i + 1)?;
        }
        Ok(DumpOutput {
            stdout: format!("Backup Server: 3.43.1.1: Dump phase number 1 completed.\n{MARKER}\n"),
            stderr: String::new(),
            status: Some(0),
        })
    }

    fn ddlgen(&self, database: &str) -> Result<Option<String>> {
        if self.schema_fails {
            return Err(Error::new(ErrorKind::DatabaseUnreachable, "ddlgen exited with Some(1)"));
        }
        Ok(Some(format!("create database {database}\n")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Put,
    Copy,
    CopyStatusFailed,
    Delete,
}

/// Fs store that fails one operation for keys containing `needle`.
pub struct FaultyStore {
    pub inner: FsObjectStore,
    pub fault: Fault,
    pub needle: String,
}

impl FaultyStore {
    pub fn new(root: &Path, fault: Fault, needle: &str) -> Self {
        Self {
            inner: FsObjectStore::new(root),
            fault,
            needle: needle.to_string(),
        }
    }

    fn hits(&self, fault: Fault, key: &str) -> bool {
        self.fault == fault && key.contains(&self.needle)
    }
}

impl ObjectStore for FaultyStore {
    fn list(&self, container: &str, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        self.inner.list(container, prefix, token)
    }

    fn put(&self, container: &str, key: &str, body: Box<dyn Read + Send>) -> Result<u64> {
        if self.hits(Fault::Put, key) {
            return Err(Error::transfer(format!("injected put failure for {key}")));
        }
        self.inner.put(container, key, body)
    }

    fn get(&self, container: &str, key: &str, out: &mut dyn Write) -> Result<u64> {
        self.inner.get(container, key, out)
    }

    fn delete(&self, container: &str, key: &str) -> Result<()> {
        if self.hits(Fault::Delete, key) {
            return Err(Error::transfer(format!("injected delete failure for {key}")));
        }
        self.inner.delete(container, key)
    }

    fn exists(&self, container: &str, key: &str) -> Result<bool> {
        self.inner.exists(container, key)
    }

    fn object_url(&self, container: &str, key: &str) -> String {
        self.inner.object_url(container, key)
    }

    fn copy(&self, source_url: &str, dest_container: &str, dest_key: &str) -> Result<()> {
        if self.hits(Fault::Copy, dest_key) {
            return Err(Error::new(
                ErrorKind::TransferFailed,
                format!("injected copy failure for {dest_key}"),
            ));
        }
        self.inner.copy(source_url, dest_container, dest_key)
    }

    fn copy_status(&self, container: &str, key: &str) -> Result<CopyStatus> {
        if self.hits(Fault::CopyStatusFailed, key) {
            return Ok(CopyStatus::Failed("injected".into()));
        }
        self.inner.copy_status(container, key)
    }
}

pub fn keys(store: &dyn ObjectStore, container: &str) -> Vec<String> {
    ase_backup::store::list_all(store, container, "").unwrap()
}

/// Stored keys that are backup artifacts.
pub fn artifact_keys(store: &dyn ObjectStore, container: &str) -> Vec<String> {
    keys(store, container)
        .into_iter()
        .filter(|k| ase_backup::naming::decode_key(k).is_some())
        .collect()
}

pub fn dir_entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(rd) => {
            let mut v: Vec<String> = rd
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            v.sort();
            v
        }
        Err(_) => Vec::new(),
    }
}
