//! Moves stripe sets between local production and the object store.
//!
//! Uploads are all-or-nothing: on any failure every object already stored for
//! the set is removed before the error is returned. Pipes and partial dump files
//! go too; finished files from an earlier run stay for the next attempt.

use std::ffi::CString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::naming::{self, Artifact, Kind};
use crate::store::{CopyStatus, ObjectStore};
use crate::timing::{Clock, Timestamp};

const RELEASE_RETRY: Duration = Duration::from_millis(10);

/// Cooperative stop signal shared by the tasks of one transfer.
///
/// Tasks observe it between blocking calls; a store call already in flight
/// runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::transfer(format!("{what} cancelled")));
        }
        Ok(())
    }
}

struct CancellableReader<R> {
    inner: R,
    cancel: CancelToken,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("transfer cancelled"));
        }
        self.inner.read(buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub container: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

/// Gives an uploaded temporary object its final key.
pub trait FinalizeArtifact: Send + Sync {
    fn finalize(
        &self,
        store: &dyn ObjectStore,
        from: &ObjectRef,
        to: &ObjectRef,
        cancel: &CancelToken,
    ) -> Result<()>;
}

/// Rename for write-once containers: server-side copy, wait for it, delete the source.
#[derive(Debug, Clone, Copy)]
pub struct CopyThenDelete {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CopyThenDelete {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl FinalizeArtifact for CopyThenDelete {
    fn finalize(
        &self,
        store: &dyn ObjectStore,
        from: &ObjectRef,
        to: &ObjectRef,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check("finalize")?;
        let source = store.object_url(&from.container, &from.key);
        debug!(%from, %to, "starting copy");
        store.copy(&source, &to.container, &to.key)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match store.copy_status(&to.container, &to.key)? {
                CopyStatus::Success => break,
                CopyStatus::Failed(reason) => {
                    return Err(Error::transfer(format!(
                        "copy {from} -> {to} failed: {reason}"
                    )));
                }
                CopyStatus::Pending | CopyStatus::Missing => {}
            }
            cancel.check("finalize")?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::transfer(format!(
                    "copy {from} -> {to} did not complete within {:?}",
                    self.timeout
                )));
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }

        store.delete(&from.container, &from.key)?;
        info!(key = %from.key, container = %from.container, "deleted temporary object");
        Ok(())
    }
}

/// A stripe set that is about to be produced; it has no end time yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSet {
    pub database: String,
    pub kind: Kind,
    pub start: Timestamp,
    pub stripe_count: u32,
}

impl PendingSet {
    pub fn new(database: impl Into<String>, kind: Kind, start: Timestamp, stripe_count: u32) -> Self {
        Self {
            database: database.into(),
            kind,
            start,
            stripe_count,
        }
    }

    pub fn stripes(&self) -> Vec<Artifact> {
        (1..=self.stripe_count)
            .map(|i| {
                Artifact::new(
                    self.database.clone(),
                    self.kind,
                    self.start,
                    None,
                    i,
                    self.stripe_count,
                )
            })
            .collect()
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::msg(format!("pipe path {} contains NUL", path.display())))?;
    let rc = unsafe { libc::mkfifo(c.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(Error::from(io::Error::last_os_error())
            .context(format!("mkfifo {}", path.display())));
    }
    debug!(pipe = %path.display(), "created pipe");
    Ok(())
}

fn remove_local(paths: &[PathBuf], what: &str) {
    for p in paths {
        match fs::remove_file(p) {
            Ok(()) => info!(path = %p.display(), "removed {what}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %p.display(), "failed to remove {what}: {e}"),
        }
    }
}

/// Unblocks a reader still waiting in `open` on a pipe the engine never
/// opened, so it sees end-of-file instead of waiting forever.
fn release_reader(pipe: &Path, attached: &AtomicBool) {
    while !attached.load(Ordering::SeqCst) {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(pipe)
        {
            Ok(w) => {
                drop(w);
                debug!(pipe = %pipe.display(), "released waiting reader");
                thread::sleep(RELEASE_RETRY);
            }
            // No reader has the pipe open yet.
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => thread::sleep(RELEASE_RETRY),
            Err(e) => {
                warn!(pipe = %pipe.display(), "cannot release reader: {e}");
                return;
            }
        }
    }
}

fn stream_stripe(
    store: &dyn ObjectStore,
    container: &str,
    key: &str,
    pipe: &Path,
    attached: &AtomicBool,
    cancel: &CancelToken,
) -> Result<u64> {
    let opened = File::open(pipe);
    attached.store(true, Ordering::SeqCst);
    let file = opened.map_err(|e| Error::transfer(format!("open pipe {}: {e}", pipe.display())))?;
    cancel.check("upload")?;
    debug!(pipe = %pipe.display(), container, key, "streaming stripe");
    let body = CancellableReader {
        inner: file,
        cancel: cancel.clone(),
    };
    store
        .put(container, key, Box::new(body))
        .map_err(|e| e.context(format!("upload {container}/{key}")))
}

/// Drives stripe-set transfers against one destination and one temporary container.
pub struct TransferCoordinator<'a> {
    store: &'a dyn ObjectStore,
    destination: String,
    temporary: String,
    finalizer: Box<dyn FinalizeArtifact + 'a>,
    clock: Clock,
}

impl<'a> TransferCoordinator<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        destination: impl Into<String>,
        temporary: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            destination: destination.into(),
            temporary: temporary.into(),
            finalizer: Box::new(CopyThenDelete::default()),
            clock,
        }
    }

    pub fn with_finalizer(mut self, finalizer: Box<dyn FinalizeArtifact + 'a>) -> Self {
        self.finalizer = finalizer;
        self
    }

    fn discard(&self, container: &str, keys: &[String]) {
        for key in keys {
            match self.store.delete(container, key) {
                Ok(()) => info!(container, key = %key, "deleted object"),
                Err(e) => warn!(container, key = %key, "failed to delete object: {e}"),
            }
        }
    }

    /// Streams the set through named pipes into the temporary container, then
    /// finalizes every stripe under its end-time key in the destination.
    ///
    /// `dump` receives the pipe paths in stripe order and must return an error
    /// when the engine did not report success.
    pub fn upload_streaming<F>(
        &self,
        set: &PendingSet,
        work_dir: &Path,
        dump: F,
    ) -> Result<Vec<Artifact>>
    where
        F: FnOnce(&[PathBuf]) -> Result<()>,
    {
        let stripes = set.stripes();
        let temp_keys = stripes
            .iter()
            .map(naming::encode_filename)
            .collect::<Result<Vec<_>>>()?;
        let pipes: Vec<PathBuf> = stripes
            .iter()
            .map(|a| {
                naming::pipe_name(work_dir, &a.database, a.kind, a.stripe_index, a.stripe_count)
            })
            .collect();

        fs::create_dir_all(work_dir)
            .map_err(|e| Error::from(e).context(format!("create {}", work_dir.display())))?;
        remove_local(&pipes, "stale pipe");
        for (i, p) in pipes.iter().enumerate() {
            if let Err(e) = make_fifo(p) {
                remove_local(&pipes[..i], "pipe");
                return Err(e);
            }
        }

        let cancel = CancelToken::new();
        let attached: Vec<AtomicBool> = pipes.iter().map(|_| AtomicBool::new(false)).collect();
        let store = self.store;
        let temporary = self.temporary.as_str();

        let (dump_result, task_results) = thread::scope(|scope| {
            let handles: Vec<_> = pipes
                .iter()
                .zip(&temp_keys)
                .zip(&attached)
                .map(|((pipe, key), flag)| {
                    let cancel = cancel.clone();
                    scope.spawn(move || {
                        let r = stream_stripe(store, temporary, key, pipe, flag, &cancel);
                        if let Err(e) = &r
                            && !cancel.is_cancelled()
                        {
                            warn!(key = %key, "stripe upload failed, stopping the set: {e}");
                            cancel.cancel();
                        }
                        r
                    })
                })
                .collect();
            info!(
                database = %set.database,
                kind = %set.kind,
                start = %set.start,
                stripes = set.stripe_count,
                "started stripe uploads"
            );

            let dump_result = dump(&pipes);
            if dump_result.is_err() {
                cancel.cancel();
            }
            for (pipe, flag) in pipes.iter().zip(&attached) {
                release_reader(pipe, flag);
            }
            let task_results: Vec<Result<u64>> = handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::transfer("stripe upload task panicked")))
                })
                .collect();
            (dump_result, task_results)
        });
        remove_local(&pipes, "pipe");

        let end = (self.clock)();
        let dump_ok = dump_result.is_ok();
        let mut errors = Vec::new();
        if let Err(e) = dump_result {
            errors.push(e);
        }
        for (a, r) in stripes.iter().zip(task_results) {
            match r {
                Ok(0) if dump_ok => errors.push(Error::transfer(format!(
                    "stripe {} of {} received no data",
                    a.stripe_index, a.stripe_count
                ))),
                Ok(bytes) => debug!(stripe = a.stripe_index, bytes, "stripe uploaded"),
                Err(e) => errors.push(e.context(format!("stripe {}", a.stripe_index))),
            }
        }
        if let Some(err) = Error::aggregate(errors) {
            warn!(
                database = %set.database,
                kind = %set.kind,
                start = %set.start,
                "streaming backup failed, removing temporary objects: {err}"
            );
            self.discard(&self.temporary, &temp_keys);
            return Err(err);
        }

        let finished: Vec<Artifact> = stripes.iter().map(|a| a.with_end(end)).collect();
        let final_keys = match finished
            .iter()
            .map(naming::encode_key)
            .collect::<Result<Vec<_>>>()
        {
            Ok(k) => k,
            Err(e) => {
                self.discard(&self.temporary, &temp_keys);
                return Err(e);
            }
        };
        for (tk, fk) in temp_keys.iter().zip(&final_keys) {
            let from = ObjectRef::new(&self.temporary, tk);
            let to = ObjectRef::new(&self.destination, fk);
            if let Err(e) = self.finalizer.finalize(self.store, &from, &to, &cancel) {
                warn!(%from, %to, "finalize failed, rolling back the set: {e}");
                self.discard(&self.destination, &final_keys);
                self.discard(&self.temporary, &temp_keys);
                return Err(e);
            }
            info!(key = %fk, container = %self.destination, "stored stripe");
        }
        info!(
            database = %set.database,
            kind = %set.kind,
            start = %set.start,
            end = %end,
            "streaming backup complete"
        );
        Ok(finished)
    }

    /// File mode: the engine writes start-time files into `dir`; they are renamed
    /// to their final names, uploaded, and removed. With `skip_upload` the
    /// renamed files stay on disk for a later `upload_local_set`.
    pub fn upload_files<F>(
        &self,
        set: &PendingSet,
        dir: &Path,
        dump: F,
        skip_upload: bool,
    ) -> Result<Vec<Artifact>>
    where
        F: FnOnce(&[PathBuf]) -> Result<()>,
    {
        let stripes = set.stripes();
        let local = stripes
            .iter()
            .map(|a| naming::encode_filename(a).map(|n| dir.join(n)))
            .collect::<Result<Vec<_>>>()?;
        fs::create_dir_all(dir)
            .map_err(|e| Error::from(e).context(format!("create {}", dir.display())))?;

        if let Err(e) = dump(&local) {
            warn!(database = %set.database, kind = %set.kind, start = %set.start, "dump failed: {e}");
            remove_local(&local, "partial dump file");
            return Err(e);
        }
        let end = (self.clock)();
        let finished: Vec<Artifact> = stripes.iter().map(|a| a.with_end(end)).collect();

        let mut renamed = Vec::with_capacity(local.len());
        let mut keys = Vec::with_capacity(local.len());
        for (a, path) in finished.iter().zip(&local) {
            let step = naming::encode_key(a).and_then(|key| {
                let target = dir.join(&key);
                fs::rename(path, &target).map_err(|e| {
                    Error::from(e).context(format!("rename {}", path.display()))
                })?;
                Ok((key, target))
            });
            match step {
                Ok((key, target)) => {
                    debug!(from = %path.display(), to = %target.display(), "renamed dump file");
                    keys.push(key);
                    renamed.push(target);
                }
                Err(e) => {
                    remove_local(&local, "dump file");
                    remove_local(&renamed, "dump file");
                    return Err(e);
                }
            }
        }

        if skip_upload {
            info!(database = %set.database, kind = %set.kind, end = %end, "upload skipped, files kept locally");
            return Ok(finished);
        }

        for (path, key) in renamed.iter().zip(&keys) {
            if let Err(e) = self.put_file(path, key) {
                warn!(database = %set.database, key = %key, "upload failed, rolling back the set: {e}");
                self.discard(&self.destination, &keys);
                remove_local(&renamed, "dump file");
                return Err(e);
            }
        }
        remove_local(&renamed, "uploaded dump file");
        info!(
            database = %set.database,
            kind = %set.kind,
            start = %set.start,
            end = %end,
            "file backup complete"
        );
        Ok(finished)
    }

    fn put_file(&self, path: &Path, key: &str) -> Result<u64> {
        let file = File::open(path)
            .map_err(|e| Error::from(e).context(format!("open {}", path.display())))?;
        let n = self
            .store
            .put(&self.destination, key, Box::new(file))
            .map_err(|e| e.context(format!("upload {}", path.display())))?;
        info!(key, container = %self.destination, bytes = n, "uploaded");
        Ok(n)
    }

    /// Uploads a finished stripe set from its final-named files in `dir`. Either
    /// every stripe is stored and the files are removed, or the stored stripes are
    /// deleted again and the files stay for a later attempt.
    pub fn upload_local_set(&self, dir: &Path, set: &[Artifact]) -> Result<()> {
        let keys = set
            .iter()
            .map(naming::encode_key)
            .collect::<Result<Vec<_>>>()?;
        let paths: Vec<PathBuf> = keys.iter().map(|k| dir.join(k)).collect();
        for (path, key) in paths.iter().zip(&keys) {
            if let Err(e) = self.put_file(path, key) {
                warn!(key = %key, "upload failed, removing the stripes already stored: {e}");
                self.discard(&self.destination, &keys);
                return Err(e);
            }
        }
        remove_local(&paths, "uploaded dump file");
        Ok(())
    }

    /// Stores a small non-artifact object, such as a schema description, in the
    /// destination.
    pub fn store_sidecar(&self, key: &str, body: Vec<u8>) -> Result<u64> {
        let n = self
            .store
            .put(&self.destination, key, Box::new(io::Cursor::new(body)))
            .map_err(|e| e.context(format!("upload {key}")))?;
        info!(key, container = %self.destination, bytes = n, "stored sidecar");
        Ok(n)
    }

    /// Uploads a sidecar file left in a working directory and removes it.
    pub fn upload_sidecar(&self, path: &Path, key: &str) -> Result<()> {
        self.put_file(path, key)?;
        remove_local(&[path.to_path_buf()], "uploaded sidecar");
        Ok(())
    }

    /// Downloads a sidecar into `dir` under its own name if the destination has it.
    pub fn fetch_sidecar(&self, key: &str, dir: &Path) -> Result<Option<PathBuf>> {
        if !self.store.exists(&self.destination, key)? {
            debug!(key, container = %self.destination, "no sidecar stored");
            return Ok(None);
        }
        fs::create_dir_all(dir)
            .map_err(|e| Error::from(e).context(format!("create {}", dir.display())))?;
        let path = dir.join(key);
        let bytes = self.fetch(key, &path)?;
        info!(key, path = %path.display(), bytes, "downloaded sidecar");
        Ok(Some(path))
    }

    /// Writes one object to `path` through a `.part` file, so `path` only ever
    /// holds a complete copy.
    fn fetch(&self, key: &str, path: &Path) -> Result<u64> {
        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        let fetched = File::create(&partial)
            .map_err(Error::from)
            .and_then(|mut f| {
                let n = self.store.get(&self.destination, key, &mut f)?;
                f.sync_all()?;
                Ok(n)
            })
            .and_then(|n| {
                fs::rename(&partial, path)?;
                Ok(n)
            });
        if fetched.is_err() {
            remove_local(&[partial], "partial download");
        }
        fetched.map_err(|e| e.context(format!("download {key}")))
    }

    /// Fetches every artifact of a restore chain into `dir`, one at a time, under
    /// its local working-file name.
    pub fn download(&self, chain: &[Artifact], dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::from(e).context(format!("create {}", dir.display())))?;
        let mut out = Vec::with_capacity(chain.len());
        for a in chain {
            let key = naming::encode_key(a)?;
            let path = dir.join(naming::encode_filename(a)?);
            let bytes = self.fetch(&key, &path)?;
            info!(key = %key, path = %path.display(), bytes, "downloaded");
            out.push(path);
        }
        Ok(out)
    }
}
