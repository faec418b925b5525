use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CopyStatus, ListPage, ObjectStore};
use crate::error::{Error, ErrorKind, Result};

const DEFAULT_PAGE_SIZE: usize = 1000;

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Directory-backed store: one subdirectory per container, one file per key.
///
/// Writes land in a hidden partial file and are renamed into place, so a
/// listing never observes a half-written object.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// `0` keeps the default.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        if page_size > 0 {
            self.page_size = page_size;
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        check_segment("container", container)?;
        Ok(self.root.join(container))
    }

    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf> {
        check_segment("key", key)?;
        Ok(self.container_dir(container)?.join(key))
    }

    fn write_atomic(&self, dest: &Path, body: &mut dyn Read) -> Result<u64> {
        let dir = dest
            .parent()
            .ok_or_else(|| Error::msg(format!("object path {} has no parent", dest.display())))?;
        fs::create_dir_all(dir)
            .map_err(|e| Error::from(e).context(format!("create {}", dir.display())))?;
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = dir.join(format!(
            ".{name}.partial-{}-{}",
            std::process::id(),
            PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> io::Result<u64> {
            let mut f = fs::File::create(&partial)?;
            let n = io::copy(body, &mut f)?;
            f.sync_all()?;
            Ok(n)
        })();
        let n = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(Error::from(e).context(format!("write {}", dest.display())));
            }
        };
        if let Err(e) = fs::rename(&partial, dest) {
            let _ = fs::remove_file(&partial);
            return Err(Error::from(e).context(format!("rename into {}", dest.display())));
        }
        Ok(n)
    }
}

fn check_segment(what: &str, s: &str) -> Result<()> {
    if s.is_empty() || s.starts_with('.') || s.contains('/') || s.contains('\\') {
        return Err(Error::new(
            ErrorKind::InvalidName,
            format!("{what} '{s}' is not a valid object name"),
        ));
    }
    Ok(())
}

fn not_found(container: &str, key: &str) -> Error {
    Error::new(ErrorKind::Io, format!("object {container}/{key} not found"))
}

impl ObjectStore for FsObjectStore {
    fn list(&self, container: &str, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let dir = self.container_dir(container)?;
        let entries = match fs::read_dir(&dir) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ListPage::default()),
            Err(e) => return Err(Error::from(e).context(format!("list {}", dir.display()))),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            if token.is_some_and(|t| name.as_str() <= t) {
                continue;
            }
            keys.push(name);
        }
        keys.sort();

        let next = if keys.len() > self.page_size {
            keys.truncate(self.page_size);
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next })
    }

    fn put(&self, container: &str, key: &str, mut body: Box<dyn Read + Send>) -> Result<u64> {
        let dest = self.object_path(container, key)?;
        self.write_atomic(&dest, &mut body)
    }

    fn get(&self, container: &str, key: &str, out: &mut dyn Write) -> Result<u64> {
        let path = self.object_path(container, key)?;
        let mut f = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(container, key)),
            Err(e) => return Err(Error::from(e).context(format!("open {}", path.display()))),
        };
        Ok(io::copy(&mut f, out)?)
    }

    fn delete(&self, container: &str, key: &str) -> Result<()> {
        let path = self.object_path(container, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).context(format!("delete {}", path.display()))),
        }
    }

    fn exists(&self, container: &str, key: &str) -> Result<bool> {
        Ok(self.object_path(container, key)?.is_file())
    }

    fn object_url(&self, container: &str, key: &str) -> String {
        format!("file://{}", self.root.join(container).join(key).display())
    }

    fn copy(&self, source_url: &str, dest_container: &str, dest_key: &str) -> Result<()> {
        let source = source_url.strip_prefix("file://").ok_or_else(|| {
            Error::transfer(format!("unsupported copy source '{source_url}'"))
        })?;
        let mut src = fs::File::open(source)
            .map_err(|e| Error::transfer(format!("copy source {source}: {e}")))?;
        let dest = self.object_path(dest_container, dest_key)?;
        self.write_atomic(&dest, &mut src)?;
        Ok(())
    }

    fn copy_status(&self, container: &str, key: &str) -> Result<CopyStatus> {
        Ok(if self.exists(container, key)? {
            CopyStatus::Success
        } else {
            CopyStatus::Missing
        })
    }
}
