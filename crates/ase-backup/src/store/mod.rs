//! Object-store seam and its backends.

use std::io::{Read, Write};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

mod fs;
mod http;
mod s3;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;
pub use s3::S3ObjectStore;

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    /// Continuation token; `None` when the listing is exhausted.
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Failed(String),
    /// The destination object does not exist (copy never started or was rolled back).
    Missing,
}

pub trait ObjectStore: Send + Sync {
    fn list(&self, container: &str, prefix: &str, token: Option<&str>) -> Result<ListPage>;
    fn put(&self, container: &str, key: &str, body: Box<dyn Read + Send>) -> Result<u64>;
    fn get(&self, container: &str, key: &str, out: &mut dyn Write) -> Result<u64>;
    /// Deleting a missing object is not an error.
    fn delete(&self, container: &str, key: &str) -> Result<()>;
    fn exists(&self, container: &str, key: &str) -> Result<bool>;
    /// Address of an object usable as a `copy` source.
    fn object_url(&self, container: &str, key: &str) -> String;
    /// Starts a server-side copy; completion is observed through `copy_status`.
    fn copy(&self, source_url: &str, dest_container: &str, dest_key: &str) -> Result<()>;
    fn copy_status(&self, container: &str, key: &str) -> Result<CopyStatus>;
}

/// Reader adapter that records how many bytes passed through it.
pub(crate) struct CountingReader<R> {
    inner: R,
    count: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    pub(crate) fn new(inner: R) -> (Self, std::sync::Arc<std::sync::atomic::AtomicU64>) {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        (
            Self {
                inner,
                count: count.clone(),
            },
            count,
        )
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count
            .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
        Ok(n)
    }
}

/// Follows continuation tokens until the listing is exhausted.
pub fn list_all(store: &dyn ObjectStore, container: &str, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list(container, prefix, token.as_deref())?;
        keys.extend(page.keys);
        match page.next {
            Some(next) if Some(&next) != token.as_ref() => token = Some(next),
            Some(next) => {
                return Err(crate::error::Error::transfer(format!(
                    "listing {container}/{prefix} repeated continuation token '{next}'"
                )));
            }
            None => break,
        }
    }
    Ok(keys)
}

pub fn open_store(cfg: &StoreConfig) -> Result<Box<dyn ObjectStore>> {
    Ok(match &cfg.backend {
        StoreBackend::Fs(fs) => Box::new(FsObjectStore::new(&fs.root).with_page_size(cfg.page_size)),
        StoreBackend::S3(s3) => Box::new(S3ObjectStore::new(s3.clone(), cfg.page_size)),
        StoreBackend::Http(http) => Box::new(HttpObjectStore::new(http.clone(), cfg.page_size)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Paged {
        pages: Vec<ListPage>,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl ObjectStore for Paged {
        fn list(&self, _c: &str, _p: &str, token: Option<&str>) -> Result<ListPage> {
            self.calls.lock().unwrap().push(token.map(str::to_string));
            let idx = token.map(|t| t.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(self.pages[idx].clone())
        }
        fn put(&self, _: &str, _: &str, _: Box<dyn Read + Send>) -> Result<u64> {
            unimplemented!()
        }
        fn get(&self, _: &str, _: &str, _: &mut dyn Write) -> Result<u64> {
            unimplemented!()
        }
        fn delete(&self, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }
        fn exists(&self, _: &str, _: &str) -> Result<bool> {
            unimplemented!()
        }
        fn object_url(&self, c: &str, k: &str) -> String {
            format!("{c}/{k}")
        }
        fn copy(&self, _: &str, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }
        fn copy_status(&self, _: &str, _: &str) -> Result<CopyStatus> {
            unimplemented!()
        }
    }

    #[test]
    fn list_all_drains_every_page() {
        let store = Paged {
            pages: vec![
                ListPage {
                    keys: vec!["a".into(), "b".into()],
                    next: Some("1".into()),
                },
                ListPage {
                    keys: vec![],
                    next: Some("2".into()),
                },
                ListPage {
                    keys: vec!["c".into()],
                    next: None,
                },
            ],
            calls: Mutex::new(Vec::new()),
        };
        assert_eq!(list_all(&store, "c", "").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            *store.calls.lock().unwrap(),
            vec![None, Some("1".into()), Some("2".into())]
        );
    }

    #[test]
    fn list_all_rejects_a_stuck_token() {
        let store = Paged {
            pages: vec![
                ListPage {
                    keys: vec!["a".into()],
                    next: Some("1".into()),
                },
                ListPage {
                    keys: vec!["b".into()],
                    next: Some("1".into()),
                },
            ],
            calls: Mutex::new(Vec::new()),
        };
        assert!(list_all(&store, "c", "").is_err());
    }
}
