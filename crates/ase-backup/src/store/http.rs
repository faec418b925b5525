use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;

use super::{CopyStatus, CountingReader, ListPage, ObjectStore};
use crate::config::HttpStoreConfig;
use crate::error::{Error, Result};

const COPY_SOURCE_HEADER: &str = "x-copy-source";
const COPY_STATUS_HEADER: &str = "x-copy-status";
const SHORT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    next: Option<String>,
}

/// Plain HTTP object service: `{base}/{container}/{key}`.
pub struct HttpObjectStore {
    cfg: HttpStoreConfig,
    page_size: usize,
    client: Client,
}

impl HttpObjectStore {
    pub fn new(cfg: HttpStoreConfig, page_size: usize) -> Result<Self> {
        // Streaming puts run for as long as the dump does; only small calls get a deadline.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            cfg,
            page_size,
            client,
        })
    }

    fn url(&self, container: &str, key: &str) -> String {
        format!("{}/{}/{}", self.cfg.base_url.trim_end_matches('/'), container, key)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match self.cfg.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder, what: &str) -> Result<reqwest::blocking::Response> {
        self.auth(req)
            .send()
            .map_err(|e| Error::transfer(format!("HTTP {what} failed: {e}")))
    }
}

fn status_error(what: &str, container: &str, key: &str, status: StatusCode) -> Error {
    Error::transfer(format!(
        "HTTP {what} {container}/{key} failed with status {status}"
    ))
}

fn parse_copy_status(raw: Option<&str>) -> CopyStatus {
    let Some(raw) = raw.map(str::trim) else {
        return CopyStatus::Success;
    };
    let lower = raw.to_ascii_lowercase();
    if lower.is_empty() || lower == "success" {
        CopyStatus::Success
    } else if lower == "pending" {
        CopyStatus::Pending
    } else if let Some(reason) = lower.strip_prefix("failed") {
        let reason = reason.trim_start_matches([':', ' ']);
        CopyStatus::Failed(if reason.is_empty() {
            "failed".into()
        } else {
            raw[raw.len() - reason.len()..].to_string()
        })
    } else {
        CopyStatus::Failed(raw.to_string())
    }
}

impl ObjectStore for HttpObjectStore {
    fn list(&self, container: &str, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let base = format!("{}/{}/", self.cfg.base_url.trim_end_matches('/'), container);
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| Error::config(format!("invalid store URL '{base}': {e}")))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("list", "1").append_pair("prefix", prefix);
            if self.page_size > 0 {
                q.append_pair("max", &self.page_size.to_string());
            }
            if let Some(t) = token {
                q.append_pair("token", t);
            }
        }
        let res = self.send(self.client.get(url).timeout(SHORT_TIMEOUT), "list")?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(ListPage::default());
        }
        if !res.status().is_success() {
            return Err(status_error("list", container, prefix, res.status()));
        }
        let body: ListResponse = res
            .json()
            .map_err(|e| Error::transfer(format!("HTTP list response for {container}: {e}")))?;
        Ok(ListPage {
            keys: body.keys,
            next: body.next.filter(|t| !t.is_empty()),
        })
    }

    fn put(&self, container: &str, key: &str, body: Box<dyn Read + Send>) -> Result<u64> {
        let (reader, count) = CountingReader::new(body);
        let req = self
            .client
            .put(self.url(container, key))
            .body(reqwest::blocking::Body::new(reader));
        let res = self.send(req, "put")?;
        if !res.status().is_success() {
            return Err(status_error("put", container, key, res.status()));
        }
        Ok(count.load(Ordering::Relaxed))
    }

    fn get(&self, container: &str, key: &str, out: &mut dyn Write) -> Result<u64> {
        let mut res = self.send(self.client.get(self.url(container, key)), "get")?;
        if !res.status().is_success() {
            return Err(status_error("get", container, key, res.status()));
        }
        res.copy_to(out)
            .map_err(|e| Error::transfer(format!("HTTP get {container}/{key}: {e}")))
    }

    fn delete(&self, container: &str, key: &str) -> Result<()> {
        let req = self
            .client
            .delete(self.url(container, key))
            .timeout(SHORT_TIMEOUT);
        let res = self.send(req, "delete")?;
        if res.status().is_success() || res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error("delete", container, key, res.status()))
    }

    fn exists(&self, container: &str, key: &str) -> Result<bool> {
        let req = self
            .client
            .head(self.url(container, key))
            .timeout(SHORT_TIMEOUT);
        let res = self.send(req, "head")?;
        if res.status().is_success() {
            return Ok(true);
        }
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Err(status_error("head", container, key, res.status()))
    }

    fn object_url(&self, container: &str, key: &str) -> String {
        self.url(container, key)
    }

    fn copy(&self, source_url: &str, dest_container: &str, dest_key: &str) -> Result<()> {
        let req = self
            .client
            .put(self.url(dest_container, dest_key))
            .header(COPY_SOURCE_HEADER, source_url)
            .timeout(SHORT_TIMEOUT);
        let res = self.send(req, "copy")?;
        if !res.status().is_success() {
            return Err(status_error("copy", dest_container, dest_key, res.status()));
        }
        Ok(())
    }

    fn copy_status(&self, container: &str, key: &str) -> Result<CopyStatus> {
        let req = self
            .client
            .head(self.url(container, key))
            .timeout(SHORT_TIMEOUT);
        let res = self.send(req, "copy status")?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(CopyStatus::Missing);
        }
        if !res.status().is_success() {
            return Err(status_error("copy status", container, key, res.status()));
        }
        let raw = res
            .headers()
            .get(COPY_STATUS_HEADER)
            .and_then(|v| v.to_str().ok());
        Ok(parse_copy_status(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_status_header_values() {
        assert_eq!(parse_copy_status(None), CopyStatus::Success);
        assert_eq!(parse_copy_status(Some("success")), CopyStatus::Success);
        assert_eq!(parse_copy_status(Some("Pending")), CopyStatus::Pending);
        assert_eq!(
            parse_copy_status(Some("failed: Source Gone")),
            CopyStatus::Failed("Source Gone".into())
        );
        assert_eq!(
            parse_copy_status(Some("failed")),
            CopyStatus::Failed("failed".into())
        );
        assert_eq!(
            parse_copy_status(Some("aborted")),
            CopyStatus::Failed("aborted".into())
        );
    }
}
