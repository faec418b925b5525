use std::io::{self, Read, Write};
use std::process::{Command, Output, Stdio};

use serde::Deserialize;

use super::{CopyStatus, ListPage, ObjectStore};
use crate::config::S3StoreConfig;
use crate::error::{Error, Result};

/// S3 through the `aws` CLI; containers map to buckets.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    cfg: S3StoreConfig,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct ListObjectsOutput {
    #[serde(rename = "Contents", default)]
    contents: Vec<ListedObject>,
    #[serde(rename = "NextToken", default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    #[serde(rename = "Key")]
    key: String,
}

impl S3ObjectStore {
    pub fn new(cfg: S3StoreConfig, page_size: usize) -> Self {
        Self { cfg, page_size }
    }

    fn full_key(&self, key: &str) -> String {
        match self
            .cfg
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
        {
            Some(p) => format!("{p}/{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix<'a>(&self, full: &'a str) -> &'a str {
        match self
            .cfg
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
        {
            Some(p) => full
                .strip_prefix(p)
                .and_then(|k| k.strip_prefix('/'))
                .unwrap_or(full),
            None => full,
        }
    }

    fn aws(&self) -> Command {
        let mut cmd = Command::new("aws");
        configure_s3_cli(&mut cmd, &self.cfg);
        cmd
    }

    /// Server-side copy through `s3 cp`, which switches to a multipart copy for
    /// objects beyond the single-request size limit.
    fn copy_command(&self, source_url: &str, dest_container: &str, dest_key: &str) -> Result<Command> {
        if !source_url.starts_with("s3://") {
            return Err(Error::transfer(format!("unsupported copy source '{source_url}'")));
        }
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(source_url)
            .arg(format!("s3://{dest_container}/{}", self.full_key(dest_key)));
        Ok(cmd)
    }

    fn head(&self, bucket: &str, key: &str) -> Result<bool> {
        let mut cmd = self.aws();
        cmd.arg("s3api")
            .arg("head-object")
            .arg("--bucket")
            .arg(bucket)
            .arg("--key")
            .arg(self.full_key(key));
        let out = run_command_output(&mut cmd)?;
        if out.status.success() {
            return Ok(true);
        }
        let msg = command_summary(&out);
        if is_not_found_text(&msg) {
            return Ok(false);
        }
        Err(Error::transfer(format!("S3 head of {bucket}/{key} failed: {msg}")))
    }
}

fn configure_s3_cli(cmd: &mut Command, cfg: &S3StoreConfig) {
    for (flag, value) in [
        ("--profile", cfg.profile.as_deref()),
        ("--region", cfg.region.as_deref()),
        ("--endpoint-url", cfg.endpoint_url.as_deref()),
    ] {
        if let Some(v) = value.map(str::trim).filter(|s| !s.is_empty()) {
            cmd.arg(flag).arg(v);
        }
    }
    for (k, v) in &cfg.command_env {
        cmd.env(k, v);
    }
}

fn run_command_output(cmd: &mut Command) -> Result<Output> {
    cmd.output()
        .map_err(|e| Error::transfer(format!("failed to run command {:?}: {e}", cmd)))
}

fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}

fn is_not_found_text(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("not found")
        || m.contains("404")
        || m.contains("no such")
        || m.contains("does not exist")
}

fn stderr_text(child: &mut std::process::Child) -> String {
    let mut buf = String::new();
    if let Some(mut e) = child.stderr.take() {
        let _ = e.read_to_string(&mut buf);
    }
    buf.trim().to_string()
}

impl ObjectStore for S3ObjectStore {
    fn list(&self, container: &str, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let mut cmd = self.aws();
        cmd.arg("s3api")
            .arg("list-objects-v2")
            .arg("--bucket")
            .arg(container)
            .arg("--prefix")
            .arg(self.full_key(prefix))
            .arg("--output")
            .arg("json");
        if self.page_size > 0 {
            cmd.arg("--max-items").arg(self.page_size.to_string());
        }
        if let Some(t) = token {
            cmd.arg("--starting-token").arg(t);
        }
        let out = run_command_output(&mut cmd)?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "S3 list of {container}/{prefix} failed: {}",
                command_summary(&out)
            )));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        if text.trim().is_empty() {
            return Ok(ListPage::default());
        }
        let parsed: ListObjectsOutput = serde_json::from_str(&text)
            .map_err(|e| Error::transfer(format!("S3 list output for {container}: {e}")))?;
        Ok(ListPage {
            keys: parsed
                .contents
                .into_iter()
                .map(|o| self.strip_prefix(&o.key).to_string())
                .collect(),
            next: parsed.next_token.filter(|t| !t.is_empty()),
        })
    }

    fn put(&self, container: &str, key: &str, mut body: Box<dyn Read + Send>) -> Result<u64> {
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg("-")
            .arg(format!("s3://{container}/{}", self.full_key(key)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transfer(format!("failed to spawn aws s3 cp: {e}")))?;
        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(&mut body, &mut stdin),
            None => Err(io::Error::other("aws s3 cp stdin unavailable")),
        };
        let status = child.wait()?;
        let stderr = stderr_text(&mut child);
        let n = copied.map_err(|e| {
            Error::transfer(format!("S3 upload of {container}/{key}: {e} {stderr}"))
        })?;
        if !status.success() {
            return Err(Error::transfer(format!(
                "S3 upload of {container}/{key} failed ({status}): {stderr}"
            )));
        }
        Ok(n)
    }

    fn get(&self, container: &str, key: &str, out: &mut dyn Write) -> Result<u64> {
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(format!("s3://{container}/{}", self.full_key(key)))
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transfer(format!("failed to spawn aws s3 cp: {e}")))?;
        let copied = match child.stdout.take() {
            Some(mut stdout) => io::copy(&mut stdout, out),
            None => Err(io::Error::other("aws s3 cp stdout unavailable")),
        };
        let status = child.wait()?;
        let stderr = stderr_text(&mut child);
        let n = copied.map_err(|e| {
            Error::transfer(format!("S3 download of {container}/{key}: {e} {stderr}"))
        })?;
        if !status.success() {
            return Err(Error::transfer(format!(
                "S3 download of {container}/{key} failed ({status}): {stderr}"
            )));
        }
        Ok(n)
    }

    fn delete(&self, container: &str, key: &str) -> Result<()> {
        let mut cmd = self.aws();
        cmd.arg("s3api")
            .arg("delete-object")
            .arg("--bucket")
            .arg(container)
            .arg("--key")
            .arg(self.full_key(key));
        let out = run_command_output(&mut cmd)?;
        if out.status.success() {
            return Ok(());
        }
        let msg = command_summary(&out);
        if is_not_found_text(&msg) {
            return Ok(());
        }
        Err(Error::transfer(format!("S3 delete of {container}/{key} failed: {msg}")))
    }

    fn exists(&self, container: &str, key: &str) -> Result<bool> {
        self.head(container, key)
    }

    fn object_url(&self, container: &str, key: &str) -> String {
        format!("s3://{container}/{}", self.full_key(key))
    }

    fn copy(&self, source_url: &str, dest_container: &str, dest_key: &str) -> Result<()> {
        let mut cmd = self.copy_command(source_url, dest_container, dest_key)?;
        let out = run_command_output(&mut cmd)?;
        if !out.status.success() {
            return Err(Error::transfer(format!(
                "S3 copy {source_url} -> {dest_container}/{dest_key} failed: {}",
                command_summary(&out)
            )));
        }
        Ok(())
    }

    /// `s3 cp` completes before returning, so presence means success.
    fn copy_status(&self, container: &str, key: &str) -> Result<CopyStatus> {
        Ok(if self.head(container, key)? {
            CopyStatus::Success
        } else {
            CopyStatus::Missing
        })
    }
}
