//! Typed, validated agent configuration built from a merged [`ConfigDoc`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigDoc;
use crate::error::{Error, Result};
use crate::naming::MAX_STRIPE_COUNT;
use crate::schedule::{HourMask, IncrementalSchedule, Schedule, WEEKDAYS};
use crate::timing::{format_duration, parse_duration};

const DEFAULT_SUCCESS_MARKER: &str = "ASE_AZURE_BACKUP_SUCCESS";
const DEFAULT_MAX_STRIPES: u32 = 8;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawAgent {
    output_dir: Option<String>,
    skip_databases: Option<Vec<String>>,
    streaming: Option<bool>,
    lock_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawFullSchedule {
    mo: Option<String>,
    tu: Option<String>,
    we: Option<String>,
    th: Option<String>,
    fr: Option<String>,
    sa: Option<String>,
    su: Option<String>,
    min_interval: Option<String>,
    max_interval: Option<String>,
}

impl RawFullSchedule {
    fn day(&self, idx: usize) -> Option<&str> {
        match idx {
            0 => self.mo.as_deref(),
            1 => self.tu.as_deref(),
            2 => self.we.as_deref(),
            3 => self.th.as_deref(),
            4 => self.fr.as_deref(),
            5 => self.sa.as_deref(),
            6 => self.su.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawIncrementalSchedule {
    min_interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawFs {
    root: Option<String>,
    root_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawS3 {
    prefix: Option<String>,
    prefix_env: Option<String>,
    region: Option<String>,
    region_env: Option<String>,
    profile: Option<String>,
    profile_env: Option<String>,
    endpoint_url: Option<String>,
    endpoint_url_env: Option<String>,
    aws_access_key_id_env: Option<String>,
    aws_secret_access_key_env: Option<String>,
    aws_session_token_env: Option<String>,
    aws_config_file_env: Option<String>,
    aws_ca_bundle_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawHttp {
    base_url: Option<String>,
    base_url_env: Option<String>,
    token: Option<String>,
    token_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawStore {
    backend: Option<String>,
    destination: Option<String>,
    destination_env: Option<String>,
    temporary: Option<String>,
    temporary_env: Option<String>,
    copy_timeout: Option<String>,
    poll_interval: Option<String>,
    page_size: Option<usize>,
    fs: RawFs,
    s3: RawS3,
    http: RawHttp,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct RawDump {
    isql: Option<String>,
    ddlgen: Option<String>,
    server: Option<String>,
    server_env: Option<String>,
    user: Option<String>,
    password_env: Option<String>,
    options: Option<String>,
    success_marker: Option<String>,
    max_stripes: Option<u32>,
    env: BTreeMap<String, String>,
    unset_env: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub output_dir: PathBuf,
    pub skip_databases: Vec<String>,
    pub streaming: bool,
    pub lock_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStoreConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3StoreConfig {
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub endpoint_url: Option<String>,
    /// Credentials forwarded to the `aws` subprocess.
    pub command_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Fs(FsStoreConfig),
    S3(S3StoreConfig),
    Http(HttpStoreConfig),
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Fs(_) => "fs",
            StoreBackend::S3(_) => "s3",
            StoreBackend::Http(_) => "http",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub destination: String,
    pub temporary: String,
    pub copy_timeout: Duration,
    pub poll_interval: Duration,
    /// `0` lets the backend pick.
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpConfig {
    pub isql: PathBuf,
    /// Schema generator run after full backups; unset skips the schema file.
    pub ddlgen: Option<PathBuf>,
    pub server: String,
    pub user: String,
    pub password: Option<String>,
    pub options: String,
    pub success_marker: String,
    pub max_stripes: u32,
    /// Set on the engine subprocess only.
    pub env: BTreeMap<String, String>,
    pub unset_env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub agent: AgentSettings,
    pub full: Schedule,
    pub incremental: IncrementalSchedule,
    pub store: StoreConfig,
    pub dump: DumpConfig,
}

fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    let direct = literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    direct.or_else(|| resolve_env_ref(env_key))
}

fn resolve_required_string_field(
    cfg_path: &str,
    literal: Option<&str>,
    env_key: Option<&str>,
) -> Result<String> {
    resolve_string_field(literal, env_key).ok_or_else(|| {
        if let Some(k) = env_key.map(str::trim).filter(|s| !s.is_empty()) {
            Error::config(format!("{cfg_path} is missing (also checked env var '{k}')"))
        } else {
            Error::config(format!("{cfg_path} is missing"))
        }
    })
}

fn required_duration(cfg_path: &str, raw: Option<&str>) -> Result<chrono::TimeDelta> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::config(format!("{cfg_path} is missing")))?;
    parse_duration(raw).map_err(|e| e.context(cfg_path))
}

fn std_duration(cfg_path: &str, raw: Option<&str>, default: &str) -> Result<Duration> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).unwrap_or(default);
    let d = parse_duration(raw).map_err(|e| e.context(cfg_path))?;
    d.to_std()
        .map_err(|_| Error::config(format!("{cfg_path} must not be negative")))
}

fn section<T: serde::de::DeserializeOwned + Default>(doc: &ConfigDoc, path: &str) -> Result<T> {
    Ok(doc.deserialize_path::<T>(path)?.unwrap_or_default())
}

fn full_schedule(raw: &RawFullSchedule) -> Result<Schedule> {
    let mut days = [[false; 24]; 7];
    for (idx, name) in WEEKDAYS.iter().enumerate() {
        let key = format!("schedule.full.{name}");
        let day = raw
            .day(idx)
            .ok_or_else(|| Error::config(format!("{key} is missing")))?;
        days[idx] = HourMask::parse_day(day).map_err(|e| e.context(&key))?;
    }
    Ok(Schedule {
        hours: HourMask::from_days(days),
        min_interval: required_duration(
            "schedule.full.min_interval",
            raw.min_interval.as_deref(),
        )?,
        max_interval: required_duration(
            "schedule.full.max_interval",
            raw.max_interval.as_deref(),
        )?,
    })
}

fn store_config(raw: &RawStore) -> Result<StoreConfig> {
    let backend_name = raw
        .backend
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("fs");
    let backend = match backend_name {
        "fs" => StoreBackend::Fs(FsStoreConfig {
            root: PathBuf::from(resolve_required_string_field(
                "store.fs.root",
                raw.fs.root.as_deref(),
                raw.fs.root_env.as_deref(),
            )?),
        }),
        "s3" => {
            let s3 = &raw.s3;
            let mut command_env = BTreeMap::new();
            for (dst, src) in [
                ("AWS_ACCESS_KEY_ID", s3.aws_access_key_id_env.as_deref()),
                ("AWS_SECRET_ACCESS_KEY", s3.aws_secret_access_key_env.as_deref()),
                ("AWS_SESSION_TOKEN", s3.aws_session_token_env.as_deref()),
                ("AWS_CONFIG_FILE", s3.aws_config_file_env.as_deref()),
                ("AWS_CA_BUNDLE", s3.aws_ca_bundle_env.as_deref()),
            ] {
                if let Some(v) = resolve_env_ref(src) {
                    command_env.insert(dst.to_string(), v);
                }
            }
            StoreBackend::S3(S3StoreConfig {
                prefix: resolve_string_field(s3.prefix.as_deref(), s3.prefix_env.as_deref()),
                region: resolve_string_field(s3.region.as_deref(), s3.region_env.as_deref()),
                profile: resolve_string_field(s3.profile.as_deref(), s3.profile_env.as_deref()),
                endpoint_url: resolve_string_field(
                    s3.endpoint_url.as_deref(),
                    s3.endpoint_url_env.as_deref(),
                ),
                command_env,
            })
        }
        "http" => StoreBackend::Http(HttpStoreConfig {
            base_url: resolve_required_string_field(
                "store.http.base_url",
                raw.http.base_url.as_deref(),
                raw.http.base_url_env.as_deref(),
            )?,
            token: resolve_string_field(raw.http.token.as_deref(), raw.http.token_env.as_deref()),
        }),
        other => {
            return Err(Error::config(format!(
                "unknown store.backend '{other}'; expected fs/s3/http"
            )));
        }
    };

    let destination = resolve_required_string_field(
        "store.destination",
        raw.destination.as_deref(),
        raw.destination_env.as_deref(),
    )?;
    let temporary = resolve_required_string_field(
        "store.temporary",
        raw.temporary.as_deref(),
        raw.temporary_env.as_deref(),
    )?;
    if destination == temporary {
        return Err(Error::config(
            "store.destination and store.temporary must be different containers",
        ));
    }

    Ok(StoreConfig {
        backend,
        destination,
        temporary,
        copy_timeout: std_duration("store.copy_timeout", raw.copy_timeout.as_deref(), "30m")?,
        poll_interval: std_duration("store.poll_interval", raw.poll_interval.as_deref(), "2s")?,
        page_size: raw.page_size.unwrap_or(0),
    })
}

fn dump_config(raw: &RawDump) -> Result<DumpConfig> {
    let max_stripes = raw.max_stripes.unwrap_or(DEFAULT_MAX_STRIPES);
    if max_stripes == 0 || max_stripes > MAX_STRIPE_COUNT {
        return Err(Error::config(format!(
            "dump.max_stripes must be within 1..={MAX_STRIPE_COUNT}, got {max_stripes}"
        )));
    }
    let password = match raw.password_env.as_deref().map(str::trim) {
        Some(k) if !k.is_empty() => Some(resolve_env_ref(Some(k)).ok_or_else(|| {
            Error::config(format!("dump.password_env names unset variable '{k}'"))
        })?),
        _ => None,
    };
    Ok(DumpConfig {
        isql: PathBuf::from(resolve_required_string_field(
            "dump.isql",
            raw.isql.as_deref(),
            None,
        )?),
        ddlgen: raw
            .ddlgen
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from),
        server: resolve_required_string_field(
            "dump.server",
            raw.server.as_deref(),
            raw.server_env.as_deref(),
        )?,
        user: resolve_required_string_field("dump.user", raw.user.as_deref(), None)?,
        password,
        options: raw.options.clone().unwrap_or_default(),
        success_marker: raw
            .success_marker
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUCCESS_MARKER.to_string()),
        max_stripes,
        env: raw.env.clone(),
        unset_env: raw
            .unset_env
            .clone()
            .unwrap_or_else(|| vec!["LANG".to_string()]),
    })
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_doc(&super::load(path)?)
    }

    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let agent: RawAgent = section(doc, "agent")?;
        let full: RawFullSchedule = section(doc, "schedule.full")?;
        let incremental: RawIncrementalSchedule = section(doc, "schedule.incremental")?;
        let store: RawStore = section(doc, "store")?;
        let dump: RawDump = section(doc, "dump")?;

        let output_dir = PathBuf::from(
            agent
                .output_dir
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("/tmp"),
        );
        let lock_dir = agent
            .lock_dir
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| output_dir.clone());

        Ok(Self {
            agent: AgentSettings {
                output_dir,
                skip_databases: agent
                    .skip_databases
                    .unwrap_or_else(|| vec!["dbccdb".to_string()]),
                streaming: agent.streaming.unwrap_or(true),
                lock_dir,
            },
            full: full_schedule(&full)?,
            incremental: IncrementalSchedule {
                min_interval: required_duration(
                    "schedule.incremental.min_interval",
                    incremental.min_interval.as_deref(),
                )?,
            },
            store: store_config(&store)?,
            dump: dump_config(&dump)?,
        })
    }

    /// Human-readable summary; secrets are masked.
    pub fn describe(&self) -> Vec<String> {
        let mut out = vec![
            format!("agent.output_dir:              {}", self.agent.output_dir.display()),
            format!("agent.lock_dir:                {}", self.agent.lock_dir.display()),
            format!("agent.streaming:               {}", self.agent.streaming),
            format!(
                "agent.skip_databases:          {}",
                self.agent.skip_databases.join(",")
            ),
        ];
        for (idx, name) in WEEKDAYS.iter().enumerate() {
            out.push(format!(
                "schedule.full.{name}:              {}",
                self.full.hours.render_day(idx)
            ));
        }
        out.push(format!(
            "schedule.full.min_interval:    {}",
            format_duration(self.full.min_interval)
        ));
        out.push(format!(
            "schedule.full.max_interval:    {}",
            format_duration(self.full.max_interval)
        ));
        out.push(format!(
            "schedule.incremental.min_interval: {}",
            format_duration(self.incremental.min_interval)
        ));
        out.push(format!("store.backend:                 {}", self.store.backend.name()));
        match &self.store.backend {
            StoreBackend::Fs(fs) => {
                out.push(format!("store.fs.root:                 {}", fs.root.display()))
            }
            StoreBackend::S3(s3) => {
                out.push(format!(
                    "store.s3.prefix:               {}",
                    s3.prefix.as_deref().unwrap_or("")
                ));
                out.push(format!(
                    "store.s3.region:               {}",
                    s3.region.as_deref().unwrap_or("")
                ));
            }
            StoreBackend::Http(http) => {
                out.push(format!("store.http.base_url:           {}", http.base_url));
                out.push(format!(
                    "store.http.token:              {}",
                    if http.token.is_some() { "<set>" } else { "<unset>" }
                ));
            }
        }
        out.push(format!("store.destination:             {}", self.store.destination));
        out.push(format!("store.temporary:               {}", self.store.temporary));
        out.push(format!("dump.isql:                     {}", self.dump.isql.display()));
        out.push(format!(
            "dump.ddlgen:                   {}",
            self.dump
                .ddlgen
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unset>".to_string())
        ));
        out.push(format!("dump.server:                   {}", self.dump.server));
        out.push(format!("dump.user:                     {}", self.dump.user));
        out.push(format!(
            "dump.password:                 {}",
            if self.dump.password.is_some() { "<set>" } else { "<unset>" }
        ));
        out.push(format!("dump.options:                  {}", self.dump.options));
        out.push(format!("dump.max_stripes:              {}", self.dump.max_stripes));
        out
    }
}
