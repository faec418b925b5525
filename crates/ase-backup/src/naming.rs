//! Artifact identity and its storage-key codec.
//!
//! Stored objects are named
//! `{database}_{full|incr}_{start}--{end}_S{idx:03}-{cnt:03}.cdmp`; local working
//! files drop the `--{end}` part because the end time is unknown while the dump runs.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, ErrorKind, Result};
use crate::timing::Timestamp;

pub const ARTIFACT_EXT: &str = "cdmp";

/// Stripe positions are written as three digits.
pub const MAX_STRIPE_COUNT: u32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Full,
    Incremental,
}

impl Kind {
    pub fn tag(self) -> &'static str {
        match self {
            Kind::Full => "full",
            Kind::Incremental => "incr",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "full" => Some(Kind::Full),
            "incr" => Some(Kind::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One stored object; for a striped backup, one member of its stripe set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    pub database: String,
    pub kind: Kind,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    pub stripe_index: u32,
    pub stripe_count: u32,
}

impl Artifact {
    pub fn new(
        database: impl Into<String>,
        kind: Kind,
        start: Timestamp,
        end: Option<Timestamp>,
        stripe_index: u32,
        stripe_count: u32,
    ) -> Self {
        Self {
            database: database.into(),
            kind,
            start,
            end,
            stripe_index,
            stripe_count,
        }
    }

    pub fn with_end(&self, end: Timestamp) -> Self {
        Self {
            end: Some(end),
            ..self.clone()
        }
    }

    /// True when both artifacts belong to the same stripe set.
    pub fn same_set(&self, other: &Artifact) -> bool {
        self.database == other.database
            && self.kind == other.kind
            && self.start == other.start
            && self.end == other.end
            && self.stripe_count == other.stripe_count
    }
}

impl Ord for Artifact {
    fn cmp(&self, other: &Self) -> Ordering {
        self.end
            .cmp(&other.end)
            .then(self.stripe_index.cmp(&other.stripe_index))
            .then(self.start.cmp(&other.start))
            .then(self.kind.cmp(&other.kind))
            .then(self.database.cmp(&other.database))
            .then(self.stripe_count.cmp(&other.stripe_count))
    }
}

impl PartialOrd for Artifact {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn validate_database(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::new(ErrorKind::InvalidName, "database name is empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$' | '#'))
    {
        return Err(Error::new(
            ErrorKind::InvalidName,
            format!("database name '{name}' contains invalid characters"),
        ));
    }
    for delim in ["--", "_full_", "_incr_"] {
        if name.contains(delim) {
            return Err(Error::new(
                ErrorKind::InvalidName,
                format!("database name '{name}' contains the key delimiter '{delim}'"),
            ));
        }
    }
    Ok(())
}

fn check_stripes(a: &Artifact) -> Result<()> {
    if a.stripe_count == 0
        || a.stripe_count > MAX_STRIPE_COUNT
        || a.stripe_index == 0
        || a.stripe_index > a.stripe_count
    {
        return Err(Error::new(
            ErrorKind::InvalidName,
            format!(
                "invalid stripe position {}/{} for database '{}'",
                a.stripe_index, a.stripe_count, a.database
            ),
        ));
    }
    Ok(())
}

/// Local working-file name (no end time).
pub fn encode_filename(a: &Artifact) -> Result<String> {
    validate_database(&a.database)?;
    check_stripes(a)?;
    Ok(format!(
        "{}_{}_{}_S{:03}-{:03}.{ARTIFACT_EXT}",
        a.database,
        a.kind.tag(),
        a.start,
        a.stripe_index,
        a.stripe_count
    ))
}

/// Stored-object key; requires the end time.
pub fn encode_key(a: &Artifact) -> Result<String> {
    validate_database(&a.database)?;
    check_stripes(a)?;
    let Some(end) = a.end else {
        return Err(Error::new(
            ErrorKind::InvalidName,
            format!(
                "artifact {} {} started {} has no end time yet",
                a.database, a.kind, a.start
            ),
        ));
    };
    Ok(format!(
        "{}_{}_{}--{}_S{:03}-{:03}.{ARTIFACT_EXT}",
        a.database,
        a.kind.tag(),
        a.start,
        end,
        a.stripe_index,
        a.stripe_count
    ))
}

fn key_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<db>[A-Za-z0-9_.$#-]+?)_(?P<kind>full|incr)_(?P<start>\d{8}_\d{6})--(?P<end>\d{8}_\d{6})_S(?P<idx>\d{3})-(?P<cnt>\d{3})\.cdmp$",
        )
        .ok()
    })
    .as_ref()
}

fn filename_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<db>[A-Za-z0-9_.$#-]+?)_(?P<kind>full|incr)_(?P<start>\d{8}_\d{6})_S(?P<idx>\d{3})-(?P<cnt>\d{3})\.cdmp$",
        )
        .ok()
    })
    .as_ref()
}

fn artifact_from_captures(caps: &regex::Captures<'_>, with_end: bool) -> Option<Artifact> {
    let database = caps.name("db")?.as_str();
    validate_database(database).ok()?;
    let kind = Kind::from_tag(caps.name("kind")?.as_str())?;
    let start = Timestamp::parse(caps.name("start")?.as_str())?;
    let end = if with_end {
        Some(Timestamp::parse(caps.name("end")?.as_str())?)
    } else {
        None
    };
    let stripe_index: u32 = caps.name("idx")?.as_str().parse().ok()?;
    let stripe_count: u32 = caps.name("cnt")?.as_str().parse().ok()?;
    let a = Artifact::new(database, kind, start, end, stripe_index, stripe_count);
    check_stripes(&a).ok()?;
    Some(a)
}

/// Parses a stored-object key. `None` means the key is not one of ours, which is
/// normal for a shared container.
pub fn decode_key(key: &str) -> Option<Artifact> {
    let caps = key_re()?.captures(key)?;
    artifact_from_captures(&caps, true)
}

/// Parses a local working-file name (no end time).
pub fn decode_filename(name: &str) -> Option<Artifact> {
    let caps = filename_re()?.captures(name)?;
    artifact_from_captures(&caps, false)
}

/// Schema description stored next to the full backup that started at `start`.
/// It is not an artifact and never decodes as one.
pub fn ddlgen_name(database: &str, start: Timestamp) -> Result<String> {
    validate_database(database)?;
    Ok(format!("{database}_ddlgen_{start}.sql"))
}

/// Listing prefix for all artifacts of one database and kind.
pub fn key_prefix(database: &str, kind: Kind) -> String {
    format!("{database}_{}_", kind.tag())
}

pub fn database_prefix(database: &str) -> String {
    format!("{database}_")
}

pub fn pipe_name(
    dir: &Path,
    database: &str,
    kind: Kind,
    stripe_index: u32,
    stripe_count: u32,
) -> PathBuf {
    dir.join(format!(
        "backup_{database}_{}_{stripe_index:03}_{stripe_count:03}.{ARTIFACT_EXT}_pipe",
        kind.tag()
    ))
}
