//! The external database-dump engine: script generation, invocation and
//! output classification.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use crate::config::DumpConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::naming::Kind;

const MAX_LOG_CHARS: usize = 4096;

/// Captured result of one engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `None` when the process was terminated by a signal.
    pub status: Option<i32>,
}

impl DumpOutput {
    pub fn exited_cleanly(&self) -> bool {
        self.status == Some(0)
    }

    /// Logs every output line: stdout at info, stderr at warn.
    pub fn log(&self, database: &str) {
        for line in self.stdout.lines().filter(|l| !l.trim().is_empty()) {
            info!(database, "dump: {}", sanitize_line(line));
        }
        for line in self.stderr.lines().filter(|l| !l.trim().is_empty()) {
            warn!(database, "dump: {}", sanitize_line(line));
        }
    }
}

pub trait DumpEngine: Send + Sync {
    /// Databases eligible for the given kind of backup.
    fn list_databases(&self, kind: Kind) -> Result<Vec<String>>;
    fn stripe_count(&self, database: &str, kind: Kind) -> Result<u32>;
    /// Runs the dump, writing stripe `i` into `targets[i - 1]`. Returns once the
    /// engine exits; classification is left to `check_dump_output`.
    fn dump(&self, database: &str, kind: Kind, targets: &[PathBuf]) -> Result<DumpOutput>;
    /// SQL schema description of `database`, stored next to its full backups.
    /// `None` when no schema generator is available.
    fn ddlgen(&self, _database: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Substrings the engine prints for known failure conditions, checked in order.
const FAILURE_PATTERNS: &[(&str, ErrorKind)] = &[
    ("no entry found under that name", ErrorKind::UnknownDatabase),
    ("Could not locate entry in Sysdatabases", ErrorKind::UnknownDatabase),
    ("No space left on device", ErrorKind::FilesystemFull),
    (
        "Can't open a connection to site 'SYB_BACKUP'",
        ErrorKind::BackupServiceUnreachable,
    ),
    ("Backup Server session was killed", ErrorKind::BackupServiceKilled),
    ("Backup Server has terminated", ErrorKind::BackupServiceKilled),
    ("Requested server name not found", ErrorKind::DatabaseUnreachable),
    ("Unable to connect", ErrorKind::DatabaseUnreachable),
    ("Login failed", ErrorKind::DatabaseUnreachable),
];

/// Classifies a finished dump. Known failure text wins over the success marker;
/// the exit status only produces a warning.
pub fn check_dump_output(out: &DumpOutput, success_marker: &str) -> Result<()> {
    for (needle, kind) in FAILURE_PATTERNS {
        if let Some(line) = out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .find(|l| l.contains(needle))
        {
            return Err(Error::new(*kind, sanitize_line(line.trim())));
        }
    }
    if !out.stdout.lines().any(|l| l.trim() == success_marker) {
        let tail = out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| sanitize_line(l.trim()))
            .unwrap_or_else(|| "no output".into());
        return Err(Error::new(
            ErrorKind::DumpFailed,
            format!("success marker missing (last output: {tail})"),
        ));
    }
    if !out.exited_cleanly() {
        warn!(status = ?out.status, "dump engine printed its success marker but exited non-zero");
    }
    Ok(())
}

/// Strips terminal escapes and control characters and caps the length so
/// engine output is safe to log.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars().peekable();
    let mut count = 0usize;
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI runs until a final byte in '@'..='~'; other escapes take one char.
            if chars.peek() == Some(&'[') {
                chars.next();
                for n in chars.by_ref() {
                    if ('@'..='~').contains(&n) {
                        break;
                    }
                }
            } else {
                chars.next();
            }
            continue;
        }
        if c.is_control() && c != '\t' {
            continue;
        }
        if count >= MAX_LOG_CHARS {
            out.push_str("...[truncated]");
            break;
        }
        out.push(if c == '\t' { ' ' } else { c });
        count += 1;
    }
    out
}

fn quote_sql(s: &str) -> String {
    s.replace('\'', "''")
}

pub fn dump_script(
    database: &str,
    kind: Kind,
    targets: &[PathBuf],
    options: &str,
    success_marker: &str,
) -> String {
    let files = targets
        .iter()
        .map(|t| format!("'{}'", quote_sql(&t.to_string_lossy())))
        .collect::<Vec<_>>()
        .join("\n    stripe on ");
    let verb = match kind {
        Kind::Full => "database",
        Kind::Incremental => "transaction",
    };
    let mut s = String::from("use master\ngo\n");
    s.push_str(&format!("dump {verb} {database} to {files}\n"));
    let options = options.trim();
    if !options.is_empty() {
        s.push_str(&format!("with {options}\n"));
    }
    s.push_str(&format!(
        "\nif @@error = 0\nbegin\n  print '{}'\nend\n\ngo\n",
        quote_sql(success_marker)
    ));
    s
}

/// Sizes the stripe count at roughly one stripe per 10 GB of used space, at
/// least two above 1 GB, capped at `max_stripes`.
pub fn stripe_count_script(database: &str, kind: Kind, max_stripes: u32) -> String {
    let used = match kind {
        Kind::Full => "@data_size - @data_free + @log_size - @log_free",
        Kind::Incremental => "@log_size - @log_free",
    };
    let max = max_stripes.max(1);
    [
        "set nocount on".to_string(),
        "go".into(),
        "declare @dbname varchar(30),".into(),
        "        @stripes int,".into(),
        "        @data_free numeric (10,2),".into(),
        "        @data_size numeric (10,2),".into(),
        "        @log_free numeric (10,2),".into(),
        "        @log_size numeric (10,2),".into(),
        "        @max_stripe_size_in_GB int".into(),
        String::new(),
        format!("select @dbname = '{}'", quote_sql(database)),
        "select @stripes = 0".into(),
        "select @max_stripe_size_in_GB = 10".into(),
        "select".into(),
        "    @data_free = convert(numeric(10,2),sum(curunreservedpgs(dbid, lstart, unreservedpgs)) * (@@maxpagesize / 1024. / 1024)),".into(),
        "    @data_size = convert(numeric(10,2),sum(u.size * (@@maxpagesize / 1024. / 1024.))),".into(),
        "    @log_free = convert(numeric(10,2),lct_admin('logsegment_freepages', u.dbid) * (@@maxpagesize / 1024. /1024. ))".into(),
        "    from master..sysusages u, master..sysdevices d".into(),
        "    where d.vdevno = u.vdevno".into(),
        "        and d.status &2 = 2".into(),
        "        and u.segmap <> 4".into(),
        "        and u.segmap < 5".into(),
        "        and db_name(u.dbid) = @dbname".into(),
        "    group by u.dbid".into(),
        "select @log_size =  sum(us.size * (@@maxpagesize / 1024. / 1024.))".into(),
        "    from master..sysdatabases db, master..sysusages us".into(),
        "    where db.dbid = us.dbid".into(),
        "        and us.segmap = 4".into(),
        "        and db_name(db.dbid) = @dbname".into(),
        "    group by db.dbid".into(),
        "select @data_free = isnull (@data_free, 0),".into(),
        "       @data_size = isnull (@data_size ,0),".into(),
        "       @log_free  = isnull (@log_free, 0),".into(),
        "       @log_size  = isnull (@log_size, 0)".into(),
        format!(
            "select @stripes = convert (int, (({used}) / 1024 + @max_stripe_size_in_GB ) / @max_stripe_size_in_GB)"
        ),
        format!("if(( @stripes < 2 ) and ( {used} > 1024 ))"),
        "begin".into(),
        "    select @stripes = 2".into(),
        "end".into(),
        String::new(),
        format!("if @stripes > {max}"),
        "begin".into(),
        format!("    select @stripes = {max}"),
        "end".into(),
        String::new(),
        "select @stripes".into(),
        "go".into(),
    ]
    .join("\n")
}

/// Incrementals skip databases whose log cannot be dumped separately.
pub fn list_databases_script(kind: Kind) -> String {
    let mut lines = vec![
        "set nocount on",
        "go",
        "select name, status, status2 into #dbname",
        "    from master..sysdatabases",
        "    where dbid <> 2 and status3 & 256 = 0",
    ];
    if kind == Kind::Incremental {
        lines.push(
            "delete from #dbname where status2 & 16 = 16 or status2 & 32 = 32 or status & 8 = 8",
        );
        lines.push("delete from #dbname where tran_dumpable_status(name) <> 0");
    }
    lines.push("select name from #dbname order by 1");
    lines.push("go");
    lines.join("\n")
}

/// Last integer printed by the stripe-count script, clamped to `1..=max`.
pub fn parse_stripe_count(stdout: &str, max: u32) -> Result<u32> {
    let n = stdout
        .lines()
        .rev()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .next()
        .ok_or_else(|| {
            Error::new(
                ErrorKind::DumpFailed,
                format!(
                    "could not read stripe count from '{}'",
                    sanitize_line(stdout.trim())
                ),
            )
        })?;
    Ok(n.clamp(1, max.max(1)))
}

/// Extra `ddlgen` flags per pass: database-level definitions first, then every object.
const DDLGEN_PASSES: &[&[&str]] = &[&["-F%", "-TDBD", "-N%"], &["-F%"]];

pub fn ddlgen_args(
    server: &str,
    user: &str,
    password: Option<&str>,
    database: &str,
    extra: &[&str],
) -> Vec<String> {
    let mut args = vec![
        format!("-S{server}"),
        format!("-D{database}"),
        format!("-U{user}"),
    ];
    if let Some(pw) = password {
        args.push(format!("-P{pw}"));
    }
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

/// Drives `isql` with generated scripts on stdin.
#[derive(Debug, Clone)]
pub struct IsqlDumpEngine {
    cfg: DumpConfig,
}

impl IsqlDumpEngine {
    pub fn new(cfg: DumpConfig) -> Self {
        Self { cfg }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cfg.isql);
        cmd.arg("-S")
            .arg(&self.cfg.server)
            .arg("-U")
            .arg(&self.cfg.user)
            .arg("-w")
            .arg("999")
            .arg("-b");
        if let Some(pw) = self.cfg.password.as_deref() {
            cmd.arg("-P").arg(pw);
        }
        self.apply_env(&mut cmd);
        cmd
    }

    fn apply_env(&self, cmd: &mut Command) {
        for k in &self.cfg.unset_env {
            cmd.env_remove(k);
        }
        cmd.envs(&self.cfg.env);
    }

    fn run_ddlgen(&self, tool: &Path, database: &str, extra: &[&str]) -> Result<String> {
        let mut cmd = Command::new(tool);
        cmd.args(ddlgen_args(
            &self.cfg.server,
            &self.cfg.user,
            self.cfg.password.as_deref(),
            database,
            extra,
        ))
        .stdin(Stdio::null());
        self.apply_env(&mut cmd);
        debug!(ddlgen = %tool.display(), database, flags = ?extra, "running ddlgen");
        let out = cmd.output().map_err(|e| {
            Error::new(
                ErrorKind::DatabaseUnreachable,
                format!("failed to spawn {}: {e}", tool.display()),
            )
        })?;
        if !out.status.success() {
            return Err(Error::new(
                ErrorKind::DatabaseUnreachable,
                format!(
                    "ddlgen for {database} exited with {:?}: {}",
                    out.status.code(),
                    sanitize_line(String::from_utf8_lossy(&out.stderr).trim())
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn run(&self, script: &str) -> Result<DumpOutput> {
        let mut cmd = self.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(isql = %self.cfg.isql.display(), server = %self.cfg.server, "running isql");
        let mut child = cmd.spawn().map_err(|e| {
            Error::new(
                ErrorKind::DatabaseUnreachable,
                format!("failed to spawn {}: {e}", self.cfg.isql.display()),
            )
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
        }
        let out = child.wait_with_output()?;
        Ok(DumpOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            status: out.status.code(),
        })
    }

    fn run_checked(&self, script: &str, what: &str) -> Result<DumpOutput> {
        let out = self.run(script)?;
        for (needle, kind) in FAILURE_PATTERNS {
            if out.stdout.contains(needle) || out.stderr.contains(needle) {
                return Err(Error::new(*kind, format!("{what}: {needle}")));
            }
        }
        if !out.exited_cleanly() {
            return Err(Error::new(
                ErrorKind::DatabaseUnreachable,
                format!(
                    "{what} exited with {:?}: {}",
                    out.status,
                    sanitize_line(out.stderr.trim())
                ),
            ));
        }
        Ok(out)
    }
}

impl DumpEngine for IsqlDumpEngine {
    fn list_databases(&self, kind: Kind) -> Result<Vec<String>> {
        let out = self.run_checked(&list_databases_script(kind), "list databases")?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn stripe_count(&self, database: &str, kind: Kind) -> Result<u32> {
        let script = stripe_count_script(database, kind, self.cfg.max_stripes);
        let out = self.run_checked(&script, "stripe count")?;
        parse_stripe_count(&out.stdout, self.cfg.max_stripes)
    }

    fn dump(&self, database: &str, kind: Kind, targets: &[PathBuf]) -> Result<DumpOutput> {
        let script = dump_script(
            database,
            kind,
            targets,
            &self.cfg.options,
            &self.cfg.success_marker,
        );
        self.run(&script)
    }

    fn ddlgen(&self, database: &str) -> Result<Option<String>> {
        let Some(tool) = self.cfg.ddlgen.as_deref() else {
            return Ok(None);
        };
        let mut passes = Vec::with_capacity(DDLGEN_PASSES.len());
        for extra in DDLGEN_PASSES {
            passes.push(self.run_ddlgen(tool, database, extra)?);
        }
        Ok(Some(passes.join("\n\n")))
    }
}
