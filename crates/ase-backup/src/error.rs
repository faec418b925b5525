use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DatabaseUnreachable,
    BackupServiceUnreachable,
    BackupServiceKilled,
    UnknownDatabase,
    FilesystemFull,
    DumpFailed,
    TransferFailed,
    RestorePointUnreachable,
    Config,
    InvalidName,
    Io,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DatabaseUnreachable => "database unreachable",
            ErrorKind::BackupServiceUnreachable => "backup service unreachable",
            ErrorKind::BackupServiceKilled => "backup service killed",
            ErrorKind::UnknownDatabase => "unknown database",
            ErrorKind::FilesystemFull => "filesystem full",
            ErrorKind::DumpFailed => "dump failed",
            ErrorKind::TransferFailed => "transfer failed",
            ErrorKind::RestorePointUnreachable => "restore point unreachable",
            ErrorKind::Config => "configuration error",
            ErrorKind::InvalidName => "invalid name",
            ErrorKind::Io => "i/o error",
            ErrorKind::Other => "error",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn transfer<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::TransferFailed, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Prefixes the message with context while keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }

    /// Folds several failures into one; the first failure decides the kind.
    /// Returns `None` for an empty list.
    pub fn aggregate(errors: Vec<Error>) -> Option<Self> {
        let mut it = errors.into_iter();
        let first = it.next()?;
        let rest: Vec<Error> = it.collect();
        if rest.is_empty() {
            return Some(first);
        }
        let mut msg = format!("{} failures: {}", rest.len() + 1, first.msg);
        for e in &rest {
            msg.push_str("; ");
            msg.push_str(&e.msg);
        }
        Some(Self {
            kind: first.kind,
            msg,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Other => write!(f, "{}", self.msg),
            k => write!(f, "{}: {}", k.as_str(), self.msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return Self::new(ErrorKind::FilesystemFull, err.to_string());
        }
        Self::new(ErrorKind::Io, err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
