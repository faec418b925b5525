pub mod agent;
pub mod config;
pub mod dump;
pub mod error;
pub mod naming;
pub mod recovery;
pub mod schedule;
pub mod store;
pub mod timing;
pub mod transfer;

pub use agent::{BackupAgent, BackupRequest, PruneReport, RunReport};
pub use error::{Error, ErrorKind, Result};
pub use naming::{Artifact, Kind};
pub use timing::Timestamp;
