//! Error types for the CSI driver.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tonic::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for validating required fields.
///
/// Returns `INVALID_ARGUMENT` status if the field is missing or empty.
pub trait Require<T> {
    fn require(self, name: &str) -> std::result::Result<T, Status>;
}

impl Require<String> for String {
    fn require(self, name: &str) -> std::result::Result<String, Status> {
        if self.is_empty() {
            Err(Status::invalid_argument(format!("{name} is required")))
        } else {
            Ok(self)
        }
    }
}

impl<T> Require<T> for Option<T> {
    fn require(self, name: &str) -> std::result::Result<T, Status> {
        self.ok_or_else(|| Status::invalid_argument(format!("{name} is required")))
    }
}

/// CSI driver errors with structured context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("volume already exists with incompatible parameters: {0}")]
    VolumeAlreadyExists(String),

    #[error("{} cannot back volume {volume_id}: {reason}", .path.display())]
    BackingPathTaken {
        volume_id: String,
        path: PathBuf,
        reason: &'static str,
    },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("invalid volume id {volume_id:?}: {reason}")]
    InvalidVolumeId {
        volume_id: String,
        reason: &'static str,
    },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("invalid starting token {0:?}: expected a non-negative offset")]
    InvalidStartingToken(String),

    #[error("invalid max_entries {0}: must not be negative")]
    InvalidMaxEntries(i32),

    #[error("invalid capacity range: limit_bytes {limit} is smaller than required_bytes {required}")]
    InvalidCapacityRange { required: i64, limit: i64 },

    #[error("volume capabilities are required")]
    MissingCapabilities,

    #[error("volume capability access_type is required")]
    MissingCapability,

    #[error("block access is not supported: only filesystem volumes are available")]
    UnsupportedAccessType,

    #[error(
        "unsupported access mode: only SINGLE_NODE_WRITER and SINGLE_NODE_READER_ONLY are supported"
    )]
    UnsupportedAccessMode,

    #[error("volume not staged at {staging_path}: {volume_id}")]
    VolumeNotStaged {
        volume_id: String,
        staging_path: String,
    },

    #[error("volume {volume_id} at {} is still exposed by {count} active mount(s)", .path.display())]
    VolumeInUse {
        volume_id: String,
        path: PathBuf,
        count: usize,
    },

    #[error("{} is already in use: {reason}", .target.display())]
    TargetConflict { target: PathBuf, reason: String },

    #[error("failed to mount {} on {}: {source}", .mount_source.display(), .target.display())]
    Mount {
        mount_source: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to unmount {}: {source}", .target.display())]
    Unmount {
        target: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} still has content after unmount, refusing to remove it", .0.display())]
    ResidualContent(PathBuf),

    #[error("failed to stat {}: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid volume record: {0}")]
    InvalidRecord(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("unsupported endpoint scheme: {endpoint}")]
    UnsupportedScheme { endpoint: String },
}

impl Error {
    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        Error::Io(io::Error::other(format!("task join error: {err}")))
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            // NOT_FOUND: Volume, node or path does not exist
            Error::VolumeNotFound(_) | Error::NodeNotFound(_) | Error::PathNotFound(_) => {
                tonic::Status::not_found(err.to_string())
            }

            // ALREADY_EXISTS: Volume, backing path or target exists but is incompatible
            Error::VolumeAlreadyExists(_)
            | Error::BackingPathTaken { .. }
            | Error::TargetConflict { .. } => {
                tonic::Status::already_exists(err.to_string())
            }

            // FAILED_PRECONDITION: Operation cannot proceed in current state
            Error::VolumeNotStaged { .. } | Error::VolumeInUse { .. } => {
                tonic::Status::failed_precondition(err.to_string())
            }

            // INVALID_ARGUMENT: Client provided invalid input
            Error::InvalidVolumeId { .. }
            | Error::InvalidPath { .. }
            | Error::InvalidStartingToken(_)
            | Error::InvalidMaxEntries(_)
            | Error::InvalidCapacityRange { .. }
            | Error::MissingCapabilities
            | Error::MissingCapability
            | Error::UnsupportedAccessType
            | Error::UnsupportedAccessMode => tonic::Status::invalid_argument(err.to_string()),

            // INTERNAL: Filesystem and mount syscall failures
            Error::Mount { .. }
            | Error::Unmount { .. }
            | Error::ResidualContent(_)
            | Error::Stat { .. }
            | Error::InvalidRecord(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Json(_) => tonic::Status::internal(err.to_string()),
        }
    }
}
