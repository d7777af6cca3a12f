//! Unified error types for vpcctl

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for vpcctl operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Request validation
    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Invalid CIDR '{cidr}': {reason}")]
    InvalidCidr { cidr: String, reason: String },

    #[error("Cannot peer '{vpc1}' with '{vpc2}': {reason}")]
    InvalidPeering {
        vpc1: String,
        vpc2: String,
        reason: String,
    },

    #[error("Invalid firewall policy '{source_ref}': {reason}")]
    InvalidPolicy { source_ref: String, reason: String },

    #[error("Unsupported workload type '{0}'")]
    UnsupportedWorkload(String),

    // Resource lookups
    #[error("VPC '{0}' not found")]
    VpcNotFound(String),

    #[error("VPC '{0}' already exists")]
    VpcAlreadyExists(String),

    #[error("Subnet '{subnet}' not found in VPC '{vpc}'")]
    SubnetNotFound { vpc: String, subnet: String },

    #[error("Subnet '{subnet}' already exists in VPC '{vpc}'")]
    SubnetAlreadyExists { vpc: String, subnet: String },

    #[error("VPCs '{0}' and '{1}' are not peered")]
    PeeringNotFound(String, String),

    #[error("VPCs '{0}' and '{1}' are already peered")]
    AlreadyPeered(String, String),

    // Resource store
    #[error("Failed to encode record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record for VPC '{vpc}' is inconsistent: {reason}")]
    CorruptRecord { vpc: String, reason: String },

    #[error("Timed out after {secs} seconds waiting for lock on '{name}'")]
    LockTimeout { name: String, secs: u64 },

    #[error("Failed to lock '{name}': {message}")]
    Lock { name: String, message: String },

    #[error("Failed to commit '{vpc}': {message}")]
    Commit { vpc: String, message: String },

    // Network backend
    #[error("Backend operation '{verb}' failed: {message}")]
    Backend { verb: String, message: String },

    #[error("Backend operation '{verb}' timed out after {secs} seconds")]
    BackendTimeout { verb: String, secs: u64 },

    #[error("Could not determine the default outbound interface")]
    NoDefaultRoute,

    // System
    #[error("This command must be run as root")]
    NotRoot,
}

/// Failure classes surfaced to operators and automation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    AlreadyExists,
    Conflict,
    BackendFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidInput => write!(f, "InvalidInput"),
            ErrorKind::NotFound => write!(f, "NotFound"),
            ErrorKind::AlreadyExists => write!(f, "AlreadyExists"),
            ErrorKind::Conflict => write!(f, "Conflict"),
            ErrorKind::BackendFailure => write!(f, "BackendFailure"),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidName { .. }
            | Error::InvalidCidr { .. }
            | Error::InvalidPeering { .. }
            | Error::InvalidPolicy { .. }
            | Error::UnsupportedWorkload(_)
            | Error::ConfigParse(_)
            | Error::ConfigValidation(_) => ErrorKind::InvalidInput,

            Error::VpcNotFound(_) | Error::SubnetNotFound { .. } | Error::PeeringNotFound(..) => {
                ErrorKind::NotFound
            }

            Error::VpcAlreadyExists(_) | Error::SubnetAlreadyExists { .. } => {
                ErrorKind::AlreadyExists
            }

            Error::AlreadyPeered(..) => ErrorKind::Conflict,

            Error::Io(_)
            | Error::ConfigRead { .. }
            | Error::Json(_)
            | Error::CorruptRecord { .. }
            | Error::LockTimeout { .. }
            | Error::Lock { .. }
            | Error::Commit { .. }
            | Error::Backend { .. }
            | Error::BackendTimeout { .. }
            | Error::NoDefaultRoute
            | Error::NotRoot => ErrorKind::BackendFailure,
        }
    }

    /// Process exit status for this error
    ///
    /// 2 means the request was rejected before anything was touched,
    /// 1 means the backend or the host failed underneath us.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidInput | ErrorKind::NotFound | ErrorKind::AlreadyExists => 2,
            ErrorKind::Conflict => 0,
            ErrorKind::BackendFailure => 1,
        }
    }

    /// Shorthand for a failed backend verb
    pub fn backend(verb: &str, message: impl Into<String>) -> Self {
        Error::Backend {
            verb: verb.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for vpcctl operations
pub type Result<T> = std::result::Result<T, Error>;
