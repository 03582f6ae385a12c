//! Error types for the node agent.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Every failure reachable from the command surface maps onto an [`ErrorKind`].

#![allow(unused_assignments)]

use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy reported to callers of the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed or invalid arguments; nothing was changed.
    BadRequest,
    /// Unknown container or NIC index.
    NotFound,
    /// The target is not in the state the operation requires.
    PreconditionFailed,
    /// Hard container limit reached.
    ServiceUnavailable,
    /// Unexpected OS or collaborator failure.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest => write!(f, "bad-request"),
            Self::NotFound => write!(f, "not-found"),
            Self::PreconditionFailed => write!(f, "precondition-failed"),
            Self::ServiceUnavailable => write!(f, "service-unavailable"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Top-level error type for the binary.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(nodecore::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Command surface error
    #[error("Command server error")]
    #[diagnostic(code(nodecore::server))]
    Server(#[from] ServerError),

    /// Container manager error
    #[error(transparent)]
    #[diagnostic(transparent)]
    Manager(#[from] ManagerError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(nodecore::io))]
    Io(#[from] std::io::Error),
}

/// Errors returned by the container manager's command surface.
#[derive(Error, Debug, Diagnostic)]
pub enum ManagerError {
    /// Declared arguments failed validation
    #[error("{0}")]
    #[diagnostic(code(nodecore::manager::invalid_arguments))]
    InvalidArguments(String),

    /// No container registered under this id
    #[error("container {id} does not exist")]
    #[diagnostic(code(nodecore::manager::not_found))]
    NotFound { id: u16 },

    /// NIC index outside the container's NIC list
    #[error("nic index {index} out of range")]
    #[diagnostic(code(nodecore::manager::nic_not_found))]
    NicNotFound { index: usize },

    /// Operation requires a different state
    #[error("{0}")]
    #[diagnostic(code(nodecore::manager::precondition))]
    PreconditionFailed(String),

    /// Hard container limit reached
    #[error("reached the hard limit of {limit} containers")]
    #[diagnostic(
        code(nodecore::manager::limit),
        help("Terminate unused containers or raise --max-containers")
    )]
    LimitReached { limit: usize },

    /// Sandbox construction or process launch failed
    #[error("sandbox error")]
    #[diagnostic(code(nodecore::manager::sandbox))]
    Sandbox(#[from] SandboxError),

    /// Network attachment failed
    #[error("network error")]
    #[diagnostic(code(nodecore::manager::network))]
    Network(#[from] NetworkError),

    /// Relay transport failed
    #[error("relay error")]
    #[diagnostic(code(nodecore::manager::relay))]
    Relay(#[from] RelayError),

    /// Config store failed
    #[error("config store error")]
    #[diagnostic(code(nodecore::manager::store))]
    Store(#[from] StoreError),

    /// Collaborator failed
    #[error("collaborator error")]
    #[diagnostic(code(nodecore::manager::capability))]
    Capability(#[from] CapabilityError),

    /// Backup or restore failed
    #[error("{0}")]
    #[diagnostic(code(nodecore::manager::backup))]
    Backup(String),

    /// I/O error with context
    #[error("I/O error: {context}")]
    #[diagnostic(code(nodecore::manager::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ManagerError {
    /// Classifies the error for the command surface.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArguments(_) => ErrorKind::BadRequest,
            Self::NotFound { .. } | Self::NicNotFound { .. } => ErrorKind::NotFound,
            Self::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            Self::LimitReached { .. } => ErrorKind::ServiceUnavailable,
            Self::Network(e) => e.kind(),
            Self::Sandbox(SandboxError::PathEscape { .. }) => ErrorKind::BadRequest,
            Self::Sandbox(_)
            | Self::Relay(_)
            | Self::Store(_)
            | Self::Capability(_)
            | Self::Backup(_)
            | Self::IoError { .. } => ErrorKind::Internal,
        }
    }

    /// Renders the full error chain on one line.
    #[must_use]
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str(": ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}

/// Errors related to sandbox construction and process launch.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// A mount operation failed
    #[error("mount failed")]
    #[diagnostic(code(nodecore::sandbox::mount))]
    Mount(#[from] MountError),

    /// A guest path resolved outside the sandbox root
    #[error("path '{path}' escapes the sandbox root")]
    #[diagnostic(code(nodecore::sandbox::path_escape))]
    PathEscape { path: String },

    /// The filesystem collaborator failed
    #[error("filesystem collaborator failed")]
    #[diagnostic(code(nodecore::sandbox::filesystem))]
    Filesystem(#[from] CapabilityError),

    /// The isolated process could not be spawned
    #[error("failed to launch isolated process: {0}")]
    #[diagnostic(code(nodecore::sandbox::launch))]
    LaunchFailed(String),

    /// Waiting on or signalling the isolated process failed
    #[error("process control failed: {0}")]
    #[diagnostic(code(nodecore::sandbox::process))]
    Process(String),

    /// I/O error with context
    #[error("I/O error: {context}")]
    #[diagnostic(code(nodecore::sandbox::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to bind mounts and unmounts.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// Bind mount failed
    #[error("bind mount failed: {0}")]
    #[diagnostic(code(nodecore::mount::bind))]
    BindMount(String),

    /// Overlay mount failed
    #[error("overlay mount failed: {0}")]
    #[diagnostic(code(nodecore::mount::overlay))]
    OverlayMount(String),

    /// Unmount failed
    #[error("unmount failed: {0}")]
    #[diagnostic(code(nodecore::mount::unmount))]
    Unmount(String),

    /// Mount point preparation failed
    #[error("failed to prepare mount point {path}")]
    #[diagnostic(code(nodecore::mount::target))]
    Target {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to NIC attachment and teardown.
#[derive(Error, Debug, Diagnostic)]
pub enum NetworkError {
    /// NIC declaration is invalid
    #[error("{0}")]
    #[diagnostic(code(nodecore::network::invalid))]
    Invalid(String),

    /// Required sibling container or state missing
    #[error("{0}")]
    #[diagnostic(code(nodecore::network::precondition))]
    Precondition(String),

    /// A host tool invocation failed
    #[error("network command failed")]
    #[diagnostic(code(nodecore::network::command))]
    Command(#[from] CapabilityError),

    /// The switch agent returned an unusable answer
    #[error("switch agent error: {0}")]
    #[diagnostic(code(nodecore::network::switch))]
    Switch(String),

    /// Round-trip to the switch agent failed
    #[error("switch agent dispatch failed: {0}")]
    #[diagnostic(code(nodecore::network::dispatch))]
    Dispatch(String),

    /// Namespace binding failed
    #[error("namespace binding failed")]
    #[diagnostic(code(nodecore::network::netns))]
    Netns(#[from] MountError),

    /// Overlay daemon failed
    #[error("overlay network error: {0}")]
    #[diagnostic(code(nodecore::network::overlay))]
    Overlay(String),

    /// I/O error with context
    #[error("I/O error: {context}")]
    #[diagnostic(code(nodecore::network::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl NetworkError {
    /// Classifies the error for the command surface.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::BadRequest,
            Self::Precondition(_) => ErrorKind::PreconditionFailed,
            _ => ErrorKind::Internal,
        }
    }
}

/// Errors related to the relay protocol.
#[derive(Error, Debug, Diagnostic)]
pub enum RelayError {
    /// Command could not be encoded
    #[error("failed to encode command")]
    #[diagnostic(code(nodecore::relay::encode))]
    Encode(#[source] serde_json::Error),

    /// Envelope could not be decoded
    #[error("failed to decode envelope")]
    #[diagnostic(code(nodecore::relay::decode))]
    Decode(#[source] serde_json::Error),

    /// No reader opened the input stream in time
    #[error("command {id} was not delivered within {timeout_ms}ms")]
    #[diagnostic(
        code(nodecore::relay::delivery_timeout),
        help("The in-sandbox helper is not reading its input stream")
    )]
    DeliveryTimeout { id: String, timeout_ms: u128 },

    /// The writer has shut down
    #[error("relay channel is closed")]
    #[diagnostic(code(nodecore::relay::closed))]
    Closed,

    /// No result arrived in time
    #[error("no result for {id} within {timeout_ms}ms")]
    #[diagnostic(code(nodecore::relay::result_timeout))]
    ResultTimeout { id: String, timeout_ms: u128 },

    /// I/O error with context
    #[error("I/O error: {context}")]
    #[diagnostic(code(nodecore::relay::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to the per-container config file.
#[derive(Error, Debug, Diagnostic)]
pub enum StoreError {
    /// I/O error with context
    #[error("I/O error: {context}")]
    #[diagnostic(code(nodecore::store::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The file content is not valid arguments JSON
    #[error("config file {path} is corrupt")]
    #[diagnostic(code(nodecore::store::corrupt))]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by collaborator implementations.
#[derive(Error, Debug, Diagnostic)]
pub enum CapabilityError {
    /// A host program exited unsuccessfully
    #[error("{program} {args} failed: {stderr}")]
    #[diagnostic(code(nodecore::capability::exec))]
    CommandFailed {
        program: String,
        args: String,
        stderr: String,
    },

    /// Generic collaborator failure
    #[error("{capability}: {reason}")]
    #[diagnostic(code(nodecore::capability::failed))]
    Failed {
        capability: &'static str,
        reason: String,
    },

    /// The broker has no result for this id
    #[error("no result for {id}")]
    #[diagnostic(code(nodecore::capability::broker))]
    NoResult { id: String },

    /// I/O error with context
    #[error("I/O error: {context}")]
    #[diagnostic(code(nodecore::capability::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to system requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Agent not running as root
    #[error("The agent must run as root (euid {euid})")]
    #[diagnostic(
        code(nodecore::system::root),
        help("Mounts, namespaces and links need CAP_SYS_ADMIN and CAP_NET_ADMIN")
    )]
    NotRoot { euid: u32 },

    /// Kernel version too old
    #[error("Kernel version {found} is below minimum required {required}")]
    #[diagnostic(
        code(nodecore::system::kernel_version),
        help("Upgrade to a kernel with network namespace and cgroups v2 support")
    )]
    KernelTooOld { found: String, required: String },

    /// cgroups v2 not available
    #[error("cgroups v2 is not available")]
    #[diagnostic(
        code(nodecore::system::cgroups),
        help("Mount cgroups v2 with: mount -t cgroup2 none /sys/fs/cgroup")
    )]
    CgroupsV2Unavailable,

    /// A required host tool is missing
    #[error("Required tool '{tool}' was not found")]
    #[diagnostic(
        code(nodecore::system::tool),
        help("Install iproute2 so the agent can manage links and namespaces")
    )]
    ToolMissing { tool: String },

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(nodecore::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to the command surface.
#[derive(Error, Debug, Diagnostic)]
pub enum ServerError {
    /// Request line could not be parsed
    #[error("Invalid request: {0}")]
    #[diagnostic(code(nodecore::server::request))]
    InvalidRequest(String),

    /// Transport error
    #[error("Transport error: {0}")]
    #[diagnostic(code(nodecore::server::transport))]
    Transport(String),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
