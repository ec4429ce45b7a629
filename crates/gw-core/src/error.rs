//! Core error types for guestwire
//!
//! Transport failures carry an [`ErrorKind`]. Whether a kind is retried by the
//! connection loop, and what the readiness prober tells the user about it,
//! both come from the single [`CLASSIFICATION`] table.

use std::fmt;
use std::io;
use std::path::PathBuf;

use gw_protocol::ProtocolError;
use thiserror::Error;

/// Category of a transport-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connect attempt exceeded its timeout
    ConnectionTimeout,
    /// Credentials were rejected
    AuthenticationFailed,
    /// Remote side closed the connection during the handshake
    Disconnected,
    /// Nothing listening on the guest port yet
    ConnectionRefused,
    /// Connection reset by peer
    ConnectionReset,
    /// Connection aborted locally
    ConnectionAborted,
    /// Host is down
    HostDown,
    /// No route to host or network
    NoRoute,
    /// EACCES from connect(); seen transiently on some hosts
    AccessDenied,
    /// Local address in use
    AddressInUse,
    /// Host key did not pass verification
    HostKeyRejected,
    /// Private key algorithm not supported by the transport library
    KeyTypeNotSupported,
    /// A channel could not be opened on an established session
    ChannelOpenFailed,
    /// Anything else the transport library reports
    Other,
}

/// Retry policy attached to an error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Transient,
    Fatal,
}

/// Classification table: kind, retry policy, readiness message
pub const CLASSIFICATION: &[(ErrorKind, Retry, Option<&str>)] = &[
    (ErrorKind::ConnectionTimeout, Retry::Transient, Some("Connection timeout.")),
    (ErrorKind::AuthenticationFailed, Retry::Fatal, Some("Authentication failure.")),
    (ErrorKind::Disconnected, Retry::Transient, Some("Remote connection disconnect.")),
    (ErrorKind::ConnectionRefused, Retry::Transient, Some("Connection refused.")),
    (ErrorKind::ConnectionReset, Retry::Transient, Some("Connection reset.")),
    (ErrorKind::ConnectionAborted, Retry::Transient, Some("Connection aborted.")),
    (ErrorKind::HostDown, Retry::Transient, Some("Host appears down.")),
    (ErrorKind::NoRoute, Retry::Transient, Some("Host unreachable.")),
    (ErrorKind::AccessDenied, Retry::Transient, None),
    (ErrorKind::AddressInUse, Retry::Transient, None),
    (ErrorKind::HostKeyRejected, Retry::Fatal, None),
    (ErrorKind::KeyTypeNotSupported, Retry::Fatal, None),
    (ErrorKind::ChannelOpenFailed, Retry::Fatal, None),
    (ErrorKind::Other, Retry::Fatal, None),
];

impl ErrorKind {
    fn classify(self) -> (Retry, Option<&'static str>) {
        CLASSIFICATION
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, retry, message)| (*retry, *message))
            .unwrap_or((Retry::Fatal, None))
    }

    /// Whether the connection loop should retry this kind
    pub fn is_retryable(self) -> bool {
        self.classify().0 == Retry::Transient
    }

    /// Message shown by the readiness prober while it keeps waiting
    pub fn readiness_message(self) -> Option<&'static str> {
        self.classify().1
    }

    /// Classify an I/O error from the socket layer
    pub fn from_io(err: &io::Error) -> Self {
        #[cfg(unix)]
        if let Some(code) = err.raw_os_error() {
            match code {
                libc::EHOSTDOWN => return ErrorKind::HostDown,
                libc::EHOSTUNREACH | libc::ENETUNREACH => return ErrorKind::NoRoute,
                _ => {}
            }
        }

        match err.kind() {
            io::ErrorKind::TimedOut => ErrorKind::ConnectionTimeout,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
            io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            io::ErrorKind::AddrInUse => ErrorKind::AddressInUse,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => ErrorKind::Disconnected,
            _ => ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ConnectionTimeout => "connection timeout",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::ConnectionRefused => "connection refused",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::ConnectionAborted => "connection aborted",
            ErrorKind::HostDown => "host down",
            ErrorKind::NoRoute => "no route to host",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::AddressInUse => "address in use",
            ErrorKind::HostKeyRejected => "host key rejected",
            ErrorKind::KeyTypeNotSupported => "key type not supported",
            ErrorKind::ChannelOpenFailed => "channel open failed",
            ErrorKind::Other => "transport error",
        };
        f.write_str(name)
    }
}

/// A failure reported by the transport layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// Failure category
    pub kind: ErrorKind,
    /// Detail from the underlying library
    pub message: String,
}

impl TransportError {
    /// Create a new transport error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the connection loop should retry this error
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::new(ErrorKind::from_io(&err), err.to_string())
    }
}

/// Top-level error type for the communicator
#[derive(Error, Debug)]
pub enum CommError {
    /// Transport error
    #[error("SSH transport error: {0}")]
    Transport(TransportError),

    /// The machine has not reported an SSH address yet
    #[error("The guest is not ready for SSH yet: no address has been reported")]
    SshNotReady,

    /// The remote shell misbehaved
    #[error("The configured shell is not behaving as expected; the remote shell must support non-interactive execution")]
    InvalidShell,

    /// Local private key type is unusable
    #[error("Private key type is not supported: {0}")]
    KeyTypeNotSupported(String),

    /// The guest's sshd does not accept the key type
    #[error("Key type {requested} is not supported by the guest SSH server (supported: {})", supported.join(", "))]
    KeyTypeNotSupportedByServer {
        requested: String,
        supported: Vec<String>,
    },

    /// The private key file belongs to another user
    #[error("Private key {} is not owned by the current user", path.display())]
    KeyBadOwner { path: PathBuf },

    /// The private key file permissions could not be tightened
    #[error("Private key {} has permissions that could not be fixed: {source}", path.display())]
    KeyBadPermissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The guest cannot install or remove public keys
    #[error("The guest does not support inserting and removing public keys")]
    InsertKeyUnsupported,

    /// Supported key types could not be determined
    #[error("No server data available to determine supported key types")]
    ServerDataUnavailable,

    /// The channel closed without reporting an exit status
    #[error("The remote command finished without reporting an exit status")]
    NoExitStatus,

    /// The command exited outside the accepted set
    #[error("Remote command exited with status {exit_status} ({key}): {command}\n\nStdout:\n{stdout}\n\nStderr:\n{stderr}")]
    BadExitStatus {
        key: String,
        command: String,
        exit_status: u32,
        stdout: String,
        stderr: String,
    },

    /// The guest has no scp binary
    #[error("scp is not available on the guest (exit status 127)")]
    ScpUnavailable,

    /// The guest refused a copy for permissions
    #[error("Permission denied copying {from} to {to}")]
    ScpPermissionDenied { from: String, to: String },

    /// Any other scp failure
    #[error("scp failed: {0}")]
    Scp(String),

    /// Keypair generation or serialization failed
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Transcript framing error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Guest capability error
    #[error("Guest capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CommError {
    /// Errors that waiting longer cannot fix; the readiness prober re-raises them
    pub fn is_fatal_for_readiness(&self) -> bool {
        match self {
            CommError::InvalidShell
            | CommError::KeyTypeNotSupported(_)
            | CommError::KeyTypeNotSupportedByServer { .. }
            | CommError::KeyBadOwner { .. }
            | CommError::KeyBadPermissions { .. }
            | CommError::InsertKeyUnsupported => true,
            _ => false,
        }
    }

    /// The message the readiness prober shows while it keeps waiting
    pub fn readiness_message(&self) -> Option<&'static str> {
        match self {
            CommError::Transport(err) => err.kind.readiness_message(),
            _ => None,
        }
    }

    /// The transport error kind, if this is a transport error
    pub fn transport_kind(&self) -> Option<ErrorKind> {
        match self {
            CommError::Transport(err) => Some(err.kind),
            _ => None,
        }
    }
}

impl From<TransportError> for CommError {
    fn from(err: TransportError) -> Self {
        match err.kind {
            ErrorKind::KeyTypeNotSupported => CommError::KeyTypeNotSupported(err.message),
            _ => CommError::Transport(err),
        }
    }
}

/// Guest capability errors
#[derive(Error, Debug)]
pub enum CapabilityError {
    /// The guest does not implement the capability
    #[error("Guest capability not available: {0}")]
    Unavailable(String),

    /// The capability ran and failed
    #[error("Guest capability {name} failed: {message}")]
    Failed { name: String, message: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
