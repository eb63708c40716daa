use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for event consumers.
///
/// A lightweight, copyable view of [`Error`] that travels inside
/// [`ShardEvent::Error`](crate::ShardEvent::Error) so subscribers can branch on
/// the failure class without holding the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// REST discovery failed
    Discovery,
    /// Endpoint/limits were needed before any successful discovery
    NoGateway,
    /// Resume requested without a session
    NoSession,
    /// Operation needed a live socket
    NoConnection,
    /// Payload could not be encoded or decoded
    Encoding,
    /// Socket-level failure
    Transport,
    /// Server closed with a non-recoverable code
    FatalClose,
    /// Routing or inter-process failure
    Routing,
    /// Other error
    Other,
}

impl ErrorKind {
    /// Short lowercase name used in relayed events.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Discovery => "discovery",
            ErrorKind::NoGateway => "no_gateway",
            ErrorKind::NoSession => "no_session",
            ErrorKind::NoConnection => "no_connection",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Transport => "transport",
            ErrorKind::FatalClose => "fatal_close",
            ErrorKind::Routing => "routing",
            ErrorKind::Other => "other",
        }
    }
}

/// Errors that can occur in ws-gateway-cluster
#[derive(Error, Debug)]
pub enum Error {
    /// REST discovery returned a non-success status or an unparseable body
    #[error("Gateway discovery failed: {0}")]
    Discovery(String),

    /// No successful discovery has happened yet
    #[error("No gateway to connect to")]
    NoGateway,

    /// `resume` was invoked without a session
    #[error("No session available to resume")]
    NoSession,

    /// The shard has no live socket
    #[error("Shard {0} has no open connection")]
    NoConnection(u32),

    /// Payload encode/decode failure or unsupported encoding
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// WebSocket protocol / socket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The server closed with a non-recoverable code
    #[error("Connection closed with fatal code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    /// No shard with this id is owned by the cluster
    #[error("Unknown shard {0}")]
    UnknownShard(u32),

    /// No child process owns this shard id
    #[error("No child process owns shard {0}")]
    NoRoute(u32),

    /// Shard id ranges handed to the process cluster overlap or are empty
    #[error("Invalid shard ranges: {0}")]
    OverlappingRanges(String),

    /// Inter-process channel failure
    #[error("IPC error: {0}")]
    Ipc(String),

    /// I/O failure (process spawn, pipes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shard task is gone
    #[error("Shard is shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Discovery(_) => ErrorKind::Discovery,
            Error::NoGateway => ErrorKind::NoGateway,
            Error::NoSession => ErrorKind::NoSession,
            Error::NoConnection(_) => ErrorKind::NoConnection,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::WebSocket(_) | Error::ConnectionFailed(_) => ErrorKind::Transport,
            Error::FatalClose { .. } => ErrorKind::FatalClose,
            Error::UnknownShard(_)
            | Error::NoRoute(_)
            | Error::OverlappingRanges(_)
            | Error::Ipc(_) => ErrorKind::Routing,
            Error::Io(_) | Error::ShuttingDown | Error::Config(_) => ErrorKind::Other,
        }
    }

    /// Whether the shard recovers from this locally by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Discovery | ErrorKind::Encoding
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NoSession.kind(), ErrorKind::NoSession);
        assert_eq!(Error::NoConnection(3).kind(), ErrorKind::NoConnection);
        assert_eq!(Error::NoRoute(9).kind(), ErrorKind::Routing);
        assert_eq!(
            Error::FatalClose {
                code: 4004,
                reason: String::new()
            }
            .kind(),
            ErrorKind::FatalClose
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::ConnectionFailed("refused".into()).is_transient());
        assert!(Error::Discovery("502".into()).is_transient());
        assert!(!Error::NoSession.is_transient());
        assert!(!Error::NoGateway.is_transient());
    }
}
