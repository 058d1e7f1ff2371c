//! Error types for metasync

use std::fmt;

/// Result type alias for metasync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for metasync
#[derive(Debug)]
pub enum Error {
    /// HTTP transport errors (connection refused, timeout, body read)
    Http(reqwest::Error),
    /// Non-success status returned by a server
    UnexpectedStatus {
        url: String,
        status: u16,
        body: String,
    },
    /// Server could not be reached
    Unreachable(String),
    /// No meta servers left to try
    NoServers,
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Object absent from the metadata snapshot
    NotFound(Missing),
    /// Command refused by the metadata authority
    Rejected(String),
    /// Authentication failure
    Authentication(String),
    /// Client was closed
    Closed,
    /// Client was already opened
    AlreadyOpen,
    /// Timeout
    Timeout,
    /// Query returned an error from a node
    Query(String),
    /// Tabular result could not be parsed
    Parse(String),
    /// Nodes did not converge before the deadline
    NotConverged {
        statement: String,
        lagging: Vec<String>,
    },
    /// Internal error
    Internal(String),
}

/// Identity of a metadata object that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Database(String),
    RetentionPolicy { database: String, name: String },
    User(String),
    DataNode(u64),
    MetaNode(u64),
    ShardGroup { database: String, policy: String },
    ContinuousQuery { database: String, name: String },
    Subscription { database: String, policy: String, name: String },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Database(name) => write!(f, "database not found: {}", name),
            Missing::RetentionPolicy { database, name } => {
                write!(f, "retention policy not found: {}.{}", database, name)
            }
            Missing::User(name) => write!(f, "user not found: {}", name),
            Missing::DataNode(id) => write!(f, "data node not found: {}", id),
            Missing::MetaNode(id) => write!(f, "meta node not found: {}", id),
            Missing::ShardGroup { database, policy } => {
                write!(f, "shard group not found: {}.{}", database, policy)
            }
            Missing::ContinuousQuery { database, name } => {
                write!(f, "continuous query not found: {}.{}", database, name)
            }
            Missing::Subscription {
                database,
                policy,
                name,
            } => write!(f, "subscription not found: {}.{}.{}", database, policy, name),
        }
    }
}

impl Error {
    /// True for errors that mean "the object is not in the snapshot".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for transport-level failures that the poller and submitter retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::UnexpectedStatus { .. }
                | Error::Unreachable(_)
                | Error::NoServers
                | Error::Timeout
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {}", e),
            Error::UnexpectedStatus { url, status, body } => {
                write!(f, "unexpected status from {}: {} {}", url, status, body.trim())
            }
            Error::Unreachable(addr) => write!(f, "server unreachable: {}", addr),
            Error::NoServers => write!(f, "no meta servers configured"),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::NotFound(missing) => write!(f, "{}", missing),
            Error::Rejected(msg) => write!(f, "Command rejected: {}", msg),
            Error::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            Error::Closed => write!(f, "meta client is closed"),
            Error::AlreadyOpen => write!(f, "meta client is already open"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Parse(msg) => write!(f, "Parse error: {}", msg),
            Error::NotConverged { statement, lagging } => write!(
                f,
                "nodes did not converge on {:?}: {}",
                statement,
                lagging.join("; ")
            ),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<bcrypt::BcryptError> for Error {
    fn from(e: bcrypt::BcryptError) -> Self {
        Error::Internal(format!("password hashing failed: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
