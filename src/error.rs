use std::fmt;

use crate::EntityName;

/// Error types raised by the sync layer and its collaborators
#[derive(Debug)]
pub enum Error {
    /// Network or transport failure talking to the backend
    Transport(String),
    /// Snapshot fetch for an entity failed
    Snapshot { entity: EntityName, message: String },
    /// A create/update/delete call was rejected
    Mutation(String),
    /// The backend has no batch delete for this entity
    BulkDeleteUnsupported(EntityName),
    /// Persisted storage could not be read or written
    Storage(String),
    /// The change feed refused to open or close a channel
    Feed(String),
    /// A record is missing its id or is not an object
    InvalidRecord(String),
    /// A composite notification id could not be resolved
    UnknownNotification(String),
    /// Configuration could not be loaded
    Config(String),
    Serialization(serde_json::Error),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Snapshot { entity, message } => {
                write!(f, "Snapshot of {} failed: {}", entity, message)
            }
            Error::Mutation(msg) => write!(f, "Mutation failed: {}", msg),
            Error::BulkDeleteUnsupported(entity) => {
                write!(f, "Bulk delete is not supported for {}", entity)
            }
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::Feed(msg) => write!(f, "Change feed error: {}", msg),
            Error::InvalidRecord(msg) => write!(f, "Invalid record: {}", msg),
            Error::UnknownNotification(id) => write!(f, "Unknown notification: {}", id),
            Error::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::Serialization(err) => write!(f, "Serialization error: {}", err),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Serialization(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
