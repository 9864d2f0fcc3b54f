use std::{fmt, io};

use crate::NodeId;

/// Raises an unrecoverable condition. The diagnostic is logged before the
/// node panics; a panic on any node takes the whole run down with it.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        panic!($($arg)+)
    }};
}

#[derive(Debug)]
pub enum Error {
    /// The transport has no live endpoint for the node.
    TransportClosed(NodeId),
    /// A node id outside `0..num_nodes`.
    UnknownNode(NodeId),
    /// A payload of the named type could not be serialized.
    Serialize(&'static str),
    /// A payload of the named type failed validation or decoding.
    Deserialize(&'static str),
    /// An envelope was truncated or carried an invalid field.
    MalformedEnvelope(&'static str),
    Io(io::Error),
    Json(serde_json::Error),
    /// A node task was cancelled before it finished.
    Aborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransportClosed(node) => {
                write!(f, "transport to node {} is closed", node)
            }
            Error::UnknownNode(node) => write!(f, "node {} does not exist", node),
            Error::Serialize(ty) => write!(f, "could not serialize {}", ty),
            Error::Deserialize(ty) => write!(f, "could not deserialize {}", ty),
            Error::MalformedEnvelope(what) => {
                write!(f, "malformed envelope: {}", what)
            }
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Json(e) => write!(f, "json error: {}", e),
            Error::Aborted => write!(f, "node task aborted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<unsigned_varint::decode::Error> for Error {
    fn from(_: unsigned_varint::decode::Error) -> Self {
        Self::MalformedEnvelope("bad varint")
    }
}
