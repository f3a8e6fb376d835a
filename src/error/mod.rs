// error.rs
use std::{error::Error, fmt};

use crate::connection::MigrationState;

const ERR_MSG_QUEUE_FULL: &str = "queue is full";
const ERR_MSG_TRANSPORT_CLOSED: &str = "transport is closed";
const ERR_MSG_TIMEOUT: &str = "operation timed out";
const ERR_MSG_DISCONNECTED: &str = "connection disconnected";
const ERR_MSG_CANCELLED: &str = "operation cancelled";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendFailReason {
    Timeout,
    Cancelled,
    Full,
    Closed,
}

impl fmt::Display for SendFailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailReason::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            SendFailReason::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            SendFailReason::Full => write!(f, "{ERR_MSG_QUEUE_FULL}"),
            SendFailReason::Closed => write!(f, "{ERR_MSG_TRANSPORT_CLOSED}"),
        }
    }
}

#[derive(Debug)]
pub struct SendError<T> {
    pub value: Option<T>,
    pub reason: SendFailReason,
}

impl<T> SendError<T> {
    pub fn full(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Full,
        }
    }

    pub fn closed(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Closed,
        }
    }

    pub fn cancelled(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Cancelled,
        }
    }

    pub fn timeout(value: Option<T>) -> Self {
        Self {
            value,
            reason: SendFailReason::Timeout,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: fmt::Debug> Error for SendError<T> {}

#[derive(Debug)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

#[derive(Debug)]
pub enum RecvError {
    Timeout,
    Disconnected,
    Cancelled,
    Absent,
    Unknown(anyhow::Error),
}

impl Error for RecvError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RecvError::Unknown(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "{ERR_MSG_TIMEOUT}"),
            RecvError::Disconnected => write!(f, "{ERR_MSG_DISCONNECTED}"),
            RecvError::Cancelled => write!(f, "{ERR_MSG_CANCELLED}"),
            RecvError::Absent => write!(f, "RX is absent"),
            RecvError::Unknown(err) => write!(f, "unknown error: {err}"),
        }
    }
}

impl From<anyhow::Error> for RecvError {
    fn from(err: anyhow::Error) -> Self {
        RecvError::Unknown(err)
    }
}

/// Rejected migration state transition. Carries the states involved so
/// the caller can log exactly what went wrong.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MigrationError {
    pub from: MigrationState,
    pub to: MigrationState,
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid migration transition: {:?} -> {:?}",
            self.from, self.to
        )
    }
}

impl Error for MigrationError {}

/// Graph construction failures surfaced to the requester as an ERROR
/// cmd result.
#[derive(Debug)]
pub enum GraphError {
    DuplicateNode(String),
    MalformedSpec(String),
    AddonNotFound(String),
    PredefinedGraphNotFound(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateNode(name) => {
                write!(f, "graph declares node '{name}' more than once")
            }
            GraphError::MalformedSpec(why) => write!(f, "malformed graph: {why}"),
            GraphError::AddonNotFound(addon) => write!(f, "addon not found: {addon}"),
            GraphError::PredefinedGraphNotFound(name) => {
                write!(f, "predefined graph not found: {name}")
            }
        }
    }
}

impl Error for GraphError {}

#[derive(Debug)]
pub enum ProtocolError {
    NotSupported(&'static str),
    Closed,
    Codec(String),
    Transport(std::io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::NotSupported(op) => {
                write!(f, "protocol does not support '{op}'")
            }
            ProtocolError::Closed => write!(f, "{ERR_MSG_TRANSPORT_CLOSED}"),
            ProtocolError::Codec(why) => write!(f, "codec error: {why}"),
            ProtocolError::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProtocolError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Transport(err)
    }
}

#[derive(Debug)]
pub enum ConnectError {
    BadUri(String),
    Refused(String),
    RetriesExhausted { uri: String, attempts: u32 },
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::BadUri(uri) => write!(f, "bad uri: {uri}"),
            ConnectError::Refused(uri) => write!(f, "connection refused: {uri}"),
            ConnectError::RetriesExhausted { uri, attempts } => {
                write!(f, "failed to connect to {uri} after {attempts} attempts")
            }
        }
    }
}

impl Error for ConnectError {}
