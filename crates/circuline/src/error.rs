use opaline_binary::error::BinaryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CircuitError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Binary(#[from] BinaryError),
    #[error("Datagram too short: {len} bytes")]
    Truncated { len: usize },
    #[error("Zero-decoded payload exceeds the {max}-byte bound")]
    DecodeOverflow { max: usize },
    #[error("Message of {len} bytes cannot be split to fit the {mtu}-byte MTU")]
    Oversize { len: usize, mtu: usize },
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Circuit is not connected")]
    NotConnected,
    #[error("Circuit is shutting down")]
    Closed,
    #[error("No circuit for region handle {0}")]
    UnknownRegion(u64),
}

pub type Result<T> = std::result::Result<T, CircuitError>;
