//! Error taxonomy for the protocol engine

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::OperationKind;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Username not in the server roster
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    /// Local private key could not be unlocked
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// Chain, validity or revocation check failed
    #[error("untrusted certificate: {0}")]
    UntrustedCertificate(String),

    #[error("{what} length {len} exceeds maximum {max}")]
    OversizedMessage {
        what: &'static str,
        len: u64,
        max: u64,
    },

    /// Signature or AEAD tag did not verify. Never carries primitive detail.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    #[error("counter mismatch: expected {expected}, got {actual}")]
    CounterMismatch { expected: u32, actual: u32 },

    #[error("directional counter exhausted")]
    CounterExhausted,

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("transport failure: {0}")]
    TransportFailure(#[from] io::Error),

    #[error("{operation} rejected by server (code {code}): {reason}")]
    OperationRejected {
        operation: OperationKind,
        code: u8,
        reason: &'static str,
    },

    #[error("filesystem failure on {}: {source}", path.display())]
    FilesystemFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session unusable: {0}")]
    SessionBroken(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        ProtocolError::MalformedMessage(msg.into())
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ProtocolError::FilesystemFailure {
            path: path.into(),
            source,
        }
    }

    /// True when the stream is still in sync after this error, i.e. the peer
    /// answered with a business rejection.
    pub fn keeps_session(&self) -> bool {
        matches!(self, ProtocolError::OperationRejected { .. })
    }

    /// Peer closed the connection (or it was reset) rather than sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::TransportFailure(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
