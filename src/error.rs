use thiserror::Error;

use crate::model::{ContainerId, Signature};

/// A container payload that does not decrypt to what its descriptors promise.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("chunk {index} spans {start}..{end}, past the {payload_len} byte payload")]
    OutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        payload_len: usize,
    },

    #[error("chunk {index} failed to decompress: {source}")]
    Decompress {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk {index} is {actual} bytes, descriptor says {expected}")]
    SizeMismatch {
        index: usize,
        expected: u32,
        actual: usize,
    },

    #[error("chunk {index} plaintext does not match its checksum")]
    ChecksumMismatch { index: usize },
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("file {signature} references container #{container_index}, group {group} has {containers}")]
    UnknownContainer {
        signature: Signature,
        group: usize,
        container_index: u32,
        containers: usize,
    },

    #[error("file {signature} references chunk #{chunk_index} of container {container}, which has {chunks}")]
    UnknownChunk {
        signature: Signature,
        container: ContainerId,
        chunk_index: u32,
        chunks: usize,
    },

    #[error("manifest codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// A failed fetch, as reported by the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

#[derive(Debug, Error)]
pub enum AbsorbError {
    #[error("container {container} is corrupt: {source}")]
    Integrity {
        container: ContainerId,
        #[source]
        source: DecryptError,
    },

    #[error("writing {signature} failed: {source}")]
    Write {
        signature: Signature,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("store bookkeeping fault: {0}")]
    Internal(String),
}

/// Everything that can go wrong with one unit of work: fetching a container
/// and absorbing it.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Absorb(#[from] AbsorbError),
}

/// A unit-scoped failure. The unit lands in the failed partition and is
/// retried next round.
#[derive(Debug, Error)]
pub enum UnitFailure {
    #[error("transport: {0}")]
    Transport(#[source] TransportError),

    #[error("data integrity: {0}")]
    Integrity(#[source] DecryptError),

    #[error("write of {signature} failed: {message}")]
    Write {
        signature: Signature,
        message: String,
    },
}

/// Stops the whole download. Nothing is scheduled after one of these.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("internal fault: {0}")]
    Internal(String),

    #[error("authentication failed: {0}")]
    Authentication(#[source] TransportError),
}

impl UnitError {
    /// Splits failures into the ones a later round may fix and the ones that
    /// end the run.
    pub fn classify(self) -> Result<UnitFailure, Fatal> {
        match self {
            UnitError::Transport(err) if err.is_unauthorized() => Err(Fatal::Authentication(err)),
            UnitError::Transport(err) => Ok(UnitFailure::Transport(err)),
            UnitError::Absorb(AbsorbError::Integrity { source, .. }) => {
                Ok(UnitFailure::Integrity(source))
            }
            UnitError::Absorb(AbsorbError::Write { signature, source }) => Ok(UnitFailure::Write {
                signature,
                message: source.to_string(),
            }),
            UnitError::Absorb(AbsorbError::Internal(message)) => Err(Fatal::Internal(message)),
        }
    }
}
