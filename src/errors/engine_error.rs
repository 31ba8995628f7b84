use aes_gcm_siv::Error;
use crypto_common::InvalidLength;
use std::{fmt, time::Duration};

use crate::models::handle::SetHandle;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    InvalidTtl {
        requested: Duration,
        min: Duration,
        max: Duration,
    },
    InvalidParameters(String),
    PayloadTooLarge {
        size: usize,
        max: usize,
    },
    Domain(String),
    SingularMatrix,
    InsufficientFragments {
        available: usize,
        required: usize,
    },
    UnsatisfiablePlacement {
        eligible: usize,
        required: usize,
    },
    AlreadyExpiring(SetHandle),
    Expired(SetHandle),
    DeadlineExceeded {
        retrieved: usize,
        required: usize,
    },
    CorruptedReconstruction(SetHandle),
    Corrupted {
        index: u8,
    },
    UnknownSet(SetHandle),
    Storage(String),
    AESError(Error),
    InvalidLength(InvalidLength),
    SerializationError(bincode::Error),
    IOError(std::io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::InvalidTtl {
                requested,
                min,
                max,
            } => write!(
                f,
                "TTL {:?} is outside the allowed range {:?}..={:?}",
                requested, min, max
            ),
            EngineError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            EngineError::PayloadTooLarge { size, max } => {
                write!(f, "Payload of {} bytes exceeds the {} byte limit", size, max)
            }
            EngineError::Domain(msg) => write!(f, "Field arithmetic error: {}", msg),
            EngineError::SingularMatrix => write!(f, "Decoding matrix is singular"),
            EngineError::InsufficientFragments {
                available,
                required,
            } => write!(
                f,
                "Insufficient fragments: {} available, {} required",
                available, required
            ),
            EngineError::UnsatisfiablePlacement { eligible, required } => write!(
                f,
                "Unsatisfiable placement: {} locations meet the latency bound, {} required",
                eligible, required
            ),
            EngineError::AlreadyExpiring(handle) => {
                write!(f, "{} is already expiring and cannot be extended", handle)
            }
            EngineError::Expired(handle) => write!(f, "{} has expired", handle),
            EngineError::DeadlineExceeded {
                retrieved,
                required,
            } => write!(
                f,
                "Deadline exceeded after retrieving {} of {} fragments",
                retrieved, required
            ),
            EngineError::CorruptedReconstruction(handle) => write!(
                f,
                "Reconstructed payload for {} does not match its content hash",
                handle
            ),
            EngineError::Corrupted { index } => write!(f, "Fragment {} is corrupted", index),
            EngineError::UnknownSet(handle) => write!(f, "Unknown fragment set {}", handle),
            EngineError::Storage(msg) => write!(f, "Storage error: {}", msg),
            EngineError::AESError(err) => write!(f, "AES error: {}", err),
            EngineError::InvalidLength(err) => write!(f, "Invalid length error: {}", err),
            EngineError::SerializationError(err) => write!(f, "Serialization error: {}", err),
            EngineError::IOError(err) => write!(f, "STD error: {}", err),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Error> for EngineError {
    fn from(err: Error) -> EngineError {
        EngineError::AESError(err)
    }
}

impl From<InvalidLength> for EngineError {
    fn from(err: InvalidLength) -> EngineError {
        EngineError::InvalidLength(err)
    }
}

impl From<bincode::Error> for EngineError {
    fn from(err: bincode::Error) -> EngineError {
        EngineError::SerializationError(err)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> EngineError {
        EngineError::IOError(err)
    }
}

impl EngineError {
    pub fn invalid_parameters(msg: &str) -> Self {
        EngineError::InvalidParameters(msg.to_string())
    }

    pub fn storage(msg: &str) -> Self {
        EngineError::Storage(msg.to_string())
    }

    /// Distinguishes internal faults from outcomes a caller is expected to
    /// handle, such as a set expiring on schedule or a missed deadline.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            EngineError::Domain(_)
                | EngineError::SingularMatrix
                | EngineError::Storage(_)
                | EngineError::AESError(_)
                | EngineError::InvalidLength(_)
                | EngineError::SerializationError(_)
                | EngineError::IOError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_failures_are_not_faults() {
        let handle = SetHandle::new(3, 1);
        assert!(!EngineError::Expired(handle).is_fault());
        assert!(!EngineError::InsufficientFragments {
            available: 2,
            required: 3
        }
        .is_fault());
        assert!(EngineError::SingularMatrix.is_fault());
        assert!(EngineError::storage("unreachable").is_fault());
    }

    #[test]
    fn display_names_the_handle() {
        let handle = SetHandle::new(7, 2);
        let msg = EngineError::AlreadyExpiring(handle).to_string();
        assert!(msg.contains(&handle.to_string()));
    }
}
