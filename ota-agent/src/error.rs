use std::io;

use derive_more::Display;
use ota_agent_core::{Refusal, Slot, image::HeaderError};

use crate::transport;

/// Why an update attempt ended in [`crate::orchestrator::Phase::Failed`].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum FailureReason {
    Context,
    Connect,
    HeaderTooShort,
    InvalidHeader,
    SameAsLastInvalid,
    MinorVersionMismatch,
    AlreadyUpToDate,
    TransferInterrupted,
    StorageWrite,
    Integrity,
    Commit,
    Restart,
}

/// Errors ending an update attempt. None of them is retried.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum UpdateError {
    #[error("failed reading the running slot context")]
    Context(#[source] eyre::Report),
    #[error("failed connecting to `{url}`")]
    Connect {
        url: String,
        #[source]
        source: transport::Error,
    },
    #[error("stream ended before the image header: got {received} bytes, need {needed}")]
    HeaderTooShort { received: usize, needed: usize },
    #[error("stream does not start with a valid image header")]
    InvalidHeader(#[source] HeaderError),
    #[error("image refused")]
    Refused(#[from] Refusal),
    #[error("transfer interrupted after {received} bytes")]
    TransferInterrupted {
        received: u64,
        #[source]
        source: Option<io::Error>,
    },
    #[error("failed writing image to slot {slot}")]
    StorageWrite {
        slot: Slot,
        #[source]
        source: eyre::Report,
    },
    #[error("image written to slot {slot} failed verification")]
    Integrity {
        slot: Slot,
        #[source]
        source: eyre::Report,
    },
    #[error("failed setting slot {slot} as boot target")]
    Commit {
        slot: Slot,
        #[source]
        source: eyre::Report,
    },
    #[error("failed requesting restart")]
    Restart(#[source] eyre::Report),
}

impl UpdateError {
    #[must_use]
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Context(_) => FailureReason::Context,
            Self::Connect { .. } => FailureReason::Connect,
            Self::HeaderTooShort { .. } => FailureReason::HeaderTooShort,
            Self::InvalidHeader(_) => FailureReason::InvalidHeader,
            Self::Refused(Refusal::SameAsLastInvalid { .. }) => {
                FailureReason::SameAsLastInvalid
            }
            Self::Refused(Refusal::MinorVersionMismatch { .. }) => {
                FailureReason::MinorVersionMismatch
            }
            Self::Refused(Refusal::AlreadyUpToDate { .. }) => {
                FailureReason::AlreadyUpToDate
            }
            Self::TransferInterrupted { .. } => FailureReason::TransferInterrupted,
            Self::StorageWrite { .. } => FailureReason::StorageWrite,
            Self::Integrity { .. } => FailureReason::Integrity,
            Self::Commit { .. } => FailureReason::Commit,
            Self::Restart(_) => FailureReason::Restart,
        }
    }
}

impl From<HeaderError> for UpdateError {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::TooShort { received, needed } => {
                Self::HeaderTooShort { received, needed }
            }
            other => Self::InvalidHeader(other),
        }
    }
}
