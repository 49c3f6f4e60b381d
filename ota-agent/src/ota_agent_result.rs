use std::process::{ExitCode, Termination};

use crate::error::{FailureReason, UpdateError};

/// Exit codes returned by the OTA agent. Custom exit codes are taken in accordance with the
/// Linux Standard Base Core Specification and are in the range 150-199.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OtaAgentResult {
    Success = 0,
    Failure = 1,
    DownloadFailed = 150,
    ImageRefused = 151,
}

impl Termination for OtaAgentResult {
    fn report(self) -> ExitCode {
        ExitCode::from(self as u8)
    }
}

impl From<&UpdateError> for OtaAgentResult {
    fn from(err: &UpdateError) -> Self {
        match err.reason() {
            FailureReason::Connect
            | FailureReason::HeaderTooShort
            | FailureReason::TransferInterrupted => Self::DownloadFailed,
            FailureReason::InvalidHeader
            | FailureReason::SameAsLastInvalid
            | FailureReason::MinorVersionMismatch
            | FailureReason::AlreadyUpToDate => Self::ImageRefused,
            FailureReason::Context
            | FailureReason::StorageWrite
            | FailureReason::Integrity
            | FailureReason::Commit
            | FailureReason::Restart => Self::Failure,
        }
    }
}

impl From<eyre::Report> for OtaAgentResult {
    fn from(err: eyre::Report) -> Self {
        match err.downcast_ref::<UpdateError>() {
            Some(err) => err.into(),
            None => Self::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use ota_agent_core::Refusal;

    use super::*;

    #[test]
    fn test_refusals_exit_with_image_refused() {
        let err = UpdateError::from(Refusal::SameAsLastInvalid {
            offered: "1.5.0".into(),
        });
        assert_eq!(
            OtaAgentResult::from(eyre::Report::new(err)),
            OtaAgentResult::ImageRefused
        );
    }

    #[test]
    fn test_interrupted_transfer_exits_with_download_failed() {
        let err = UpdateError::TransferInterrupted {
            received: 4096,
            source: None,
        };
        assert_eq!(OtaAgentResult::from(&err), OtaAgentResult::DownloadFailed);
    }

    #[test]
    fn test_other_errors_exit_with_failure() {
        let report = eyre::eyre!("failed opening partition directory");
        assert_eq!(OtaAgentResult::from(report), OtaAgentResult::Failure);
    }
}
