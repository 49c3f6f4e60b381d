use std::{io, path::PathBuf, str::FromStr};

use derive_more::Display;
use ota_agent_core::{Slot, image::IntegrityError};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

/// Error definition for library.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed accessing `{}`", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid partition data in `{}`", .path.display())]
    InvalidOtaData {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("partition directory `{}` is already initialized", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("slot {0} is running and cannot be written")]
    SlotRunning(Slot),
    #[error("slot {0} already has an open writer")]
    SlotBusy(Slot),
    #[error("slot {slot} is not bootable, its image is {state}")]
    NotBootable { slot: Slot, state: ImageState },
    #[error("writer for slot {0} is already closed")]
    WriterClosed(Slot),
    #[error("image written to slot {slot} failed verification")]
    Integrity {
        slot: Slot,
        #[source]
        source: IntegrityError,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// State of the image held by a slot.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    /// Freshly written, never booted.
    #[display("new")]
    New,
    /// Booted once, waiting for the application to confirm it works.
    #[display("pending_verify")]
    PendingVerify,
    #[display("valid")]
    Valid,
    /// Rejected after booting it.
    #[display("invalid")]
    Invalid,
    /// Never confirmed before the next reset.
    #[display("aborted")]
    Aborted,
    /// Nothing known about the slot contents.
    #[display("undefined")]
    Undefined,
}

impl ImageState {
    #[must_use]
    pub fn is_bootable(self) -> bool {
        matches!(self, Self::New | Self::PendingVerify | Self::Valid)
    }

    #[must_use]
    pub fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid | Self::Aborted)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown image state `{0}`, run `ota-slot-ctrl status list` for the accepted values")]
pub struct ImageStateParseError(String);

impl FromStr for ImageState {
    type Err = ImageStateParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let state = match s.to_lowercase().as_str() {
            "new" | "0" => Self::New,
            "pending_verify" | "pendingverify" | "pending" | "1" => Self::PendingVerify,
            "valid" | "2" => Self::Valid,
            "invalid" | "3" => Self::Invalid,
            "aborted" | "4" => Self::Aborted,
            "undefined" | "5" => Self::Undefined,
            _ => return Err(ImageStateParseError(s.to_string())),
        };
        Ok(state)
    }
}

/// Contents of `otadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct OtaData {
    pub current: Slot,
    pub next: Slot,
    pub slot_a: ImageState,
    pub slot_b: ImageState,
}

impl OtaData {
    pub(crate) fn new(current: Slot) -> Self {
        let mut data = Self {
            current,
            next: current,
            slot_a: ImageState::Undefined,
            slot_b: ImageState::Undefined,
        };
        *data.state_mut(current) = ImageState::Valid;
        data
    }

    pub(crate) fn state(&self, slot: Slot) -> ImageState {
        match slot {
            Slot::A => self.slot_a,
            Slot::B => self.slot_b,
        }
    }

    pub(crate) fn state_mut(&mut self, slot: Slot) -> &mut ImageState {
        match slot {
            Slot::A => &mut self.slot_a,
            Slot::B => &mut self.slot_b,
        }
    }
}
