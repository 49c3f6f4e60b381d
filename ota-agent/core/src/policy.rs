//! Decides whether an offered image may be installed, given what is currently running
//! and what was last rejected by the bootloader.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::version::ImageVersion;

/// Minor versions that let any offered minor through when the running image has them.
pub const DEFAULT_WILDCARD_MINORS: [u32; 2] = [0, 255];

/// Whether the offered image must share the running image's minor version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinorGate {
    #[default]
    Off,
    Enforce,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown minor gate `{0}`, expected `off` or `enforce`")]
pub struct MinorGateParseError(String);

impl FromStr for MinorGate {
    type Err = MinorGateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "enforce" => Ok(Self::Enforce),
            other => Err(MinorGateParseError(other.to_string())),
        }
    }
}

/// Reasons an offered image is refused before anything is written.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Refusal {
    #[error("offered version `{offered}` is the same as the last invalid image")]
    SameAsLastInvalid { offered: String },
    #[error("offered minor version {offered} does not match running minor version {running}")]
    MinorVersionMismatch { offered: u32, running: u32 },
    #[error("offered version `{offered}` is already running")]
    AlreadyUpToDate { offered: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub minor_gate: MinorGate,
    pub wildcard_minors: Vec<u32>,
    /// Refuse an image whose version equals the running one.
    pub reject_same_version: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            minor_gate: MinorGate::Off,
            wildcard_minors: DEFAULT_WILDCARD_MINORS.to_vec(),
            reject_same_version: false,
        }
    }
}

impl Policy {
    /// Checks the offered version against the running and last invalid versions.
    ///
    /// Checks run in a fixed order: last invalid image, minor gate, same version.
    /// A missing or unparsable version on either side never causes a refusal on its
    /// own.
    pub fn evaluate(
        &self,
        offered: &ImageVersion,
        running: Option<&ImageVersion>,
        last_invalid: Option<&ImageVersion>,
    ) -> Result<(), Refusal> {
        if let Some(last_invalid) = last_invalid
            && offered.same_as(last_invalid)
        {
            return Err(Refusal::SameAsLastInvalid {
                offered: offered.text().to_string(),
            });
        }

        if self.minor_gate == MinorGate::Enforce {
            let minors = offered
                .parsed()
                .zip(running.and_then(ImageVersion::parsed))
                .map(|(offered, running)| (offered.minor(), running.minor()));
            match minors {
                Some((_, running)) if self.wildcard_minors.contains(&running) => {
                    debug!("running minor version {running} accepts any minor version");
                }
                Some((offered, running)) if offered != running => {
                    return Err(Refusal::MinorVersionMismatch { offered, running });
                }
                Some(_) => {}
                None => debug!("skipping minor version check, a version is unknown"),
            }
        }

        if let Some(running) = running
            && offered.same_as(running)
        {
            if self.reject_same_version {
                return Err(Refusal::AlreadyUpToDate {
                    offered: offered.text().to_string(),
                });
            }
            info!("offered version `{offered}` is already running, updating anyway");
        }

        Ok(())
    }
}
