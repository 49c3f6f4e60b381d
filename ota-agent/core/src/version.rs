//! Firmware versions as embedded in an image's application descriptor.
//!
//! The descriptor stores the version as free-form text. Only text of the exact form
//! `major.minor.patch` with three unsigned decimal components is understood as a
//! [`FirmwareVersion`]; anything else is kept verbatim as an [`ImageVersion`] whose
//! parsed form is unknown.

use std::{fmt, str::FromStr};

use tracing::debug;

/// A parsed `major.minor.patch` version.
///
/// Ordering is lexicographic on `(major, minor, patch)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

impl FirmwareVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    #[must_use]
    pub fn major(&self) -> u32 {
        self.major
    }

    #[must_use]
    pub fn minor(&self) -> u32 {
        self.minor
    }

    #[must_use]
    pub fn patch(&self) -> u32 {
        self.patch
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("failed to parse `{input}` as firmware version, expected `major.minor.patch`")]
pub struct VersionParseError {
    input: String,
}

impl FromStr for FirmwareVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError {
            input: s.to_string(),
        };
        let mut parts = s.split('.').map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            part.parse::<u32>().map_err(|_| err())
        });
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };
        Ok(Self::new(major?, minor?, patch?))
    }
}

/// The version text of an image together with its parsed form, if it has one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageVersion {
    text: String,
    parsed: Option<FirmwareVersion>,
}

impl ImageVersion {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let parsed = match text.parse() {
            Ok(version) => Some(version),
            Err(e) => {
                debug!("version is unknown: {e}");
                None
            }
        };
        Self { text, parsed }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn parsed(&self) -> Option<FirmwareVersion> {
        self.parsed
    }

    /// Whether two images carry the same version.
    ///
    /// Parsed versions are compared when both sides have one, the raw text otherwise.
    #[must_use]
    pub fn same_as(&self, other: &ImageVersion) -> bool {
        match (self.parsed, other.parsed) {
            (Some(a), Some(b)) => a == b,
            _ => self.text == other.text,
        }
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
