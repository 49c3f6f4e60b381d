//! Domain types shared by the OTA agent and the slot controller: the firmware image
//! format, firmware versions and the policy deciding whether an offered image is
//! accepted.

#![forbid(unsafe_code)]
#![warn(unreachable_pub)]

pub mod image;
pub mod policy;
mod slot;
pub mod version;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use image::{ImageMetadata, VerifiedImage};
pub use policy::{MinorGate, Policy, Refusal};
pub use slot::{Slot, SlotParseError};
pub use version::{FirmwareVersion, ImageVersion, VersionParseError};
