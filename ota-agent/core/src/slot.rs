use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// One of the two application partitions. Exactly one of them runs at any time; the
/// other one receives updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];

    /// The other slot.
    ///
    /// ```
    /// use ota_agent_core::Slot;
    ///
    /// assert_eq!(Slot::A.opposite(), Slot::B);
    /// assert_eq!(Slot::B.opposite().opposite(), Slot::B);
    /// ```
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown slot `{0}`, expected `a` or `b` (or `0` and `1`)")]
pub struct SlotParseError(String);

impl FromStr for Slot {
    type Err = SlotParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "0" => Ok(Slot::A),
            "b" | "1" => Ok(Slot::B),
            _ => Err(SlotParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Slot {
    type Error = SlotParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
