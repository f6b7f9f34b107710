use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BunkitError, Result};

const TAG_PREFIX: &str = "bun-";

/// A `major.minor.patch` runtime release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a user supplied version request.
    ///
    /// Blank input and `latest` resolve to `Ok(None)`, leaving the choice to the
    /// installer. `bun-v1.2.3`, `v1.2.3` and `1.2.3` are accepted; anything that
    /// does not reduce to three integer components is an error.
    pub fn parse(input: &str) -> Result<Option<Self>> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }

    /// Release tag used by the upstream repository, e.g. `bun-v1.3.6`.
    pub fn git_tag(&self) -> String {
        format!("{TAG_PREFIX}v{self}")
    }
}

impl FromStr for Version {
    type Err = BunkitError;

    fn from_str(input: &str) -> Result<Self> {
        let mut rest = input.trim();
        if rest
            .get(..TAG_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(TAG_PREFIX))
        {
            rest = &rest[TAG_PREFIX.len()..];
        }
        if rest.starts_with(['v', 'V']) {
            rest = &rest[1..];
        }

        let invalid = |reason: &str| BunkitError::InvalidVersion {
            input: input.to_owned(),
            reason: reason.to_owned(),
        };

        let parts: Vec<&str> = rest.split('.').collect();
        if parts.len() != 3 {
            return Err(invalid("expected major.minor.patch"));
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| invalid("major, minor and patch must be integers"))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
