use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A four-part compiler/linker tool version (major.minor.build.revision).
///
/// Ordering is lexicographic over the tuple, never string-based, so
/// `19.13.26030.0` correctly exceeds `19.13.26029.0` while falling short of
/// `19.13.26115.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("version '{0}' must have two to four dotted components")]
    ComponentCount(String),
    #[error("version '{0}' contains a non-numeric component")]
    NonNumeric(String),
}

impl ToolVersion {
    /// Sentinel used for unbounded range ends and "always fails" minimums,
    /// written as `*` in policy files.
    pub const MAX: ToolVersion = ToolVersion::new(u32::MAX, u32::MAX, u32::MAX, u32::MAX);

    pub const MIN: ToolVersion = ToolVersion::new(0, 0, 0, 0);

    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        ToolVersion {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == ToolVersion::MAX {
            return f.write_str("*");
        }
        let mut first = true;
        for component in [self.major, self.minor, self.build, self.revision] {
            if !first {
                f.write_str(".")?;
            }
            if component == u32::MAX {
                f.write_str("*")?;
            } else {
                write!(f, "{}", component)?;
            }
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ToolVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(ToolVersion::MAX);
        }

        let mut parts = [0u32; 4];
        let mut count = 0;
        for piece in s.split('.') {
            if count == 4 {
                return Err(VersionParseError::ComponentCount(s.to_string()));
            }
            // A `*` component caps that position, so "19.0.*.*" bounds every
            // 19.0 build from above.
            parts[count] = if piece == "*" {
                u32::MAX
            } else {
                piece
                    .parse()
                    .map_err(|_| VersionParseError::NonNumeric(s.to_string()))?
            };
            count += 1;
        }

        if count < 2 {
            return Err(VersionParseError::ComponentCount(s.to_string()));
        }

        Ok(ToolVersion::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl Serialize for ToolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ToolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A half-open version interval: `min` is inclusive, `max` exclusive.
///
/// An unbounded upper end is expressed with [`ToolVersion::MAX`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: ToolVersion,
    pub max: ToolVersion,
}

impl VersionRange {
    pub const fn new(min: ToolVersion, max: ToolVersion) -> Self {
        VersionRange { min, max }
    }

    pub fn contains(&self, version: ToolVersion) -> bool {
        self.min <= version && (version < self.max || self.max == ToolVersion::MAX)
    }

    pub fn overlaps(&self, other: &VersionRange) -> bool {
        self.min < other.max && other.min < self.max
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
