//! `major.minor.patch` versions and `name@version` template ids.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)$").expect("valid regex"))
}

fn template_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9][A-Za-z0-9_-]*)@((?:0|[1-9]\d*)\.(?:0|[1-9]\d*)\.(?:0|[1-9]\d*))$")
            .expect("valid regex")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SemverError {
    #[error("invalid version {0:?}: expected major.minor.patch")]
    Version(String),

    #[error("invalid template id {0:?}: expected name@major.minor.patch")]
    TemplateId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = SemverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = version_re()
            .captures(s)
            .ok_or_else(|| SemverError::Version(s.to_string()))?;
        let part = |i: usize| {
            caps[i]
                .parse::<u64>()
                .map_err(|_| SemverError::Version(s.to_string()))
        };
        Ok(Self::new(part(1)?, part(2)?, part(3)?))
    }
}

impl TryFrom<String> for Version {
    type Error = SemverError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parsed `name@major.minor.patch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateId {
    pub name: String,
    pub version: Version,
}

impl TemplateId {
    pub fn parse(raw: &str) -> Result<Self, SemverError> {
        raw.parse()
    }

    /// Global a script bundle for this template assigns its exports to.
    pub fn global_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!(
            "__activity_{}_{}_{}_{}",
            name, self.version.major, self.version.minor, self.version.patch
        )
    }
}

impl FromStr for TemplateId {
    type Err = SemverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = template_id_re()
            .captures(s)
            .ok_or_else(|| SemverError::TemplateId(s.to_string()))?;
        let version = caps[2]
            .parse()
            .map_err(|_| SemverError::TemplateId(s.to_string()))?;
        Ok(Self {
            name: caps[1].to_string(),
            version,
        })
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}
