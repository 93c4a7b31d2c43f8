//! Identifier definitions for blocks, users and jobs.

use crate::{define_name, IdError};

// =============================================================================
// Names
// =============================================================================

define_name!(BlockName, "block name");
define_name!(UserName, "user name");

// =============================================================================
// Jobs
// =============================================================================

/// Scheduler job identifier.
///
/// Job ids are positive integers handed out by the scheduler; zero is
/// reserved for "no job" on the scheduler side and is rejected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u32);

impl JobId {
    /// Creates a job id, rejecting zero.
    pub fn new(id: u32) -> Result<Self, IdError> {
        if id == 0 {
            return Err(IdError::InvalidJobId(id.to_string()));
        }
        Ok(Self(id))
    }

    /// Returns the underlying integer.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let id = s
            .parse::<u32>()
            .map_err(|_| IdError::InvalidJobId(s.to_string()))?;
        Self::new(id)
    }
}

impl TryFrom<u32> for JobId {
    type Error = IdError;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<JobId> for u32 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl serde::Serialize for JobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for JobId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u32::deserialize(deserializer)?;
        Self::new(id).map_err(serde::de::Error::custom)
    }
}
