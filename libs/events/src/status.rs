//! Vendor block status codes.

use serde::{Deserialize, Serialize};

/// Block status as reported by the hardware control service.
///
/// The service uses single-letter codes. Codes this crate does not know are
/// preserved in [`VendorBlockStatus::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VendorBlockStatus {
    /// `A`: resources reserved for the block.
    Allocated,
    /// `B`: boot in progress.
    Booting,
    /// `F`: block released.
    Free,
    /// `I`: booted and usable.
    Initialized,
    /// `T`: block is being torn down.
    Terminating,
    /// Any other code.
    Other(String),
}

impl VendorBlockStatus {
    /// Parses a vendor status code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "A" => Self::Allocated,
            "B" => Self::Booting,
            "F" => Self::Free,
            "I" => Self::Initialized,
            "T" => Self::Terminating,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the vendor code.
    pub fn code(&self) -> &str {
        match self {
            Self::Allocated => "A",
            Self::Booting => "B",
            Self::Free => "F",
            Self::Initialized => "I",
            Self::Terminating => "T",
            Self::Other(code) => code,
        }
    }

    /// Returns true if the code is one this crate understands.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl std::fmt::Display for VendorBlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for VendorBlockStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for VendorBlockStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let code = String::deserialize(deserializer)?;
        Ok(Self::from_code(&code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("A", VendorBlockStatus::Allocated)]
    #[case("B", VendorBlockStatus::Booting)]
    #[case("F", VendorBlockStatus::Free)]
    #[case("I", VendorBlockStatus::Initialized)]
    #[case("T", VendorBlockStatus::Terminating)]
    fn test_known_codes(#[case] code: &str, #[case] expected: VendorBlockStatus) {
        let status = VendorBlockStatus::from_code(code);
        assert_eq!(status, expected);
        assert!(status.is_known());
        assert_eq!(status.code(), code);
    }

    #[test]
    fn test_unknown_code_preserved() {
        let status: VendorBlockStatus = serde_json::from_str("\"Z\"").unwrap();
        assert_eq!(status, VendorBlockStatus::Other("Z".to_string()));
        assert!(!status.is_known());
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"Z\"");
    }
}
