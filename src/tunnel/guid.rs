//! Structured interface identifiers

use crate::error::{BridgeError, Result};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 128-bit interface identifier in `{xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceGuid(Uuid);

impl InterfaceGuid {
    /// Parse the bare form the host passes (no surrounding braces)
    pub fn parse_bare(text: &str) -> Result<Self> {
        format!("{{{text}}}").parse()
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl FromStr for InterfaceGuid {
    type Err = BridgeError;

    fn from_str(text: &str) -> Result<Self> {
        let invalid = |reason: String| BridgeError::InvalidIdentifier {
            text: text.to_string(),
            reason,
        };
        // uuid also accepts simple and urn forms; only the braced one is valid here
        if text.len() != 38 || !text.starts_with('{') || !text.ends_with('}') {
            return Err(invalid(
                "expected {xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx}".to_string(),
            ));
        }
        Uuid::parse_str(text)
            .map(Self)
            .map_err(|e| invalid(e.to_string()))
    }
}

impl fmt::Display for InterfaceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0.braced())
    }
}
