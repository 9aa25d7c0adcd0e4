//! Cylinder size identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_SIZE_LEN: usize = 16;

/// Validated cylinder size label such as `12L` or `6KG`.
///
/// Labels are trimmed and upper-cased on parse so `12l` and ` 12L ` name the
/// same size.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct CylinderSize(String);

impl CylinderSize {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CylinderSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err("cylinder size must not be empty".to_string());
        }
        if normalized.len() > MAX_SIZE_LEN {
            return Err(format!(
                "cylinder size '{}' exceeds {} characters",
                normalized, MAX_SIZE_LEN
            ));
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.')
        {
            return Err(format!(
                "cylinder size '{}' contains invalid characters",
                normalized
            ));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for CylinderSize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CylinderSize> for String {
    fn from(size: CylinderSize) -> Self {
        size.0
    }
}

impl fmt::Display for CylinderSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
