//! Value objects: equality by value, not identity.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// Opaque scheduling ordinal of a job. Higher values are submitted first.
///
/// The named lanes (`low`, `normal`, `high`) are conveniences; any integer
/// ordinal is accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u32);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);

    pub const fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    pub const fn ordinal(self) -> u32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl ValueObject for Priority {}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Priority {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::LOW),
            "normal" => Ok(Self::NORMAL),
            "high" => Ok(Self::HIGH),
            other => other
                .parse::<u32>()
                .map(Self)
                .map_err(|_| DomainError::validation(format!("unknown priority: {s}"))),
        }
    }
}

/// Category label a job or a dedup record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Category(String);

impl Category {
    pub fn new(label: impl Into<String>) -> Result<Self, DomainError> {
        let label = label.into();
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("category must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for Category {}

impl Default for Category {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl core::fmt::Display for Category {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Category {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.0
    }
}

impl FromStr for Category {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_accepts_lanes_and_ordinals() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::HIGH);
        assert_eq!(" Low ".parse::<Priority>().unwrap(), Priority::LOW);
        assert_eq!("7".parse::<Priority>().unwrap(), Priority::new(7));
        assert!("urgent".parse::<Priority>().is_err());
        assert!(Priority::HIGH > Priority::NORMAL);
    }

    #[test]
    fn blank_category_is_rejected() {
        assert!(Category::new("   ").is_err());
        assert_eq!(Category::new(" science ").unwrap().as_str(), "science");
    }
}
