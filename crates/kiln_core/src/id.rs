//! Identifiers for KILN entities.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run identifier - identifies a single build invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Create a new random RunId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run_{}", self.0)
    }
}

/// Identity of a resolved element: its name plus the active variant.
///
/// Elements that declare no variants have no variant component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    name: String,
    variant: Option<String>,
}

impl ElementId {
    /// Separator between name and variant in the textual form
    pub const VARIANT_SEPARATOR: char = ':';

    /// Create an identity without a variant
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variant: None,
        }
    }

    /// Create an identity with an explicit variant
    #[must_use]
    pub fn with_variant(name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variant: Some(variant.into()),
        }
    }

    /// Parse `name` or `name:variant`
    ///
    /// # Errors
    ///
    /// Returns error if the name or the variant is empty or contains whitespace
    pub fn parse(s: &str) -> CoreResult<Self> {
        let (name, variant) = match s.split_once(Self::VARIANT_SEPARATOR) {
            Some((name, variant)) => (name, Some(variant)),
            None => (s, None),
        };

        validate_component(s, name, "element name")?;
        if let Some(variant) = variant {
            validate_component(s, variant, "variant")?;
        }

        Ok(Self {
            name: name.to_string(),
            variant: variant.map(str::to_string),
        })
    }

    /// Element name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active variant, if the element declares variants
    #[must_use]
    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

fn validate_component(whole: &str, part: &str, what: &str) -> CoreResult<()> {
    if part.is_empty() {
        return Err(CoreError::InvalidId {
            value: whole.to_string(),
            reason: format!("empty {}", what),
        });
    }
    if part.chars().any(|c| c.is_whitespace() || c == ElementId::VARIANT_SEPARATOR) {
        return Err(CoreError::InvalidId {
            value: whole.to_string(),
            reason: format!("{} contains whitespace or '{}'", what, ElementId::VARIANT_SEPARATOR),
        });
    }
    Ok(())
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}{}{}", self.name, Self::VARIANT_SEPARATOR, variant),
            None => write!(f, "{}", self.name),
        }
    }
}
