//! Strict project identifier validation
//!
//! Every public entry point of the subsystem re-validates the project
//! identifier before it is used to build a sandbox name or an on-disk path.
//! The accepted format is exactly the lowercase hyphenated UUIDv4 form, which
//! rules out path traversal and name injection regardless of how the
//! identifier reached this layer.

use crate::error::SandboxError;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix for engine-visible sandbox names derived from a project id
const SANDBOX_NAME_PREFIX: &str = "devbay-";

/// A validated project identifier.
///
/// Can only be constructed through [`FromStr`], so holding a `ProjectId`
/// proves the identifier already passed format validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(String);

impl ProjectId {
    /// The validated identifier string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic engine-side sandbox name for this project.
    ///
    /// Lookups always go through this name, never through an engine-generated
    /// id, so reconciliation stays idempotent.
    #[must_use]
    pub fn sandbox_name(&self) -> String {
        format!("{SANDBOX_NAME_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectId {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !has_uuid_shape(s) {
            return Err(SandboxError::InvalidProjectId { id: s.to_string() });
        }

        // Shape check above guarantees parseability; the parse confirms the
        // version nibble so only v4 identifiers are accepted.
        let parsed = Uuid::parse_str(s).map_err(|_| SandboxError::InvalidProjectId {
            id: s.to_string(),
        })?;
        if parsed.get_version_num() != 4 {
            return Err(SandboxError::InvalidProjectId { id: s.to_string() });
        }

        Ok(Self(s.to_string()))
    }
}

/// Check the exact lowercase hyphenated UUID shape: 36 chars, hyphens at
/// positions 8, 13, 18, 23, lowercase hex everywhere else.
fn has_uuid_shape(s: &str) -> bool {
    if s.len() != 36 || !s.is_ascii() {
        return false;
    }

    for (i, c) in s.char_indices() {
        match i {
            8 | 13 | 18 | 23 => {
                if c != '-' {
                    return false;
                }
            }
            _ => {
                if !(c.is_ascii_digit() || ('a'..='f').contains(&c)) {
                    return false;
                }
            }
        }
    }

    true
}
