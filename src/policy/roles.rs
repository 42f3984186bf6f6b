//! Typed role names and role sets.
//!
//! Role names come from the store and are later interpolated into
//! `SET ROLE "<name>"`, so they are parsed into [`RoleName`] at the boundary
//! and never handled as raw strings afterwards.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid role name: {0:?}")]
pub struct InvalidRoleName(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    /// Parse a role name: a lowercase identifier of at most 63 bytes.
    ///
    /// # Errors
    /// Returns [`InvalidRoleName`] for anything else.
    pub fn parse(value: &str) -> Result<Self, InvalidRoleName> {
        if crate::store::is_identifier(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(InvalidRoleName(value.to_string()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoleName {
    type Error = InvalidRoleName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoleName> for String {
    fn from(value: RoleName) -> Self {
        value.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(BTreeSet<RoleName>);

impl RoleSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn contains(&self, role: &RoleName) -> bool {
        self.0.contains(role)
    }

    pub fn insert(&mut self, role: RoleName) -> bool {
        self.0.insert(role)
    }

    /// True when at least one role is in both sets.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RoleName> {
        self.0.iter()
    }
}

impl FromIterator<RoleName> for RoleSet {
    fn from_iter<I: IntoIterator<Item = RoleName>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(RoleName::as_str).collect();
        write!(f, "{{{}}}", names.join(","))
    }
}
