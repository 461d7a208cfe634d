//! Caller identity handed to every marketplace operation.
//!
//! Authentication happens at the edge (JWT or dev headers); the core receives
//! an explicit [`Caller`] per request and performs its own authorization
//! checks. There is no process-wide "current user".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier issued by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Imports projects, approves and rejects work
    Researcher,
    /// Claims and completes tasks
    Annotator,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "researcher" => Ok(Role::Researcher),
            "annotator" => Ok(Role::Annotator),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Researcher => f.write_str("researcher"),
            Role::Annotator => f.write_str("annotator"),
        }
    }
}

/// Authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn researcher(id: impl Into<UserId>) -> Self {
        Self {
            user_id: id.into(),
            role: Role::Researcher,
        }
    }

    pub fn annotator(id: impl Into<UserId>) -> Self {
        Self {
            user_id: id.into(),
            role: Role::Annotator,
        }
    }

    pub fn is_researcher(&self) -> bool {
        self.role == Role::Researcher
    }

    pub fn is_annotator(&self) -> bool {
        self.role == Role::Annotator
    }
}
