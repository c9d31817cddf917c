//! Timeline identities.
//!
//! A timeline is a named, ordered view over events. Its storage key is
//! derived deterministically from its kind and owner:
//!
//! | Kind   | Key              |
//! |--------|------------------|
//! | home   | `home:{owner}`   |
//! | global | `global`         |
//! | user   | `user:{owner}`   |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which feed a timeline represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineKind {
    /// The signed-in user's follow feed. Its events are protected from eviction.
    Home,
    /// Unfiltered network feed.
    Global,
    /// A single author's posts.
    User,
}

impl TimelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Global => "global",
            Self::User => "user",
        }
    }
}

impl std::str::FromStr for TimelineKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "home" => Ok(Self::Home),
            "global" => Ok(Self::Global),
            "user" => Ok(Self::User),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TimelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timeline kind plus its owner key (absent for the global feed).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineRef {
    pub kind: TimelineKind,
    pub owner: Option<String>,
}

impl TimelineRef {
    pub fn home(owner: impl Into<String>) -> Self {
        Self {
            kind: TimelineKind::Home,
            owner: Some(owner.into()),
        }
    }

    pub fn global() -> Self {
        Self {
            kind: TimelineKind::Global,
            owner: None,
        }
    }

    pub fn user(owner: impl Into<String>) -> Self {
        Self {
            kind: TimelineKind::User,
            owner: Some(owner.into()),
        }
    }

    /// Deterministic storage key.
    pub fn key(&self) -> String {
        match (self.kind, self.owner.as_deref()) {
            (TimelineKind::Global, _) => "global".to_string(),
            (kind, Some(owner)) => format!("{}:{}", kind.as_str(), owner),
            (kind, None) => kind.as_str().to_string(),
        }
    }

    /// Whether events in this timeline are exempt from capacity eviction.
    pub fn is_protected(&self) -> bool {
        self.kind == TimelineKind::Home
    }
}

impl fmt::Display for TimelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
