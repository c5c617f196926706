use serde::{Deserialize, Serialize};
use std::fmt;

/// Distinguishes sets of addresses from lists of sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetKind {
    /// Holds IP members.
    Set,

    /// Holds references to other sets by name.
    List,
}

/// Identifies an ipset on a node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IpSetMetadata {
    pub name: String,
    pub kind: SetKind,
}

// === impl IpSetMetadata ===

impl IpSetMetadata {
    pub fn new(name: impl Into<String>, kind: SetKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn set(name: impl Into<String>) -> Self {
        Self::new(name, SetKind::Set)
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, SetKind::List)
    }

    pub fn is_list(&self) -> bool {
        self.kind == SetKind::List
    }
}

impl fmt::Display for IpSetMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

// === impl SetKind ===

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => "set".fmt(f),
            Self::List => "list".fmt(f),
        }
    }
}
