//! The program handed to an [`Executor`](crate::Executor).
//!
//! Programs are expressed only in terms of set names, members, and rule descriptors. Operations
//! are ordered so that an executor applying them front-to-back never installs a rule that
//! references a missing set and never deletes a set that an installed rule still references.

use crate::{IpSetMetadata, NetworkPolicy, Rule};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub ops: Vec<Op>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    CreateSet { set: IpSetMetadata },
    AddMembers { set: String, members: Vec<IpAddr> },
    RemoveMembers { set: String, members: Vec<IpAddr> },
    AddReferences { list: String, sets: Vec<String> },
    AddPolicy { policy: NetworkPolicy },

    /// Transforms the installed rule sequence into the staged one.
    UpdatePolicy { name: String, edits: Vec<RuleEdit> },

    RemovePolicy { name: String },
    RemoveReferences { list: String, sets: Vec<String> },
    DeleteSet { set: IpSetMetadata },
}

/// One step of an edit script over a policy's rule sequence.
///
/// Edits are applied in order with a cursor that starts before the first installed rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "edit", rename_all = "snake_case")]
pub enum RuleEdit {
    /// Advances past `count` installed rules unchanged.
    Keep { count: usize },

    /// Removes the installed rule at the cursor.
    Delete { rule: Rule },

    /// Inserts a rule at the cursor and advances past it.
    Insert { rule: Rule },
}

/// Managed packet-filter state found on the host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    pub sets: Vec<IpSetMetadata>,
    pub policies: Vec<String>,
}

// === impl Program ===

impl Program {
    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Op> {
        self.ops.iter()
    }
}

impl Extend<Op> for Program {
    fn extend<T: IntoIterator<Item = Op>>(&mut self, iter: T) {
        self.ops.extend(iter)
    }
}

impl FromIterator<Op> for Program {
    fn from_iter<T: IntoIterator<Item = Op>>(iter: T) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Program {
    type Item = Op;
    type IntoIter = std::vec::IntoIter<Op>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

// === impl HostState ===

impl HostState {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.policies.is_empty()
    }
}
