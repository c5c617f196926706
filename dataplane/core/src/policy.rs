use crate::IpSetMetadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named, ordered collection of match rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub name: String,
    pub rules: Vec<Rule>,
}

/// A single match rule.
///
/// A packet matches when it satisfies every set reference, the protocol, and the port range.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub direction: Direction,

    /// Source sets for ingress rules, destination sets for egress rules.
    pub sets: Vec<SetRef>,

    pub protocol: Option<Protocol>,
    pub ports: Option<PortRange>,
    pub action: Action,

    /// Passed through to the host, where supported, to identify the rule.
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetRef {
    pub set: IpSetMetadata,

    /// When false, the rule matches traffic *not* in the set.
    pub included: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

/// An inclusive port range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

// === impl NetworkPolicy ===

impl NetworkPolicy {
    pub fn new(name: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    /// Returns every set referenced by the policy's rules.
    pub fn referenced_sets(&self) -> BTreeSet<&IpSetMetadata> {
        self.rules
            .iter()
            .flat_map(|rule| rule.sets.iter().map(|r| &r.set))
            .collect()
    }
}

// === impl Rule ===

impl Rule {
    pub fn new(direction: Direction, action: Action) -> Self {
        Self {
            direction,
            sets: Vec::new(),
            protocol: None,
            ports: None,
            action,
            comment: None,
        }
    }

    pub fn ingress(action: Action) -> Self {
        Self::new(Direction::Ingress, action)
    }

    pub fn egress(action: Action) -> Self {
        Self::new(Direction::Egress, action)
    }

    pub fn matching(mut self, set: IpSetMetadata) -> Self {
        self.sets.push(SetRef {
            set,
            included: true,
        });
        self
    }

    pub fn not_matching(mut self, set: IpSetMetadata) -> Self {
        self.sets.push(SetRef {
            set,
            included: false,
        });
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_ports(mut self, start: u16, end: u16) -> Self {
        self.ports = Some(PortRange { start, end });
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

// === impl PortRange ===

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_ranges_are_inclusive() {
        let http = PortRange::single(80);
        assert!(http.contains(80));
        assert!(!http.contains(81));

        let rule = Rule::ingress(Action::Allow).with_ports(8000, 8080);
        let ports = rule.ports.expect("ports must be set");
        assert!(ports.contains(8000));
        assert!(ports.contains(8080));
        assert!(!ports.contains(7999));
        assert_ne!(ports, http);
    }

    #[test]
    fn excluded_sets_are_still_referenced() {
        let policy = NetworkPolicy::new(
            "deny-others",
            vec![
                Rule::ingress(Action::Deny)
                    .not_matching(IpSetMetadata::set("ns-a-pods"))
                    .not_matching(IpSetMetadata::list("all-namespaces")),
                Rule::egress(Action::Allow).matching(IpSetMetadata::set("ns-a-pods")),
            ],
        );
        assert_eq!(
            policy.rules[0].sets,
            vec![
                SetRef {
                    set: IpSetMetadata::set("ns-a-pods"),
                    included: false,
                },
                SetRef {
                    set: IpSetMetadata::list("all-namespaces"),
                    included: false,
                },
            ]
        );

        let referenced = policy.referenced_sets();
        assert_eq!(referenced.len(), 2);
        assert_eq!(referenced.iter().filter(|set| set.is_list()).count(), 1);
    }
}
