use crate::diff::rule_edits;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use npm_dataplane_core::{Error, NetworkPolicy, Op, Result, ValidationError};
use npm_dataplane_ipsets::{IpSetStore, Referrer};
use tracing::{debug, trace, warn};

/// Holds staged network policies and the versions installed on the host.
#[derive(Debug, Default)]
pub struct PolicyStore {
    staged: HashMap<String, NetworkPolicy>,
    installed: HashMap<String, NetworkPolicy>,

    /// Names whose staged version may differ from the installed one.
    pending: HashSet<String>,
}

/// Host operations for the pending policies.
#[derive(Clone, Debug, Default)]
pub struct PolicyPlan {
    /// Policy creations and updates.
    pub upserts: Vec<Op>,
    pub removes: Vec<Op>,

    /// Policies held back because they reference sets that are not ready.
    pub held_back: Vec<ValidationError>,

    /// Sets referenced by installed rules that remain on the host after this plan.
    pub retained_sets: HashSet<String>,

    commits: Vec<(String, Option<NetworkPolicy>)>,
    examined: Vec<String>,
}

// === impl PolicyStore ===

impl PolicyStore {
    /// Stages a new policy, registering its set references.
    pub fn add(&mut self, policy: NetworkPolicy, sets: &mut IpSetStore) -> Result<()> {
        if self.staged.contains_key(&policy.name) {
            return Err(Error::PolicyExists(policy.name));
        }
        register(&policy, sets);
        debug!(policy = %policy.name, rules = policy.rules.len(), "Adding");
        let name = policy.name.clone();
        self.staged.insert(name.clone(), policy);
        self.touch(&name);
        Ok(())
    }

    /// Replaces a staged policy's rules.
    pub fn update(&mut self, policy: NetworkPolicy, sets: &mut IpSetStore) -> Result<()> {
        let Some(prior) = self.staged.get(&policy.name) else {
            return Err(Error::PolicyNotFound(policy.name));
        };
        if *prior == policy {
            trace!(policy = %policy.name, "Unchanged");
            return Ok(());
        }
        release(prior, sets);
        register(&policy, sets);
        debug!(policy = %policy.name, rules = policy.rules.len(), "Updating");
        let name = policy.name.clone();
        self.staged.insert(name.clone(), policy);
        self.touch(&name);
        Ok(())
    }

    /// Removes a staged policy. Removing an absent policy is a no-op.
    pub fn remove(&mut self, name: &str, sets: &mut IpSetStore) {
        let Some(policy) = self.staged.remove(name) else {
            trace!(policy = %name, "Already removed");
            return;
        };
        release(&policy, sets);
        debug!(policy = %name, "Removing");
        self.touch(name);
    }

    pub fn get(&self, name: &str) -> Option<&NetworkPolicy> {
        self.staged.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.staged.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains(name)
    }

    /// Returns the names of policies installed on the host, sorted.
    pub fn installed_names(&self) -> Vec<String> {
        let mut names = self.installed.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Plans host operations for every pending policy.
    ///
    /// A policy that references a set that is missing (or awaiting replacement) is held back and
    /// stays pending. Its installed version, if any, stays on the host unless it references a set
    /// whose kind is being replaced, in which case it is removed until the replacement exists.
    pub fn plan(&self, sets: &IpSetStore) -> PolicyPlan {
        let mut names = self.pending.iter().cloned().collect::<Vec<_>>();
        names.sort();

        let mut plan = PolicyPlan::default();
        let mut updates = Vec::new();
        for name in names {
            match (self.staged.get(&name), self.installed.get(&name)) {
                (None, None) => {}

                (Some(policy), installed) => {
                    let missing = policy
                        .referenced_sets()
                        .into_iter()
                        .filter(|set| !sets.is_ready(set))
                        .map(|set| set.name.clone())
                        .collect::<Vec<_>>();
                    if !missing.is_empty() {
                        warn!(policy = %name, ?missing, "Holding back policy with unknown ipsets");
                        // Sets staged with a new kind replace their host set only once nothing on
                        // the host references it, so an installed version that references one is
                        // withdrawn rather than retained.
                        let replacing = installed.is_some_and(|installed| {
                            missing
                                .iter()
                                .any(|set| sets.is_replacing(set) && references(installed, set))
                        });
                        match installed {
                            Some(_) if replacing => {
                                debug!(policy = %name, "Withdrawing until ipsets are replaced");
                                plan.removes.push(Op::RemovePolicy { name: name.clone() });
                                plan.commits.push((name.clone(), None));
                            }
                            Some(installed) => plan.retained_sets.extend(
                                installed.referenced_sets().into_iter().map(|s| s.name.clone()),
                            ),
                            None => {}
                        }
                        plan.held_back.push(ValidationError {
                            policy: name.clone(),
                            missing,
                        });
                    } else {
                        match installed {
                            None => plan.upserts.push(Op::AddPolicy {
                                policy: policy.clone(),
                            }),
                            Some(installed) if installed == policy => {}
                            Some(installed) => updates.push(Op::UpdatePolicy {
                                name: name.clone(),
                                edits: rule_edits(&installed.rules, &policy.rules),
                            }),
                        }
                        plan.commits.push((name.clone(), Some(policy.clone())));
                    }
                }

                (None, Some(_)) => {
                    plan.removes.push(Op::RemovePolicy { name: name.clone() });
                    plan.commits.push((name.clone(), None));
                }
            }
            plan.examined.push(name);
        }
        plan.upserts.extend(updates);
        plan
    }

    /// Plans the removal of every installed policy.
    pub fn plan_teardown(&self) -> PolicyPlan {
        let mut plan = PolicyPlan::default();
        for name in self.installed_names() {
            plan.removes.push(Op::RemovePolicy { name: name.clone() });
            plan.commits.push((name.clone(), None));
            plan.examined.push(name);
        }
        plan
    }

    /// Records a plan as applied to the host.
    pub fn commit(&mut self, plan: PolicyPlan) {
        for (name, policy) in plan.commits {
            match policy {
                Some(policy) => {
                    self.installed.insert(name, policy);
                }
                None => {
                    self.installed.remove(&name);
                }
            }
        }
        for name in plan.examined {
            self.settle(&name);
        }
    }

    pub fn clear(&mut self) {
        self.staged.clear();
        self.installed.clear();
        self.pending.clear();
    }

    fn touch(&mut self, name: &str) {
        if self.staged.contains_key(name) || self.installed.contains_key(name) {
            self.pending.insert(name.to_string());
        } else {
            self.pending.remove(name);
        }
    }

    fn settle(&mut self, name: &str) {
        if self.staged.get(name) == self.installed.get(name) {
            self.pending.remove(name);
        } else {
            self.pending.insert(name.to_string());
        }
    }
}

// === impl PolicyPlan ===

impl PolicyPlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removes.is_empty()
    }
}

fn references(policy: &NetworkPolicy, set: &str) -> bool {
    policy.referenced_sets().iter().any(|meta| meta.name == set)
}

fn register(policy: &NetworkPolicy, sets: &mut IpSetStore) {
    let referrer = Referrer::Policy(policy.name.clone());
    for set in policy.referenced_sets() {
        sets.add_reference(&set.name, referrer.clone());
    }
}

fn release(policy: &NetworkPolicy, sets: &mut IpSetStore) {
    let referrer = Referrer::Policy(policy.name.clone());
    for set in policy.referenced_sets() {
        sets.release_reference(&set.name, &referrer);
    }
}
