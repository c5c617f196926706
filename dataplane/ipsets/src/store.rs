use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use npm_dataplane_core::{Error, IpSetMetadata, Op, Result, SetKind};
use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet},
    net::IpAddr,
};
use tracing::{debug, error, trace, warn};

/// Holds staged ipsets and the content last applied to the host.
#[derive(Debug, Default)]
pub struct IpSetStore {
    /// Staged sets, by name.
    sets: HashMap<String, IpSet>,

    /// The content of each set as last applied to the host, by name.
    host: HashMap<String, HostSet>,

    /// Referrers of each set, by set name.
    ///
    /// Entries may exist for names that are not (yet) staged.
    references: HashMap<String, HashSet<Referrer>>,

    /// Names whose staged state may differ from the host.
    pending: HashSet<String>,
}

/// Identifies the owner of a reference to a set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Referrer {
    List(String),
    Policy(String),
}

/// A snapshot of a staged set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSetView {
    pub metadata: IpSetMetadata,

    /// IP members and the pod key that owns each. Empty for lists.
    pub members: BTreeMap<IpAddr, String>,

    /// Member set names. Empty for sets.
    pub sets: BTreeSet<String>,

    pub reference_count: usize,

    /// Set when the staged content has not been applied to the host.
    pub dirty: bool,
}

/// Host operations for the pending sets, grouped by the phase in which they must run.
#[derive(Debug, Default)]
pub struct SetPlan {
    pub creates: Vec<Op>,
    pub member_adds: Vec<Op>,
    pub member_removes: Vec<Op>,
    pub reference_adds: Vec<Op>,
    pub reference_removes: Vec<Op>,
    pub deletes: Vec<Op>,

    /// The host content to record for each submitted set; `None` records a deletion.
    commits: Vec<(String, Option<HostSet>)>,

    /// Every pending name considered by the plan.
    examined: Vec<String>,
}

#[derive(Debug)]
struct IpSet {
    kind: SetKind,

    /// IP members and the pod key that owns each.
    ips: HashMap<IpAddr, String>,

    /// Member set names, for lists.
    sets: HashSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct HostSet {
    kind: SetKind,
    ips: HashSet<IpAddr>,
    sets: HashSet<String>,
}

// === impl IpSetStore ===

impl IpSetStore {
    /// Stages a set. Creating an existing set is a no-op.
    pub fn create(&mut self, meta: &IpSetMetadata) {
        match self.sets.entry(meta.name.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().kind;
                if existing != meta.kind {
                    error!(
                        set = %meta.name,
                        %existing,
                        requested = %meta.kind,
                        "IPSet already exists with a different kind"
                    );
                } else {
                    trace!(set = %meta.name, "Already exists");
                }
                return;
            }
            Entry::Vacant(entry) => {
                debug!(set = %meta.name, kind = %meta.kind, "Creating");
                entry.insert(IpSet::new(meta.kind));
            }
        }
        self.touch(&meta.name);
    }

    /// Removes an unreferenced set. Deleting an absent set is a no-op.
    ///
    /// A set that is still referenced is kept: callers are expected to remove policies and list
    /// memberships before the sets they use.
    pub fn delete(&mut self, meta: &IpSetMetadata) {
        let Some(set) = self.sets.get(&meta.name) else {
            trace!(set = %meta.name, "Already deleted");
            return;
        };
        if set.kind != meta.kind {
            warn!(
                set = %meta.name,
                existing = %set.kind,
                requested = %meta.kind,
                "Ignoring deletion of an IPSet with a different kind"
            );
            return;
        }

        let references = self.reference_count(&meta.name);
        if references > 0 {
            error!(
                set = %meta.name,
                references,
                "Refusing to delete an IPSet that is still referenced"
            );
            return;
        }

        let set = self.sets.remove(&meta.name).expect("set must exist");
        let referrer = Referrer::List(meta.name.clone());
        for member in set.sets {
            self.release_reference(&member, &referrer);
        }
        debug!(set = %meta.name, "Deleted");
        self.touch(&meta.name);
    }

    /// Fails unless every set is staged as a `Set`.
    pub fn check_sets(&self, sets: &[IpSetMetadata]) -> Result<()> {
        for meta in sets {
            if meta.kind != SetKind::Set || !self.contains(meta) {
                return Err(Error::UnknownSet(meta.name.clone()));
            }
        }
        Ok(())
    }

    /// Adds `ip` to each set, owned by `pod_key`.
    ///
    /// An IP owned by another pod is transferred to `pod_key`.
    pub fn add_ip(&mut self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()> {
        self.check_sets(sets)?;
        for meta in sets {
            let set = self.sets.get_mut(&meta.name).expect("set must exist");
            match set.ips.insert(ip, pod_key.to_string()) {
                Some(prior) if prior != pod_key => {
                    debug!(set = %meta.name, %ip, %prior, pod = %pod_key, "Transferred IP");
                }
                Some(_) => {
                    trace!(set = %meta.name, %ip, "Already a member");
                    continue;
                }
                None => trace!(set = %meta.name, %ip, pod = %pod_key, "Added IP"),
            }
            self.touch(&meta.name);
        }
        Ok(())
    }

    /// Removes `ip` from each set if it is owned by `pod_key`.
    pub fn remove_ip(&mut self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()> {
        self.check_sets(sets)?;
        for meta in sets {
            self.retract(&meta.name, ip, pod_key);
        }
        Ok(())
    }

    /// Removes `ip` from the named set if it is owned by `pod_key`. An empty pod key matches any
    /// owner.
    pub(crate) fn retract(&mut self, name: &str, ip: IpAddr, pod_key: &str) {
        let Some(set) = self.sets.get_mut(name) else {
            return;
        };
        let owner = match set.ips.get(&ip) {
            Some(owner) => owner,
            None => return,
        };
        if !pod_key.is_empty() && owner != pod_key {
            debug!(
                set = %name,
                %ip,
                %owner,
                pod = %pod_key,
                "Ignoring removal of an IP owned by another pod"
            );
            return;
        }
        set.ips.remove(&ip);
        trace!(set = %name, %ip, "Removed IP");
        self.touch(name);
    }

    /// Adds sets to a list.
    pub fn add_to_list(&mut self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()> {
        self.check_list(list)?;
        for meta in sets {
            if !self.contains(meta) {
                return Err(Error::UnknownSet(meta.name.clone()));
            }
            if meta.name == list.name || self.reaches(&meta.name, &list.name) {
                return Err(Error::Cycle {
                    list: list.name.clone(),
                    set: meta.name.clone(),
                });
            }
        }

        let referrer = Referrer::List(list.name.clone());
        let mut changed = false;
        for meta in sets {
            let set = self.sets.get_mut(&list.name).expect("list must exist");
            if set.sets.insert(meta.name.clone()) {
                debug!(list = %list.name, set = %meta.name, "Added to list");
                self.add_reference(&meta.name, referrer.clone());
                changed = true;
            }
        }
        if changed {
            self.touch(&list.name);
        }
        Ok(())
    }

    /// Removes sets from a list.
    pub fn remove_from_list(&mut self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()> {
        self.check_list(list)?;
        if let Some(meta) = sets.iter().find(|meta| !self.contains(meta)) {
            return Err(Error::UnknownSet(meta.name.clone()));
        }

        let referrer = Referrer::List(list.name.clone());
        let mut changed = false;
        for meta in sets {
            let set = self.sets.get_mut(&list.name).expect("list must exist");
            if set.sets.remove(&meta.name) {
                debug!(list = %list.name, set = %meta.name, "Removed from list");
                self.release_reference(&meta.name, &referrer);
                changed = true;
            }
        }
        if changed {
            self.touch(&list.name);
        }
        Ok(())
    }

    pub fn add_reference(&mut self, name: &str, referrer: Referrer) {
        self.references
            .entry(name.to_string())
            .or_default()
            .insert(referrer);
    }

    pub fn release_reference(&mut self, name: &str, referrer: &Referrer) {
        if let Entry::Occupied(mut entry) = self.references.entry(name.to_string()) {
            entry.get_mut().remove(referrer);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Counts the lists and policies referencing a set.
    pub fn reference_count(&self, name: &str) -> usize {
        self.references.get(name).map_or(0, |referrers| referrers.len())
    }

    /// Indicates whether a set is staged with the given kind.
    pub fn contains(&self, meta: &IpSetMetadata) -> bool {
        self.sets
            .get(&meta.name)
            .is_some_and(|set| set.kind == meta.kind)
    }

    /// Indicates whether rules may reference the set once the next plan has run.
    ///
    /// A set is not ready while a host set of the same name but a different kind awaits deletion.
    pub fn is_ready(&self, meta: &IpSetMetadata) -> bool {
        self.contains(meta)
            && self
                .host
                .get(&meta.name)
                .map_or(true, |host| host.kind == meta.kind)
    }

    /// Indicates whether a set is staged with a kind that differs from its host set.
    pub fn is_replacing(&self, name: &str) -> bool {
        match (self.sets.get(name), self.host.get(name)) {
            (Some(set), Some(host)) => set.kind != host.kind,
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<IpSetView> {
        let set = self.sets.get(name)?;
        Some(IpSetView {
            metadata: IpSetMetadata::new(name, set.kind),
            members: set
                .ips
                .iter()
                .map(|(ip, pod)| (*ip, pod.clone()))
                .collect(),
            sets: set.sets.iter().cloned().collect(),
            reference_count: self.reference_count(name),
            dirty: self.pending.contains(name),
        })
    }

    /// Returns the names of all staged sets, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.sets.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains(name)
    }

    /// Returns the number of sets present on the host.
    pub fn host_len(&self) -> usize {
        self.host.len()
    }

    /// Plans host operations for every pending set.
    ///
    /// `retained` names sets that rules remaining on the host after this batch still reference.
    /// Deletions of those sets, and of any set a retained list contains, are deferred.
    pub fn plan(&self, retained: &HashSet<String>) -> SetPlan {
        let retained = self.host_closure(retained);

        let mut names = self.pending.iter().cloned().collect::<Vec<_>>();
        names.sort();

        let mut plan = SetPlan::default();
        let mut deletes = Vec::new();
        for name in names {
            match (self.sets.get(&name), self.host.get(&name)) {
                (None, None) => {}

                (Some(set), None) => {
                    plan.creates.push(Op::CreateSet {
                        set: IpSetMetadata::new(&name, set.kind),
                    });
                    let host = HostSet::new(set.kind);
                    let host = self.plan_content(&name, set, host, &mut plan);
                    plan.commits.push((name.clone(), Some(host)));
                }

                (Some(set), Some(host)) if set.kind == host.kind => {
                    let host = self.plan_content(&name, set, host.clone(), &mut plan);
                    plan.commits.push((name.clone(), Some(host)));
                }

                // Either the set was deleted or it was recreated with a different kind. In the
                // latter case the replacement is created by a subsequent plan.
                (_, Some(host)) => {
                    if retained.contains(&name) {
                        debug!(set = %name, "Deferring deletion of a referenced IPSet");
                    } else {
                        if !host.sets.is_empty() {
                            plan.reference_removes.push(Op::RemoveReferences {
                                list: name.clone(),
                                sets: sorted(host.sets.iter()),
                            });
                        }
                        deletes.push(IpSetMetadata::new(&name, host.kind));
                        plan.commits.push((name.clone(), None));
                    }
                }
            }
            plan.examined.push(name);
        }

        // Lists are deleted before the sets they may have contained.
        deletes.sort_by(|a, b| b.kind.cmp(&a.kind).then_with(|| a.name.cmp(&b.name)));
        plan.deletes = deletes
            .into_iter()
            .map(|set| Op::DeleteSet { set })
            .collect();
        plan
    }

    /// Plans a teardown of every set on the host.
    pub fn plan_teardown(&self) -> SetPlan {
        let mut hosts = self.host.iter().collect::<Vec<_>>();
        hosts.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut plan = SetPlan::default();
        let mut deletes = Vec::new();
        for (name, host) in hosts {
            let name = name.clone();
            if !host.sets.is_empty() {
                plan.reference_removes.push(Op::RemoveReferences {
                    list: name.clone(),
                    sets: sorted(host.sets.iter()),
                });
            }
            deletes.push(IpSetMetadata::new(&name, host.kind));
            plan.commits.push((name.clone(), None));
            plan.examined.push(name);
        }
        deletes.sort_by(|a, b| b.kind.cmp(&a.kind).then_with(|| a.name.cmp(&b.name)));
        plan.deletes = deletes
            .into_iter()
            .map(|set| Op::DeleteSet { set })
            .collect();
        plan
    }

    /// Records a plan as applied to the host.
    ///
    /// Sets modified since the plan was made remain pending.
    pub fn commit(&mut self, plan: SetPlan) {
        for (name, host) in plan.commits {
            match host {
                Some(host) => {
                    self.host.insert(name, host);
                }
                None => {
                    self.host.remove(&name);
                }
            }
        }
        for name in plan.examined {
            self.settle(&name);
        }
    }

    /// Drops all staged and host state.
    pub fn clear(&mut self) {
        self.sets.clear();
        self.host.clear();
        self.references.clear();
        self.pending.clear();
    }

    fn check_list(&self, list: &IpSetMetadata) -> Result<()> {
        if list.kind != SetKind::List || !self.contains(list) {
            return Err(Error::UnknownSet(list.name.clone()));
        }
        Ok(())
    }

    /// Indicates whether `to` is reachable from `from` through list membership.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(name) = stack.pop() {
            if name == to {
                return true;
            }
            if !seen.insert(name) {
                continue;
            }
            if let Some(set) = self.sets.get(name) {
                stack.extend(set.sets.iter().map(String::as_str));
            }
        }
        false
    }

    /// Expands a set of names with every host set they contain, transitively.
    fn host_closure(&self, names: &HashSet<String>) -> HashSet<String> {
        let mut closure = HashSet::new();
        let mut stack = names.iter().map(String::as_str).collect::<Vec<_>>();
        while let Some(name) = stack.pop() {
            if !closure.insert(name.to_string()) {
                continue;
            }
            if let Some(host) = self.host.get(name) {
                stack.extend(host.sets.iter().map(String::as_str));
            }
        }
        closure
    }

    /// Plans the membership changes that bring `host` to the staged content of `set`, returning
    /// the host content once they are applied.
    fn plan_content(
        &self,
        name: &str,
        set: &IpSet,
        mut host: HostSet,
        plan: &mut SetPlan,
    ) -> HostSet {
        let adds = set
            .ips
            .keys()
            .filter(|ip| !host.ips.contains(*ip))
            .copied()
            .collect::<BTreeSet<_>>();
        let removes = host
            .ips
            .iter()
            .filter(|ip| !set.ips.contains_key(*ip))
            .copied()
            .collect::<BTreeSet<_>>();
        if !adds.is_empty() {
            host.ips.extend(adds.iter().copied());
            plan.member_adds.push(Op::AddMembers {
                set: name.to_string(),
                members: adds.into_iter().collect(),
            });
        }
        if !removes.is_empty() {
            for ip in &removes {
                host.ips.remove(ip);
            }
            plan.member_removes.push(Op::RemoveMembers {
                set: name.to_string(),
                members: removes.into_iter().collect(),
            });
        }

        // Members awaiting replacement of a host set of another kind are added by a later plan.
        let adds = set
            .sets
            .iter()
            .filter(|member| !host.sets.contains(*member))
            .filter(|member| {
                self.sets.get(*member).is_some_and(|m| {
                    self.is_ready(&IpSetMetadata::new(member.as_str(), m.kind))
                })
            })
            .cloned()
            .collect::<BTreeSet<_>>();
        let removes = host
            .sets
            .iter()
            .filter(|member| !set.sets.contains(*member))
            .cloned()
            .collect::<BTreeSet<_>>();
        if !adds.is_empty() {
            host.sets.extend(adds.iter().cloned());
            plan.reference_adds.push(Op::AddReferences {
                list: name.to_string(),
                sets: adds.into_iter().collect(),
            });
        }
        if !removes.is_empty() {
            for member in &removes {
                host.sets.remove(member);
            }
            plan.reference_removes.push(Op::RemoveReferences {
                list: name.to_string(),
                sets: removes.into_iter().collect(),
            });
        }

        host
    }

    /// Marks a name pending unless it is neither staged nor on the host.
    fn touch(&mut self, name: &str) {
        if self.sets.contains_key(name) || self.host.contains_key(name) {
            self.pending.insert(name.to_string());
        } else {
            self.pending.remove(name);
        }
    }

    /// Marks a name pending only if its staged content differs from the host.
    fn settle(&mut self, name: &str) {
        let clean = match (self.sets.get(name), self.host.get(name)) {
            (None, None) => true,
            (Some(set), Some(host)) => set.matches(host),
            _ => false,
        };
        if clean {
            self.pending.remove(name);
        } else {
            self.pending.insert(name.to_string());
        }
    }
}

// === impl SetPlan ===

impl SetPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.member_adds.is_empty()
            && self.member_removes.is_empty()
            && self.reference_adds.is_empty()
            && self.reference_removes.is_empty()
            && self.deletes.is_empty()
    }
}

// === impl IpSet ===

impl IpSet {
    fn new(kind: SetKind) -> Self {
        Self {
            kind,
            ips: HashMap::new(),
            sets: HashSet::new(),
        }
    }

    fn matches(&self, host: &HostSet) -> bool {
        self.kind == host.kind
            && self.ips.len() == host.ips.len()
            && self.ips.keys().all(|ip| host.ips.contains(ip))
            && self.sets == host.sets
    }
}

// === impl HostSet ===

impl HostSet {
    fn new(kind: SetKind) -> Self {
        Self {
            kind,
            ips: HashSet::new(),
            sets: HashSet::new(),
        }
    }
}

fn sorted<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut names = names.cloned().collect::<Vec<_>>();
    names.sort();
    names
}
