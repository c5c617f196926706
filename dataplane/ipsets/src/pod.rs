use crate::IpSetStore;
use ahash::AHashMap as HashMap;
use npm_dataplane_core::{IpSetMetadata, PodUpdate, Result};
use std::{collections::BTreeSet, net::IpAddr};
use tracing::{debug, instrument};

/// Tracks each pod's current IP and the sets it has joined.
#[derive(Debug, Default)]
pub struct PodTracker {
    pods: HashMap<String, PodMembership>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodMembership {
    pub ip: IpAddr,
    pub sets: BTreeSet<String>,
}

// === impl PodTracker ===

impl PodTracker {
    /// Moves a pod to a new IP and set membership.
    ///
    /// When the pod's IP changes, the prior IP is retracted from every set it joined before the new
    /// IP is added, so that a reused IP never inherits the previous pod's memberships. When the IP
    /// is unchanged, it is retracted from sets that are no longer targeted.
    #[instrument(skip(self, sets, update), fields(pod = %update.pod_key, ip = %update.ip))]
    pub fn update_pod(&mut self, sets: &mut IpSetStore, update: PodUpdate) -> Result<()> {
        sets.check_sets(&update.sets)?;

        let PodUpdate {
            pod_key,
            ip,
            sets: targets,
        } = update;
        let target_names = targets
            .iter()
            .map(|meta| meta.name.clone())
            .collect::<BTreeSet<_>>();

        if let Some(prior) = self.pods.remove(&pod_key) {
            if prior.ip != ip {
                debug!(prior = %prior.ip, "Retracting prior IP");
                for name in &prior.sets {
                    sets.retract(name, prior.ip, &pod_key);
                }
            } else {
                for name in prior.sets.difference(&target_names) {
                    sets.retract(name, ip, &pod_key);
                }
            }
        }

        sets.add_ip(&targets, ip, &pod_key)?;
        if !target_names.is_empty() {
            self.pods.insert(
                pod_key,
                PodMembership {
                    ip,
                    sets: target_names,
                },
            );
        }
        Ok(())
    }

    /// Adds a pod's IP to sets, retracting the pod's prior IP if it has changed.
    ///
    /// IPs without a pod key are not tracked.
    pub fn add_to_sets(
        &mut self,
        sets: &mut IpSetStore,
        targets: &[IpSetMetadata],
        ip: IpAddr,
        pod_key: &str,
    ) -> Result<()> {
        sets.check_sets(targets)?;

        if !pod_key.is_empty() {
            let pod = self
                .pods
                .entry(pod_key.to_string())
                .or_insert_with(|| PodMembership {
                    ip,
                    sets: BTreeSet::new(),
                });
            if pod.ip != ip {
                debug!(pod = %pod_key, prior = %pod.ip, %ip, "Retracting prior IP");
                for name in &pod.sets {
                    sets.retract(name, pod.ip, pod_key);
                }
                pod.ip = ip;
                pod.sets.clear();
            }
            pod.sets
                .extend(targets.iter().map(|meta| meta.name.clone()));
        }

        sets.add_ip(targets, ip, pod_key)
    }

    /// Removes a pod's IP from sets.
    pub fn remove_from_sets(
        &mut self,
        sets: &mut IpSetStore,
        targets: &[IpSetMetadata],
        ip: IpAddr,
        pod_key: &str,
    ) -> Result<()> {
        sets.remove_ip(targets, ip, pod_key)?;

        if let Some(pod) = self.pods.get_mut(pod_key) {
            if pod.ip == ip {
                for meta in targets {
                    pod.sets.remove(&meta.name);
                }
                if pod.sets.is_empty() {
                    debug!(pod = %pod_key, "Forgetting pod");
                    self.pods.remove(pod_key);
                }
            }
        }
        Ok(())
    }

    /// Retracts a pod's IP from every set it joined and forgets the pod.
    pub fn delete_pod(&mut self, sets: &mut IpSetStore, pod_key: &str) {
        let Some(pod) = self.pods.remove(pod_key) else {
            return;
        };
        debug!(pod = %pod_key, ip = %pod.ip, "Deleting pod");
        for name in &pod.sets {
            sets.retract(name, pod.ip, pod_key);
        }
    }

    pub fn get(&self, pod_key: &str) -> Option<&PodMembership> {
        self.pods.get(pod_key)
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn clear(&mut self) {
        self.pods.clear();
    }
}
