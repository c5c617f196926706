//! A recording [`GenericDataplane`] for testing collaborators without a real dataplane.

use crate::{GenericDataplane, IpSetMetadata, NetworkPolicy, PodUpdate, Result};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::{collections::VecDeque, net::IpAddr};

/// Records every call and returns programmed results.
///
/// Fallible methods return `Ok(())` unless a result has been queued with
/// [`MockDataplane::return_next`].
#[derive(Debug, Default)]
pub struct MockDataplane {
    calls: Mutex<Vec<Call>>,
    results: Mutex<HashMap<Method, VecDeque<Result<()>>>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    InitializeDataplane,
    ResetDataplane,
    CreateIpSet(IpSetMetadata),
    DeleteIpSet(IpSetMetadata),
    AddToSets {
        sets: Vec<IpSetMetadata>,
        ip: IpAddr,
        pod_key: String,
    },
    RemoveFromSets {
        sets: Vec<IpSetMetadata>,
        ip: IpAddr,
        pod_key: String,
    },
    AddToList {
        list: IpSetMetadata,
        sets: Vec<IpSetMetadata>,
    },
    RemoveFromList {
        list: IpSetMetadata,
        sets: Vec<IpSetMetadata>,
    },
    UpdatePod(PodUpdate),
    AddPolicy(NetworkPolicy),
    UpdatePolicy(NetworkPolicy),
    RemovePolicy(String),
    ApplyDataplane,
}

/// Identifies a fallible method for programming results.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    InitializeDataplane,
    ResetDataplane,
    AddToSets,
    RemoveFromSets,
    AddToList,
    RemoveFromList,
    UpdatePod,
    AddPolicy,
    UpdatePolicy,
    RemovePolicy,
    ApplyDataplane,
}

// === impl MockDataplane ===

impl MockDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a result for the next call of `method`.
    pub fn return_next(&self, method: Method, result: Result<()>) {
        self.results
            .lock()
            .entry(method)
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn respond(&self, method: Method, call: Call) -> Result<()> {
        self.record(call);
        self.results
            .lock()
            .get_mut(&method)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[async_trait::async_trait]
impl GenericDataplane for MockDataplane {
    async fn initialize_dataplane(&self) -> Result<()> {
        self.respond(Method::InitializeDataplane, Call::InitializeDataplane)
    }

    async fn reset_dataplane(&self) -> Result<()> {
        self.respond(Method::ResetDataplane, Call::ResetDataplane)
    }

    fn create_ipset(&self, set: &IpSetMetadata) {
        self.record(Call::CreateIpSet(set.clone()));
    }

    fn delete_ipset(&self, set: &IpSetMetadata) {
        self.record(Call::DeleteIpSet(set.clone()));
    }

    fn add_to_sets(&self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()> {
        let call = Call::AddToSets {
            sets: sets.to_vec(),
            ip,
            pod_key: pod_key.to_string(),
        };
        self.respond(Method::AddToSets, call)
    }

    fn remove_from_sets(&self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()> {
        let call = Call::RemoveFromSets {
            sets: sets.to_vec(),
            ip,
            pod_key: pod_key.to_string(),
        };
        self.respond(Method::RemoveFromSets, call)
    }

    fn add_to_list(&self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()> {
        let call = Call::AddToList {
            list: list.clone(),
            sets: sets.to_vec(),
        };
        self.respond(Method::AddToList, call)
    }

    fn remove_from_list(&self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()> {
        let call = Call::RemoveFromList {
            list: list.clone(),
            sets: sets.to_vec(),
        };
        self.respond(Method::RemoveFromList, call)
    }

    fn update_pod(&self, update: PodUpdate) -> Result<()> {
        self.respond(Method::UpdatePod, Call::UpdatePod(update))
    }

    fn add_policy(&self, policy: NetworkPolicy) -> Result<()> {
        self.respond(Method::AddPolicy, Call::AddPolicy(policy))
    }

    fn update_policy(&self, policy: NetworkPolicy) -> Result<()> {
        self.respond(Method::UpdatePolicy, Call::UpdatePolicy(policy))
    }

    fn remove_policy(&self, name: &str) -> Result<()> {
        self.respond(Method::RemovePolicy, Call::RemovePolicy(name.to_string()))
    }

    async fn apply_dataplane(&self) -> Result<()> {
        self.respond(Method::ApplyDataplane, Call::ApplyDataplane)
    }
}
