#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod error;
pub mod ipset;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod policy;
pub mod program;

pub use self::{
    error::{Error, Result, ValidationError},
    ipset::{IpSetMetadata, SetKind},
    policy::{Action, Direction, NetworkPolicy, PortRange, Protocol, Rule, SetRef},
    program::{HostState, Op, Program, RuleEdit},
};
use std::net::IpAddr;

/// Describes a pod's current address and the sets it should be a member of.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodUpdate {
    /// A stable pod identity, typically `namespace/name`.
    pub pod_key: String,

    pub ip: IpAddr,

    /// The sets the pod's IP should belong to, as derived from its labels.
    pub sets: Vec<IpSetMetadata>,
}

/// The dataplane's public contract.
///
/// Staging operations only update in-memory state; nothing reaches the host packet filter until
/// `apply_dataplane` is called.
#[async_trait::async_trait]
pub trait GenericDataplane: Send + Sync {
    /// Discards any managed packet-filter state left behind by a previous process.
    async fn initialize_dataplane(&self) -> Result<()>;

    /// Removes every managed policy and set from both the host and memory.
    async fn reset_dataplane(&self) -> Result<()>;

    fn create_ipset(&self, set: &IpSetMetadata);

    fn delete_ipset(&self, set: &IpSetMetadata);

    fn add_to_sets(&self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()>;

    fn remove_from_sets(&self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()>;

    fn add_to_list(&self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()>;

    fn remove_from_list(&self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()>;

    fn update_pod(&self, update: PodUpdate) -> Result<()>;

    fn add_policy(&self, policy: NetworkPolicy) -> Result<()>;

    fn update_policy(&self, policy: NetworkPolicy) -> Result<()>;

    fn remove_policy(&self, name: &str) -> Result<()>;

    /// Flushes all pending state to the host in a single executor program.
    async fn apply_dataplane(&self) -> Result<()>;
}

/// Translates programs into concrete packet-filter invocations.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Lists the managed sets and policies currently present on the host.
    async fn host_state(&self) -> anyhow::Result<HostState>;

    /// Applies a program to the host. Failures are opaque to the dataplane.
    async fn execute(&self, program: Program) -> anyhow::Result<()>;
}
