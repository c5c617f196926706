//! The NPM dataplane apply coordinator.
//!
//! [`Dataplane`] stages ipset, pod and policy mutations in a shared in-memory index and flushes
//! them to the host packet filter in batches. Each batch is a single [`Program`] handed to an
//! [`Executor`], ordered so that every set exists before a rule or list references it and is only
//! deleted once nothing on the host references it:
//!
//! 1. set creations
//! 2. member additions
//! 3. member removals
//! 4. list reference additions
//! 5. policy creations and updates
//! 6. policy removals
//! 7. list reference removals
//! 8. set deletions (lists first)
//!
//! Staging never waits on the executor. Applies are single-flight; state staged while an apply is
//! in flight stays pending for the next one.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod apply_loop;
mod args;
mod metrics;


pub use self::{apply_loop::ApplyLoopConfig, args::DataplaneArgs, metrics::DataplaneMetrics};
pub use npm_dataplane_core::{
    Error, Executor, GenericDataplane, HostState, IpSetMetadata, NetworkPolicy, Op, PodUpdate,
    Program, Result, SetKind, ValidationError,
};
pub use npm_dataplane_ipsets::IpSetView;

use npm_dataplane_ipsets::{IpSetStore, PodTracker, SetPlan};
use npm_dataplane_policies::{PolicyPlan, PolicyStore};
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use std::{net::IpAddr, sync::Arc};
use tokio::{
    sync::{Mutex, Notify},
    time,
};
use tracing::{debug, error, info, instrument, trace, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// All staged dataplane state.
#[derive(Debug, Default)]
pub struct Index {
    sets: IpSetStore,
    pods: PodTracker,
    policies: PolicyStore,
}

/// Stages dataplane mutations and applies them to the host through an [`Executor`].
#[derive(Debug)]
pub struct Dataplane<E> {
    index: SharedIndex,
    executor: E,

    /// Serializes applies, initialization and resets.
    apply_lock: Mutex<()>,

    /// Notified whenever state is staged.
    staged: Notify,

    metrics: DataplaneMetrics,
}

// === impl Index ===

impl Index {
    /// Counts the sets and policies whose staged state differs from the host.
    pub fn pending_len(&self) -> usize {
        self.sets.pending_len() + self.policies.pending_len()
    }

    pub fn ipsets_len(&self) -> usize {
        self.sets.len()
    }

    pub fn policies_len(&self) -> usize {
        self.policies.len()
    }

    pub fn pods_len(&self) -> usize {
        self.pods.len()
    }
}

// === impl Dataplane ===

impl<E: Executor> Dataplane<E> {
    pub fn new(executor: E, metrics: DataplaneMetrics) -> Self {
        Self {
            index: Arc::new(RwLock::new(Index::default())),
            executor,
            apply_lock: Mutex::new(()),
            staged: Notify::new(),
            metrics,
        }
    }

    /// Registers gauges describing the size of the staged index.
    pub fn register_index_metrics(&self, reg: &mut Registry) {
        metrics::register_index(reg, self.index.clone());
    }

    /// Retracts a pod's IP from every set it joined and forgets the pod.
    #[instrument(skip(self))]
    pub fn delete_pod(&self, pod_key: &str) {
        self.stage(|index| index.pods.delete_pod(&mut index.sets, pod_key));
    }

    pub fn get_ipset(&self, name: &str) -> Option<IpSetView> {
        self.index.read().sets.get(name)
    }

    /// Returns the names of all staged sets, sorted.
    pub fn ipset_names(&self) -> Vec<String> {
        self.index.read().sets.names()
    }

    /// Counts the lists and policies referencing a set.
    pub fn reference_count(&self, name: &str) -> usize {
        self.index.read().sets.reference_count(name)
    }

    pub fn policy_exists(&self, name: &str) -> bool {
        self.index.read().policies.contains(name)
    }

    pub fn get_policy(&self, name: &str) -> Option<NetworkPolicy> {
        self.index.read().policies.get(name).cloned()
    }

    /// Counts the sets and policies awaiting an apply.
    pub fn pending_len(&self) -> usize {
        self.index.read().pending_len()
    }

    /// Flushes pending state to the host.
    ///
    /// Policies that reference sets that are not staged are held back and reported as
    /// [`Error::Validation`] once everything else has been applied. If the executor fails, nothing
    /// is recorded as applied and all pending state is retained.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> Result<()> {
        let _apply = self.apply_lock.lock().await;

        let (program, sets, mut policies) = {
            let index = self.index.read();
            if index.pending_len() == 0 {
                trace!("Nothing to apply");
                return Ok(());
            }
            let mut policies = index.policies.plan(&index.sets);
            let mut sets = index.sets.plan(&policies.retained_sets);
            let program = assemble(&mut sets, &mut policies);
            (program, sets, policies)
        };
        let held_back = std::mem::take(&mut policies.held_back);

        let start = time::Instant::now();
        let ops = program.len();
        if !program.is_empty() {
            debug!(ops, "Executing program");
            if let Err(error) = self.executor.execute(program).await {
                self.metrics.observe(metrics::Outcome::Failure, start.elapsed());
                error!(error = %format_args!("{error:#}"), "Failed to apply dataplane program");
                return Err(Error::Executor(error));
            }
        }

        let pending = {
            let mut index = self.index.write();
            index.policies.commit(policies);
            index.sets.commit(sets);
            index.pending_len()
        };

        let outcome = if held_back.is_empty() {
            metrics::Outcome::Success
        } else {
            metrics::Outcome::Partial
        };
        if ops > 0 {
            self.metrics.observe(outcome, start.elapsed());
        }

        if held_back.is_empty() {
            info!(ops, pending, "Applied dataplane");
            return Ok(());
        }

        for invalid in &held_back {
            warn!(policy = %invalid.policy, missing = ?invalid.missing, "Network policy held back");
        }
        info!(ops, pending, held_back = held_back.len(), "Applied dataplane");
        Err(Error::Validation(held_back))
    }

    /// Discards managed host state left behind by a previous process.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<()> {
        let _apply = self.apply_lock.lock().await;

        let HostState { policies, mut sets } =
            self.executor.host_state().await.map_err(Error::Executor)?;
        if policies.is_empty() && sets.is_empty() {
            debug!("No residual dataplane state");
            return Ok(());
        }

        info!(
            policies = policies.len(),
            ipsets = sets.len(),
            "Discarding residual dataplane state"
        );
        // Lists are deleted before the sets they may contain.
        sets.sort_by(|a, b| b.kind.cmp(&a.kind).then_with(|| a.name.cmp(&b.name)));
        let program = policies
            .into_iter()
            .map(|name| Op::RemovePolicy { name })
            .chain(sets.into_iter().map(|set| Op::DeleteSet { set }))
            .collect::<Program>();
        self.executor.execute(program).await.map_err(Error::Executor)
    }

    /// Removes every applied policy and set from the host, then drops all staged state.
    ///
    /// If the executor fails, staged state is left untouched.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        let _apply = self.apply_lock.lock().await;

        let program = {
            let index = self.index.read();
            let mut policies = index.policies.plan_teardown();
            let mut sets = index.sets.plan_teardown();
            assemble(&mut sets, &mut policies)
        };
        if !program.is_empty() {
            info!(ops = program.len(), "Tearing down dataplane");
            self.executor
                .execute(program)
                .await
                .map_err(Error::Executor)?;
        }

        let mut index = self.index.write();
        index.sets.clear();
        index.pods.clear();
        index.policies.clear();
        debug!("Cleared dataplane state");
        Ok(())
    }

    pub(crate) fn stage<T>(&self, f: impl FnOnce(&mut Index) -> T) -> T {
        let out = f(&mut self.index.write());
        self.staged.notify_one();
        out
    }
}

#[async_trait::async_trait]
impl<E: Executor> GenericDataplane for Dataplane<E> {
    async fn initialize_dataplane(&self) -> Result<()> {
        self.initialize().await
    }

    async fn reset_dataplane(&self) -> Result<()> {
        self.reset().await
    }

    #[instrument(skip(self, set), fields(set = %set))]
    fn create_ipset(&self, set: &IpSetMetadata) {
        self.stage(|index| index.sets.create(set));
    }

    #[instrument(skip(self, set), fields(set = %set))]
    fn delete_ipset(&self, set: &IpSetMetadata) {
        self.stage(|index| index.sets.delete(set));
    }

    #[instrument(skip(self, sets), fields(sets = sets.len()))]
    fn add_to_sets(&self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()> {
        self.stage(|index| index.pods.add_to_sets(&mut index.sets, sets, ip, pod_key))
    }

    #[instrument(skip(self, sets), fields(sets = sets.len()))]
    fn remove_from_sets(&self, sets: &[IpSetMetadata], ip: IpAddr, pod_key: &str) -> Result<()> {
        self.stage(|index| index.pods.remove_from_sets(&mut index.sets, sets, ip, pod_key))
    }

    #[instrument(skip(self, list, sets), fields(list = %list, sets = sets.len()))]
    fn add_to_list(&self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()> {
        self.stage(|index| index.sets.add_to_list(list, sets))
    }

    #[instrument(skip(self, list, sets), fields(list = %list, sets = sets.len()))]
    fn remove_from_list(&self, list: &IpSetMetadata, sets: &[IpSetMetadata]) -> Result<()> {
        self.stage(|index| index.sets.remove_from_list(list, sets))
    }

    fn update_pod(&self, update: PodUpdate) -> Result<()> {
        self.stage(|index| index.pods.update_pod(&mut index.sets, update))
    }

    #[instrument(skip(self, policy), fields(policy = %policy.name))]
    fn add_policy(&self, policy: NetworkPolicy) -> Result<()> {
        self.stage(|index| {
            let Index { sets, policies, .. } = index;
            policies.add(policy, sets)
        })
    }

    #[instrument(skip(self, policy), fields(policy = %policy.name))]
    fn update_policy(&self, policy: NetworkPolicy) -> Result<()> {
        self.stage(|index| {
            let Index { sets, policies, .. } = index;
            policies.update(policy, sets)
        })
    }

    #[instrument(skip(self))]
    fn remove_policy(&self, name: &str) -> Result<()> {
        self.stage(|index| {
            let Index { sets, policies, .. } = index;
            policies.remove(name, sets)
        });
        Ok(())
    }

    async fn apply_dataplane(&self) -> Result<()> {
        self.apply().await
    }
}

/// Drains the operations from a set plan and a policy plan into a single program, in the order
/// the host must apply them.
fn assemble(sets: &mut SetPlan, policies: &mut PolicyPlan) -> Program {
    use std::mem::take;

    let mut program = Program::default();
    program.extend(take(&mut sets.creates));
    program.extend(take(&mut sets.member_adds));
    program.extend(take(&mut sets.member_removes));
    program.extend(take(&mut sets.reference_adds));
    program.extend(take(&mut policies.upserts));
    program.extend(take(&mut policies.removes));
    program.extend(take(&mut sets.reference_removes));
    program.extend(take(&mut sets.deletes));
    program
}
