use crate::ApplyLoopConfig;
use tokio::time::Duration;

/// Configures the background apply loop.
///
/// Intended to be flattened into an embedding binary's arguments.
#[derive(Clone, Debug, clap::Args)]
pub struct DataplaneArgs {
    /// The interval at which staged dataplane changes are applied to the host.
    #[clap(long, default_value = "500", env = "NPM_APPLY_INTERVAL_MS")]
    pub apply_interval_ms: u64,

    /// Applies immediately once this many ipsets and policies are pending.
    #[clap(long, default_value = "100", env = "NPM_MAX_PENDING_BEFORE_APPLY")]
    pub max_pending_before_apply: usize,
}

// === impl DataplaneArgs ===

impl DataplaneArgs {
    pub fn apply_loop_config(&self) -> ApplyLoopConfig {
        ApplyLoopConfig {
            apply_interval: Duration::from_millis(self.apply_interval_ms.max(1)),
            max_pending_before_apply: self.max_pending_before_apply.max(1),
        }
    }
}

impl From<DataplaneArgs> for ApplyLoopConfig {
    fn from(args: DataplaneArgs) -> Self {
        args.apply_loop_config()
    }
}
