use crate::{Dataplane, Executor};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Controls how often [`Dataplane::run_apply_loop`] flushes staged state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ApplyLoopConfig {
    /// Pending state is applied at least this often.
    pub apply_interval: Duration,

    /// Pending state is applied as soon as this many sets and policies are pending.
    pub max_pending_before_apply: usize,
}

impl Default for ApplyLoopConfig {
    fn default() -> Self {
        Self {
            apply_interval: Duration::from_millis(500),
            max_pending_before_apply: 100,
        }
    }
}

// === impl Dataplane ===

impl<E: Executor> Dataplane<E> {
    /// Applies pending state periodically until `drain` is signaled.
    ///
    /// Failed applies are logged and retried on the next tick.
    #[instrument(skip_all, fields(interval = ?config.apply_interval))]
    pub async fn run_apply_loop(&self, config: ApplyLoopConfig, drain: drain::Watch) {
        let mut interval = time::interval(config.apply_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin! {
            let shutdown = drain.signaled();
        }

        info!(
            max_pending = config.max_pending_before_apply,
            "Starting dataplane apply loop"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {}

                _ = self.staged.notified() => {
                    let pending = self.pending_len();
                    if pending < config.max_pending_before_apply {
                        continue;
                    }
                    debug!(pending, "Pending threshold reached");
                }

                _ = &mut shutdown => {
                    debug!("Stopping dataplane apply loop");
                    return;
                }
            }

            if self.pending_len() == 0 {
                continue;
            }
            if let Err(error) = self.apply().await {
                warn!(%error, "Failed to apply dataplane");
            }
            interval.reset();
        }
    }
}
