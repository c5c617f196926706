use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{
        counter::Counter, family::Family, gauge::ConstGauge, histogram::Histogram, MetricType,
    },
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct DataplaneMetrics {
    applies: Family<ApplyLabels, Counter>,
    duration: Histogram,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ApplyLabels {
    result: &'static str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,

    /// Applied, but some policies were held back.
    Partial,

    Failure,
}

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub(crate) fn register_index(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

// === impl DataplaneMetrics ===

impl DataplaneMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "applies",
            "Total number of dataplane applies that reached the executor, by result",
            metrics.applies.clone(),
        );
        reg.register_with_unit(
            "apply_duration",
            "Histogram of the time (seconds) taken to apply a dataplane program",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        metrics
    }

    pub(crate) fn observe(&self, outcome: Outcome, elapsed: time::Duration) {
        let result = match outcome {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failure => "failure",
        };
        self.applies.get_or_create(&ApplyLabels { result }).inc();
        self.duration.observe(elapsed.as_secs_f64());
    }
}

impl Default for DataplaneMetrics {
    fn default() -> Self {
        Self {
            applies: Family::default(),
            duration: Histogram::new([0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        }
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let (ipsets, policies, pods, pending) = {
            let index = self.0.read();
            (
                index.ipsets_len(),
                index.policies_len(),
                index.pods_len(),
                index.pending_len(),
            )
        };

        let gauges = [
            ("ipset_index_size", "The number of ipsets in index", ipsets),
            (
                "network_policy_index_size",
                "The number of network policies in index",
                policies,
            ),
            ("pod_index_size", "The number of pods in index", pods),
            (
                "pending_index_size",
                "The number of ipsets and network policies awaiting an apply",
                pending,
            ),
        ];
        for (name, help, value) in gauges {
            let gauge = ConstGauge::new(value as u32);
            let gauge_encoder = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
            gauge.encode(gauge_encoder)?;
        }
        Ok(())
    }
}
