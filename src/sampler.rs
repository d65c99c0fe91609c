/// Sampling: one control-plane round trip turned into a `MetricSample`.
use crate::control_plane::{
    ConnectFailure, ControlPlaneClient, SpecificStats, StatTable, TopologyInfo,
};
use std::collections::BTreeMap;

/// Stat window Storm keeps since executor start.
const ALL_TIME: &str = ":all-time";

/// Point-in-time snapshot of a topology's execution counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub topology_id: String,
    /// `<component>[<start>-<end>]/<stat>/<stream>` -> count.
    pub counters: BTreeMap<String, u64>,
    /// Logical index of the sample, 0-based.
    pub taken_at: u64,
}

/// Outcome of a single sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleResult {
    Sample(MetricSample),
    /// Topology is not in the cluster (or died between calls).
    NotAlived,
}

/// Owns one control-plane connection for the duration of a probe.
/// Dropping the sampler closes it.
pub struct Sampler {
    client: Box<dyn ControlPlaneClient>,
    next_index: u64,
}

impl Sampler {
    pub fn new(client: Box<dyn ControlPlaneClient>, first_index: u64) -> Self {
        Self {
            client,
            next_index: first_index,
        }
    }

    /// Index the next sample will carry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Look the topology up by exact name and collect its counters.
    pub async fn sample(&mut self, topology_name: &str) -> Result<SampleResult, ConnectFailure> {
        let summary = self.client.cluster_summary().await?;
        let Some(topology) = summary.topology(topology_name) else {
            tracing::debug!(topology = topology_name, "topology not in cluster summary");
            return Ok(SampleResult::NotAlived);
        };
        let topology_id = topology.id.clone();

        let Some(info) = self.client.topology_info(&topology_id).await? else {
            return Ok(SampleResult::NotAlived);
        };

        let sample = MetricSample {
            topology_id,
            counters: counters_from(&info),
            taken_at: self.next_index,
        };
        self.next_index += 1;
        tracing::debug!(
            topology = topology_name,
            taken_at = sample.taken_at,
            counters = sample.counters.len(),
            "sampled topology"
        );
        Ok(SampleResult::Sample(sample))
    }
}

/// Flatten all-time executor stats into a single counter map.
///
/// Executors that have not reported stats yet contribute nothing; once they
/// do, their keys appear and the window treats that as progress.
pub fn counters_from(info: &TopologyInfo) -> BTreeMap<String, u64> {
    let mut counters = BTreeMap::new();
    for executor in &info.executors {
        let Some(stats) = &executor.stats else {
            continue;
        };
        let prefix = format!(
            "{}[{}-{}]",
            executor.component_id, executor.task_start, executor.task_end
        );
        let mut add = |stat: &str, table: &StatTable| {
            if let Some(streams) = table.get(ALL_TIME) {
                for (stream, count) in streams {
                    counters.insert(
                        format!("{prefix}/{stat}/{stream}"),
                        u64::try_from(*count).unwrap_or(0),
                    );
                }
            }
        };
        add("emitted", &stats.emitted);
        add("transferred", &stats.transferred);
        match &stats.specific {
            SpecificStats::Bolt {
                acked,
                failed,
                executed,
            } => {
                add("acked", acked);
                add("failed", failed);
                add("executed", executed);
            }
            SpecificStats::Spout { acked, failed } => {
                add("acked", acked);
                add("failed", failed);
            }
        }
    }
    counters
}
