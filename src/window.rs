use crate::sampler::MetricSample;
use std::collections::VecDeque;

/// Classification of a topology's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Progress observed, or not enough samples yet to tell.
    Executing,
    /// Counters identical across a full window.
    Stopped,
    /// Topology not present in the cluster summary.
    NotAlived,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::NotAlived => "not_alived",
        }
    }
}

/// The last `capacity` samples of one topology, oldest first.
///
/// Because counters only grow for a given topology instance, equal endpoints
/// imply every sample in between is equal too, so only the oldest and newest
/// are compared.
#[derive(Debug)]
pub struct StabilityWindow {
    capacity: usize,
    samples: VecDeque<MetricSample>,
}

impl StabilityWindow {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Add a sample and classify the window.
    ///
    /// A sample where any counter went down belongs to a restarted topology:
    /// the older evidence is discarded and the window starts over from it.
    pub fn push(&mut self, sample: MetricSample) -> ExecutionStatus {
        if let Some(newest) = self.samples.back() {
            if is_restart(newest, &sample) {
                tracing::info!(
                    topology_id = %sample.topology_id,
                    taken_at = sample.taken_at,
                    "counters decreased, topology restarted; resetting window"
                );
                self.samples.clear();
            }
        }

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        if !self.is_full() {
            return ExecutionStatus::Executing;
        }
        match (self.samples.front(), self.samples.back()) {
            (Some(oldest), Some(newest)) if oldest.counters == newest.counters => {
                ExecutionStatus::Stopped
            }
            _ => ExecutionStatus::Executing,
        }
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A different topology id, or any shared counter lower than before.
fn is_restart(previous: &MetricSample, next: &MetricSample) -> bool {
    previous.topology_id != next.topology_id
        || next.counters.iter().any(|(key, value)| {
            previous
                .counters
                .get(key)
                .is_some_and(|before| value < before)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use ExecutionStatus::{Executing, Stopped};

    fn sample(taken_at: u64, counters: &[(&str, u64)]) -> MetricSample {
        MetricSample {
            topology_id: "wordcount-1-1".to_string(),
            counters: counters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            taken_at,
        }
    }

    fn feed(window: &mut StabilityWindow, values: &[u64]) -> Vec<ExecutionStatus> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| window.push(sample(i as u64, &[("a", *v)])))
            .collect()
    }

    #[test]
    fn test_identical_samples_stop_on_last_push() {
        let mut window = StabilityWindow::new(3);
        assert_eq!(feed(&mut window, &[10, 10, 10]), vec![Executing, Executing, Stopped]);
    }

    #[test]
    fn test_progress_then_flat() {
        let mut window = StabilityWindow::new(3);
        assert_eq!(
            feed(&mut window, &[10, 20, 20, 20]),
            vec![Executing, Executing, Executing, Stopped]
        );
    }

    #[test]
    fn test_never_stops_while_counters_move() {
        let mut window = StabilityWindow::new(3);
        let statuses = feed(&mut window, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(statuses.iter().all(|s| *s == Executing));
    }

    #[test]
    fn test_one_flat_pair_is_not_enough() {
        let mut window = StabilityWindow::new(3);
        let statuses = feed(&mut window, &[1, 2, 2, 3, 3, 4]);
        assert!(statuses.iter().all(|s| *s == Executing));
    }

    #[test]
    fn test_capacity_bounded() {
        let mut window = StabilityWindow::new(2);
        feed(&mut window, &[1, 2, 3, 4]);
        assert_eq!(window.len(), 2);
        assert!(window.is_full());
    }

    #[test]
    fn test_capacity_one_stops_immediately() {
        let mut window = StabilityWindow::new(1);
        assert_eq!(feed(&mut window, &[5]), vec![Stopped]);
    }

    #[test]
    fn test_zero_capacity_treated_as_one() {
        let window = StabilityWindow::new(0);
        assert_eq!(window.capacity(), 1);
        assert!(window.is_empty());
    }

    #[test]
    fn test_new_key_is_progress() {
        let mut window = StabilityWindow::new(2);
        assert_eq!(window.push(sample(0, &[("a", 1)])), Executing);
        assert_eq!(window.push(sample(1, &[("a", 1), ("b", 0)])), Executing);
        assert_eq!(window.push(sample(2, &[("a", 1), ("b", 0)])), Stopped);
    }

    #[test]
    fn test_restart_resets_window() {
        let mut window = StabilityWindow::new(3);
        // 10 -> 0 -> 10 would look flat at the endpoints without restart detection.
        assert_eq!(feed(&mut window, &[10, 10]), vec![Executing, Executing]);
        assert_eq!(window.push(sample(2, &[("a", 0)])), Executing);
        assert_eq!(window.len(), 1);
        assert_eq!(window.push(sample(3, &[("a", 10)])), Executing);
        assert_eq!(window.push(sample(4, &[("a", 10)])), Executing);
        assert_eq!(window.push(sample(5, &[("a", 10)])), Stopped);
    }

    #[test]
    fn test_new_topology_id_resets_window() {
        let mut window = StabilityWindow::new(2);
        window.push(sample(0, &[("a", 1)]));
        let mut other = sample(1, &[("a", 1)]);
        other.topology_id = "wordcount-2-2".to_string();
        assert_eq!(window.push(other), Executing);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_status_names() {
        assert_eq!(ExecutionStatus::Executing.as_str(), "executing");
        assert_eq!(ExecutionStatus::Stopped.as_str(), "stopped");
        assert_eq!(ExecutionStatus::NotAlived.as_str(), "not_alived");
    }
}
