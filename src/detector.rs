use crate::control_plane::{ConnectFailure, Connector};
use crate::sampler::{SampleResult, Sampler};
use crate::window::{ExecutionStatus, StabilityWindow};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How evidence is kept between probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// Every probe starts from an empty window.
    PerProbe,
    /// One window survives across probes; only a restart clears it.
    Carried,
}

/// Why a probe ended without a classification.
#[derive(Debug)]
pub enum ProbeError {
    Connect(ConnectFailure),
    /// Shutdown was requested while waiting between samples.
    Interrupted,
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Connect(e) => write!(f, "{e}"),
            ProbeError::Interrupted => write!(f, "interrupted by shutdown request"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Connect(e) => Some(e),
            ProbeError::Interrupted => None,
        }
    }
}

impl From<ConnectFailure> for ProbeError {
    fn from(e: ConnectFailure) -> Self {
        ProbeError::Connect(e)
    }
}

/// Samples a topology until the window yields a verdict.
///
/// Each call to [`Detector::get_execution`] is one blocking probe of at most
/// `check_count` samples spaced `interval` apart. The control-plane
/// connection is opened at the start of the probe and dropped when it ends.
pub struct Detector {
    connector: Box<dyn Connector>,
    interval: Duration,
    check_count: usize,
    mode: WindowMode,
    shutdown: CancellationToken,
    carried: Option<StabilityWindow>,
    next_index: u64,
}

impl Detector {
    pub fn new(
        connector: Box<dyn Connector>,
        interval: Duration,
        check_count: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            interval,
            check_count: check_count.max(1),
            mode: WindowMode::PerProbe,
            shutdown,
            carried: None,
            next_index: 0,
        }
    }

    pub fn with_mode(mut self, mode: WindowMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run one probe and classify the topology.
    pub async fn get_execution(&mut self, topology: &str) -> Result<ExecutionStatus, ProbeError> {
        let mut window = match self.mode {
            WindowMode::PerProbe => StabilityWindow::new(self.check_count),
            WindowMode::Carried => self
                .carried
                .take()
                .unwrap_or_else(|| StabilityWindow::new(self.check_count)),
        };

        let result = self.probe(topology, &mut window).await;

        // A verdict or an error ends the wait, so only an open question is carried.
        if let (WindowMode::Carried, Ok(ExecutionStatus::Executing)) = (self.mode, &result) {
            self.carried = Some(window);
        }
        result
    }

    async fn probe(
        &mut self,
        topology: &str,
        window: &mut StabilityWindow,
    ) -> Result<ExecutionStatus, ProbeError> {
        let client = self.connector.connect().await?;
        let mut sampler = Sampler::new(client, self.next_index);

        for _ in 0..self.check_count {
            if !window.is_empty() {
                self.pause().await?;
            }

            let result = sampler.sample(topology).await;
            self.next_index = sampler.next_index();
            let sample = match result? {
                SampleResult::NotAlived => return Ok(ExecutionStatus::NotAlived),
                SampleResult::Sample(sample) => sample,
            };

            let status = window.push(sample);
            tracing::debug!(
                topology,
                status = status.as_str(),
                filled = window.len(),
                capacity = window.capacity(),
                "pushed sample"
            );
            if status == ExecutionStatus::Stopped {
                return Ok(ExecutionStatus::Stopped);
            }
        }
        Ok(ExecutionStatus::Executing)
    }

    /// Sleep for one interval unless shutdown is requested first.
    async fn pause(&self) -> Result<(), ProbeError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ProbeError::Interrupted),
            _ = tokio::time::sleep(self.interval) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::fake::{FakeCluster, Step};
    use tokio::time::Instant;

    fn assert_elapsed(start: Instant, expected_ms: u64) {
        let elapsed = start.elapsed();
        let expected = Duration::from_millis(expected_ms);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(10),
            "elapsed {elapsed:?}, expected about {expected:?}"
        );
    }

    fn detector(cluster: &FakeCluster, interval_ms: u64, check_count: usize) -> Detector {
        Detector::new(
            Box::new(cluster.clone()),
            Duration::from_millis(interval_ms),
            check_count,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_flat_counters_stop() {
        let cluster = FakeCluster::scripted("wordcount", vec![Step::Running(vec![("a", 10)])]);
        let mut detector = detector(&cluster, 100, 3);

        let start = Instant::now();
        let status = detector.get_execution("wordcount").await.unwrap();
        assert_eq!(status, ExecutionStatus::Stopped);
        assert_eq!(cluster.summary_calls(), 3);
        // Two sleeps between three samples.
        assert_elapsed(start, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_then_flat_needs_second_probe() {
        let cluster = FakeCluster::scripted(
            "wordcount",
            vec![
                Step::Running(vec![("a", 10)]),
                Step::Running(vec![("a", 20)]),
                Step::Running(vec![("a", 20)]),
                Step::Running(vec![("a", 20)]),
            ],
        );
        let mut detector = detector(&cluster, 100, 3);

        // [10, 20, 20] fills the window with unequal endpoints.
        assert_eq!(
            detector.get_execution("wordcount").await.unwrap(),
            ExecutionStatus::Executing
        );
        // Next probe starts fresh: [20, 20, 20].
        assert_eq!(
            detector.get_execution("wordcount").await.unwrap(),
            ExecutionStatus::Stopped
        );
        assert_eq!(cluster.summary_calls(), 6);
        assert_eq!(cluster.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_topology_short_circuits() {
        let cluster = FakeCluster::scripted("wordcount", vec![Step::Absent]);
        let mut detector = detector(&cluster, 1_000, 5);

        let start = Instant::now();
        assert_eq!(
            detector.get_execution("wordcount").await.unwrap(),
            ExecutionStatus::NotAlived
        );
        assert_eq!(cluster.summary_calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_mid_probe_short_circuits() {
        let cluster = FakeCluster::scripted(
            "wordcount",
            vec![Step::Running(vec![("a", 1)]), Step::Vanished],
        );
        let mut detector = detector(&cluster, 100, 5);
        assert_eq!(
            detector.get_execution("wordcount").await.unwrap(),
            ExecutionStatus::NotAlived
        );
        assert_eq!(cluster.summary_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_surfaces_and_releases_connection() {
        let cluster = FakeCluster::scripted(
            "wordcount",
            vec![Step::Running(vec![("a", 1)]), Step::Fail],
        );
        let mut detector = detector(&cluster, 100, 5);

        let err = detector.get_execution("wordcount").await.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Connect(ConnectFailure::Transport { .. })
        ));
        assert_eq!(cluster.summary_calls(), 2);
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_surfaces() {
        let cluster = FakeCluster::unreachable();
        let mut detector = detector(&cluster, 100, 5);
        let err = detector.get_execution("wordcount").await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect(ConnectFailure::Connect { .. })));
        assert_eq!(cluster.summary_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_bounded_by_check_count() {
        let cluster = FakeCluster::scripted("wordcount", vec![Step::Growing]);
        let mut detector = detector(&cluster, 100, 4);

        let start = Instant::now();
        assert_eq!(
            detector.get_execution("wordcount").await.unwrap(),
            ExecutionStatus::Executing
        );
        assert_eq!(cluster.summary_calls(), 4);
        assert_elapsed(start, 300);
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_carried_window_stops_sooner() {
        let script = vec![
            Step::Running(vec![("a", 10)]),
            Step::Running(vec![("a", 20)]),
            Step::Running(vec![("a", 20)]),
            Step::Running(vec![("a", 20)]),
        ];
        let cluster = FakeCluster::scripted("wordcount", script);
        let mut detector = detector(&cluster, 100, 3).with_mode(WindowMode::Carried);

        assert_eq!(
            detector.get_execution("wordcount").await.unwrap(),
            ExecutionStatus::Executing
        );
        let start = Instant::now();
        // One more sample completes [20, 20, 20], and it is paced like the rest.
        assert_eq!(
            detector.get_execution("wordcount").await.unwrap(),
            ExecutionStatus::Stopped
        );
        assert_eq!(cluster.summary_calls(), 4);
        assert_elapsed(start, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_pause_interrupts() {
        let cluster = FakeCluster::scripted("wordcount", vec![Step::Growing]);
        let token = CancellationToken::new();
        let mut detector = Detector::new(
            Box::new(cluster.clone()),
            Duration::from_secs(3600),
            5,
            token.clone(),
        );
        token.cancel();

        let start = Instant::now();
        let err = detector.get_execution("wordcount").await.unwrap_err();
        assert!(matches!(err, ProbeError::Interrupted));
        assert_eq!(cluster.summary_calls(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(cluster.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_cancel_from_another_task_is_prompt() {
        let cluster = FakeCluster::scripted("wordcount", vec![Step::Growing]);
        let token = CancellationToken::new();
        let mut detector = Detector::new(
            Box::new(cluster.clone()),
            Duration::from_secs(60),
            5,
            token.clone(),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let start = std::time::Instant::now();
        let err = detector.get_execution("wordcount").await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, ProbeError::Interrupted));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
