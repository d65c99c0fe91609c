/// The wait loop: probe a topology until it quiesces, disappears, the
/// control plane fails, or the deadline passes.
use crate::control_plane::ConnectFailure;
use crate::detector::{Detector, ProbeError};
use crate::window::ExecutionStatus;
use std::time::Duration;
use tokio::time::Instant;

/// Exit code: topology stopped.
pub const EXIT_STOPPED: i32 = 0;
/// Exit code: still executing when the deadline passed.
pub const EXIT_NOT_STOPPED: i32 = 1;
/// Exit code: topology missing, control plane unreachable, or bad input.
pub const EXIT_FAILURE: i32 = 2;
/// Exit code: interrupted by SIGINT/SIGTERM.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Terminal result of a wait. Each variant carries the topology name and the
/// wall-clock time spent.
#[derive(Debug)]
pub enum WaitOutcome {
    Stopped {
        topology: String,
        elapsed: Duration,
    },
    NotAlive {
        topology: String,
        elapsed: Duration,
    },
    TimedOut {
        topology: String,
        elapsed: Duration,
    },
    ConnectFailed {
        topology: String,
        elapsed: Duration,
        endpoint: String,
        error: ConnectFailure,
    },
    Interrupted {
        topology: String,
        elapsed: Duration,
    },
}

impl WaitOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            WaitOutcome::Stopped { .. } => EXIT_STOPPED,
            WaitOutcome::TimedOut { .. } => EXIT_NOT_STOPPED,
            WaitOutcome::NotAlive { .. } | WaitOutcome::ConnectFailed { .. } => EXIT_FAILURE,
            WaitOutcome::Interrupted { .. } => EXIT_INTERRUPTED,
        }
    }

    pub fn topology(&self) -> &str {
        match self {
            WaitOutcome::Stopped { topology, .. }
            | WaitOutcome::NotAlive { topology, .. }
            | WaitOutcome::TimedOut { topology, .. }
            | WaitOutcome::ConnectFailed { topology, .. }
            | WaitOutcome::Interrupted { topology, .. } => topology,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            WaitOutcome::Stopped { elapsed, .. }
            | WaitOutcome::NotAlive { elapsed, .. }
            | WaitOutcome::TimedOut { elapsed, .. }
            | WaitOutcome::ConnectFailed { elapsed, .. }
            | WaitOutcome::Interrupted { elapsed, .. } => *elapsed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WaitOutcome::Stopped { .. } => "stopped",
            WaitOutcome::NotAlive { .. } => "not_alive",
            WaitOutcome::TimedOut { .. } => "timed_out",
            WaitOutcome::ConnectFailed { .. } => "connect_failed",
            WaitOutcome::Interrupted { .. } => "interrupted",
        }
    }

    /// Report the outcome once, at the level it deserves.
    pub fn log(&self) {
        let topology = self.topology();
        let elapsed_ms = self.elapsed().as_millis() as u64;
        match self {
            WaitOutcome::Stopped { .. } => {
                tracing::info!(topology, elapsed_ms, "topology execution stopped");
            }
            WaitOutcome::NotAlive { .. } => {
                tracing::error!(topology, elapsed_ms, "topology not exist, exit wait");
            }
            WaitOutcome::TimedOut { .. } => {
                tracing::error!(topology, elapsed_ms, "topology wait timeout, exit wait");
            }
            WaitOutcome::ConnectFailed {
                endpoint, error, ..
            } => {
                tracing::error!(
                    topology,
                    elapsed_ms,
                    %endpoint,
                    error = %error,
                    "nimbus connect failed, exit wait"
                );
            }
            WaitOutcome::Interrupted { .. } => {
                tracing::warn!(topology, elapsed_ms, "wait interrupted by shutdown request");
            }
        }
    }
}

/// Drives the detector until a terminal outcome.
///
/// Pacing comes from the detector's own sampling interval; there is no extra
/// sleep between probes. Connection failures are not retried.
pub struct WaitLoop {
    detector: Detector,
    timeout: Duration,
}

impl WaitLoop {
    pub fn new(detector: Detector, timeout: Duration) -> Self {
        Self { detector, timeout }
    }

    pub async fn wait(&mut self, topology: &str) -> WaitOutcome {
        let start = Instant::now();
        let mut probes: u32 = 0;
        let name = topology.to_string();

        loop {
            if self.detector.is_shut_down() {
                return WaitOutcome::Interrupted {
                    topology: name,
                    elapsed: start.elapsed(),
                };
            }

            probes += 1;
            let status = match self.detector.get_execution(topology).await {
                Ok(status) => status,
                Err(ProbeError::Connect(error)) => {
                    return WaitOutcome::ConnectFailed {
                        topology: name,
                        elapsed: start.elapsed(),
                        endpoint: self.detector.endpoint(),
                        error,
                    }
                }
                Err(ProbeError::Interrupted) => {
                    return WaitOutcome::Interrupted {
                        topology: name,
                        elapsed: start.elapsed(),
                    }
                }
            };

            let elapsed = start.elapsed();
            match status {
                ExecutionStatus::Stopped => {
                    return WaitOutcome::Stopped {
                        topology: name,
                        elapsed,
                    }
                }
                ExecutionStatus::NotAlived => {
                    return WaitOutcome::NotAlive {
                        topology: name,
                        elapsed,
                    }
                }
                ExecutionStatus::Executing => {
                    if elapsed >= self.timeout {
                        return WaitOutcome::TimedOut {
                            topology: name,
                            elapsed,
                        };
                    }
                    tracing::info!(
                        topology,
                        probes,
                        elapsed_secs = elapsed.as_secs(),
                        timeout_secs = self.timeout.as_secs(),
                        "topology still executing"
                    );
                }
            }
        }
    }
}
