//! The cluster control plane as seen from outside: summary types, the client
//! capability, and the transport failure taxonomy.
use crate::thrift::ThriftError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// One running topology as listed in the cluster summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySummary {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// One supervisor (worker node).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSummary {
    pub host: String,
    pub supervisor_id: String,
}

/// Full-cluster snapshot returned by `getClusterInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSummary {
    pub supervisors: Vec<SupervisorSummary>,
    pub topologies: Vec<TopologySummary>,
}

impl ClusterSummary {
    /// Find a topology by exact name.
    pub fn topology(&self, name: &str) -> Option<&TopologySummary> {
        self.topologies.iter().find(|t| t.name == name)
    }
}

/// Counter table: stat window (e.g. `:all-time`) -> stream -> count.
pub type StatTable = BTreeMap<String, BTreeMap<String, i64>>;

/// Role-specific executor stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecificStats {
    Bolt {
        acked: StatTable,
        failed: StatTable,
        executed: StatTable,
    },
    Spout {
        acked: StatTable,
        failed: StatTable,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorStats {
    pub emitted: StatTable,
    pub transferred: StatTable,
    pub specific: SpecificStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSummary {
    pub component_id: String,
    pub task_start: i32,
    pub task_end: i32,
    pub host: String,
    pub port: i32,
    /// Absent until the executor has reported its first heartbeat.
    pub stats: Option<ExecutorStats>,
}

/// Per-topology execution info returned by `getTopologyInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub executors: Vec<ExecutorSummary>,
}

/// The control-plane call could not complete.
#[derive(Debug)]
pub enum ConnectFailure {
    /// TCP connect to the control plane failed.
    Connect {
        endpoint: String,
        source: std::io::Error,
    },
    /// Read or write on an established connection failed.
    Transport { source: std::io::Error },
    /// An RPC (or the connect itself) did not finish in time.
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// The peer sent something we could not decode or an application error.
    Protocol { source: ThriftError },
    /// The reply decoded but did not have the expected shape.
    Malformed { detail: String },
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailure::Connect { endpoint, source } => {
                write!(f, "failed to connect to {endpoint}: {source}")
            }
            ConnectFailure::Transport { source } => {
                write!(f, "control plane transport error: {source}")
            }
            ConnectFailure::Timeout { operation, after } => {
                write!(f, "{operation} timed out after {}s", after.as_secs())
            }
            ConnectFailure::Protocol { source } => {
                write!(f, "control plane protocol error: {source}")
            }
            ConnectFailure::Malformed { detail } => {
                write!(f, "malformed control plane reply: {detail}")
            }
        }
    }
}

impl std::error::Error for ConnectFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectFailure::Connect { source, .. } => Some(source),
            ConnectFailure::Transport { source } => Some(source),
            ConnectFailure::Protocol { source } => Some(source),
            ConnectFailure::Timeout { .. } | ConnectFailure::Malformed { .. } => None,
        }
    }
}

impl From<ThriftError> for ConnectFailure {
    fn from(source: ThriftError) -> Self {
        ConnectFailure::Protocol { source }
    }
}

/// An open connection to the control plane. Dropping it closes the connection.
#[async_trait]
pub trait ControlPlaneClient: Send {
    /// Fetch the full cluster summary.
    async fn cluster_summary(&mut self) -> Result<ClusterSummary, ConnectFailure>;

    /// Fetch execution info for a topology id.
    ///
    /// Returns `Ok(None)` when the control plane reports the topology is no
    /// longer alive.
    async fn topology_info(&mut self, id: &str) -> Result<Option<TopologyInfo>, ConnectFailure>;
}

/// Opens control-plane connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ControlPlaneClient>, ConnectFailure>;

    /// `host:port` for diagnostics.
    fn endpoint(&self) -> String;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_lookup_is_exact() {
        let summary = ClusterSummary {
            supervisors: Vec::new(),
            topologies: vec![
                TopologySummary {
                    id: "wordcount2-1-1".to_string(),
                    name: "wordcount2".to_string(),
                    status: "ACTIVE".to_string(),
                },
                TopologySummary {
                    id: "wordcount-2-1".to_string(),
                    name: "wordcount".to_string(),
                    status: "ACTIVE".to_string(),
                },
            ],
        };
        assert_eq!(summary.topology("wordcount").unwrap().id, "wordcount-2-1");
        assert!(summary.topology("Wordcount").is_none());
        assert!(summary.topology("word").is_none());
    }

    #[test]
    fn test_connect_failure_display_and_source() {
        use std::error::Error;
        let err = ConnectFailure::Connect {
            endpoint: "nimbus:6627".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(err.to_string(), "failed to connect to nimbus:6627: refused");
        assert!(err.source().is_some());

        let err = ConnectFailure::Timeout {
            operation: "getClusterInfo",
            after: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "getClusterInfo timed out after 30s");
        assert!(err.source().is_none());
    }
}
