//! Nimbus Thrift client: framed transport, `getClusterInfo` and
//! `getTopologyInfo`, and the mapping from Storm's wire structs to our
//! summary types.
use crate::config::NimbusConfig;
use crate::control_plane::{
    ClusterSummary, ConnectFailure, Connector, ControlPlaneClient, ExecutorStats,
    ExecutorSummary, SpecificStats, StatTable, SupervisorSummary, TopologyInfo, TopologySummary,
};
use crate::storm_config::NimbusEndpoint;
use crate::thrift::{self, Fields, MessageType, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Opens framed Thrift connections to Nimbus.
#[derive(Debug, Clone)]
pub struct NimbusConnector {
    host: String,
    port: u16,
    rpc_timeout: Duration,
    max_frame: usize,
}

impl NimbusConnector {
    pub fn new(endpoint: &NimbusEndpoint, settings: &NimbusConfig) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            rpc_timeout: Duration::from_secs(settings.rpc_timeout_secs),
            max_frame: endpoint.max_buffer_size,
        }
    }
}

#[async_trait]
impl Connector for NimbusConnector {
    async fn connect(&self) -> Result<Box<dyn ControlPlaneClient>, ConnectFailure> {
        let endpoint = self.endpoint();
        let stream = tokio::time::timeout(
            self.rpc_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ConnectFailure::Timeout {
            operation: "connect",
            after: self.rpc_timeout,
        })?
        .map_err(|source| ConnectFailure::Connect {
            endpoint: endpoint.clone(),
            source,
        })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ConnectFailure::Transport { source })?;

        tracing::debug!(%endpoint, "connected to nimbus");
        Ok(Box::new(NimbusClient {
            stream,
            seqid: 0,
            rpc_timeout: self.rpc_timeout,
            max_frame: self.max_frame,
        }))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One open Nimbus connection. The socket closes when this is dropped.
pub struct NimbusClient {
    stream: TcpStream,
    seqid: i32,
    rpc_timeout: Duration,
    max_frame: usize,
}

impl NimbusClient {
    async fn call(&mut self, method: &'static str, args: Fields) -> Result<Fields, ConnectFailure> {
        self.seqid = self.seqid.wrapping_add(1);
        let seqid = self.seqid;
        let request = thrift::encode_message(method, MessageType::Call, seqid, &args);

        let stream = &mut self.stream;
        let max_frame = self.max_frame;
        let exchange = async move {
            write_frame(stream, &request).await?;
            read_frame(stream, max_frame).await
        };
        let payload = tokio::time::timeout(self.rpc_timeout, exchange)
            .await
            .map_err(|_| ConnectFailure::Timeout {
                operation: method,
                after: self.rpc_timeout,
            })??;

        let message = thrift::decode_message(&payload)?;
        if message.kind == MessageType::Exception {
            return Err(thrift::application_error(&message.body).into());
        }
        if message.kind != MessageType::Reply || message.name != method || message.seqid != seqid {
            return Err(ConnectFailure::Malformed {
                detail: format!(
                    "expected reply to {method}#{seqid}, got {:?} {}#{}",
                    message.kind, message.name, message.seqid
                ),
            });
        }
        Ok(message.body)
    }
}

#[async_trait]
impl ControlPlaneClient for NimbusClient {
    async fn cluster_summary(&mut self) -> Result<ClusterSummary, ConnectFailure> {
        let result = self.call("getClusterInfo", Fields::new()).await?;
        let summary = result
            .get(0)
            .and_then(Value::as_struct)
            .ok_or_else(|| malformed("getClusterInfo returned no result"))?;
        parse_cluster_summary(summary)
    }

    async fn topology_info(&mut self, id: &str) -> Result<Option<TopologyInfo>, ConnectFailure> {
        let args = Fields::new().with(1, Value::string(id));
        let result = self.call("getTopologyInfo", args).await?;
        if let Some(info) = result.get(0).and_then(Value::as_struct) {
            return parse_topology_info(info).map(Some);
        }
        if let Some(e) = result.get(1).and_then(Value::as_struct) {
            let msg = e.get(1).and_then(Value::as_str).unwrap_or("");
            tracing::debug!(topology_id = id, msg, "nimbus reports topology not alive");
            return Ok(None);
        }
        if let Some(e) = result.get(2).and_then(Value::as_struct) {
            let msg = e.get(1).and_then(Value::as_str).unwrap_or("");
            return Err(malformed(format!("not authorized to read {id}: {msg}")));
        }
        Err(malformed("getTopologyInfo returned no result"))
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), ConnectFailure> {
    let len = (payload.len() as u32).to_be_bytes();
    let io = async {
        stream.write_all(&len).await?;
        stream.write_all(payload).await?;
        stream.flush().await
    };
    io.await.map_err(|source| ConnectFailure::Transport { source })
}

async fn read_frame(stream: &mut TcpStream, max_frame: usize) -> Result<Vec<u8>, ConnectFailure> {
    let mut len = [0u8; 4];
    stream
        .read_exact(&mut len)
        .await
        .map_err(|source| ConnectFailure::Transport { source })?;
    let len = i32::from_be_bytes(len);
    if len < 0 || len as usize > max_frame {
        return Err(malformed(format!("frame size {len} outside 0..={max_frame}")));
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|source| ConnectFailure::Transport { source })?;
    Ok(payload)
}

fn malformed(detail: impl Into<String>) -> ConnectFailure {
    ConnectFailure::Malformed {
        detail: detail.into(),
    }
}

fn field<'a>(fields: &'a Fields, id: i16, what: &str) -> Result<&'a Value, ConnectFailure> {
    fields
        .get(id)
        .ok_or_else(|| malformed(format!("{what}: missing field {id}")))
}

fn string_field(fields: &Fields, id: i16, what: &str) -> Result<String, ConnectFailure> {
    field(fields, id, what)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("{what}: field {id} is not a string")))
}

fn int_field(fields: &Fields, id: i16, what: &str) -> Result<i32, ConnectFailure> {
    field(fields, id, what)?
        .as_i64()
        .map(|v| v as i32)
        .ok_or_else(|| malformed(format!("{what}: field {id} is not an integer")))
}

fn struct_list<'a>(
    fields: &'a Fields,
    id: i16,
    what: &str,
) -> Result<Vec<&'a Fields>, ConnectFailure> {
    let items = field(fields, id, what)?
        .as_list()
        .ok_or_else(|| malformed(format!("{what}: field {id} is not a list")))?;
    items
        .iter()
        .map(|v| {
            v.as_struct()
                .ok_or_else(|| malformed(format!("{what}: list element is not a struct")))
        })
        .collect()
}

fn parse_cluster_summary(fields: &Fields) -> Result<ClusterSummary, ConnectFailure> {
    let supervisors = struct_list(fields, 1, "ClusterSummary.supervisors")?
        .into_iter()
        .map(|s| {
            Ok(SupervisorSummary {
                host: string_field(s, 1, "SupervisorSummary.host")?,
                supervisor_id: string_field(s, 5, "SupervisorSummary.supervisor_id")
                    .unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, ConnectFailure>>()?;

    let topologies = struct_list(fields, 3, "ClusterSummary.topologies")?
        .into_iter()
        .map(|t| {
            Ok(TopologySummary {
                id: string_field(t, 1, "TopologySummary.id")?,
                name: string_field(t, 2, "TopologySummary.name")?,
                status: string_field(t, 7, "TopologySummary.status").unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, ConnectFailure>>()?;

    Ok(ClusterSummary {
        supervisors,
        topologies,
    })
}

fn parse_topology_info(fields: &Fields) -> Result<TopologyInfo, ConnectFailure> {
    let executors = struct_list(fields, 4, "TopologyInfo.executors")?
        .into_iter()
        .map(parse_executor)
        .collect::<Result<Vec<_>, ConnectFailure>>()?;
    Ok(TopologyInfo {
        id: string_field(fields, 1, "TopologyInfo.id")?,
        name: string_field(fields, 2, "TopologyInfo.name")?,
        status: string_field(fields, 5, "TopologyInfo.status").unwrap_or_default(),
        executors,
    })
}

fn parse_executor(fields: &Fields) -> Result<ExecutorSummary, ConnectFailure> {
    let info = field(fields, 1, "ExecutorSummary.executor_info")?
        .as_struct()
        .ok_or_else(|| malformed("ExecutorSummary.executor_info is not a struct"))?;
    let stats = match fields.get(7).and_then(Value::as_struct) {
        Some(stats) => Some(parse_executor_stats(stats)?),
        None => None,
    };
    Ok(ExecutorSummary {
        component_id: string_field(fields, 2, "ExecutorSummary.component_id")?,
        task_start: int_field(info, 1, "ExecutorInfo.task_start")?,
        task_end: int_field(info, 2, "ExecutorInfo.task_end")?,
        host: string_field(fields, 3, "ExecutorSummary.host").unwrap_or_default(),
        port: int_field(fields, 4, "ExecutorSummary.port").unwrap_or_default(),
        stats,
    })
}

fn parse_executor_stats(fields: &Fields) -> Result<ExecutorStats, ConnectFailure> {
    let specific = field(fields, 3, "ExecutorStats.specific")?
        .as_struct()
        .ok_or_else(|| malformed("ExecutorStats.specific is not a struct"))?;
    let specific = if let Some(bolt) = specific.get(1).and_then(Value::as_struct) {
        SpecificStats::Bolt {
            acked: stat_table(bolt.get(1))?,
            failed: stat_table(bolt.get(2))?,
            executed: stat_table(bolt.get(4))?,
        }
    } else if let Some(spout) = specific.get(2).and_then(Value::as_struct) {
        SpecificStats::Spout {
            acked: stat_table(spout.get(1))?,
            failed: stat_table(spout.get(2))?,
        }
    } else {
        return Err(malformed("ExecutorSpecificStats has no bolt or spout member"));
    };
    Ok(ExecutorStats {
        emitted: stat_table(fields.get(1))?,
        transferred: stat_table(fields.get(2))?,
        specific,
    })
}

/// Decode `map<string, map<K, i64>>` where K is a stream name or a
/// `GlobalStreamId`. A missing optional field yields an empty table.
fn stat_table(value: Option<&Value>) -> Result<StatTable, ConnectFailure> {
    let Some(value) = value else {
        return Ok(StatTable::new());
    };
    let windows = value
        .as_map()
        .ok_or_else(|| malformed("stat table is not a map"))?;
    let mut table = StatTable::new();
    for (window, streams) in windows {
        let window = window
            .as_str()
            .ok_or_else(|| malformed("stat window key is not a string"))?;
        let streams = streams
            .as_map()
            .ok_or_else(|| malformed("stat streams are not a map"))?;
        let mut counts = BTreeMap::new();
        for (stream, count) in streams {
            let count = count
                .as_i64()
                .ok_or_else(|| malformed("stat count is not an integer"))?;
            counts.insert(stream_key(stream)?, count);
        }
        table.insert(window.to_string(), counts);
    }
    Ok(table)
}

fn stream_key(value: &Value) -> Result<String, ConnectFailure> {
    if let Some(name) = value.as_str() {
        return Ok(name.to_string());
    }
    let id = value
        .as_struct()
        .ok_or_else(|| malformed("stream key is neither string nor GlobalStreamId"))?;
    Ok(format!(
        "{}:{}",
        string_field(id, 1, "GlobalStreamId.componentId")?,
        string_field(id, 2, "GlobalStreamId.streamId")?
    ))
}
