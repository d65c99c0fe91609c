/// Config fan-out: push one local file to every supervisor in the cluster.
///
/// Hostnames come from the Nimbus cluster summary. Every name is resolved up
/// front so a typo in the cluster fails the run before any node is touched.
/// Nodes are then copied to one at a time; the first failure aborts the run.
use crate::config::DeployConfig;
use crate::control_plane::{ClusterSummary, ConnectFailure, Connector};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Login used on every node. Each node authenticates independently.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    /// Blank or absent means key-based (or no) authentication.
    pub password: Option<String>,
    pub ssh_port: u16,
}

impl Credentials {
    fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.trim().is_empty())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssh_port", &self.ssh_port)
            .finish()
    }
}

/// What to push and where.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub source: PathBuf,
    pub destination: String,
    pub credentials: Credentials,
}

/// Nodes pushed to and nodes skipped.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DeployReport {
    pub pushed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Errors from a single remote copy.
#[derive(Debug)]
pub enum CopyError {
    /// The copy program could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The node rejected the login.
    AuthFailed { user: String },
    /// A step exited unsuccessfully.
    Failed {
        step: &'static str,
        status: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Spawn { program, source } => {
                write!(f, "failed to run {program}: {source}")
            }
            CopyError::AuthFailed { user } => write!(f, "login failed for user {user}"),
            CopyError::Failed {
                step,
                status,
                stderr,
            } => {
                let code = status.map_or_else(|| "signal".to_string(), |c| c.to_string());
                write!(f, "{step} failed (exit {code}): {}", stderr.trim())
            }
        }
    }
}

impl std::error::Error for CopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CopyError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors that abort a deployment.
#[derive(Debug)]
pub enum DeployError {
    Connect(ConnectFailure),
    Source {
        path: PathBuf,
        source: std::io::Error,
    },
    InvalidDestination(String),
    Resolve {
        host: String,
        source: std::io::Error,
    },
    LocalHost(String),
    Copy {
        host: String,
        source: CopyError,
    },
}

impl std::fmt::Display for DeployError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployError::Connect(e) => write!(f, "get target hosts failed: {e}"),
            DeployError::Source { path, source } => {
                write!(f, "cannot read source {}: {}", path.display(), source)
            }
            DeployError::InvalidDestination(dst) => write!(
                f,
                "destination {dst:?} must name a file using only letters, digits and /._-+,=@%"
            ),
            DeployError::Resolve { host, source } => {
                write!(f, "cannot resolve supervisor host {host}: {source}")
            }
            DeployError::LocalHost(detail) => {
                write!(f, "cannot determine local hostname: {detail}")
            }
            DeployError::Copy { host, source } => write!(f, "put to {host} failed: {source}"),
        }
    }
}

impl std::error::Error for DeployError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeployError::Connect(e) => Some(e),
            DeployError::Source { source, .. } => Some(source),
            DeployError::Resolve { source, .. } => Some(source),
            DeployError::Copy { source, .. } => Some(source),
            DeployError::InvalidDestination(_) | DeployError::LocalHost(_) => None,
        }
    }
}

/// Copies one local file to one remote node.
#[async_trait]
pub trait RemoteCopy: Send + Sync {
    async fn put(
        &self,
        host: &str,
        credentials: &Credentials,
        source: &Path,
        destination: &str,
    ) -> Result<(), CopyError>;
}

/// Split a remote path into directory and file name at the last `/`.
///
/// The path reaches the node twice, as the `scp` target and as a `chmod`
/// argument, and only one of those goes through a remote shell. Paths are
/// therefore limited to characters both read the same way.
pub fn split_destination(destination: &str) -> Result<(&str, &str), DeployError> {
    let plain = destination
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+,=@%".contains(c));
    if !plain {
        return Err(DeployError::InvalidDestination(destination.to_string()));
    }
    let (dir, file) = destination.rsplit_once('/').unwrap_or(("", destination));
    if file.is_empty() {
        return Err(DeployError::InvalidDestination(destination.to_string()));
    }
    Ok((dir, file))
}

/// Supervisor hosts to push to, in cluster order without duplicates, plus
/// the hosts skipped because they are this machine and the file would be
/// copied onto itself.
pub fn plan_targets(
    summary: &ClusterSummary,
    local_host: &str,
    source: &Path,
    destination: &str,
) -> DeployReport {
    let same_path = source == Path::new(destination);
    let mut plan = DeployReport::default();
    for supervisor in &summary.supervisors {
        let host = &supervisor.host;
        if plan.pushed.contains(host) || plan.skipped.contains(host) {
            continue;
        }
        if same_path && host == local_host {
            plan.skipped.push(host.clone());
        } else {
            plan.pushed.push(host.clone());
        }
    }
    plan
}

/// This machine's hostname, as the cluster would list it.
pub fn local_hostname() -> Result<String, DeployError> {
    nix::unistd::gethostname()
        .map_err(|e| DeployError::LocalHost(e.to_string()))?
        .into_string()
        .map_err(|raw| DeployError::LocalHost(format!("non UTF-8 hostname {raw:?}")))
}

/// Pushes a file to every supervisor through a [`RemoteCopy`] channel.
pub struct Deployer {
    copier: Box<dyn RemoteCopy>,
    local_host: String,
}

impl Deployer {
    pub fn new(copier: Box<dyn RemoteCopy>, local_host: impl Into<String>) -> Self {
        Self {
            copier,
            local_host: local_host.into(),
        }
    }

    /// Fetch supervisors from the control plane, then push.
    pub async fn deploy(
        &self,
        connector: &dyn Connector,
        request: &PutRequest,
    ) -> Result<DeployReport, DeployError> {
        let summary = {
            let mut client = connector.connect().await.map_err(DeployError::Connect)?;
            client.cluster_summary().await.map_err(DeployError::Connect)?
        };
        tracing::info!(
            endpoint = %connector.endpoint(),
            supervisors = summary.supervisors.len(),
            "fetched supervisor list"
        );
        self.run(&summary, request).await
    }

    pub async fn run(
        &self,
        summary: &ClusterSummary,
        request: &PutRequest,
    ) -> Result<DeployReport, DeployError> {
        let metadata =
            std::fs::metadata(&request.source).map_err(|source| DeployError::Source {
                path: request.source.clone(),
                source,
            })?;
        if !metadata.is_file() {
            return Err(DeployError::Source {
                path: request.source.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a file"),
            });
        }
        let (dir, file) = split_destination(&request.destination)?;

        let plan = plan_targets(
            summary,
            &self.local_host,
            &request.source,
            &request.destination,
        );
        // Every supervisor, skipped or not, must resolve before anything is copied.
        for host in plan.pushed.iter().chain(&plan.skipped) {
            resolve(host, request.credentials.ssh_port).await?;
        }

        for host in &plan.skipped {
            tracing::info!(host, "local host and source equals destination, skipping");
        }
        for host in &plan.pushed {
            tracing::info!(
                host,
                source = %request.source.display(),
                dir,
                file,
                "putting config"
            );
            self.copier
                .put(
                    host,
                    &request.credentials,
                    &request.source,
                    &request.destination,
                )
                .await
                .map_err(|source| DeployError::Copy {
                    host: host.clone(),
                    source,
                })?;
        }
        Ok(plan)
    }
}

async fn resolve(host: &str, port: u16) -> Result<(), DeployError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| DeployError::Resolve {
            host: host.to_string(),
            source,
        })?;
    if addrs.next().is_none() {
        return Err(DeployError::Resolve {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        });
    }
    Ok(())
}

/// A fully built external command.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    program: String,
    args: Vec<String>,
    /// Passed to `sshpass -e` through the environment, never on the command line.
    password: Option<String>,
}

/// Remote copy through the system `scp`/`ssh` clients.
///
/// With a password the clients are wrapped in `sshpass -e`; without one they
/// run in batch mode so a missing key fails instead of prompting.
pub struct ScpChannel {
    config: DeployConfig,
}

impl ScpChannel {
    pub fn new(config: DeployConfig) -> Self {
        Self { config }
    }

    fn wrap(&self, client: &str, mut args: Vec<String>, credentials: &Credentials) -> Invocation {
        let mut common = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
        ];
        match credentials.password() {
            Some(password) => {
                let mut wrapped = vec!["-e".to_string(), client.to_string()];
                wrapped.append(&mut common);
                wrapped.append(&mut args);
                Invocation {
                    program: self.config.sshpass_command.clone(),
                    args: wrapped,
                    password: Some(password.to_string()),
                }
            }
            None => {
                common.push("-o".to_string());
                common.push("BatchMode=yes".to_string());
                common.append(&mut args);
                Invocation {
                    program: client.to_string(),
                    args: common,
                    password: None,
                }
            }
        }
    }

    fn scp_invocation(
        &self,
        host: &str,
        credentials: &Credentials,
        source: &Path,
        destination: &str,
    ) -> Invocation {
        let args = vec![
            "-P".to_string(),
            credentials.ssh_port.to_string(),
            source.display().to_string(),
            format!(
                "{}@{}:{}",
                credentials.user,
                bracket_ipv6(host),
                destination
            ),
        ];
        self.wrap(&self.config.scp_command, args, credentials)
    }

    fn chmod_invocation(
        &self,
        host: &str,
        credentials: &Credentials,
        destination: &str,
    ) -> Invocation {
        let args = vec![
            "-p".to_string(),
            credentials.ssh_port.to_string(),
            format!("{}@{}", credentials.user, host),
            "chmod".to_string(),
            self.config.file_mode.clone(),
            shell_quote(destination),
        ];
        self.wrap(&self.config.ssh_command, args, credentials)
    }

    async fn execute(
        &self,
        step: &'static str,
        invocation: Invocation,
        credentials: &Credentials,
    ) -> Result<(), CopyError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &invocation.password {
            command.env("SSHPASS", password);
        }
        tracing::debug!(step, program = %invocation.program, args = ?invocation.args, "running");

        let output = command.output().await.map_err(|source| CopyError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.contains("Permission denied") {
            return Err(CopyError::AuthFailed {
                user: credentials.user.clone(),
            });
        }
        Err(CopyError::Failed {
            step,
            status: output.status.code(),
            stderr,
        })
    }
}

#[async_trait]
impl RemoteCopy for ScpChannel {
    async fn put(
        &self,
        host: &str,
        credentials: &Credentials,
        source: &Path,
        destination: &str,
    ) -> Result<(), CopyError> {
        let started = std::time::Instant::now();
        let scp = self.scp_invocation(host, credentials, source, destination);
        self.execute("scp", scp, credentials).await?;
        let chmod = self.chmod_invocation(host, credentials, destination);
        self.execute("chmod", chmod, credentials).await?;
        tracing::info!(
            host,
            destination,
            duration_ms = started.elapsed().as_millis() as u64,
            "config put"
        );
        Ok(())
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Quote for a POSIX shell on the remote side.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
