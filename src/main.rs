mod config;
mod control_plane;
mod deploy;
mod detector;
mod nimbus;
mod sampler;
mod signals;
mod storm_config;
mod thrift;
mod wait;
mod window;

use clap::{CommandFactory, Parser, Subcommand};
use config::ToolConfig;
use deploy::{Credentials, Deployer, PutRequest, ScpChannel, DEFAULT_SSH_PORT};
use detector::{Detector, WindowMode};
use nimbus::NimbusConnector;
use signals::SignalHandler;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use storm_config::{NimbusEndpoint, StormConfig, DEFAULT_CONFIG_PATH};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wait::{WaitLoop, EXIT_FAILURE};

/// Exit code for a failed `put`.
const EXIT_PUT_FAILED: i32 = 1;

/// Operate a Storm cluster from the outside: wait for a topology to drain,
/// or push a config file to every supervisor.
#[derive(Parser, Debug)]
#[command(name = "storm-tools", version, about)]
pub struct Cli {
    /// Tool settings file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Debug logging (sample-level detail)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait until a topology stops processing tuples
    Wait(WaitArgs),
    /// Push a file to every supervisor node
    Put(PutArgs),
}

#[derive(clap::Args, Debug)]
struct WaitArgs {
    /// Cluster config file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Topology name
    #[arg(short = 't', long, required_unless_present = "sh")]
    topology: Option<String>,

    /// Seconds between samples
    #[arg(short = 'i', long, default_value_t = 1,
          value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Overall timeout in seconds
    #[arg(short = 'w', long = "timeout", default_value_t = 30)]
    timeout: u64,

    /// Show help and exit with the failure code
    #[arg(long)]
    sh: bool,
}

#[derive(clap::Args)]
struct PutArgs {
    /// Cluster config file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Local file to push
    #[arg(short = 's', long)]
    source: PathBuf,

    /// Absolute path on every node
    #[arg(short = 'd', long)]
    destination: String,

    /// SSH user
    #[arg(long = "ua", value_name = "USER")]
    user: String,

    /// SSH password (key auth when omitted)
    #[arg(long = "up", value_name = "PASSWORD")]
    password: Option<String>,

    /// SSH port
    #[arg(long = "sp", value_name = "PORT", default_value_t = DEFAULT_SSH_PORT)]
    ssh_port: u16,

    /// Show help
    #[arg(long = "sh", action = clap::ArgAction::Help)]
    _sh: Option<bool>,
}

impl std::fmt::Debug for PutArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutArgs")
            .field("config", &self.config)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssh_port", &self.ssh_port)
            .finish()
    }
}

/// Legacy single-dash spellings and their long equivalents.
const LEGACY_FLAGS: &[(&str, &str)] = &[
    ("-sh", "--sh"),
    ("-ua", "--ua"),
    ("-up", "--up"),
    ("-sp", "--sp"),
];

/// Flags whose next argument is a value and must be left untouched.
const VALUE_FLAGS: &[&str] = &[
    "-c", "--config", "-t", "--topology", "-i", "--interval", "-w", "--timeout", "-s",
    "--source", "-d", "--destination", "--ua", "--up", "--sp", "--settings",
];

/// Rewrite `-sh`, `-ua`, `-up` and `-sp` to their long forms so clap does not
/// read them as clusters of short flags.
fn normalize_legacy_flags(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    let mut out: Vec<OsString> = Vec::new();
    let mut expects_value = false;
    for arg in args {
        if expects_value {
            expects_value = false;
            out.push(arg);
            continue;
        }
        let replaced = arg.to_str().and_then(|s| {
            LEGACY_FLAGS
                .iter()
                .find(|(legacy, _)| *legacy == s)
                .map(|(_, long)| OsString::from(*long))
        });
        let arg = replaced.unwrap_or(arg);
        expects_value = arg.to_str().is_some_and(|s| VALUE_FLAGS.contains(&s));
        out.push(arg);
    }
    out
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_subcommand_help(name: &str) {
    let mut cmd = Cli::command();
    if let Some(sub) = cmd.find_subcommand_mut(name) {
        let _ = sub.print_help();
    }
}

fn load_endpoint(path: &std::path::Path) -> Result<NimbusEndpoint, config::ConfigError> {
    let storm = StormConfig::load(path)?;
    storm.nimbus_endpoint()
}

fn shutdown_token() -> CancellationToken {
    match SignalHandler::install() {
        Ok(handler) => handler.token(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to install signal handlers");
            CancellationToken::new()
        }
    }
}

/// Topology name and Nimbus endpoint for a wait, or the exit code when the
/// wait cannot start (help requested, or the cluster config is unusable).
fn wait_target(args: &WaitArgs) -> Result<(String, NimbusEndpoint), i32> {
    let Some(topology) = args.topology.as_ref().filter(|_| !args.sh) else {
        print_subcommand_help("wait");
        return Err(EXIT_FAILURE);
    };
    match load_endpoint(&args.config) {
        Ok(endpoint) => Ok((topology.clone(), endpoint)),
        Err(e) => {
            tracing::error!(
                config = %args.config.display(),
                error = %e,
                "failed to load cluster config"
            );
            Err(EXIT_FAILURE)
        }
    }
}

async fn run_wait(settings: &ToolConfig, args: WaitArgs) -> i32 {
    let (topology, endpoint) = match wait_target(&args) {
        Ok(target) => target,
        Err(code) => return code,
    };

    let mode = if settings.wait.carry_window {
        WindowMode::Carried
    } else {
        WindowMode::PerProbe
    };
    let detector = Detector::new(
        Box::new(NimbusConnector::new(&endpoint, &settings.nimbus)),
        Duration::from_secs(args.interval),
        settings.wait.check_count,
        shutdown_token(),
    )
    .with_mode(mode);

    tracing::info!(
        topology = %topology,
        endpoint = %detector.endpoint(),
        interval_secs = args.interval,
        timeout_secs = args.timeout,
        check_count = settings.wait.check_count,
        "waiting for topology to stop"
    );

    let mut wait_loop = WaitLoop::new(detector, Duration::from_secs(args.timeout));
    let outcome = wait_loop.wait(&topology).await;
    outcome.log();
    println!("{} {}", outcome.topology(), outcome.as_str());
    outcome.exit_code()
}

async fn run_put(settings: &ToolConfig, args: PutArgs) -> i32 {
    let endpoint = match load_endpoint(&args.config) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::error!(
                config = %args.config.display(),
                error = %e,
                "failed to load cluster config"
            );
            return EXIT_PUT_FAILED;
        }
    };
    let local_host = match deploy::local_hostname() {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(error = %e, "put failed");
            return EXIT_PUT_FAILED;
        }
    };

    let connector = NimbusConnector::new(&endpoint, &settings.nimbus);
    let deployer = Deployer::new(
        Box::new(ScpChannel::new(settings.deploy.clone())),
        local_host,
    );
    let request = PutRequest {
        source: args.source,
        destination: args.destination,
        credentials: Credentials {
            user: args.user,
            password: args.password,
            ssh_port: args.ssh_port,
        },
    };

    match deployer.deploy(&connector, &request).await {
        Ok(report) => {
            tracing::info!(
                pushed = report.pushed.len(),
                skipped = report.skipped.len(),
                "put config finished"
            );
            println!(
                "put {} to {} node(s)",
                request.destination,
                report.pushed.len()
            );
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "put config failed");
            EXIT_PUT_FAILED
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_from(normalize_legacy_flags(std::env::args_os()));
    init_logging(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    let settings = match ToolConfig::load(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "failed to load settings");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let code = match cli.command {
        Command::Wait(args) => run_wait(&settings, args).await,
        Command::Put(args) => run_put(&settings, args).await,
    };
    std::process::exit(code);
}
