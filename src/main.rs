use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lan_sentinel::archive::{ArchiveDispatcher, FtpStore};
use lan_sentinel::config::{ArchiveConfig, Config, ProbeKind};
use lan_sentinel::discovery::{ConnectProbe, DiscoveryProbe, NmapConfig, NmapProbe};
use lan_sentinel::events::EventChannel;
use lan_sentinel::latency::{IcmpProbe, LatencyMonitor};
use lan_sentinel::orchestrator::{Orchestrator, RunOutcome, ScanTarget};
use lan_sentinel::services::ServiceTable;
use lan_sentinel::snapshot::{CommandCapturer, NoSnapshot, SnapshotSource};
use lan_sentinel::store::{Encoding, Precision, RecordStore};
use lan_sentinel::types::{format_timestamp, ScanResult};
use lan_sentinel::{netdetect, ports, server};

/// lan-sentinel: on-demand LAN sweeps with screen snapshots, a JSON/XML scan archive and live WAN latency.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lan-sentinel",
    version,
    about = "On-demand LAN sweeps with screen snapshots, a JSON/XML scan archive and live WAN latency.",
    long_about = None
)]
struct Cli {
    /// CIDR (e.g., 192.168.1.0/24) or single IP to sweep. If omitted, auto-detect local /24.
    #[arg(long, env = "LAN_SENTINEL_NETWORK")]
    network: Option<String>,

    /// Port specification, e.g. "21-23,25,80".
    #[arg(long, env = "LAN_SENTINEL_PORTS", default_value = ports::COMMON_PORTS)]
    ports: String,

    /// Path to ports list file (one port or range per line). Overrides --ports.
    #[arg(long = "ports-file", env = "LAN_SENTINEL_PORTS_FILE")]
    ports_file: Option<PathBuf>,

    /// Discovery backend: nmap or connect.
    #[arg(long, env = "LAN_SENTINEL_PROBE", default_value = "nmap")]
    probe: ProbeKind,

    /// Path to the nmap binary.
    #[arg(long = "nmap-path", env = "LAN_SENTINEL_NMAP", default_value = "nmap")]
    nmap_path: String,

    /// Upper bound for one discovery sweep, in seconds.
    #[arg(long = "probe-timeout-secs", env = "LAN_SENTINEL_PROBE_TIMEOUT", default_value_t = 600)]
    probe_timeout_secs: u64,

    /// Max concurrent TCP connect attempts (connect probe).
    #[arg(long, default_value_t = 1000)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds (connect probe).
    #[arg(long = "timeout-ms", default_value_t = 400)]
    timeout_ms: u64,

    /// Screenshot command writing an image to stdout; empty disables capture.
    #[arg(
        long = "capture-command",
        env = "LAN_SENTINEL_CAPTURE",
        default_value = "import -window root png:-"
    )]
    capture_command: String,

    /// Directory holding scan records (created if missing).
    #[arg(long = "results-dir", env = "LAN_SENTINEL_RESULTS_DIR", default_value = "scan_results")]
    results_dir: PathBuf,

    /// Record encoding written by this installation: json or xml.
    #[arg(long, env = "LAN_SENTINEL_ENCODING", default_value = "json")]
    encoding: Encoding,

    /// Record name precision: seconds, or day (one record per day, overwritten).
    #[arg(long, env = "LAN_SENTINEL_PRECISION", default_value = "seconds")]
    precision: Precision,

    /// FTP archive host[:port]; archiving is off when unset.
    #[arg(long = "archive-host", env = "LAN_SENTINEL_ARCHIVE_HOST")]
    archive_host: Option<String>,

    /// Remote directory for archived records.
    #[arg(long = "archive-dir", env = "LAN_SENTINEL_ARCHIVE_DIR", default_value = "/scans")]
    archive_dir: String,

    /// Connect/operation timeout for the archive, in seconds.
    #[arg(long = "archive-timeout-secs", default_value_t = 10)]
    archive_timeout_secs: u64,

    /// Address probed by the latency monitor.
    #[arg(long = "latency-target", env = "LAN_SENTINEL_LATENCY_TARGET", default_value = "8.8.8.8")]
    latency_target: IpAddr,

    /// HTTP/WebSocket listen address.
    #[arg(long, env = "LAN_SENTINEL_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Directory of static UI files.
    #[arg(long = "ui-dir", default_value = "ui")]
    ui_dir: PathBuf,

    /// Run a single scan, print the hosts and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// More logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let network = match self.network {
            Some(n) => n,
            None => {
                let net = netdetect::default_network()
                    .context("no --network given and local network detection failed")?;
                info!(%net, "auto-detected local network");
                net.to_string()
            }
        };
        let ports = match &self.ports_file {
            Some(path) => ports::load_ports_from_path(path)?,
            None => ports::parse_ports_str(&self.ports).context("invalid --ports")?,
        };
        let config = Config {
            network,
            ports,
            probe: self.probe,
            nmap_path: self.nmap_path,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            connect_concurrency: self.concurrency,
            connect_timeout: Duration::from_millis(self.timeout_ms),
            capture_command: self
                .capture_command
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            results_dir: self.results_dir,
            encoding: self.encoding,
            precision: self.precision,
            archive: self.archive_host.map(|endpoint| ArchiveConfig {
                endpoint,
                remote_dir: self.archive_dir,
                timeout: Duration::from_secs(self.archive_timeout_secs),
            }),
            latency_target: self.latency_target,
            bind: self.bind,
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let once = cli.once;
    let ui_dir = cli.ui_dir.clone();
    let config = cli.into_config()?;

    info!(
        network = %config.network,
        ports = config.ports.len(),
        probe = ?config.probe,
        encoding = %config.encoding,
        precision = %config.precision,
        results_dir = %config.results_dir.display(),
        archive = config.archive.as_ref().map(|a| a.endpoint.as_str()).unwrap_or("<off>"),
        "lan-sentinel configuration"
    );

    let store = Arc::new(
        RecordStore::open(&config.results_dir, config.encoding, config.precision)
            .await
            .with_context(|| format!("cannot open results dir {}", config.results_dir.display()))?,
    );
    let events = EventChannel::new();
    let orchestrator = Arc::new(build_orchestrator(&config, store.clone(), events.clone())?);

    if once {
        return run_once(&orchestrator).await;
    }

    LatencyMonitor::new(Arc::new(IcmpProbe), config.latency_target, events.clone())
        .with_timing(config.latency_timeout, config.latency_interval)
        .spawn();

    let shutdown = CancellationToken::new();
    let state = server::AppState::new(store, orchestrator, netdetect::system_info(), ui_dir);
    let server_task = tokio::spawn(server::spawn_server(config.bind, state, shutdown.clone()));

    tokio::signal::ctrl_c().await.context("cannot listen for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();
    server_task.await??;
    Ok(())
}

fn build_orchestrator(config: &Config, store: Arc<RecordStore>, events: EventChannel) -> Result<Orchestrator> {
    let probe: Arc<dyn DiscoveryProbe> = match config.probe {
        ProbeKind::Nmap => Arc::new(NmapProbe::new(NmapConfig {
            nmap_path: config.nmap_path.clone(),
            timeout: config.probe_timeout,
            ..NmapConfig::default()
        })),
        ProbeKind::Connect => Arc::new(ConnectProbe::new(
            config.connect_concurrency,
            config.connect_timeout,
        )),
    };

    let snapshot: Arc<dyn SnapshotSource> = if config.capture_command.is_empty() {
        warn!("screen capture disabled");
        Arc::new(NoSnapshot)
    } else {
        Arc::new(CommandCapturer::new(&config.capture_command, config.capture_timeout)?)
    };

    let target = ScanTarget {
        network: config.network.clone(),
        ports: config.ports.clone(),
    };
    let mut orchestrator = Orchestrator::new(
        target,
        probe,
        snapshot,
        Arc::new(ServiceTable::system()),
        store,
        events,
    );
    if let Some(archive) = &config.archive {
        let remote = Arc::new(FtpStore::new(archive.endpoint.clone(), archive.timeout));
        orchestrator =
            orchestrator.with_archive(Arc::new(ArchiveDispatcher::new(remote, archive.remote_dir.clone())));
    }
    Ok(orchestrator)
}

async fn run_once(orchestrator: &Arc<Orchestrator>) -> Result<()> {
    match orchestrator.run().await {
        RunOutcome::Published { result, archive, .. } => {
            print_results_table(&result);
            if let Some(upload) = archive {
                // headless runs wait for the upload so it is not cut off at exit
                let _ = upload.await;
            }
            Ok(())
        }
        RunOutcome::Failed(message) => bail!(message),
    }
}

fn print_results_table(result: &ScanResult) {
    let mut ip_w = "ip".len();
    let mut host_w = "hostname".len();
    let mut svc_w = "service".len();
    for h in result.hosts() {
        ip_w = ip_w.max(h.ip.len());
        host_w = host_w.max(h.hostname.len().min(40));
        for p in &h.ports {
            svc_w = svc_w.max(p.service.len());
        }
    }
    let port_w = "port/proto".len();

    println!(
        "\nScan of {} at {}: {} host(s) up{}",
        result.network(),
        format_timestamp(result.timestamp()),
        result.hosts().len(),
        result
            .filename()
            .map(|f| format!(", saved as {f}"))
            .unwrap_or_default()
    );
    println!(
        "{:<ip_w$}  {:<host_w$}  {:>port_w$}  {:<svc_w$}  version",
        "ip", "hostname", "port/proto", "service",
    );
    println!(
        "{:-<ip_w$}  {:-<host_w$}  {:-<port_w$}  {:-<svc_w$}  {:-<7}",
        "", "", "", "", "",
    );
    for h in result.hosts() {
        let name: String = h.hostname.chars().take(40).collect();
        if h.ports.is_empty() {
            println!("{:<ip_w$}  {:<host_w$}  {:>port_w$}", h.ip, name, "-");
            continue;
        }
        for p in &h.ports {
            println!(
                "{:<ip_w$}  {:<host_w$}  {:>port_w$}  {:<svc_w$}  {}",
                h.ip,
                name,
                format!("{}/{}", p.port, p.protocol),
                p.service,
                p.version,
            );
        }
    }
}
