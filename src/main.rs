use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::Result;

use xpose_agent::connection::{Agent, AgentState, RunConfig};
use xpose_agent::inspection::{EventSink, HttpSink, NullSink};
use xpose_core::config::Settings;
use xpose_core::resume::load_resume_record;
use xpose_wire::TunnelConfig;

#[derive(Parser)]
#[command(name = "xpose", version, about = "Expose a loopback service on the public internet through a long-lived tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a config file (defaults to ~/.xpose/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a tunnel to a local port and run in the foreground
    Http {
        /// Local port to expose
        port: u16,
        #[command(flatten)]
        opts: TunnelOpts,
    },
    /// Start a tunnel as a background daemon
    Start {
        port: u16,
        #[command(flatten)]
        opts: TunnelOpts,
    },
    /// Stop the background daemon
    Stop,
    /// Report whether the background daemon is running
    Status,
    /// Show the active settings file and resume record
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved settings (file path and effective values)
    Show,
    /// Print the resume record's path and remembered tunnels, if any
    Resume,
}

#[derive(clap::Args, Clone)]
struct TunnelOpts {
    /// Edge gateway to connect to, e.g. wss://xpose.dev/_tunnel/connect
    #[arg(long)]
    edge: Option<String>,

    /// Requested subdomain; omit to let the edge assign one
    #[arg(long)]
    subdomain: Option<String>,

    /// Requested session TTL in seconds
    #[arg(long)]
    ttl: Option<u64>,

    /// Answer CORS preflights and add permissive CORS headers
    #[arg(long)]
    cors: bool,

    /// Allow only this IPv4/IPv6 literal or IPv4 CIDR (repeatable)
    #[arg(long = "allow")]
    allowed_ips: Vec<String>,

    /// Requests per minute per source IP (0 disables the limiter)
    #[arg(long = "rate-limit")]
    rate_limit: Option<u32>,

    /// Inject a response header as KEY=VALUE (repeatable)
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Post inspection events as JSON to this URL
    #[arg(long = "inspect-url")]
    inspect_url: Option<String>,
}

fn pid_file(settings: &Settings) -> PathBuf {
    settings.base_dir().join("xpose.pid")
}

fn log_file(settings: &Settings) -> PathBuf {
    settings.base_dir().join("xpose.log")
}

fn is_process_running(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn run_config_from(settings: &Settings, port: u16, opts: &TunnelOpts) -> Result<RunConfig> {
    let edge_host = opts.edge.clone().unwrap_or_else(|| settings.agent.edge_host.clone());
    let edge_connect_url = if edge_host.contains("://") {
        edge_host
    } else {
        format!("wss://{edge_host}/_tunnel/connect")
    };

    let subdomain = opts
        .subdomain
        .clone()
        .or_else(|| Some(settings.agent.subdomain.clone()).filter(|s| !s.is_empty()));
    let ttl_secs = opts.ttl.or(Some(settings.agent.ttl_secs));

    let mut custom_headers = BTreeMap::new();
    for header in &opts.headers {
        let Some((key, value)) = header.split_once('=') else {
            return Err(color_eyre::eyre::eyre!("invalid --header {header:?}, expected KEY=VALUE"));
        };
        custom_headers.insert(key.trim().to_string(), value.trim().to_string());
    }

    let tunnel_config = TunnelConfig {
        allowed_ips: opts.allowed_ips.clone(),
        rate_limit: opts.rate_limit,
        cors: opts.cors,
        custom_headers,
    };

    let inspect_url = opts.inspect_url.clone().or_else(|| settings.inspection.sink_url.clone());
    let inspection: Arc<dyn EventSink> = match inspect_url {
        Some(url) if settings.inspection.enabled || opts.inspect_url.is_some() => Arc::new(HttpSink::new(url)),
        _ => Arc::new(NullSink),
    };

    let mut cfg = RunConfig::new(edge_connect_url, port, settings.resume_path());
    cfg.subdomain = subdomain;
    cfg.ttl_secs = ttl_secs;
    cfg.tunnel_config = tunnel_config;
    cfg.inspection = inspection;
    Ok(cfg)
}

async fn run_http(settings: Settings, port: u16, opts: TunnelOpts) -> Result<()> {
    let cfg = run_config_from(&settings, port, &opts)?;
    let (agent, mut state_rx) = Agent::new(cfg);

    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow();
            match state {
                AgentState::Connecting => tracing::info!("connecting to edge"),
                AgentState::Connected => tracing::info!("tunnel established"),
                AgentState::Reconnecting => tracing::warn!("connection lost, reconnecting"),
                AgentState::Disconnected => tracing::error!("giving up after repeated reconnect failures"),
                AgentState::Expired => tracing::info!("tunnel TTL expired"),
            }
        }
    });

    agent.run().await;
    Ok(())
}

fn start_daemon(settings: &Settings, port: u16, opts: &TunnelOpts) -> Result<()> {
    let pid_path = pid_file(settings);

    if pid_path.exists() {
        if let Ok(contents) = std::fs::read_to_string(&pid_path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if is_process_running(pid) {
                    eprintln!("xpose daemon already running (PID {pid})");
                    return Ok(());
                }
                std::fs::remove_file(&pid_path)?;
            }
        }
    }

    let log_path = log_file(settings);
    let log = std::fs::File::create(&log_path)?;

    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("http").arg(port.to_string());
    if let Some(edge) = &opts.edge {
        cmd.arg("--edge").arg(edge);
    }
    if let Some(subdomain) = &opts.subdomain {
        cmd.arg("--subdomain").arg(subdomain);
    }
    if let Some(ttl) = opts.ttl {
        cmd.arg("--ttl").arg(ttl.to_string());
    }
    if opts.cors {
        cmd.arg("--cors");
    }
    for ip in &opts.allowed_ips {
        cmd.arg("--allow").arg(ip);
    }
    if let Some(rate_limit) = opts.rate_limit {
        cmd.arg("--rate-limit").arg(rate_limit.to_string());
    }
    for header in &opts.headers {
        cmd.arg("--header").arg(header);
    }
    if let Some(url) = &opts.inspect_url {
        cmd.arg("--inspect-url").arg(url);
    }

    let child = cmd
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()?;

    let pid = child.id();
    std::fs::write(&pid_path, pid.to_string())?;

    eprintln!("xpose daemon started (PID {pid}), exposing port {port}");
    eprintln!("Logs: {}", log_path.display());
    Ok(())
}

fn stop_daemon(settings: &Settings) -> Result<()> {
    let pid_path = pid_file(settings);

    if !pid_path.exists() {
        eprintln!("No PID file found — daemon not running");
        return Ok(());
    }

    let contents = std::fs::read_to_string(&pid_path)?;
    let pid: u32 = contents
        .trim()
        .parse()
        .map_err(|_| color_eyre::eyre::eyre!("Invalid PID file"))?;

    if !is_process_running(pid) {
        eprintln!("Process {pid} not running, removing stale PID file");
        std::fs::remove_file(&pid_path)?;
        return Ok(());
    }

    eprintln!("Stopping xpose daemon (PID {pid})…");
    std::process::Command::new("kill")
        .args([&pid.to_string()])
        .status()?;

    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(500));
        if !is_process_running(pid) {
            break;
        }
    }

    if is_process_running(pid) {
        eprintln!("Process did not exit, sending SIGKILL…");
        std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()?;
    }

    if pid_path.exists() {
        std::fs::remove_file(&pid_path)?;
    }

    eprintln!("xpose daemon stopped");
    Ok(())
}

fn show_daemon_status(settings: &Settings) {
    let pid_path = pid_file(settings);

    if pid_path.exists() {
        if let Ok(contents) = std::fs::read_to_string(&pid_path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if is_process_running(pid) {
                    eprintln!("xpose daemon: running (PID {pid})");
                } else {
                    eprintln!("xpose daemon: not running (stale PID file)");
                }
                return;
            }
        }
    }

    eprintln!("xpose daemon: not running");
}

fn show_config(settings: &Settings, config_path: Option<&PathBuf>) {
    match config_path {
        Some(path) => eprintln!("Config file: {} (explicit)", path.display()),
        None => eprintln!("Config file: ~/.xpose/config.toml (default, may not exist)"),
    }
    eprintln!("base_dir:            {}", settings.base_dir().display());
    eprintln!("resume_path:         {}", settings.resume_path().display());
    eprintln!("agent.edge_host:     {}", settings.agent.edge_host);
    eprintln!("agent.ttl_secs:      {}", settings.agent.ttl_secs);
    eprintln!(
        "agent.subdomain:     {}",
        if settings.agent.subdomain.is_empty() { "(let the edge assign one)" } else { &settings.agent.subdomain }
    );
    eprintln!("inspection.enabled:  {}", settings.inspection.enabled);
    eprintln!(
        "inspection.sink_url: {}",
        settings.inspection.sink_url.as_deref().unwrap_or("(none)")
    );
}

async fn show_resume(settings: &Settings) {
    let path = settings.resume_path();
    eprintln!("Resume record: {}", path.display());
    match load_resume_record(&path).await {
        Some(record) => {
            eprintln!("Valid as of: {}", record.created_at);
            for tunnel in &record.tunnels {
                eprintln!("  {} -> localhost:{} ({})", tunnel.public_url(), tunnel.port, tunnel.domain);
            }
        }
        None => eprintln!("No valid resume record (absent, malformed, or expired)."),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_ref()).unwrap_or_default();
    settings.ensure_directories()?;

    match cli.command {
        Commands::Http { port, opts } => {
            init_tracing();
            run_http(settings, port, opts).await?;
        }
        Commands::Start { port, opts } => {
            start_daemon(&settings, port, &opts)?;
        }
        Commands::Stop => {
            stop_daemon(&settings)?;
        }
        Commands::Status => {
            show_daemon_status(&settings);
        }
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => show_config(&settings, cli.config.as_ref()),
            ConfigAction::Resume => show_resume(&settings).await,
        },
    }

    Ok(())
}
