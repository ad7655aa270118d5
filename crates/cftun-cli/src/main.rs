//! cftun - manage cloudflared tunnels and the cloudflared system service

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ipnetwork::IpNetwork;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cftun_cli::settings::{Settings, SettingsManager};
use cftun_service::reconciler::check_credentials;
use cftun_service::{
    location, normalize_tunnel_id, run_blocking, CloudflaredCli, ConfigReconciler,
    ReconcilerConfig, RecordState, ServiceConfig, ServiceController, ServiceLocation,
    SystemService, TunnelRegistry, VerifyPolicy,
};

/// cftun - Cloudflare tunnel and service manager
#[derive(Parser, Debug)]
#[command(name = "cftun")]
#[command(about = "Manage cloudflared tunnels and the cloudflared system service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Path of the cloudflared binary
    #[arg(long, global = true, env = "CFTUN_CLOUDFLARED")]
    cloudflared: Option<PathBuf>,

    /// Directory holding the service config (defaults to the platform location)
    #[arg(long, global = true, env = "CFTUN_SERVICE_DIR")]
    service_dir: Option<PathBuf>,

    /// Make `config verify` report drift without rewriting the service config
    #[arg(long, global = true)]
    report_only: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Manage tunnels on the Cloudflare account
    Tunnel {
        #[command(subcommand)]
        command: TunnelCommands,
    },
    /// Manage the cloudflared system service
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
    /// Inspect and reconcile the service config record
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Manage saved cftun settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum TunnelCommands {
    /// List tunnels
    List,
    /// Create a tunnel and write its config
    Create {
        /// Tunnel name
        name: String,
        /// Application URL to proxy (e.g. http://localhost:8000)
        #[arg(long)]
        url: Option<String>,
        /// Enable warp-routing for private network access (no URL)
        #[arg(long, conflicts_with = "url")]
        warp_routing: bool,
        /// Hostname to route to the tunnel via DNS (e.g. app.example.com)
        #[arg(long)]
        hostname: Option<String>,
        /// Private network range to route to the tunnel (e.g. 10.0.0.0/24)
        #[arg(long)]
        ip_cidr: Option<IpNetwork>,
        /// Also point the system service at the new tunnel
        #[arg(long)]
        service: bool,
        /// Restart the service afterwards
        #[arg(long, requires = "service")]
        restart: bool,
        /// Don't write ~/.cloudflared/config.yml
        #[arg(long)]
        no_user_config: bool,
    },
    /// Delete a tunnel
    Delete {
        /// Tunnel id or name
        tunnel: String,
    },
    /// Show tunnel details
    Info {
        /// Tunnel id or name
        tunnel: String,
    },
    /// Route a DNS hostname to a tunnel
    RouteDns {
        /// Tunnel id or name
        tunnel: String,
        /// Hostname (e.g. app.example.com)
        hostname: String,
    },
    /// Route a private network range to a tunnel
    RouteIp {
        /// Network in CIDR notation
        cidr: IpNetwork,
        /// Tunnel id or name
        tunnel: String,
    },
    /// Authenticate cloudflared with a Cloudflare account
    Login,
    /// Run a tunnel in the foreground
    Run {
        /// Tunnel id or name
        tunnel: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum ServiceCommands {
    /// Install the cloudflared system service
    Install {
        /// Point the service at the tunnel in ~/.cloudflared/config.yml first
        #[arg(long)]
        from_user_config: bool,
    },
    /// Uninstall the cloudflared system service
    Uninstall,
    /// Start service
    Start,
    /// Stop service
    Stop,
    /// Restart service
    Restart,
    /// Check service status
    Status,
    /// View service logs
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    /// Remove the service directory (config and copied credentials)
    Clean {
        /// Confirm removal
        #[arg(long)]
        yes: bool,
    },
}

/// Tunnel identity for the service config
///
/// Values not given fall back to ~/.cloudflared/config.yml when it describes
/// the same tunnel.
#[derive(Args, Debug, Clone, Default)]
struct TunnelArgs {
    /// Tunnel id
    #[arg(long)]
    tunnel: Option<String>,
    /// Credentials file of the tunnel
    #[arg(long)]
    credentials: Option<PathBuf>,
    /// Application URL to proxy
    #[arg(long)]
    url: Option<String>,
    /// Enable warp-routing
    #[arg(long, conflicts_with = "url")]
    warp_routing: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// Print the service config
    Show,
    /// Write a tunnel identity into the service config
    Reconcile(TunnelArgs),
    /// Compare the service config with a tunnel identity
    Verify(TunnelArgs),
    /// Rewrite the service config with a tunnel identity
    Repair(TunnelArgs),
    /// Report the service config, its credentials and the tunnel behind it
    Diagnose,
}

#[derive(Subcommand, Debug, Clone)]
enum SettingsCommands {
    /// Print saved settings
    Show,
    /// Save the cloudflared binary path
    SetCloudflared { path: PathBuf },
    /// Save a service directory override
    SetServiceDir { dir: PathBuf },
    /// Save the verify policy (auto-fix or report-only)
    SetVerifyPolicy {
        #[arg(value_parser = parse_verify_policy)]
        policy: VerifyPolicy,
    },
    /// Remove all saved settings
    Clear,
}

fn parse_verify_policy(value: &str) -> Result<VerifyPolicy, String> {
    match value {
        "auto-fix" => Ok(VerifyPolicy::AutoFix),
        "report-only" => Ok(VerifyPolicy::ReportOnly),
        other => Err(format!(
            "unknown verify policy '{}': expected auto-fix or report-only",
            other
        )),
    }
}

/// Collaborators resolved from flags and saved settings
struct App {
    cloudflared: CloudflaredCli,
    reconciler: ConfigReconciler<CloudflaredCli>,
    service: SystemService,
}

impl App {
    fn new(cli: &Cli, settings: &Settings) -> Self {
        let binary = cli
            .cloudflared
            .clone()
            .or_else(|| settings.cloudflared.clone())
            .unwrap_or_else(|| PathBuf::from("cloudflared"));

        let location = cli
            .service_dir
            .clone()
            .or_else(|| settings.service_dir.clone())
            .map(ServiceLocation::Explicit)
            .unwrap_or_default();

        let verify_policy = if cli.report_only {
            VerifyPolicy::ReportOnly
        } else {
            settings.verify_policy
        };

        let cloudflared = CloudflaredCli::with_binary(&binary);
        Self {
            reconciler: ConfigReconciler::new(
                ReconcilerConfig {
                    location,
                    verify_policy,
                },
                cloudflared.clone(),
            ),
            service: SystemService::with_cloudflared(&binary),
            cloudflared,
        }
    }

    /// Reconciler for the per-user ~/.cloudflared/config.yml
    fn user_config(&self) -> Result<ConfigReconciler<CloudflaredCli>> {
        let dir = location::user_dir().context("Failed to get home directory")?;
        Ok(ConfigReconciler::new(
            ReconcilerConfig::in_dir(dir),
            self.cloudflared.clone(),
        ))
    }

    /// Tunnel identity from ~/.cloudflared/config.yml
    fn user_tunnel(&self) -> Result<Option<ServiceConfig>> {
        match self.user_config()?.read()? {
            RecordState::Present(record) => Ok(record.service_config()),
            RecordState::Absent => Ok(None),
        }
    }

    /// Merge explicit flags over the user config's tunnel identity
    ///
    /// The user config only fills gaps when it describes the same tunnel;
    /// for any other tunnel the credentials default to
    /// `~/.cloudflared/<tunnel>.json` and nothing else is inherited.
    fn resolve(&self, args: TunnelArgs) -> Result<ServiceConfig> {
        let fallback = match (&args.tunnel, &args.credentials) {
            (Some(_), Some(_)) => None,
            _ => self.user_tunnel()?,
        };
        let fallback = match (&args.tunnel, fallback) {
            (Some(tunnel), Some(user))
                if normalize_tunnel_id(tunnel) != normalize_tunnel_id(&user.tunnel_id) =>
            {
                None
            }
            (_, fallback) => fallback,
        };

        let tunnel_id = args
            .tunnel
            .or_else(|| fallback.as_ref().map(|c| c.tunnel_id.clone()))
            .context("No tunnel given and none configured in ~/.cloudflared/config.yml (use --tunnel)")?;
        let credentials = args
            .credentials
            .or_else(|| fallback.as_ref().map(|c| c.credentials_path.clone()))
            .or_else(|| location::default_credentials_path(&tunnel_id))
            .context("No credentials file given and the home directory is unknown (use --credentials)")?;

        let mut desired = ServiceConfig::new(tunnel_id, credentials);
        desired.target_url = args
            .url
            .or_else(|| fallback.as_ref().and_then(|c| c.target_url.clone()));
        if args.warp_routing {
            desired.warp_routing_enabled = Some(true);
        } else if desired.target_url.is_none() {
            desired.warp_routing_enabled = fallback.and_then(|c| c.warp_routing_enabled);
        }
        Ok(desired)
    }

    fn require_cloudflared(&self) -> Result<()> {
        if !self.cloudflared.is_installed() {
            bail!(
                "cloudflared is not installed (looked for {:?}). Please install it first.",
                self.cloudflared.binary()
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level)?;

    let settings_manager = SettingsManager::new()?;
    if let Commands::Settings { command } = &cli.command {
        return handle_settings_command(&settings_manager, command.clone());
    }

    let settings = settings_manager.load()?;
    let app = App::new(&cli, &settings);
    let command = cli.command;

    // Every command shells out or touches the disk; keep that off the runtime threads
    run_blocking(move || dispatch(&app, command)).await?
}

fn dispatch(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Tunnel { command } => handle_tunnel_command(app, command),
        Commands::Service { command } => handle_service_command(app, command),
        Commands::Config { command } => handle_config_command(app, command),
        Commands::Settings { .. } => unreachable!("settings are handled before dispatch"),
    }
}

fn handle_tunnel_command(app: &App, command: TunnelCommands) -> Result<()> {
    app.require_cloudflared()?;
    let cloudflared = &app.cloudflared;

    match command {
        TunnelCommands::List => {
            let tunnels = cloudflared.list_tunnels()?;
            if tunnels.is_empty() {
                println!("No tunnels found");
                return Ok(());
            }
            println!("{:<38} {:<24} CREATED", "ID", "NAME");
            for tunnel in tunnels {
                let created = tunnel
                    .created_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<38} {:<24} {}", tunnel.id, tunnel.name, created);
            }
            Ok(())
        }
        TunnelCommands::Create {
            name,
            url,
            warp_routing,
            hostname,
            ip_cidr,
            service,
            restart,
            no_user_config,
        } => {
            let tunnel = cloudflared.create_tunnel(&name)?;
            println!("✅ Tunnel created: {} ({})", tunnel.name, tunnel.id);

            let credentials = tunnel
                .credentials_path()
                .context("Failed to determine the tunnel credentials path")?;
            let mut desired = ServiceConfig::new(&tunnel.id, credentials);
            if let Some(url) = url {
                desired = desired.with_target_url(url);
            } else if warp_routing {
                desired = desired.with_warp_routing(true);
            }

            if !no_user_config {
                let path = app.user_config()?.reconcile(&desired)?;
                println!("   Config file written: {}", path.display());
            }

            if service {
                let path = app.reconciler.reconcile(&desired)?;
                println!("   Service config updated: {}", path.display());
                if restart {
                    app.service.restart()?;
                    println!("✅ Service restarted with the new tunnel");
                }
            }

            // Routing failures don't undo the tunnel; report and continue
            if let Some(hostname) = hostname {
                match cloudflared.route_dns(&tunnel.id, &hostname) {
                    Ok(()) => println!("   DNS route added: {} -> {}", hostname, tunnel.id),
                    Err(e) => warn!("Failed to add DNS route for {}: {}", hostname, e),
                }
            }
            if let Some(cidr) = ip_cidr {
                match cloudflared.route_ip(&cidr, &tunnel.id) {
                    Ok(()) => println!("   IP route added: {} -> {}", cidr, tunnel.id),
                    Err(e) => warn!("Failed to add IP route for {}: {}", cidr, e),
                }
            }

            println!();
            println!("To start routing, run: cftun tunnel run {}", tunnel.id);
            Ok(())
        }
        TunnelCommands::Delete { tunnel } => {
            cloudflared.delete_tunnel(&tunnel)?;
            println!("✅ Tunnel {} deleted", tunnel);
            Ok(())
        }
        TunnelCommands::Info { tunnel } => {
            let info = cloudflared.tunnel_info(&tunnel)?;
            println!("{}", info);
            Ok(())
        }
        TunnelCommands::RouteDns { tunnel, hostname } => {
            cloudflared.route_dns(&tunnel, &hostname)?;
            println!("✅ DNS route added: {} -> {}", hostname, tunnel);
            Ok(())
        }
        TunnelCommands::RouteIp { cidr, tunnel } => {
            cloudflared.route_ip(&cidr, &tunnel)?;
            println!("✅ IP route added: {} -> {}", cidr, tunnel);
            Ok(())
        }
        TunnelCommands::Login => {
            cloudflared.login()?;
            println!("✅ cloudflared login completed");
            Ok(())
        }
        TunnelCommands::Run { tunnel } => {
            let mut child = cloudflared.run_tunnel(&tunnel)?;
            let status = child.wait().context("Failed to wait for cloudflared")?;
            if !status.success() {
                bail!("cloudflared exited with {}", status);
            }
            Ok(())
        }
    }
}

fn handle_service_command(app: &App, command: ServiceCommands) -> Result<()> {
    let service = &app.service;

    if !service.is_supported() {
        bail!("Service management is not supported on this platform (supported: Linux systemd, macOS launchd, Windows)");
    }

    match command {
        ServiceCommands::Install { from_user_config } => {
            if from_user_config {
                let desired = app
                    .user_tunnel()?
                    .context("No tunnel configured in ~/.cloudflared/config.yml")?;
                check_credentials(&desired.credentials_path)?;
                let path = app.reconciler.reconcile(&desired)?;
                println!("   Service config updated: {}", path.display());
            }
            service.install()?;
            println!("✅ Service installed");
            println!("   Start with: cftun service start");
            Ok(())
        }
        ServiceCommands::Uninstall => {
            service.uninstall()?;
            println!("✅ Service uninstalled");
            Ok(())
        }
        ServiceCommands::Start => {
            service.start()?;
            println!("✅ Service started");
            Ok(())
        }
        ServiceCommands::Stop => {
            service.stop()?;
            println!("✅ Service stopped");
            Ok(())
        }
        ServiceCommands::Restart => {
            service.restart()?;
            println!("✅ Service restarted");
            Ok(())
        }
        ServiceCommands::Status => {
            let status = service.status()?;
            println!("Service status: {}", status);
            Ok(())
        }
        ServiceCommands::Logs { lines } => {
            let logs = service.logs(lines)?;
            print!("{}", logs);
            Ok(())
        }
        ServiceCommands::Clean { yes } => {
            let dir = app.reconciler.service_dir()?;
            if !yes {
                bail!(
                    "Refusing to remove {} without --yes",
                    dir.display()
                );
            }
            if cftun_service::clean_service_files(&dir)? {
                println!("✅ Removed {}", dir.display());
            } else {
                println!("Nothing to remove at {}", dir.display());
            }
            Ok(())
        }
    }
}

fn handle_config_command(app: &App, command: ConfigCommands) -> Result<()> {
    let reconciler = &app.reconciler;

    match command {
        ConfigCommands::Show => {
            let path = reconciler.locate()?;
            match reconciler.read()? {
                RecordState::Present(record) => {
                    println!("# {}", path.display());
                    print!("{}", record.to_yaml()?);
                }
                RecordState::Absent => println!("No service config at {}", path.display()),
            }
            Ok(())
        }
        ConfigCommands::Reconcile(args) => {
            let desired = app.resolve(args)?;
            let path = reconciler.reconcile(&desired)?;
            println!("✅ Service config written: {}", path.display());
            Ok(())
        }
        ConfigCommands::Verify(args) => {
            let expected = app.resolve(args)?;
            let verification = reconciler.verify(&expected)?;

            for problem in &verification.problems {
                println!("❌ {}", problem);
            }
            if verification.ok {
                println!("✅ Service config matches tunnel {}", expected.tunnel_id);
            } else if verification.auto_fixed {
                info!("Service config rewritten after verification");
                println!("🔧 Service config rewritten for tunnel {}", expected.tunnel_id);
            }
            verification.ensure_consistent()?;
            Ok(())
        }
        ConfigCommands::Repair(args) => {
            let expected = app.resolve(args)?;
            let path = reconciler.repair(&expected)?;
            println!("✅ Service config repaired: {}", path.display());
            Ok(())
        }
        ConfigCommands::Diagnose => {
            let diagnosis = reconciler.diagnose()?;
            println!("{}", diagnosis);
            Ok(())
        }
    }
}

fn handle_settings_command(manager: &SettingsManager, command: SettingsCommands) -> Result<()> {
    match command {
        SettingsCommands::Show => {
            let settings = manager.load()?;
            println!("# {}", manager.path().display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        SettingsCommands::SetCloudflared { path } => {
            manager.update(|s| s.cloudflared = Some(path))?;
            println!("✅ cloudflared path saved");
        }
        SettingsCommands::SetServiceDir { dir } => {
            manager.update(|s| s.service_dir = Some(dir))?;
            println!("✅ Service directory saved");
        }
        SettingsCommands::SetVerifyPolicy { policy } => {
            manager.update(|s| s.verify_policy = policy)?;
            println!("✅ Verify policy saved");
        }
        SettingsCommands::Clear => {
            manager.clear()?;
            println!("✅ Settings cleared");
        }
    }
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
