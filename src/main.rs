use clap::{Parser, Subcommand};
use cstp_vpn::auth;
use cstp_vpn::cstp::{NegotiationParams, TunDevice, WebrtcDtlsConnector};
use cstp_vpn::platform::{get_interface_manager, get_routing_manager};
use cstp_vpn::vpn::{HostNetwork, NetworkConfigurator, ResolvConf};
use cstp_vpn::{Config, Tunnel, TunnelError, VpnState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How long `disconnect` waits for a running client to clean up
const DISCONNECT_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "cstp-vpn")]
#[command(about = "OpenConnect-compatible CSTP/DTLS VPN client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/cstp-vpn/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output, including raw negotiation headers
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the VPN server and run the tunnel until interrupted
    Connect {
        /// Server host name, overriding the config file
        #[arg(short, long)]
        server: Option<String>,
        /// `webvpn` session cookie from an earlier authentication
        #[arg(long)]
        cookie: Option<String>,
    },
    /// Disconnect the running tunnel, or clean up after a crashed one
    Disconnect,
    /// Show current VPN status
    Status,
    /// Generate default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Connect { server, cookie } => {
            let mut config = match Config::load(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    error!("Cannot load {}: {}", config_path.display(), e);
                    println!("Run `cstp-vpn init` to create a config file");
                    std::process::exit(1);
                }
            };
            if let Some(host) = server {
                config.server.host = host;
            }
            if !connect(config, cookie).await? {
                std::process::exit(1);
            }
        }
        Commands::Disconnect => disconnect().await?,
        Commands::Status => status(),
        Commands::Init { force } => {
            if config_path.exists() && !force {
                println!("Config already exists: {}", config_path.display());
                return Ok(());
            }
            Config::default().save(&config_path)?;
            println!("Created default config: {}", config_path.display());
        }
    }

    Ok(())
}

fn require_root() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    if !nix::unistd::geteuid().is_root() {
        return Err("this command must be run as root".into());
    }
    Ok(())
}

/// Run one session. Returns false when it ended for any reason other than a
/// requested disconnect.
async fn connect(config: Config, cookie: Option<String>) -> Result<bool, Box<dyn std::error::Error>> {
    require_root()?;

    if let Some(state) = VpnState::load()? {
        if state.owner_alive() {
            return Err(format!("already connected (pid {})", state.pid).into());
        }
        warn!("Found state from a previous session, cleaning up first");
        revert_stale(&state)?;
    }

    let interfaces = get_interface_manager()?;
    let local = interfaces.local_interface()?;
    info!(
        "Local interface {} ({}) via {}",
        local.name, local.ip4, local.gateway
    );

    let token = auth::resolve_cookie(cookie.as_deref(), config.cookie.as_deref())?;
    info!("Connecting to {}:{}...", config.server.host, config.server.port);
    let transport = auth::connect(&config.server.host, config.server.port, token).await?;

    let params = NegotiationParams {
        host: transport.host,
        server_address: transport.server_address,
        tls_cipher_suite: transport.tls_cipher_suite,
        session_token: transport.session_token,
        local_ip4: local.ip4,
        agent: config.agent_identity(),
        default_keepalive: config.default_keepalive(),
        default_dpd: config.default_dpd(),
    };

    let tun_name = config.tunnel.tun_name.clone();
    let network: Arc<dyn NetworkConfigurator> = Arc::new(HostNetwork::new(
        Arc::from(interfaces),
        Arc::from(get_routing_manager()?),
        local.clone(),
        &tun_name,
        ResolvConf::new(),
    ));

    // Ctrl+C abandons negotiation, then disconnects the session once it is up
    let options = config.tunnel_options();
    let interrupt = options.interrupt.clone();
    ctrlc::set_handler(move || interrupt.cancel())?;

    let tunnel = match Tunnel::establish(
        transport.stream,
        &params,
        |mtu| TunDevice::create(&tun_name, mtu),
        network,
        WebrtcDtlsConnector::new(),
        &options,
    )
    .await
    {
        Ok(tunnel) => tunnel,
        Err(TunnelError::Interrupted) => {
            println!("Interrupted.");
            return Ok(true);
        }
        Err(e) => return Err(e.into()),
    };

    let state = VpnState::new(tunnel.network_request().clone(), local);
    if let Err(e) = state.save() {
        warn!("Failed to save state: {} (crash recovery unavailable)", e);
    }

    let handle = tunnel.handle();
    let interrupt = options.interrupt.clone();
    tokio::spawn(async move {
        interrupt.cancelled().await;
        if handle.disconnect() {
            info!("Disconnecting...");
        }
    });

    println!("Connected. Press Ctrl+C to disconnect.");
    let reason = tunnel.run().await;

    if let Err(e) = VpnState::delete() {
        warn!("Failed to delete state file: {}", e);
    }

    if reason.is_failure() {
        error!("Session ended: {}", reason);
        Ok(false)
    } else {
        println!("Disconnected.");
        Ok(true)
    }
}

async fn disconnect() -> Result<(), Box<dyn std::error::Error>> {
    let Some(state) = VpnState::load()? else {
        println!("VPN Status: Not connected");
        return Ok(());
    };

    if state.owner_alive() {
        info!("Asking pid {} to disconnect", state.pid);
        signal_owner(&state)?;

        let deadline = tokio::time::Instant::now() + DISCONNECT_WAIT;
        while VpnState::is_active() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if VpnState::is_active() {
            return Err(format!("pid {} did not disconnect within {:?}", state.pid, DISCONNECT_WAIT).into());
        }
        println!("Disconnected.");
        return Ok(());
    }

    require_root()?;
    warn!("pid {} is gone, reverting its network changes", state.pid);
    revert_stale(&state)?;
    println!("Cleaned up stale session on {}", state.request.tun_name);
    Ok(())
}

#[cfg(unix)]
fn signal_owner(state: &VpnState) -> Result<(), Box<dyn std::error::Error>> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = i32::try_from(state.pid)?;
    kill(Pid::from_raw(pid), Signal::SIGINT)?;
    Ok(())
}

#[cfg(not(unix))]
fn signal_owner(_state: &VpnState) -> Result<(), Box<dyn std::error::Error>> {
    Err("signalling a running client is not supported on this platform".into())
}

/// Replay teardown from a state file left by a client that died.
fn revert_stale(state: &VpnState) -> Result<(), Box<dyn std::error::Error>> {
    let network = HostNetwork::new(
        Arc::from(get_interface_manager()?),
        Arc::from(get_routing_manager()?),
        state.local.clone(),
        &state.request.tun_name,
        ResolvConf::new(),
    );
    state.request.revert(&network);
    VpnState::delete()?;
    debug!("Stale state removed");
    Ok(())
}

fn status() {
    match VpnState::load() {
        Ok(Some(state)) => {
            if state.owner_alive() {
                println!("VPN Status: Connected (pid {})", state.pid);
            } else {
                println!("VPN Status: Stale (pid {} not running, run `cstp-vpn disconnect`)", state.pid);
            }
            let request = &state.request;
            println!("  Tunnel: {}", request.tun_name);
            println!("  Address: {}/{}", request.address, request.netmask);
            println!("  Server: {}", request.server);
            println!("  Local: {} via {}", state.local.name, state.local.gateway);
            if request.split_include.is_empty() {
                println!("  Routes: all traffic");
            } else {
                println!("  Routes: {}", request.split_include.len());
                for net in &request.split_include {
                    println!("    {}", net);
                }
            }
            if !request.split_exclude.is_empty() {
                println!("  Excluded: {}", request.split_exclude.len());
            }
            if !request.dns.is_empty() {
                println!("  DNS: {:?}", request.dns);
            }
        }
        Ok(None) => println!("VPN Status: Not connected"),
        Err(e) => println!("Error reading state: {}", e),
    }
}
