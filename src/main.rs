//! wg-provisioner: subscription-driven `WireGuard` peer provisioning
//!
//! This is the main entry point for the provisioning daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./wg-provisioner
//!
//! # Run with custom configuration
//! sudo ./wg-provisioner -c /path/to/config.json
//!
//! # Run with environment overrides
//! WG_PROVISIONER_LOG_LEVEL=debug sudo ./wg-provisioner
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use wg_provisioner::config::{load_config_with_env, Config};
use wg_provisioner::ipc::{IpcHandler, IpcServer};
use wg_provisioner::lifecycle::{spawn_worker, ExpirySweeper};

/// Grace period for background tasks after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/wg-provisioner/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("wg-provisioner v{}", wg_provisioner::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"wg-provisioner v{}

Provisions WireGuard peers for paid subscriptions and revokes them on expiry.

USAGE:
    wg-provisioner [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/wg-provisioner/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    WG_PROVISIONER_LOG_LEVEL            Override log level (trace, debug, info, warn, error)
    WG_PROVISIONER_DATABASE_PATH        Override subscription database path
    WG_PROVISIONER_IPC_SOCKET           Override IPC socket path
    WG_PROVISIONER_SERVER_ENDPOINT      Override server endpoint written into client configs
    WG_PROVISIONER_SERVER_PUBLIC_KEY    Override server public key
    WG_PROVISIONER_CLIENT_NETWORK_CIDR  Override client address network

REQUIREMENTS:
    - wireguard-tools (`wg`) on PATH for the cli backend
    - CAP_NET_ADMIN (or root) to modify the interface
    - write access to the peer-config file and the storage directories
"#,
        wg_provisioner::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    // Parse arguments
    let args = Args::parse();

    // Handle generate-config
    if args.generate_config {
        wg_provisioner::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    // Load configuration
    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    // Handle check-config
    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config);

    info!("wg-provisioner v{}", wg_provisioner::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let coordinator = wg_provisioner::build_coordinator(&config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize lifecycle: {}", e))?;

    let (shutdown_tx, _) = broadcast::channel(1);

    // Lifecycle worker: the single owner of allocation and provisioning
    let (lifecycle, worker_handle) =
        spawn_worker(coordinator, &config.lifecycle, shutdown_tx.subscribe());

    // Expiry sweeper
    let sweeper_handle = if config.sweeper.enabled {
        Some(ExpirySweeper::new(lifecycle.clone(), &config.sweeper).spawn(shutdown_tx.subscribe()))
    } else {
        warn!("Expiry sweeper disabled; lapsed subscriptions will not be revoked");
        None
    };

    // IPC server
    let ipc_handler = Arc::new(IpcHandler::new(lifecycle.clone(), shutdown_tx.clone()));
    let ipc_server = IpcServer::new(config.ipc.clone(), ipc_handler, shutdown_tx.clone());
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!("IPC server error: {}", e);
        }
    });

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    // Wait for a signal or an IPC shutdown command
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        _ = shutdown_rx.recv() => {
            info!("Shutdown requested over IPC");
        }
    }

    // Graceful shutdown
    info!("Shutting down...");
    let _ = shutdown_tx.send(());

    if let Some(handle) = sweeper_handle {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, ipc_handle).await;

    // Let the worker finish the command it is executing
    drop(lifecycle);
    if tokio::time::timeout(SHUTDOWN_GRACE, worker_handle).await.is_err() {
        warn!("Lifecycle worker did not stop within {:?}", SHUTDOWN_GRACE);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix platforms, just wait forever
    std::future::pending::<()>().await
}
