// WireGuard session daemon and control client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use wg_session::{
    api::HttpProvisioningClient,
    backend::{BackendHandle, WgQuickBackend},
    config::load_config,
    connectivity::{self, ConnectivityMonitor, NmConnectivitySource},
    control::{self, ControlReply, ControlRequest, ControlServer},
    controller::TunnelController,
    liveness::KernelTransportProbe,
    provisioning::ProvisioningSequencer,
    service::ServiceLifecycle,
    state::ConnectionStateMachine,
    store::{FileStore, VpnStore},
    tunnel_config::TunnelConfig,
    types::Config,
};

#[derive(Parser)]
#[command(name = "wg-session")]
#[command(about = "Provisioned WireGuard session daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-session/config.toml")]
    config: PathBuf,

    /// Control socket of a running daemon (client commands only)
    #[arg(short, long, default_value = "/run/wg-session/control.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the session daemon
    Daemon,
    /// Connect, fetching the configuration unless a wg-quick file is given
    Connect {
        #[arg(long)]
        config_file: Option<PathBuf>,
    },
    /// Bring the tunnel down
    Disconnect,
    /// Reconnect from the stored configuration
    Resume,
    /// Probe and print the tunnel status
    Status,
    /// Drop the stored configuration and keys and register a new key
    Forget,
}

fn main() -> Result<()> {
    // 2 threads: one for the control socket and status poll, one for
    // D-Bus and process spawns
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-session")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Daemon => {
            let config = load_config(&args.config)
                .with_context(|| format!("Failed to load config from {:?}", args.config))?;

            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or(&config.general.log_level),
            )
            .init();

            run_daemon(config).await
        }
        command => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
                .init();

            let request = client_request(command)?;
            run_client(&args.socket, &request).await
        }
    }
}

fn client_request(command: Command) -> Result<ControlRequest> {
    Ok(match command {
        Command::Connect { config_file: None } => ControlRequest::Connect { descriptor: None },
        Command::Connect {
            config_file: Some(path),
        } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            let parsed = TunnelConfig::parse(&text)
                .with_context(|| format!("Failed to parse {:?}", path))?;
            ControlRequest::Connect {
                descriptor: Some(parsed.to_descriptor()),
            }
        }
        Command::Disconnect => ControlRequest::Disconnect,
        Command::Resume => ControlRequest::Resume,
        Command::Status => ControlRequest::Status,
        Command::Forget => ControlRequest::Forget,
        Command::Daemon => anyhow::bail!("daemon is not a client command"),
    })
}

async fn run_client(socket: &Path, request: &ControlRequest) -> Result<()> {
    match control::send_request(socket, request).await? {
        ControlReply::Ok { message, status } => {
            println!("{}", message);
            log::debug!("Status after command: {} (active: {})", status.state, status.active);
            Ok(())
        }
        ControlReply::Incomplete { missing } => {
            anyhow::bail!("Configuration incomplete, missing: {}", missing.join(", "))
        }
        ControlReply::Error { message } => anyhow::bail!("{}", message),
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    let general = &config.general;
    log::info!("Starting wg-session daemon");
    log::info!("Tunnel: {}", general.tunnel_name);
    log::info!("State directory: {:?}", general.state_dir);
    log::info!("Provisioning backend: {}", config.api.base_url);

    let store = Arc::new(VpnStore::new(
        FileStore::open(&general.state_dir).context("Failed to open state store")?,
    ));
    let machine = Arc::new(ConnectionStateMachine::new(store.clone()));
    if let Some(state) = machine.last_known() {
        log::info!("Last recorded connection state: {}", state);
    }

    // Backend initialization runs in the background; commands wait for it
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let backend = BackendHandle::spawn(WgQuickBackend::init(general.runtime_dir.clone(), events_tx));

    let controller = Arc::new(
        TunnelController::new(
            general.tunnel_name.clone(),
            backend,
            Arc::new(KernelTransportProbe),
            machine,
        )
        .context("Failed to create tunnel controller")?,
    );
    let event_loop = controller.clone().spawn_event_loop(events_rx);

    let api = Arc::new(
        HttpProvisioningClient::new(&config.api).context("Failed to create provisioning client")?,
    );
    let provisioning = Arc::new(ProvisioningSequencer::new(
        api,
        store.clone(),
        general.machine_id_path.clone(),
    ));

    // Register the device key as early as possible
    {
        let provisioning = provisioning.clone();
        tokio::spawn(async move {
            let report = provisioning.bootstrap().await;
            match report.error {
                None => log::info!("Provisioning bootstrap complete ({:?})", report.flags),
                Some(e) => log::warn!("Provisioning bootstrap incomplete: {}", e),
            }
        });
    }

    let service = Arc::new(ServiceLifecycle::new(
        controller.clone(),
        provisioning,
        store.clone(),
        general,
    ));

    let subscription = match NmConnectivitySource::new().await {
        Ok(source) => Some(connectivity::subscribe(
            source,
            ConnectivityMonitor::new(controller.clone(), store),
        )),
        Err(e) => {
            log::warn!("Connectivity monitoring unavailable: {:#}", e);
            None
        }
    };

    // The socket is up before resume so a hung wg-quick can still be inspected
    let server = ControlServer::bind(&general.runtime_dir)?;
    let mut server_task = tokio::spawn(server.serve(service.clone()));

    let resume = service.clone().spawn_resume();
    let poll = service.clone().spawn_status_poll();

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    log::info!("Daemon running");

    let result = tokio::select! {
        _ = sigterm.recv() => {
            log::info!("Received SIGTERM");
            Ok(())
        }
        _ = sigint.recv() => {
            log::info!("Received SIGINT");
            Ok(())
        }
        served = &mut server_task => {
            match served {
                Ok(Err(e)) => Err(e.context("Control server stopped")),
                Ok(Ok(())) => Ok(()),
                Err(e) => Err(anyhow::anyhow!("Control server task panicked: {}", e)),
            }
        }
    };

    server_task.abort();
    resume.abort();
    service.shutdown(poll, subscription).await;
    event_loop.abort();
    control::cleanup(&general.runtime_dir);

    result
}
