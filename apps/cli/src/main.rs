mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dmk_core::command::{CloseApp, GetAppAndVersion};
use dmk_core::protocol::{ApduBuilder, ApduParser, constants::*};
use dmk_core::{
    DeviceDescriptor, DeviceId, DeviceManagementKit, DeviceStateStream, DmkError, MockTransport, SessionId,
    Transport, is_success,
};
use tracing::{error, info, warn};

use crate::config::CliConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ledger device management tool (simulated devices)", long_about = None)]
struct Args {
    /// Path to a TOML file with [kit] settings and [[devices]]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List devices that have no session
    Scan {
        /// Observation window in milliseconds
        #[arg(long)]
        window_ms: Option<u64>,
    },
    /// Connect, query the device, watch its state, close the app, disconnect
    Run {
        /// Device id (first available device if omitted)
        #[arg(long)]
        device: Option<String>,

        /// Lock and unlock the device while its state is watched
        #[arg(long)]
        simulate_lock: bool,
    },
    /// Write the default configuration to a file
    InitConfig { path: PathBuf },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };

    if let Cmd::InitConfig { path } = &args.command {
        config.save(path)?;
        info!(path = %path.display(), "Configuration written");
        return Ok(());
    }

    let transports = config.transports();
    let mut builder = DeviceManagementKit::builder().with_config(config.kit.clone());
    for transport in &transports {
        builder = builder.add_transport(transport.clone());
    }
    let dmk = builder.build();
    info!(devices = config.devices.len(), "Starting DMK tool (mock transports)");

    let result = match args.command {
        Cmd::Scan { window_ms } => scan(&dmk, window_ms).await,
        Cmd::Run { device, simulate_lock } => {
            run_flow(&dmk, &transports, device.as_deref(), simulate_lock).await
        }
        Cmd::InitConfig { .. } => Ok(()),
    };
    dmk.close().await?;
    result
}

async fn scan(dmk: &DeviceManagementKit, window_ms: Option<u64>) -> Result<()> {
    let window = window_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| dmk.config().observation_window());
    let snapshot = dmk
        .discovery()
        .listen_for(window)
        .last()
        .await
        .unwrap_or_default();
    let available = dmk.filter_unconnected(&snapshot);

    info!(count = available.len(), "Available devices");
    for device in available.devices() {
        info!(name = %device.name, transport = %device.transport, id = %device.id, model = %device.model_id, "Device");
    }
    Ok(())
}

async fn run_flow(
    dmk: &DeviceManagementKit,
    transports: &[MockTransport],
    wanted: Option<&str>,
    simulate_lock: bool,
) -> Result<()> {
    let available = dmk.available_devices().await;
    let device: DeviceDescriptor = match wanted {
        Some(id) => available
            .get(&DeviceId::new(id))
            .cloned()
            .with_context(|| format!("Device {} is not available", id))?,
        None => match available.devices().first() {
            Some(device) => device.clone(),
            None => bail!("No available devices found"),
        },
    };

    info!(device = %device.id, "Connecting");
    let session = dmk.connect(&device).await?;
    let connected = dmk.get_connected_device(session.id())?;
    info!(session = %session.id(), name = %connected.name, model = %connected.model_id, "Connected");

    let states = dmk.get_device_session_state(session.id())?;
    let watcher = tokio::spawn(watch_state(states));

    let app = dmk.send_command(session.id(), &GetAppAndVersion).await?;
    info!(app = %app.name, version = %app.version, "Current application");

    send_get_version(dmk, session.id()).await;

    if simulate_lock {
        let transport = transports
            .iter()
            .find(|t| t.kind() == device.transport)
            .context("No transport for the selected device")?;
        let pause = dmk.config().state_poll_interval() * 3;
        transport.update_device(&device.id, |sim| sim.locked = true);
        tokio::time::sleep(pause).await;
        transport.update_device(&device.id, |sim| sim.locked = false);
        tokio::time::sleep(pause).await;
    }

    match dmk.send_command(session.id(), &CloseApp).await {
        Ok(()) => info!("Application closed"),
        Err(e) => warn!("Close app failed: {}", e),
    }

    dmk.disconnect(session.id()).await?;
    info!("Device disconnected successfully");
    watcher.await?;
    Ok(())
}

/// Raw dashboard GET_VERSION; refused while an application runs.
async fn send_get_version(dmk: &DeviceManagementKit, session_id: SessionId) {
    let apdu = ApduBuilder::new(CLA_DASHBOARD, INS_GET_OS_VERSION, 0x00, 0x00).build();
    match dmk.exchange(session_id, &apdu).await {
        Ok(response) if is_success(&response) => {
            let mut parser = ApduParser::new(&response);
            match parser.extract_u32() {
                Ok(target_id) => info!(target_id = %format!("{:08X}", target_id), "Dashboard version"),
                Err(e) => warn!("Malformed version reply: {}", e),
            }
        }
        Ok(response) => warn!("{}", DmkError::UnexpectedStatus(response.status_word())),
        Err(e) => warn!("GET_VERSION failed: {}", e),
    }
}

async fn watch_state(mut states: DeviceStateStream) {
    while let Some(change) = states.next().await {
        let state = &change.state;
        info!(status = %state.device_status, model = %state.device_model_id, "Device state");
        if change.became_locked() {
            warn!("Device is locked - please enter your PIN");
        }
        if let Some(battery) = &state.battery_status {
            info!("Battery level: {}%", battery.level);
        }
        if let Some(app) = &state.current_app {
            info!(app = %app.name, version = %app.version, "Current app");
        }
    }
    info!("State monitoring ended");
}
