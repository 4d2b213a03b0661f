use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lockmate_bridge::domain::settings::SettingsService;
use lockmate_bridge::infrastructure::bluetooth::connection::ConnectionConfig;
use lockmate_bridge::infrastructure::bluetooth::simulated::SimulatedTransport;
use lockmate_bridge::infrastructure::logging;
use lockmate_bridge::{BleDevice, BluetoothService, KnownNetworks, ProvisionPolicy, Provisioner, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lockmate")]
#[command(version)]
#[command(about = "Pair and provision Lockmate smart locks over Bluetooth LE")]
struct Cli {
    /// Talk to in-memory locks instead of the Bluetooth adapter
    #[arg(long, global = true)]
    simulate: bool,

    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Per-request deadline override
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby locks
    Scan {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
    /// Show the WiFi networks a lock can see
    Networks {
        #[arg(long)]
        device: String,
        #[arg(long)]
        password: String,
    },
    /// Put a lock on WiFi and authorize a user
    Provision {
        #[arg(long)]
        device: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        wifi_password: String,
        #[arg(long)]
        user_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match &cli.settings {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };
    if let Some(timeout_ms) = cli.timeout_ms {
        settings_service.get_mut().request_timeout_ms = timeout_ms;
    }

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Lockmate bridge");

    if cli.simulate {
        return run(Arc::new(SimulatedTransport::demo()), cli.command, settings_service).await;
    }
    run_hardware(cli.command, settings_service).await
}

#[cfg(feature = "hardware")]
async fn run_hardware(command: Commands, settings_service: SettingsService) -> Result<()> {
    use lockmate_bridge::infrastructure::bluetooth::btle::BtleTransport;

    let transport = BtleTransport::new()
        .await
        .context("Failed to open the Bluetooth adapter")?;
    run(Arc::new(transport), command, settings_service).await
}

#[cfg(not(feature = "hardware"))]
async fn run_hardware(_command: Commands, _settings_service: SettingsService) -> Result<()> {
    anyhow::bail!("Built without Bluetooth support; rebuild with --features hardware or pass --simulate")
}

async fn run<T: Transport>(
    transport: Arc<T>,
    command: Commands,
    mut settings_service: SettingsService,
) -> Result<()> {
    let settings = settings_service.get().clone();
    let config = ConnectionConfig::from_settings(&settings).context("Invalid BLE settings")?;
    let service = BluetoothService::new(transport, config);

    match command {
        Commands::Scan { seconds } => scan(service, Duration::from_secs(seconds)).await,
        Commands::Networks { device, password } => {
            let provisioner = Provisioner::new(Arc::new(service), ProvisionPolicy::from_settings(&settings));
            let mut device = known_device(&settings_service, &device);
            open(&provisioner, &mut device, &password).await?;

            let mut known = KnownNetworks::new();
            let result = provisioner.poll_networks(&device, &mut known).await;
            close(&provisioner, &device).await;
            result?;

            for name in known.names() {
                println!("{}", name);
            }
            settings_service.add_known_device(&device)
        }
        Commands::Provision {
            device,
            password,
            ssid,
            wifi_password,
            user_id,
        } => {
            let provisioner = Provisioner::new(Arc::new(service), ProvisionPolicy::from_settings(&settings));
            let mut device = known_device(&settings_service, &device);
            open(&provisioner, &mut device, &password).await?;

            let result = provisioner
                .provision(&device, &ssid, &wifi_password, &user_id)
                .await;
            close(&provisioner, &device).await;
            result?;

            println!("{} joined {:?} and authorized {}", device.name, ssid, user_id);
            settings_service.add_known_device(&device)
        }
    }
}

async fn scan<T: Transport>(mut service: BluetoothService<T>, duration: Duration) -> Result<()> {
    let mut found = service.start_scan().await.context("Failed to start scan")?;
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            result = found.recv() => match result {
                Some(result) => {
                    let rssi = result.rssi.map_or_else(|| "-".to_string(), |r| r.to_string());
                    println!("{}\t{}\t{}", result.device_id, result.display_name(), rssi);
                }
                None => break,
            },
        }
    }

    service.stop_scan().await?;
    Ok(())
}

/// Remembered device for an id, or a fresh one named after it
fn known_device(settings_service: &SettingsService, device_id: &str) -> BleDevice {
    settings_service
        .get()
        .known_devices
        .iter()
        .find(|d| d.id == device_id)
        .cloned()
        .unwrap_or_else(|| BleDevice::new(device_id, device_id))
}

async fn open<T: Transport>(provisioner: &Provisioner<T>, device: &mut BleDevice, password: &str) -> Result<()> {
    provisioner
        .service()
        .connect(&device.id)
        .await
        .with_context(|| format!("Failed to connect to {}", device.id))?;
    let paired = provisioner.confirm_pairing(device, password).await;
    if paired.is_err() {
        close(provisioner, device).await;
    }
    paired
}

async fn close<T: Transport>(provisioner: &Provisioner<T>, device: &BleDevice) {
    if let Err(e) = provisioner.service().disconnect(&device.id).await {
        warn!(device_id = %device.id, "Disconnect failed: {}", e);
    }
}
