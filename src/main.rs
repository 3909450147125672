mod ble;
mod calibration;
mod channels;
mod config;
mod connection;
mod device_scanner;
mod error;
mod listeners;
mod migration;
#[cfg(test)]
mod mocks;
mod models;
mod sensor;
mod store;
mod transport;

use ble::{BleService, BleSettings};
use calibration::{fit_coefficients, to_coefficient_set, CalibrationPoint};
use channels::ChannelRegistry;
use clap::{Parser, Subcommand};
use config::Config;
use connection::FileRecordStore;
use device_scanner::{extract_mac_from_name, extract_mac_with_prefix};
use error::BleError;
use migration::{MigrationEngine, MigrationReport};
use models::{ChannelNumber, Device, DeviceId};
use sensor::BleEvent;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::MemoryStore;
use transport::BtleplugTransport;

type CliResult = Result<(), Box<dyn Error>>;

/// AirScale channel calibration and sensor sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log filter, e.g. "debug" or "airscale_sync=trace" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Config file to use instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backfill channels and reassign legacy calibrations in a store file
    Migrate {
        #[arg(long)]
        store: PathBuf,
    },
    /// Fit calibration points and print the coefficient payload
    Fit {
        /// pressure,weight[,ambient[,temp]]; repeat for each point
        #[arg(long = "point", required = true)]
        points: Vec<CalibrationPoint>,
        /// Sensor the coefficients apply to; empty means the hub
        #[arg(long, default_value = "")]
        target_mac: String,
    },
    /// Add a device to a store file and create its channels
    Register {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        device: DeviceId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: u64,
        #[arg(long)]
        wifi_mac: Option<String>,
    },
    /// Record a calibration for a device channel in a store file
    Calibrate {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        device: DeviceId,
        #[arg(long, default_value_t = 1)]
        channel: u8,
        #[arg(long = "point", required = true)]
        points: Vec<CalibrationPoint>,
    },
    /// Set or clear a channel's axle-group label
    Label {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        device: DeviceId,
        #[arg(long)]
        channel: u8,
        label: Option<String>,
    },
    /// Move a device to a new owner and flag it for recalibration
    Transfer {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        device: DeviceId,
        #[arg(long)]
        owner: u64,
    },
    /// Discover nearby sensors and pair with the strongest one
    Scan {
        #[command(flatten)]
        pairing: PairingTarget,
    },
    /// Connect to a known sensor by platform id and advertised name
    Connect {
        device_id: String,
        name: String,
        #[command(flatten)]
        pairing: PairingTarget,
    },
    /// Push a channel's latest calibration to the last paired sensor
    Send {
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        device: DeviceId,
        #[arg(long, default_value_t = 1)]
        channel: u8,
        #[arg(long, default_value = "")]
        target_mac: String,
    },
    /// Disconnect and erase the last paired sensor
    Forget,
    /// Reconnect and print telemetry until Ctrl-C
    Listen,
}

/// Store row that a successful pairing is written back to
#[derive(clap::Args, Debug)]
struct PairingTarget {
    #[arg(long, requires = "device")]
    store: Option<PathBuf>,
    #[arg(long, requires = "store")]
    device: Option<DeviceId>,
}

impl PairingTarget {
    fn record(&self, ble_device_id: &str, wifi_mac: &str) -> CliResult {
        let (Some(store), Some(device)) = (&self.store, self.device) else {
            return Ok(());
        };
        with_store(store, |registry| {
            registry.record_pairing(device, ble_device_id, wifi_mac)?;
            println!("device {} now paired with {}", device, ble_device_id);
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    // Initialize logging
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = &cli.log_level {
        builder.parse_filters(filter);
    }
    builder.init();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Migrate { store } => migrate(&store),
        Command::Fit { points, target_mac } => {
            let coefficients = fit_coefficients(&points, target_mac)?;
            for point in &points {
                let predicted = coefficients.predict(point.air_pressure, point.ambient_pressure, point.air_temp);
                log::info!(
                    "{} psi: measured {} predicted {:.1}",
                    point.air_pressure,
                    point.weight,
                    predicted
                );
            }
            println!("{}", serde_json::to_string_pretty(&coefficients)?);
            Ok(())
        }
        Command::Register {
            store,
            device,
            name,
            owner,
            wifi_mac,
        } => with_store(&store, |registry| {
            registry.register_device(Device {
                wifi_mac,
                ..Device::new(device, name, owner)
            })?;
            println!("registered device {} with channels 1 and 2", device);
            Ok(())
        }),
        Command::Calibrate {
            store,
            device,
            channel,
            points,
        } => with_store(&store, |registry| {
            let calibration = registry.record_calibration(device, channel_number(channel)?, points)?;
            println!(
                "calibration {} for device {} channel {}: {:?}",
                calibration.id, device, channel, calibration.model
            );
            Ok(())
        }),
        Command::Label {
            store,
            device,
            channel,
            label,
        } => with_store(&store, |registry| {
            registry.set_label(device, channel_number(channel)?, label)?;
            Ok(())
        }),
        Command::Transfer { store, device, owner } => with_store(&store, |registry| {
            registry.transfer_ownership(device, owner)?;
            println!("device {} now belongs to {} and needs recalibration", device, owner);
            Ok(())
        }),
        Command::Scan { pairing } => {
            let service = start(&config, false).await?;
            let record = service.scan_and_connect().await?;
            println!("paired {} (MAC {})", record.device_name, record.wifi_mac);
            service.disconnect().await?;
            pairing.record(&record.device_id, &record.wifi_mac)
        }
        Command::Connect {
            device_id,
            name,
            pairing,
        } => {
            let service = start(&config, false).await?;
            // Factory-named sensors are accepted even under a custom prefix
            let wifi_mac = extract_mac_with_prefix(&name, &config.device_name_prefix)
                .or_else(|| extract_mac_from_name(&name))
                .ok_or_else(|| BleError::UnrecognizedDevice(name.clone()))?;
            service.connect_to_device(&device_id, &name, &wifi_mac).await?;
            println!("paired {} (MAC {})", name, wifi_mac);
            service.disconnect().await?;
            pairing.record(&device_id, &wifi_mac)
        }
        Command::Send {
            store,
            device,
            channel,
            target_mac,
        } => {
            let store = MemoryStore::load(&store)?;
            let registry = ChannelRegistry::new(&store);
            let calibration = registry
                .latest_calibration(device, channel_number(channel)?)?
                .ok_or_else(|| format!("device {} channel {} has no calibration", device, channel))?;
            let coefficients = to_coefficient_set(&calibration.model, target_mac);

            let service = start(&config, true).await?;
            service.send_coefficients(&coefficients).await?;
            service.disconnect().await?;
            Ok(())
        }
        Command::Forget => {
            let service = start(&config, false).await?;
            service.forget_device().await?;
            println!("forgot last paired device");
            Ok(())
        }
        Command::Listen => listen(&config).await,
    }
}

fn channel_number(channel: u8) -> Result<ChannelNumber, Box<dyn Error>> {
    Ok(ChannelNumber::try_from(channel)?)
}

fn migrate(path: &Path) -> CliResult {
    let store = MemoryStore::load(path)?;
    let engine = MigrationEngine::new(&store);
    let (channels, calibrations) = engine.run_all()?;
    print_report("channel backfill", &channels);
    print_report("calibration reassignment", &calibrations);
    store.save(path)?;
    Ok(())
}

fn print_report(name: &str, report: &MigrationReport) {
    println!("{}: {}", name, report);
    for error in &report.errors {
        println!("  {}: {}", error.row, error.message);
    }
}

/// Runs `f` against the store at `path` and writes it back on success
fn with_store<F>(path: &Path, f: F) -> CliResult
where
    F: FnOnce(&ChannelRegistry<'_>) -> CliResult,
{
    let store = MemoryStore::load(path)?;
    f(&ChannelRegistry::new(&store))?;
    store.save(path)?;
    Ok(())
}

async fn start(config: &Config, auto_reconnect: bool) -> Result<BleService, Box<dyn Error>> {
    let transport = Arc::new(BtleplugTransport::new(config.scan_duration()));
    let records = Arc::new(FileRecordStore::default_location());
    log::debug!("connection record at {}", records.path().display());

    let mut settings = BleSettings::from(config);
    settings.auto_reconnect &= auto_reconnect;
    let service = BleService::new(transport, records, settings);
    if !service.initialize().await? {
        return Err(BleError::Unavailable.into());
    }
    Ok(service)
}

async fn listen(config: &Config) -> CliResult {
    let service = start(config, true).await?;
    if service.connected_device_id().is_none() {
        return Err(BleError::NotConnected.into());
    }

    let (sender, receiver) = crossbeam_channel::unbounded::<BleEvent>();
    let token = service.subscribe(move |event| {
        let _ = sender.send(event.clone());
    });

    std::thread::spawn(move || {
        for event in receiver {
            match event {
                BleEvent::Telemetry(telemetry) => println!(
                    "{} {}",
                    telemetry.received_at.to_rfc3339(),
                    serde_json::Value::Object(telemetry.fields)
                ),
                BleEvent::StateChanged(state) => println!("state: {:?}", state),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    service.unsubscribe(token);
    service.disconnect().await?;
    Ok(())
}

