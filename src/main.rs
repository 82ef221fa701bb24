//! Colosseum CLI
//!
//! Main entry point for the `colosseum` command.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colosseum::config::{Config, DEFAULT_CONFIG_PATH};
use colosseum::session::{DeviceSession, SessionEvent, SessionSettings};
use colosseum::units::calculate;
use colosseum::units::{Quantity, UnitNumber};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colosseum")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive the Colosseum fraction collector and plan collection runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports that look like the collector's Arduino
    Ports,

    /// Derive run parameters from flow rate and two known quantities
    Calc {
        /// Flow rate, e.g. "10 uL/sec"
        #[arg(long)]
        flow_rate: String,

        /// Total run time, e.g. "30 min"
        #[arg(long, conflicts_with = "total_volume", required_unless_present = "total_volume")]
        total_time: Option<String>,

        /// Total volume, e.g. "5 mL"
        #[arg(long)]
        total_volume: Option<String>,

        /// Volume collected per tube, e.g. "500 uL"
        #[arg(long, conflicts_with = "fractions", required_unless_present = "fractions")]
        volume_per_fraction: Option<String>,

        /// Number of fractions
        #[arg(long)]
        fractions: Option<String>,

        /// Unit for derived times
        #[arg(long, default_value = "min")]
        time_unit: String,

        /// Unit for derived volumes
        #[arg(long, default_value = "mL")]
        volume_unit: String,
    },

    /// Connect to the collector and run a collection
    Run {
        /// Number of fractions to collect
        #[arg(long)]
        fractions: usize,

        /// Time between tubes in milliseconds
        #[arg(long, conflicts_with_all = ["flow_rate", "volume_per_fraction"])]
        interval_ms: Option<u64>,

        /// Flow rate, used with --volume-per-fraction to derive the interval
        #[arg(long, requires = "volume_per_fraction")]
        flow_rate: Option<String>,

        /// Volume per tube, used with --flow-rate to derive the interval
        #[arg(long, requires = "flow_rate")]
        volume_per_fraction: Option<String>,

        /// Echo commands instead of opening a serial port
        #[arg(long)]
        dry: bool,

        /// Serial port; overrides the configuration and discovery
        #[arg(long)]
        port: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ports => list_ports(&config),
        Commands::Calc {
            flow_rate,
            total_time,
            total_volume,
            volume_per_fraction,
            fractions,
            time_unit,
            volume_unit,
        } => calc(
            &flow_rate,
            total_time.as_deref(),
            total_volume.as_deref(),
            volume_per_fraction.as_deref(),
            fractions.as_deref(),
            &time_unit,
            &volume_unit,
        ),
        Commands::Run {
            fractions,
            interval_ms,
            flow_rate,
            volume_per_fraction,
            dry,
            port,
        } => {
            let interval = match (interval_ms, flow_rate, volume_per_fraction) {
                (Some(ms), _, _) => Duration::from_millis(ms),
                (None, Some(flow_rate), Some(size)) => derive_interval(&flow_rate, &size)?,
                _ => bail!("Give either --interval-ms or both --flow-rate and --volume-per-fraction"),
            };
            run(&config, fractions, interval, dry, port).await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
            Ok(())
        }
    }
}

#[cfg(feature = "instrument_serial")]
fn list_ports(config: &Config) -> Result<()> {
    let ports = colosseum::adapters::serial_adapter::arduino_ports(config.serial.usb_vendor_id)?;
    if ports.is_empty() {
        println!("No matching serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
fn list_ports(_config: &Config) -> Result<()> {
    bail!("Port discovery needs the `instrument_serial` feature")
}

fn calc(
    flow_rate: &str,
    total_time: Option<&str>,
    total_volume: Option<&str>,
    volume_per_fraction: Option<&str>,
    fractions: Option<&str>,
    time_unit: &str,
    volume_unit: &str,
) -> Result<()> {
    let flow_rate = UnitNumber::parse(flow_rate, Quantity::FlowRate)?;
    let time = total_time.map(|t| UnitNumber::parse(t, Quantity::Time)).transpose()?;
    let volume = total_volume.map(|v| UnitNumber::parse(v, Quantity::Volume)).transpose()?;
    let size = volume_per_fraction
        .map(|v| UnitNumber::parse(v, Quantity::Volume))
        .transpose()?;
    let count = fractions.map(|n| UnitNumber::parse(n, Quantity::Count)).transpose()?;

    match (time, volume, &size, count) {
        (Some(time), None, Some(size), None) => {
            let out = calculate::from_total_time_and_fraction_size(
                &flow_rate,
                &time,
                size,
                Some(volume_unit),
                None,
            )?;
            println!("Total volume:        {}", out.total_volume.to_string_places(2));
            println!("Number of fractions: {}", out.number_of_fractions.to_string_places(0));
        }
        (Some(time), None, None, Some(count)) => {
            let out = calculate::from_total_time_and_count(
                &flow_rate,
                &time,
                &count,
                Some(volume_unit),
                Some(volume_unit),
            )?;
            println!("Total volume:        {}", out.total_volume.to_string_places(2));
            println!("Volume per fraction: {}", out.volume_per_fraction.to_string_places(2));
        }
        (None, Some(volume), Some(size), None) => {
            let out = calculate::from_total_volume_and_fraction_size(
                &flow_rate,
                &volume,
                size,
                Some(time_unit),
                None,
            )?;
            println!("Total time:          {}", out.total_time.to_string_places(2));
            println!("Number of fractions: {}", out.number_of_fractions.to_string_places(0));
        }
        (None, Some(volume), None, Some(count)) => {
            let out = calculate::from_total_volume_and_count(
                &flow_rate,
                &volume,
                &count,
                Some(time_unit),
                Some(volume_unit),
            )?;
            println!("Total time:          {}", out.total_time.to_string_places(2));
            println!("Volume per fraction: {}", out.volume_per_fraction.to_string_places(2));
        }
        _ => bail!(
            "Give one of --total-time/--total-volume and one of --volume-per-fraction/--fractions"
        ),
    }

    if let Some(size) = size {
        let interval = calculate::collection_interval(&flow_rate, &size)?;
        println!("Time per fraction:   {}", interval.to_string_places(0));
    }
    Ok(())
}

fn derive_interval(flow_rate: &str, volume_per_fraction: &str) -> Result<Duration> {
    let flow_rate = UnitNumber::parse(flow_rate, Quantity::FlowRate)?;
    let size = UnitNumber::parse(volume_per_fraction, Quantity::Volume)?;
    let interval = calculate::collection_interval(&flow_rate, &size)?;
    Duration::try_from_secs_f64(interval.value() / 1000.0)
        .with_context(|| format!("Cannot wait {} between fractions", interval))
}

async fn run(
    config: &Config,
    fractions: usize,
    interval: Duration,
    dry: bool,
    port: Option<String>,
) -> Result<()> {
    let settings = config.session_settings()?;
    let session = if dry || config.device.dry {
        info!("Dry run; no serial port will be opened");
        DeviceSession::dry(settings)
    } else {
        open_serial(config, port, settings)?
    };

    let banner = session.connect().await.context("Failed to connect to the collector")?;
    println!("Connected: {}", banner);

    let mut events = session.setup(fractions, interval).await.context("Setup failed")?;
    println!(
        "Collecting {} fractions, {} ms apart",
        fractions,
        interval.as_millis()
    );

    let runner = session.clone();
    let mut handle = tokio::spawn(async move { runner.run().await });

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report(&event, fractions),
                None => break (&mut handle).await,
            },
            result = &mut handle => {
                while let Some(event) = events.try_recv() {
                    report(&event, fractions);
                }
                break result;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping the device");
                if let Err(e) = session.stop().await {
                    warn!(error = %e, "Stop command failed");
                }
            }
        }
    };
    outcome.context("Run loop panicked")??;

    let snapshot = session.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if let Err(e) = session.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    if snapshot.error {
        bail!(
            "Run failed: {}",
            snapshot.last_error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn report(event: &SessionEvent, fractions: usize) {
    match event {
        SessionEvent::Progress { position } => {
            println!("Fraction {}/{} collected", position + 1, fractions)
        }
        SessionEvent::Error { position, error } => {
            eprintln!("Fraction {} failed: {}", position + 1, error)
        }
        SessionEvent::Done => println!("Run complete"),
    }
}

#[cfg(feature = "tokio_serial")]
fn open_serial(
    config: &Config,
    port: Option<String>,
    settings: SessionSettings,
) -> Result<DeviceSession> {
    use colosseum::adapters::serial_adapter::{arduino_ports, SerialAdapter};

    let port = match port.or_else(|| config.serial.port.clone()) {
        Some(port) => port,
        None => arduino_ports(config.serial.usb_vendor_id)?
            .into_iter()
            .next()
            .context("No collector found; pass --port or set serial.port")?,
    };
    info!(%port, "Using serial port");

    let adapter = SerialAdapter::from_config(port, &config.serial)?;
    Ok(DeviceSession::new(adapter, settings))
}

#[cfg(not(feature = "tokio_serial"))]
fn open_serial(
    _config: &Config,
    _port: Option<String>,
    _settings: SessionSettings,
) -> Result<DeviceSession> {
    bail!("Serial transport needs the `tokio_serial` feature; use --dry to run without hardware")
}
