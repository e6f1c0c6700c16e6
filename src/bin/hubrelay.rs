//! hubrelay - serve the bridge routes on a local WebSocket port.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use hubrelay::transport::gatt::GattCentral;
use hubrelay::transport::serial::{SerialOpener, SystemSerial};
use hubrelay::transport::simulated::{
    nxt_battery_responder, SimGattCentral, SimPeripheral, SimSerialHub, SimSerialOpener,
};
use hubrelay::{serve, Bridge, RelayConfig};

#[derive(Parser, Debug)]
#[command(name = "hubrelay", version, about = "WebSocket relay for LEGO and micro:bit hubs")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// NXT serial device (auto-detected when unset)
    #[arg(long, env = "NXT_PORT")]
    nxt_port: Option<String>,

    /// SPIKE serial device (auto-detected when unset)
    #[arg(long, env = "SPIKE_PORT")]
    spike_port: Option<String>,

    /// TLS certificate (PEM); requires --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log at debug level, including telegram dumps
    #[arg(short, long)]
    debug: bool,

    /// Use simulated hubs instead of real devices
    #[arg(long)]
    simulate: bool,
}

const SIM_NXT_PORT: &str = "/dev/cu.NXT";
const SIM_SPIKE_PORT: &str = "/dev/ttyACM0";

fn load_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if args.nxt_port.is_some() {
        config.serial.nxt_port = args.nxt_port.clone();
    }
    if args.spike_port.is_some() {
        config.serial.spike_port = args.spike_port.clone();
    }
    if args.tls_cert.is_some() {
        config.server.tls_cert = args.tls_cert.clone();
        config.server.tls_key = args.tls_key.clone();
    }
    if args.simulate {
        config.serial.nxt_port = Some(SIM_NXT_PORT.into());
        config.serial.spike_port = Some(SIM_SPIKE_PORT.into());
    }
    config.validate()?;
    Ok(config)
}

fn simulated_devices(config: &RelayConfig) -> (Arc<dyn SerialOpener>, Arc<dyn GattCentral>) {
    let serial = SimSerialOpener::new();
    serial.add(
        SIM_NXT_PORT,
        SimSerialHub::new().with_responder(nxt_battery_responder()),
    );
    serial.add(
        SIM_SPIKE_PORT,
        SimSerialHub::new()
            .with_responder(|line: &[u8]| line.ends_with(b"\r\n").then(|| line.to_vec())),
    );

    let central = SimGattCentral::new().with_scan_delay(Duration::from_millis(500));
    central.add(
        SimPeripheral::new("00:16:53:AA:BB:01", Some("LEGO Move Hub"), Some(-58))
            .with_characteristic(
                config.boost.service,
                config.boost.characteristic,
                &[0x05, 0x00, 0x01, 0x02, 0x06],
            ),
    );
    central.add(SimPeripheral::new("E4:7D:3A:00:11:22", Some("BBC micro:bit [zavog]"), Some(-71)));
    (Arc::new(serial), Arc::new(central))
}

#[cfg(feature = "ble-central")]
async fn system_central() -> Result<Arc<dyn GattCentral>, String> {
    match hubrelay::transport::btle::BtleCentral::new().await {
        Ok(central) => Ok(Arc::new(central)),
        Err(e) => Err(format!("BLE adapter unavailable: {}", e)),
    }
}

#[cfg(not(feature = "ble-central"))]
async fn system_central() -> Result<Arc<dyn GattCentral>, String> {
    Err("BLE support not built (enable ble-central)".into())
}

async fn run(config: RelayConfig, simulate: bool) -> anyhow::Result<()> {
    let (serial, central) = if simulate {
        log::info!("Using simulated hubs");
        let (serial, central) = simulated_devices(&config);
        (serial, Ok(central))
    } else {
        let serial: Arc<dyn SerialOpener> =
            Arc::new(SystemSerial::new(config.framer_settings().poll_interval));
        let central = system_central().await;
        if let Err(e) = &central {
            log::warn!("{}", e);
        }
        (serial, central)
    };

    let bridge = Arc::new(Bridge::new(config, serial, central));
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down");
        }
    };
    serve(bridge, shutdown).await?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(&args)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.server.blocking_threads)
        .build()
        .context("cannot start runtime")?;
    runtime.block_on(run(config, args.simulate))
}
