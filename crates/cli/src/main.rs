//! usbhid-cli
//!
//! Connects to a USB HID device, prints what it sends and writes the bytes
//! typed on stdin.

mod config;
mod input;

use anyhow::{Context, Result};
use async_channel::Receiver;
use clap::Parser;
use common::setup_logging;
use config::CliConfig;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};
use usbhid::usb::RusbTransport;
use usbhid::{ConnectionController, HidEvent, Transport, create_event_channel, hex_bytes};

const EVENT_CAPACITY: usize = 256;
const STDIN_CAPACITY: usize = 16;
/// How long shutdown waits for queued events to be printed
const PRINTER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "usbhid-cli")]
#[command(author, version, about = "Talk to a USB HID device from the terminal")]
#[command(long_about = "
Keeps a connection to one USB HID device, reconnecting when it is
unplugged and plugged back in. Inbound reports are printed in hex.
Each line typed on stdin is written to the device as bytes.

EXAMPLES:
    # Connect to the default device (0x1234:0x0006)
    usbhid-cli

    # Toggle the sample firmware's LEDs by typing:
    1 0 1 0

    # Another device, retrying failed writes twice
    usbhid-cli --vendor-id 0x16c0 --product-id 0x05df --retry 2

    # List USB devices and exit
    usbhid-cli --list-devices

CONFIGURATION:
    Configuration files are searched in this order:
    1. Path specified with --config
    2. ~/.config/usbhid/config.toml
    3. /etc/usbhid/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Vendor id, e.g. 0x1234
    #[arg(long, value_name = "HEX")]
    vendor_id: Option<String>,

    /// Product id, e.g. 0x0006
    #[arg(long, value_name = "HEX")]
    product_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Default retry count for failed writes
    #[arg(long, value_name = "N")]
    retry: Option<u32>,

    /// Coalesce queued writes into one transfer
    #[arg(long)]
    coalesce: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = CliConfig::default_path();
        CliConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        CliConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    if let Some(vendor_id) = args.vendor_id {
        config.device.vendor_id = vendor_id;
    }
    if let Some(product_id) = args.product_id {
        config.device.product_id = product_id;
    }
    if let Some(log_level) = args.log_level {
        config.logging.log_level = log_level;
    }
    if let Some(retry) = args.retry {
        config.io.default_retry = retry;
    }
    if args.coalesce {
        config.io.write_coalescing = true;
    }
    config.validate()?;

    setup_logging(&config.logging.log_level).context("Failed to setup logging")?;
    info!("usbhid-cli v{}", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(RusbTransport::new().context("Failed to initialize libusb")?);

    if args.list_devices {
        return list_devices_mode(transport).await;
    }

    run(config, transport).await
}

/// List USB devices and exit
async fn list_devices_mode(transport: Arc<RusbTransport>) -> Result<()> {
    let devices = tokio::task::spawn_blocking(move || transport.enumerate_devices())
        .await
        .context("Device enumeration task failed")?
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x} - {} {}",
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Bus {:03} Device {:03}",
            device.bus_number, device.address
        );
    }

    Ok(())
}

async fn run(config: CliConfig, transport: Arc<RusbTransport>) -> Result<()> {
    let vendor_id = config.device.vendor_id()?;
    let product_id = config.device.product_id()?;

    let (listener, events) = create_event_channel(EVENT_CAPACITY);
    let controller = Arc::new(
        ConnectionController::new(
            transport,
            vendor_id,
            product_id,
            config.io,
            Arc::new(listener),
        )
        .context("Failed to create connection controller")?,
    );

    let printer = tokio::spawn(print_events(events));

    let opener = Arc::clone(&controller);
    let state = tokio::task::spawn_blocking(move || opener.open())
        .await
        .context("Open task failed")?;
    info!(
        "Watching for {:04x}:{:04x}, state {}",
        vendor_id, product_id, state
    );
    info!("Type bytes to send (e.g. '1 0 1 0'); Ctrl+C or EOF to quit");

    let lines = spawn_stdin_reader().context("Failed to start stdin reader")?;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.recv() => match line {
                Ok(Ok(line)) => send_line(&controller, &line),
                Ok(Err(e)) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
                Err(_) => {
                    info!("Input closed, shutting down...");
                    break;
                }
            },
        }
    }

    // Dropping the last handle drops the listener, which ends the printer.
    tokio::task::spawn_blocking(move || {
        controller.close();
        drop(controller);
    })
    .await
    .context("Close task failed")?;
    if tokio::time::timeout(PRINTER_DRAIN_TIMEOUT, printer).await.is_err() {
        debug!("Event printer still busy at exit");
    }

    Ok(())
}

/// Read stdin lines on a plain thread
///
/// A blocked stdin read cannot be cancelled, so it must not live on the
/// runtime; the thread is simply abandoned at exit.
fn spawn_stdin_reader() -> Result<Receiver<std::io::Result<String>>> {
    let (tx, rx) = async_channel::bounded(STDIN_CAPACITY);
    std::thread::Builder::new()
        .name("usbhid-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let failed = line.is_err();
                if tx.send_blocking(line).is_err() || failed {
                    break;
                }
            }
        })?;
    Ok(rx)
}

fn send_line(controller: &ConnectionController, line: &str) {
    let data = match input::parse_bytes(line) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("{:#}", e);
            return;
        }
    };
    if data.is_empty() {
        return;
    }

    if let Err(e) = controller.write(data, None) {
        eprintln!("Not sent: {}", e);
    }
}

async fn print_events(events: Receiver<HidEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            HidEvent::Data(data) => println!("<- {}", hex_bytes(&data)),
            HidEvent::StateChanged(state) => println!("state: {}", state),
            HidEvent::RunError(e) => eprintln!("error: {}", e),
        }
    }
}
