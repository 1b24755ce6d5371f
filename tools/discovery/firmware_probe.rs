// Probe the motor controller: find its port, report firmware and motion status.
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use stylus_rig::config::RigConfig;
use stylus_rig::firmware::{FirmwareVersion, StatusFormat};
use stylus_rig::transport::{
    find_rig_port, SerialTransport, Transport, QUERY_MOTION, QUERY_PEN, QUERY_VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "firmware_probe", about = "Query the stylus rig motor controller")]
struct Args {
    /// Rig configuration file
    #[arg(short, long, default_value = "config/rig.toml")]
    config: PathBuf,

    /// Serial port, overriding the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Only list serial ports
    #[arg(long)]
    list: bool,
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("cannot enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for info in ports {
        match info.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "  {} (USB {:04x}:{:04x} {})",
                info.port_name,
                usb.vid,
                usb.pid,
                usb.manufacturer.as_deref().unwrap_or("unknown manufacturer")
            ),
            other => println!("  {} ({:?})", info.port_name, other),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = RigConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    stylus_rig::logging::init(&config.application)?;

    println!("Serial ports:");
    list_ports()?;
    if args.list {
        return Ok(());
    }

    if args.port.is_some() {
        config.serial.port = args.port;
    }
    let port = find_rig_port(&config.serial)?;
    println!("\nController on {port}");
    config.serial.port = Some(port);

    let mut link = SerialTransport::open(&config.serial)?;
    let banner = link.query(QUERY_VERSION)?;
    let version = FirmwareVersion::parse(&banner);
    match version {
        Some(v) => println!("Firmware:      {v} (home command: {})", v.supports_home()),
        None => println!("Firmware:      unrecognized reply {:?}", banner.trim()),
    }

    let format = StatusFormat::for_version(version);
    println!("Status format: {format:?}");
    if format.is_queryable() {
        let reply = link.query(QUERY_MOTION)?;
        let status = format.parse(&reply);
        println!("Motion:        {status:?}");
        println!("Buffer full:   {}", status.buffer_full(format));
    }
    let pen = link.query(QUERY_PEN)?;
    println!("Pen:           {}", if pen.trim_start().starts_with('0') { "down" } else { "up" });

    link.close()?;
    Ok(())
}
