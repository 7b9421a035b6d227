use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod capture;
mod errors;
mod host;
mod logging;
mod session;

#[derive(Parser, Debug)]
#[command(
    name = "mg24-audio",
    about = "Record audio from a XIAO MG24 Sense over USB CDC"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports, USB CDC devices first
    Ports,
    /// Record one capture from a connected device
    Record {
        /// Serial port path (e.g. /dev/ttyACM0)
        port: String,
        /// Sample rate in Hz
        #[arg(long, default_value_t = session::MAX_SR)]
        rate: u32,
        /// Recording duration in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f64,
        /// Write raw little-endian i16 samples to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve the device protocol on stdin/stdout with a synthetic microphone
    Sim {
        /// Simulated ADC resolution in bits
        #[arg(long, default_value_t = 12)]
        bit_depth: u8,
        /// Test tone frequency in Hz
        #[arg(long, default_value_t = 440)]
        tone_hz: u32,
    },
}

fn main() {
    logging::init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    match Args::parse().command {
        Command::Ports => list_ports(),
        Command::Record {
            port,
            rate,
            seconds,
            out,
        } => record(&port, rate, seconds, out.as_deref()),
        Command::Sim { bit_depth, tone_hz } => sim(bit_depth, tone_hz),
    }
}

fn list_ports() -> Result<()> {
    let mut ports = serialport::available_ports().context("failed to enumerate serial ports")?;
    ports.sort_by_key(|p| !matches!(p.port_type, serialport::SerialPortType::UsbPort(_)));
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => println!(
                "{} — {}",
                port.port_name,
                usb.product.as_deref().unwrap_or("USB device")
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

fn record(port: &str, rate: u32, seconds: f64, out: Option<&std::path::Path>) -> Result<()> {
    let mut recorder =
        host::Recorder::connect_serial(port).with_context(|| format!("failed to open {port}"))?;
    println!("Recording {seconds:.2}s at {rate} Hz from {port}...");

    let recording = recorder.record(rate, seconds)?;
    println!(
        "Received {} samples at {} Hz ({:.2}s)",
        recording.samples.len(),
        recording.sample_rate_hz,
        recording.duration_secs()
    );

    if let Some(path) = out {
        let mut file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        for sample in &recording.samples {
            file.write_all(&sample.to_le_bytes())?;
        }
        println!("Wrote {}", path.display());
    }
    Ok(())
}

fn sim(bit_depth: u8, tone_hz: u32) -> Result<()> {
    let calibration = capture::AdcCalibration::new(bit_depth)?;
    let adc = capture::SineAdc::new(bit_depth, tone_hz, session::MAX_SR);
    let engine = capture::CaptureEngine::new(adc, capture::SystemClock::new(), calibration);
    let mut session = session::Session::new(engine);

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    session.serve(stdin, stdout)?;
    Ok(())
}
