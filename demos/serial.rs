use std::env;
use std::fs::File;

use c3000_pumps::config::{PumpSettings, SetupConfig};
use c3000_pumps::multi::MultiPumpController;
use c3000_pumps::pump::PumpController;
use c3000_pumps::syringe::PumpConfig;
use c3000_pumps::types::{MicrostepMode, ValvePosition};
use inquire::Select;
use serialport::SerialPort;

// Configuration constants - adjust these for your setup
const BAUD_RATE: u32 = c3000_pumps::config::DEFAULT_BAUDRATE;
// Replies are short, but discovery waits this long on every empty dial position.
const SERIAL_TIMEOUT_MS: u64 = 100;
const SYRINGE_VOLUME_ML: f64 = 5.0;
const TRANSFER_VOLUME_ML: f64 = 7.5;
const TOP_VELOCITY: u32 = 24000;

pub struct PortWrapper(Box<dyn SerialPort>);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::AddrInUse => embedded_io::ErrorKind::AddrInUse,
            std::io::ErrorKind::AddrNotAvailable => embedded_io::ErrorKind::AddrNotAvailable,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::AlreadyExists => embedded_io::ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for PortWrapper {
    type Error = IoError;
}

impl embedded_io::Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

fn open_port(port_name: &str, baudrate: u32, timeout: std::time::Duration) -> PortWrapper {
    let port = serialport::new(port_name, baudrate)
        .timeout(timeout)
        .open()
        .expect("Failed to open serial port");
    PortWrapper(port)
}

/// Bring up every pump of a setup file and run a short transfer on each group.
fn run_setup(path: &str) {
    let setup = SetupConfig::from_reader(File::open(path).expect("Failed to open setup"))
        .expect("Failed to parse setup");

    let mut pumps: MultiPumpController<PortWrapper> =
        MultiPumpController::new(setup, |name, settings: &PumpSettings| {
            println!("Connecting {} on {}", name, settings.port);
            Ok(open_port(&settings.port, settings.baudrate, settings.timeout_duration()))
        })
        .unwrap();

    pumps.smart_initialize_all(true).unwrap();
    println!("All pumps initialized");

    let groups: Vec<(String, Vec<String>)> =
        pumps.groups().iter().map(|(g, m)| (g.clone(), m.clone())).collect();
    for (group, members) in groups {
        let chunks = pumps
            .transfer_group(
                &members,
                TRANSFER_VOLUME_ML,
                ValvePosition::Input,
                ValvePosition::Output,
                None,
                None,
                true,
            )
            .unwrap();
        println!("Group {} transferred {} ml in chunks {:?}", group, TRANSFER_VOLUME_ML, chunks);
    }
}

fn main() {
    env_logger::init();

    // A setup file drives several pumps, anything else is taken as a port name
    if let Some(path) = env::args().nth(1).filter(|arg| arg.ends_with(".json")) {
        run_setup(&path);
        return;
    }

    // Get serial port from command line arg or interactive selection
    let port_name = env::args().nth(1).unwrap_or_else(|| {
        // List available serial ports
        let ports = serialport::available_ports().expect("Failed to enumerate serial ports");

        if ports.is_empty() {
            eprintln!("No serial ports found!");
            std::process::exit(1);
        }

        let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();

        // Interactive selection
        Select::new("Select a serial port:", port_names)
            .prompt()
            .expect("Failed to select port")
    });

    println!("Using port: {}", port_name);

    let port = open_port(
        &port_name,
        BAUD_RATE,
        std::time::Duration::from_millis(SERIAL_TIMEOUT_MS),
    );

    // Create a pump object, this finds the dial position
    let syringe = PumpConfig::new(MicrostepMode::Mode2, SYRINGE_VOLUME_ML).unwrap();
    let mut pump: PumpController<PortWrapper, 128> = PumpController::new("demo", port, syringe)
        .unwrap()
        .with_default_top_velocity(TOP_VELOCITY);
    println!("Found pump at address {}", pump.address());

    println!("Valve topology: {:?}", pump.valve_topology().unwrap());
    println!("State: {:?}", pump.state().unwrap());

    pump.smart_initialize(None, true).unwrap();
    println!("Pump initialized, top velocity {}", pump.top_velocity().unwrap());

    // Transfer more than one stroke, the pump refills as needed
    pump.transfer(
        TRANSFER_VOLUME_ML,
        ValvePosition::Input,
        ValvePosition::Output,
        None,
        None,
    )
    .unwrap();
    println!("Transferred {} ml", TRANSFER_VOLUME_ML);

    println!("Plunger at {} ml", pump.current_volume().unwrap());
    println!("Valve on {}", pump.valve_position().unwrap());
}
