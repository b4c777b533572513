//! sensorlink_cli: bench tool for sensor nodes on a serial port.
//!
//! `ports` lists candidate devices, `check` confirms that a node answers,
//! `monitor` streams decoded events and `send` writes one command line.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::broadcast;

use sensorlink_lib::events::LinkEvent;
use sensorlink_lib::io::serial::list_serial_ports;
use sensorlink_lib::link::LinkManager;
use sensorlink_lib::settings::{load_settings, LinkSettings};

#[derive(Parser, Debug)]
#[command(name = "sensorlink_cli", version, about = "Serial sensor node bench tool")]
struct Cli {
    /// Settings file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports, known ESP8266 bridges first
    Ports,
    /// Open the port and report whether the node comes up
    Check(LinkArgs),
    /// Print every event from the node
    Monitor {
        #[command(flatten)]
        link: LinkArgs,
        /// Seconds to run (0 = until Ctrl-C)
        #[arg(short, long, default_value_t = 0)]
        duration: u64,
        /// Print events as JSON lines
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Send one command line and print what comes back
    Send {
        #[command(flatten)]
        link: LinkArgs,
        /// Command line to write (a newline is appended)
        #[arg(short, long)]
        command: String,
        /// How long to wait for output after sending
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
    },
}

#[derive(Args, Debug)]
struct LinkArgs {
    /// Serial port (overrides settings)
    #[arg(short, long)]
    port: Option<String>,
    /// Baud rate (overrides settings)
    #[arg(short, long)]
    baud: Option<u32>,
}

impl LinkArgs {
    fn apply(&self, mut link: LinkSettings) -> LinkSettings {
        if let Some(port) = &self.port {
            link.port = port.clone();
        }
        if let Some(baud) = self.baud {
            link.baud_rate = baud;
        }
        link
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Ports => list_ports(),
        Command::Check(link) => match link_settings(&cli.config, &link) {
            Ok(settings) => check(settings).await,
            Err(e) => Err(e),
        },
        Command::Monitor {
            link,
            duration,
            json,
        } => match link_settings(&cli.config, &link) {
            Ok(settings) => monitor(settings, duration, json).await,
            Err(e) => Err(e),
        },
        Command::Send {
            link,
            command,
            wait_ms,
        } => match link_settings(&cli.config, &link) {
            Ok(settings) => send(settings, &command, Duration::from_millis(wait_ms)).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn link_settings(config: &Option<PathBuf>, args: &LinkArgs) -> Result<LinkSettings, String> {
    let settings = load_settings(config.as_deref())?;
    Ok(args.apply(settings.link))
}

fn list_ports() -> Result<(), String> {
    let ports = list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for p in ports {
        let ids = match (p.vid, p.pid) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => "-".to_string(),
        };
        let label = p.product.or(p.manufacturer).unwrap_or_default();
        let bridge = p.bridge.unwrap_or("-");
        println!(
            "{:<24} {:<9} {:<10} {:<7} {}",
            p.port_name, p.port_type, ids, bridge, label
        );
    }
    Ok(())
}

async fn check(settings: LinkSettings) -> Result<(), String> {
    let port = settings.port.clone();
    let manager = LinkManager::serial(settings);
    let mut events = manager.subscribe();

    let connected = manager.check_connection().await;
    let failure = drain_failure(&mut events);
    manager.shutdown().await;

    if connected {
        println!("{}: connected", port);
        Ok(())
    } else {
        Err(failure.unwrap_or_else(|| format!("{}: not connected", port)))
    }
}

async fn monitor(settings: LinkSettings, seconds: u64, json: bool) -> Result<(), String> {
    let manager = LinkManager::serial(settings);
    let mut events = manager.subscribe();

    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print_event(&event, json);
                    if event == LinkEvent::Shutdown {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("(skipped {} events)", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if !manager.check_connection().await {
        manager.shutdown().await;
        let _ = printer.await;
        return Err("Failed to establish initial connection".to_string());
    }

    let session = async {
        if seconds == 0 {
            std::future::pending::<()>().await;
        } else {
            manager.read_for(Duration::from_secs(seconds)).await;
        }
    };
    tokio::select! {
        _ = session => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    manager.shutdown().await;
    let _ = printer.await;
    Ok(())
}

async fn send(settings: LinkSettings, command: &str, wait: Duration) -> Result<(), String> {
    let manager = LinkManager::serial(settings);
    let mut events = manager.subscribe();

    if !manager.check_connection().await {
        let failure = drain_failure(&mut events);
        manager.shutdown().await;
        return Err(failure.unwrap_or_else(|| "Not connected".to_string()));
    }

    let result = manager.send_command(command).await.map_err(|e| e.to_string());
    if result.is_ok() {
        let deadline = tokio::time::sleep(wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Ok(LinkEvent::Log(_)) | Ok(LinkEvent::Connected) => {}
                    Ok(event) => print_event(&event, false),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    manager.shutdown().await;
    result
}

fn drain_failure(events: &mut broadcast::Receiver<LinkEvent>) -> Option<String> {
    let mut failure = None;
    while let Ok(event) = events.try_recv() {
        if let LinkEvent::ConnectionFailed { error } = event {
            failure = Some(error);
        }
    }
    failure
}

fn print_event(event: &LinkEvent, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }
    match event {
        LinkEvent::SensorData(r) => println!(
            "[{}] {:.1}C {:.1}% co2={} tvoc={} heap={} wifi={}",
            r.device_id,
            r.dht22.temperature,
            r.dht22.humidity,
            r.ccs811.co2,
            r.ccs811.tvoc,
            r.system.free_heap,
            r.system.wifi_connected
        ),
        LinkEvent::DeviceError(text) => println!("! {}", text),
        LinkEvent::RawMessage(text) => println!("  {}", text),
        LinkEvent::Log(entry) => {
            eprintln!("{:?}: {}", entry.level, entry.message)
        }
        LinkEvent::ConnectionFailed { error } => eprintln!("connection failed: {}", error),
        other => eprintln!("-- {}", other.name()),
    }
}
