use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use periphlink::{
    device, init_logging, list_ports, ConnectionManager, DeviceEntry, DeviceEvent, DeviceKind,
    LogFormat, PeriphlinkConfig, BUILD_DATE,
};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "periphlink", version, about = "Talk to serial peripherals")]
struct Cli {
    /// Device settings file (.json or .toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports
    Ports,
    /// Report which port hosts a device
    Probe {
        /// Configured device name or device kind
        device: String,
        /// Ports to try, in order; defaults to the configured or detected ports
        ports: Vec<String>,
    },
    /// Print readings and events from a device until Ctrl-C
    Monitor {
        /// Configured device name or device kind
        device: String,
        /// Port to open; probed when omitted
        port: Option<String>,
    },
    /// Send G-code commands and print each response block
    Gcode {
        /// Port the controller is attached to
        port: String,
        /// Commands, sent in order
        #[arg(required = true)]
        commands: Vec<String>,
        /// Configured device name to take settings from
        #[arg(long, default_value = "gcode")]
        device: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PeriphlinkConfig> {
    match path {
        Some(path) => PeriphlinkConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(PeriphlinkConfig::default()),
    }
}

/// A configured entry by name, else a default entry for a device kind
fn resolve_device(config: &PeriphlinkConfig, name: &str) -> anyhow::Result<DeviceEntry> {
    if let Some(entry) = config.device(name) {
        return Ok(entry.clone());
    }
    let kind: DeviceKind = name
        .parse()
        .with_context(|| format!("'{}' is neither a configured device nor a device kind", name))?;
    Ok(DeviceEntry {
        name: name.to_string(),
        kind,
        port: None,
        profile: None,
        identification: None,
        ignore_prefixes: Vec::new(),
    })
}

fn candidate_ports(config: &PeriphlinkConfig, entry: &DeviceEntry) -> anyhow::Result<Vec<String>> {
    let ports = config.candidate_ports(entry);
    if !ports.is_empty() {
        return Ok(ports);
    }
    Ok(list_ports()?.into_iter().map(|p| p.port_name).collect())
}

async fn find_port(
    manager: &ConnectionManager,
    config: &PeriphlinkConfig,
    entry: &DeviceEntry,
    ports: Vec<String>,
) -> anyhow::Result<String> {
    let ports = if ports.is_empty() {
        candidate_ports(config, entry)?
    } else {
        ports
    };
    match manager.find_device(&ports).await {
        Some(port) => Ok(port),
        None => bail!("{} not found on {:?}", entry.name, ports),
    }
}

fn print_ports() -> anyhow::Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}\t{}\t{:04x}:{:04x}",
                port.port_name, port.description, vid, pid
            ),
            _ => println!("{}\t{}", port.port_name, port.description),
        }
    }
    Ok(())
}

async fn monitor(mut manager: ConnectionManager, port: &str) -> anyhow::Result<()> {
    let mut events = manager.subscribe();
    if !manager.connect(port).await? {
        bail!("{} did not identify on {}", manager.protocol().label(), port);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(DeviceEvent::Reading(reading)) => println!("{}\t{}", reading.timestamp, reading),
                Ok(DeviceEvent::Data(_)) => {}
                Ok(event) => println!("# {}", event),
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    manager.disconnect().await;
    Ok(())
}

async fn send_gcode(
    mut manager: ConnectionManager,
    port: &str,
    commands: &[String],
) -> anyhow::Result<()> {
    if !manager.connect(port).await? {
        bail!("{} did not identify on {}", manager.protocol().label(), port);
    }

    let mut outcome = Ok(());
    for command in commands {
        match manager.send_command(command.as_str()).await {
            Ok(block) => {
                println!("> {}", command);
                for line in &block.lines {
                    println!("{}", line);
                }
            }
            Err(e) => {
                outcome = Err(anyhow::Error::new(e).context(format!("sending {}", command)));
                break;
            }
        }
    }

    manager.disconnect().await;
    outcome
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    tracing::debug!("periphlink {} built {}", periphlink::VERSION, BUILD_DATE);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Ports => print_ports(),
        Command::Probe { device, ports } => {
            let entry = resolve_device(&config, &device)?;
            let manager = ConnectionManager::serial(device::from_entry(&entry));
            let port = find_port(&manager, &config, &entry, ports).await?;
            println!("{}", port);
            Ok(())
        }
        Command::Monitor { device, port } => {
            let entry = resolve_device(&config, &device)?;
            let manager = ConnectionManager::serial(device::from_entry(&entry));
            let port = match port.or_else(|| entry.port.clone()) {
                Some(port) => port,
                None => find_port(&manager, &config, &entry, Vec::new()).await?,
            };
            monitor(manager, &port).await
        }
        Command::Gcode {
            port,
            commands,
            device,
        } => {
            let entry = resolve_device(&config, &device)?;
            if entry.kind != DeviceKind::Gcode {
                bail!("{} is a {} device, not a G-code controller", entry.name, entry.kind);
            }
            let manager = ConnectionManager::serial(device::from_entry(&entry));
            send_gcode(manager, &port, &commands).await
        }
    }
}
