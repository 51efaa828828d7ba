// src/main.rs
//
// portrx command-line tool: list serial ports, watch them come and go, and
// monitor a serial port or TCP peer. Lines typed on stdin are sent with
// `write_line`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use portrx::io::serial::SystemSerialBackend;
use portrx::{
    init_logging, list_ports, load_config, IoError, PortEnumerator, PortRx, PortsConfig,
    SerialPortRx, TcpClientRx,
};

#[derive(Parser)]
#[command(name = "portrx", version, about = "Self-healing serial and TCP monitor")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports with USB details
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the serial port list whenever it changes
    Watch,
    /// Monitor a serial port
    Serial {
        port: String,
        #[arg(long)]
        baud: Option<u32>,
        /// Print inbound data as hex
        #[arg(long)]
        hex: bool,
    },
    /// Monitor a TCP peer
    Tcp {
        host: String,
        port: u16,
        #[arg(long)]
        hex: bool,
        /// Seconds to wait before reconnecting after the connection drops
        #[arg(long)]
        reconnect: Option<u64>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Port(#[from] IoError),

    #[error("failed to enumerate ports: {0}")]
    Enumerate(#[from] std::io::Error),

    #[error("failed to render port list: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => PortsConfig::default(),
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: PortsConfig) -> Result<(), CliError> {
    match command {
        Command::List { json } => list(json),
        Command::Watch => watch(&config).await,
        Command::Serial { port, baud, hex } => {
            let mut serial = config.serial;
            serial.port_name = port;
            if let Some(baud) = baud {
                serial.baud_rate = baud;
            }
            let encoding = serial.encoding;
            let rx = SerialPortRx::new(serial);
            monitor(&rx, None, move |chars: &[char]| {
                if hex {
                    format!("{} ", hex::encode(encoding.encode_chars(chars)))
                } else {
                    chars.iter().collect()
                }
            })
            .await
        }
        Command::Tcp {
            host,
            port,
            hex,
            reconnect,
        } => {
            let mut tcp = config.tcp;
            tcp.host = host;
            tcp.port = port;
            let rx = TcpClientRx::new(tcp);
            monitor(&rx, reconnect.map(Duration::from_secs), move |bytes: &[u8]| {
                if hex {
                    format!("{} ", hex::encode(bytes))
                } else {
                    String::from_utf8_lossy(bytes).into_owned()
                }
            })
            .await
        }
    }
}

fn list(json: bool) -> Result<(), CliError> {
    let ports = list_ports()?;

    if json {
        let text = serde_json::to_string_pretty(&ports)?;
        println!("{}", text);
        return Ok(());
    }

    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        let usb = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" {:04x}:{:04x}", vid, pid),
            _ => String::new(),
        };
        let product = port.product.or(port.manufacturer).unwrap_or_default();
        println!("{:<24} {:<10}{} {}", port.port_name, port.port_type, usb, product);
    }
    Ok(())
}

async fn watch(config: &PortsConfig) -> Result<(), CliError> {
    let enumerator = PortEnumerator::new(Arc::new(SystemSerialBackend), config.serial.poll_interval());
    let mut names = enumerator.subscribe()?;

    loop {
        tokio::select! {
            list = names.recv() => match list {
                Some(list) => println!("{}", list.join(", ")),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Print inbound data and errors, forward stdin lines, until Ctrl-C.
/// With `reconnect` set, a port that dropped after a connection fault is
/// opened again on the next tick.
async fn monitor<P, F>(port: &P, reconnect: Option<Duration>, render: F) -> Result<(), CliError>
where
    P: PortRx,
    F: Fn(&[P::Item]) -> String,
{
    let mut data = port.data_received();
    let mut errors = port.errors();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut stdout = tokio::io::stdout();
    let mut lost: Option<String> = None;

    port.open()?;

    let mut retry = tokio::time::interval(reconnect.unwrap_or(Duration::from_secs(1)));
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(item) = data.recv() => {
                let mut batch = vec![item];
                batch.extend(data.drain());
                let _ = stdout.write_all(render(&batch).as_bytes()).await;
                let _ = stdout.flush().await;
            }
            Some(err) = errors.recv() => {
                eprintln!("! {}", err);
                if err.is_connection_fault() {
                    lost = err.device().map(str::to_string);
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !port.write_line(&line) {
                        eprintln!("! not connected, line dropped");
                    }
                }
                _ => stdin_open = false,
            },
            _ = retry.tick(), if reconnect.is_some() => {
                if port.is_open() {
                    lost = None;
                } else if let Some(device) = &lost {
                    eprintln!("! reopening {}", device);
                    port.open()?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    port.close();
    Ok(())
}
