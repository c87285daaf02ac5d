use clap::{Args, Parser, Subcommand};
use flightlink::config::{get_default_config_path, Config, ConfigError, ConfigLoader};
use flightlink::port::{HealthState, InputListener, Port, PortError, PortListener, PortOptions};
use flightlink::transport::serial::{available_ports, open_serial, LineSettings};
use flightlink::transport::TcpServerPort;
use flightlink::{logging, AppError, AppResult};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Weak};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "flightlink",
    version,
    about = "Talk to flight peripherals over serial, BLE bridges and TCP.",
    long_about = "Opens a byte-stream port, prints what the peer sends and forwards stdin lines to it. Port health changes are reported as JSON lines on stderr."
)]
struct Cli {
    /// Configuration file (overrides the standard search path).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `flightlink=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial devices.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Open a port and relay stdin/stdout until Ctrl+C or end of input.
    #[command(subcommand)]
    Monitor(MonitorTarget),
    /// Inspect or create the configuration file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum MonitorTarget {
    /// A serial device or configured alias.
    Serial {
        path: String,
        /// Line speed; defaults to `serial.default_baud`.
        #[arg(short, long)]
        baud: Option<u32>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Accept TCP clients and broadcast to all of them.
    Tcp {
        /// Listen port; defaults to `tcp.port`.
        #[arg(short, long)]
        port: Option<u16>,
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct OutputArgs {
    /// Print received bytes as hex.
    #[arg(long)]
    hex: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration.
    Show,
    /// Write a default configuration file.
    Init {
        /// Destination; defaults to the per-user config directory.
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

// --- Main Application Entry Point ---
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Warning: logging disabled: {e}");
    }

    match cli.command {
        Command::List { json } => list_ports(json),
        Command::Monitor(target) => monitor(&config, target).await,
        Command::Config(ConfigCommand::Show) => {
            let text = toml::to_string_pretty(&config).map_err(ConfigError::from)?;
            print!("{text}");
            Ok(())
        }
        Command::Config(ConfigCommand::Init { path, force }) => init_config(path, force),
    }
}

fn load_config(path: Option<&PathBuf>) -> AppResult<Config> {
    let loader = match path {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(path) = &loader.config_path {
        debug!("configuration loaded from {}", path.display());
    }
    Ok(loader.into_config())
}

fn init_config(path: Option<PathBuf>, force: bool) -> AppResult<()> {
    let path = path
        .or_else(get_default_config_path)
        .ok_or_else(|| AppError::InvalidArgument("no configuration directory found".into()))?;
    if path.exists() && !force {
        return Err(AppError::InvalidArgument(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    ConfigLoader::with_defaults()?.save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn list_ports(json: bool) -> AppResult<()> {
    let ports = available_ports()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("No serial devices found.");
    }
    for port in ports {
        println!(
            "{:<24} {:<10} {}",
            port.name,
            port.kind,
            port.description.unwrap_or_default()
        );
    }
    Ok(())
}

async fn monitor(config: &Config, target: MonitorTarget) -> AppResult<()> {
    let options = PortOptions::from(&config.io);
    let (name, port, output) = match target {
        MonitorTarget::Serial { path, baud, output } => {
            let path = config.serial.resolve_port(&path);
            let baud = baud.unwrap_or(config.serial.default_baud);
            if baud == 0 {
                return Err(AppError::InvalidArgument("baud rate must be positive".into()));
            }
            let settings = LineSettings::from(&config.serial).with_baud_rate(baud);
            let port = open_serial(&path, &settings, options)?;
            (path, Arc::new(port) as Arc<dyn Port>, output)
        }
        MonitorTarget::Tcp { port, output } => {
            let mut tcp = config.tcp.clone();
            if let Some(port) = port {
                tcp.port = port;
            }
            let server = TcpServerPort::from_config(&tcp, options)?;
            let name = server.local_addr().to_string();
            (name, Arc::new(server) as Arc<dyn Port>, output)
        }
    };

    let status = Arc::new(StatusPrinter {
        name: name.clone(),
        port: Arc::downgrade(&port),
    });
    port.set_listener(Some(status.clone()));
    port.set_input_listener(Some(Arc::new(OutputPrinter { hex: output.hex })));
    status.print("opened", None);

    let (eof_tx, eof_rx) = oneshot::channel();
    let writer = port.clone();
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            forward_stdin(writer.as_ref());
            let _ = eof_tx.send(());
        })?;

    tokio::select! {
        _ = shutdown_signal() => {},
        _ = eof_rx => info!("end of input"),
    }

    if let Err(e) = port.drain() {
        warn!("{}: drain failed: {}", name, e);
    }
    port.close();
    status.print("closed", None);
    Ok(())
}

/// Forward stdin lines to `port`, CR LF terminated, until end of input.
fn forward_stdin(port: &dyn Port) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("stdin read failed: {}", e);
                return;
            }
        };
        match port.write_all(format!("{line}\r\n").as_bytes()) {
            Ok(()) => {}
            Err(PortError::NotConnected) => warn!("no peer connected, line dropped"),
            Err(PortError::NotOpen) => return,
            Err(e) => warn!("write failed: {}", e),
        }
    }
}

#[derive(Serialize)]
struct StatusLine<'a> {
    event: &'a str,
    port: &'a str,
    state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Reports port health as JSON lines on stderr.
struct StatusPrinter {
    name: String,
    port: Weak<dyn Port>,
}

impl StatusPrinter {
    fn print(&self, event: &str, message: Option<&str>) {
        let state = self
            .port
            .upgrade()
            .map_or(HealthState::Failed, |port| port.state());
        let line = StatusLine {
            event,
            port: &self.name,
            state,
            message,
        };
        match serde_json::to_string(&line) {
            Ok(json) => eprintln!("{json}"),
            Err(e) => warn!("status line not serializable: {}", e),
        }
    }
}

impl PortListener for StatusPrinter {
    fn on_state_changed(&self) {
        self.print("state", None);
    }

    fn on_error(&self, message: &str) {
        self.print("error", Some(message));
    }
}

/// Copies received bytes to stdout.
struct OutputPrinter {
    hex: bool,
}

impl InputListener for OutputPrinter {
    fn on_data_received(&self, data: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let result = if self.hex {
            let text: Vec<String> = data.iter().map(|b| format!("{b:02x}")).collect();
            writeln!(stdout, "{}", text.join(" "))
        } else {
            stdout.write_all(data)
        };
        if let Err(e) = result.and_then(|()| stdout.flush()) {
            debug!("stdout write failed: {}", e);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, shutting down");
}
