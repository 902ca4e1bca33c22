// kartlink test application -- CLI tool for exercising a kart tracker
// radio link against real hardware or a simulated radio.
//
// Usage:
//   kartlink-test-app list
//   kartlink-test-app --port /dev/ttyACM0 monitor
//   kartlink-test-app --port /dev/ttyACM0 send "box this lap"
//   kartlink-test-app --mock monitor --duration 10
//   kartlink-test-app --mock --drop-acks 2 send "pit"
//
// Logging goes to stderr and is controlled with RUST_LOG, e.g.
//   RUST_LOG=kartlink_link=debug kartlink-test-app --mock monitor

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use kartlink::transport::{PortChooser, SerialPortProvider, available_ports};
use kartlink::{CommandMessage, Link, LinkBuilder, LinkEvent, PortInfo, SelectionState};
use kartlink_test_harness::{MockPort, MockPortProvider};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// kartlink test application -- talks to a kart tracker base-station radio.
#[derive(Parser)]
#[command(name = "kartlink-test-app", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyACM0, COM3). Without it, a single
    /// attached port is used automatically and several ports are offered
    /// in a prompt.
    #[arg(long)]
    port: Option<String>,

    /// Serial speed.
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Acknowledgment timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    ack_timeout_ms: u64,

    /// Give up on a command after this many retries.
    #[arg(long, default_value_t = 10, conflicts_with = "unbounded")]
    max_retries: u32,

    /// Retry unacknowledged commands until the session changes.
    #[arg(long)]
    unbounded: bool,

    /// Use a simulated radio instead of a real serial port.
    #[arg(long)]
    mock: bool,

    /// With --mock: number of writes of each command the simulated radio
    /// ignores before acknowledging it.
    #[arg(long, default_value_t = 0, requires = "mock")]
    drop_acks: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List serial ports.
    List,

    /// Print telemetry and link events.
    Monitor {
        /// Stop after this many seconds (0 = until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Send a command and wait for its acknowledgment.
    Send {
        /// Command text.
        text: String,
    },
}

// ---------------------------------------------------------------------------
// Link construction
// ---------------------------------------------------------------------------

fn configure(cli: &Cli, builder: LinkBuilder) -> LinkBuilder {
    let builder = builder
        .baud_rate(cli.baud)
        .ack_timeout(Duration::from_millis(cli.ack_timeout_ms));
    if cli.unbounded {
        builder.unbounded_retries()
    } else {
        builder.max_retries(cli.max_retries)
    }
}

async fn create_link(cli: &Cli) -> Result<Link> {
    if cli.mock {
        let provider = MockPortProvider::new().with_known_ports(vec![
            PortInfo::new("mock0").with_description("simulated tracker radio"),
        ]);
        let link = configure(cli, LinkBuilder::new(provider.clone()))
            .build()
            .await
            .context("failed to build link with simulated radio")?;
        let port = provider
            .last_opened()
            .context("simulated radio did not open")?;
        tokio::spawn(simulate_radio(port, cli.drop_acks));
        println!("Connected (simulated radio)");
        return Ok(link);
    }

    let mut provider = SerialPortProvider::new(Arc::new(StdinChooser));
    if let Some(port) = &cli.port {
        provider = provider.authorize(PortInfo::new(port.as_str()));
    }
    let link = configure(cli, LinkBuilder::new(provider))
        .build()
        .await
        .context("failed to build link")?;

    link.connect(false).await.context("failed to open port")?;
    match &*link.selection().borrow() {
        SelectionState::Selected(port) => println!("Connected -- {port}"),
        _ => bail!("no port selected"),
    }
    if link.current_generation().is_none() {
        bail!("port is selected but no session is open");
    }
    Ok(link)
}

// ---------------------------------------------------------------------------
// Simulated radio
// ---------------------------------------------------------------------------

/// Plays the base-station radio on a mock port: one telemetry record per
/// second, and an acknowledgment for every command write after the first
/// `drop_acks` writes of it.
async fn simulate_radio(port: MockPort, drop_acks: u32) {
    tracing::info!(port = port.name(), drop_acks, "simulated radio started");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut handled = 0;
    let mut lap = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                lap += 1;
                port.push_line(&simulated_telemetry(lap));
            }
            _ = port.wait_for_writes(handled + 1) => {
                let sent = port.sent_strings();
                for raw in &sent[handled..] {
                    let Ok(command) = serde_json::from_str::<CommandMessage>(raw) else {
                        continue;
                    };
                    if command.retry_counter.unwrap_or(0) >= drop_acks {
                        port.push_line(&simulated_ack(raw));
                    }
                }
                handled = sent.len();
            }
        }
    }
}

fn simulated_telemetry(lap: u32) -> String {
    let angle = f64::from(lap % 60) / 60.0 * std::f64::consts::TAU;
    serde_json::json!({
        "recipient": "base",
        "sender": "kart-1",
        "rssi": -72,
        "snr": 9.5,
        "data": {
            "lat": 52.0 + 0.001 * angle.sin(),
            "lng": 4.0 + 0.001 * angle.cos(),
            "speed": 40.0,
            "course": angle.to_degrees(),
            "battery": 90,
            "satellites": 11,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    })
    .to_string()
}

fn simulated_ack(raw_command: &str) -> String {
    serde_json::json!({
        "recipient": "base",
        "sender": "kart-1",
        "data": { "type": "command_ack", "content": { "content": raw_command } }
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_list() -> Result<()> {
    let ports = available_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }
    println!("{:<24} Description", "Port");
    println!("{}", "-".repeat(48));
    for port in ports {
        println!(
            "{:<24} {}",
            port.name,
            port.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_monitor(link: &Link, duration_secs: u64) -> Result<()> {
    let mut telemetry = link.subscribe_telemetry();
    let mut events = link.subscribe_events();
    let mut connected = link.connected();

    println!("Monitoring link (Ctrl-C to stop)...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    let sleep = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => {
                println!("Monitor duration elapsed.");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
            record = telemetry.recv() => match record {
                Ok(t) => println!(
                    "[telemetry] {} lat={:?} lng={:?} speed={:?} battery={:?} at {}",
                    t.sender, t.data.lat, t.data.lng, t.data.speed, t.data.battery,
                    t.data.timestamp.to_rfc3339()
                ),
                Err(RecvError::Lagged(n)) => println!("[warning] missed {n} telemetry records"),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(event) => println!("[event] {event:?}"),
                Err(RecvError::Lagged(n)) => println!("[warning] missed {n} events"),
                Err(RecvError::Closed) => break,
            },
            Ok(()) = connected.changed() => {
                let up = *connected.borrow_and_update();
                println!("[link] {}", if up { "receiving" } else { "silent" });
            }
        }
    }

    let stats = link.stats();
    println!(
        "telemetry={} acks={} malformed={} unknown={}",
        stats.telemetry, stats.acks, stats.malformed, stats.unknown
    );
    Ok(())
}

async fn cmd_send(link: &Link, text: &str) -> Result<()> {
    let mut events = link.subscribe_events();
    let pending = link.submit(text).context("failed to submit command")?;
    let uuid = pending.uuid();
    println!("Sent {uuid}");

    let started = Instant::now();
    let outcome = pending.outcome();
    tokio::pin!(outcome);

    loop {
        tokio::select! {
            result = &mut outcome => {
                let acked = result.with_context(|| format!("command {uuid} not acknowledged"))?;
                println!(
                    "Acknowledged after {} retries in {:.1}s",
                    acked.retry_counter.unwrap_or(0),
                    started.elapsed().as_secs_f64()
                );
                return Ok(());
            }
            Ok(LinkEvent::CommandRetried { uuid: id, retry_counter }) = events.recv() => {
                if id == uuid {
                    println!("  no ack yet, retry {retry_counter}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Port prompt
// ---------------------------------------------------------------------------

/// Prompts on the terminal with a numbered list of ports.
struct StdinChooser;

#[async_trait]
impl PortChooser for StdinChooser {
    async fn choose(&self, candidates: &[PortInfo]) -> kartlink::Result<Option<PortInfo>> {
        if candidates.is_empty() {
            println!("No serial ports found.");
            return Ok(None);
        }
        let candidates = candidates.to_vec();
        tokio::task::spawn_blocking(move || prompt(&candidates))
            .await
            .map_err(|e| kartlink::Error::Transport(format!("port prompt failed: {e}")))?
            .map_err(kartlink::Error::Io)
    }
}

fn prompt(candidates: &[PortInfo]) -> io::Result<Option<PortInfo>> {
    for (i, port) in candidates.iter().enumerate() {
        println!("  {}) {port}", i + 1);
    }
    print!("Select port (empty to cancel): ");
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| candidates.get(i).cloned()))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    // `list` does not need a link.
    if matches!(cli.command, Command::List) {
        return cmd_list();
    }

    let link = create_link(&cli).await?;
    let result = match &cli.command {
        Command::Monitor { duration } => cmd_monitor(&link, *duration).await,
        Command::Send { text } => cmd_send(&link, text).await,
        Command::List => unreachable!("list handled above"),
    };
    link.shutdown().await;
    result
}
