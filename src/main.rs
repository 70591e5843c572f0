//! midi-link - keep a MIDI controller connected and watch its traffic

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use midi_link::backend::MidirAccess;
use midi_link::config::{AppConfig, ConfigWatcher};
use midi_link::midi::format_hex;
use midi_link::{Message, MidiDevice, MidiMessage, PortAccess, PortDirection};

/// midi-link - resilient connection to a MIDI controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "midi-link.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Print inbound messages
    #[arg(long)]
    monitor: bool,
}

/// What the print loop receives from the device's listener threads
enum MonitorEvent {
    Connected(bool),
    Messages(Vec<Message>),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    let access: Arc<dyn PortAccess> = Arc::new(MidirAccess::default());

    if args.list_ports {
        list_ports(access.as_ref());
        return Ok(());
    }

    info!("Starting midi-link v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let (config_watcher, initial_config) = ConfigWatcher::new(args.config.clone()).await?;
    info!("Configuration loaded with hot-reload enabled");

    let device = MidiDevice::from_config(access, &initial_config).context("Failed to create MIDI device")?;

    let result = run_app(&device, (*initial_config).clone(), config_watcher, args.monitor).await;

    device.close();
    info!("midi-link shutdown complete");
    result
}

async fn run_app(
    device: &MidiDevice,
    mut config: AppConfig,
    mut config_watcher: ConfigWatcher,
    monitor: bool,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<MonitorEvent>(1024);

    // Listeners run on slot and backend threads; never block them
    let tx = event_tx.clone();
    device.subscribe_connected(move |connected| {
        let _ = tx.try_send(MonitorEvent::Connected(*connected));
    });
    if monitor {
        let tx = event_tx.clone();
        device.subscribe_messages(move |batch| {
            if tx.try_send(MonitorEvent::Messages(batch.to_vec())).is_err() {
                debug!("Monitor queue full, dropping {} message(s)", batch.len());
            }
        });
    }

    device.begin_connect()?;
    info!(
        "Waiting for '{}' (input '{}', output '{}')",
        device.name(),
        config.device.input,
        config.device.output
    );

    let started = Instant::now();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(new_config) = config_watcher.next_config() => {
                apply_config(device, &config, &new_config);
                config = new_config;
            }
            Some(event) = event_rx.recv() => print_event(started, device.name(), &event),
        }
    }

    Ok(())
}

/// Search terms apply to the next connection attempt; everything else needs
/// a restart
fn apply_config(device: &MidiDevice, old: &AppConfig, new: &AppConfig) {
    if old.device.input != new.device.input || old.device.output != new.device.output {
        info!(
            "Applying new search terms (input '{}', output '{}')",
            new.device.input, new.device.output
        );
        device.change_search_terms(new.device.input.clone(), new.device.output.clone());
    }

    if old.timing != new.timing || old.send != new.send || old.device.name != new.device.name {
        warn!("Changes to device.name, timing and send take effect after a restart");
    }
}

fn print_event(started: Instant, device: &str, event: &MonitorEvent) {
    let timestamp = format!("{:08}", started.elapsed().as_millis());

    match event {
        MonitorEvent::Connected(true) => {
            println!("[{}ms] {} {}", timestamp.dimmed(), "●".bright_green(), device.white());
        }
        MonitorEvent::Connected(false) => {
            println!("[{}ms] {} {}", timestamp.dimmed(), "○".bright_red(), device.white());
        }
        MonitorEvent::Messages(messages) => {
            for msg in messages {
                let hex = format_hex(&msg.to_bytes());
                let hex_colored = match msg.typed() {
                    MidiMessage::NoteOn { .. } if msg.is_note_off() => hex.bright_red(),
                    MidiMessage::NoteOn { .. } => hex.bright_green(),
                    MidiMessage::NoteOff { .. } => hex.bright_red(),
                    MidiMessage::ControlChange { .. } => hex.bright_yellow(),
                    MidiMessage::PitchBend { .. } => hex.bright_cyan(),
                    _ => hex.normal(),
                };

                println!(
                    "[{}ms] {} {:20} | {:9} => {}",
                    timestamp.dimmed(),
                    "IN ".bright_blue(),
                    device.white(),
                    hex_colored,
                    msg.to_string().bright_blue()
                );
            }
        }
    }
}

fn list_ports(access: &dyn PortAccess) {
    println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());

    for (direction, title) in [
        (PortDirection::Input, "Input Ports:"),
        (PortDirection::Output, "Output Ports:"),
    ] {
        println!("\n{}", title.bold());
        match access.enumerate(direction) {
            Ok(ports) if ports.is_empty() => println!("  {}", "No ports found".dimmed()),
            Ok(ports) => {
                for port in ports {
                    println!("  {} {}", port.name.bright_white(), format!("[{}]", port.id).dimmed());
                }
            }
            Err(e) => println!("  {}", format!("Enumeration failed: {}", e).red()),
        }
    }

    println!();
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(true),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
