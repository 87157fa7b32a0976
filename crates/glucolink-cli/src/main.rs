//! Command-line monitor for CGM sensor links.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

use glucolink_core::{
    BtleRadio, CentralCoordinator, LinkConfig, LinkEvent, SensorIdentity, SensorLinkDelegate,
};
use glucolink_types::GlucoseReading;

#[derive(Parser)]
#[command(name = "glucolink")]
#[command(author, version, about = "Monitor a CGM sensor over BLE", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for sensors and print what is found
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "15")]
        timeout: u64,
    },

    /// Connect to a sensor and stream readings until interrupted
    Monitor {
        /// Remembered sensor name (e.g. "DXCM7A"); first match wins when
        /// omitted
        #[arg(short, long)]
        sensor: Option<String>,

        /// Print events as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },
}

/// Delegate that prints link activity to the terminal.
struct TerminalDelegate;

#[async_trait]
impl SensorLinkDelegate for TerminalDelegate {
    async fn sensor_connected(&self, name: &str) {
        println!("connected to {name}");
    }

    async fn sensor_disconnected(&self, suspected_end_of_session: bool) {
        if suspected_end_of_session {
            println!("disconnected (sensor session appears to be over)");
        } else {
            println!("disconnected, retrying...");
        }
    }

    async fn sensor_error(&self, kind: &str, detail: &str) {
        eprintln!("error [{kind}]: {detail}");
    }

    async fn sensor_read(&self, reading: GlucoseReading) {
        let flag = if reading.is_display_only {
            " (display only)"
        } else {
            ""
        };
        println!("{}  {}{flag}", reading.timestamp, reading);
    }

    async fn sensor_read_backfill(&self, readings: Vec<GlucoseReading>) {
        println!("backfill: {} readings", readings.len());
        for reading in readings {
            println!("  {}  {}", reading.timestamp, reading);
        }
    }

    async fn sensor_discovered_new(&self, name: &str, activated_at: OffsetDateTime) -> bool {
        println!("adopting sensor {name} (activated {activated_at})");
        true
    }
}

/// Delegate for JSON mode: adopts sensors silently, output comes from the
/// broadcast stream.
struct QuietDelegate;

#[async_trait]
impl SensorLinkDelegate for QuietDelegate {
    async fn sensor_discovered_new(&self, _name: &str, _activated_at: OffsetDateTime) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Scan { timeout } => scan(timeout).await,
        Commands::Monitor { sensor, json } => monitor(sensor, json).await,
    }
}

/// Run a discovery pass and print every matching sensor seen.
async fn scan(timeout: u64) -> Result<()> {
    let radio = Arc::new(BtleRadio::new().await?);
    let link = CentralCoordinator::start(
        radio,
        Arc::new(TerminalDelegate),
        LinkConfig::default(),
        None,
    )
    .await?;
    let mut events = link.subscribe();

    println!("scanning for {timeout}s...");
    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                if let Ok(LinkEvent::ConnectionStatusChanged) = event {
                    let status = link.status();
                    if let Some(peripheral) = status.active_peripheral {
                        println!("found sensor at {peripheral}");
                    }
                }
            }
        }
    }
    link.stop();
    Ok(())
}

/// Stream readings until interrupted.
async fn monitor(sensor: Option<String>, json: bool) -> Result<()> {
    let radio = Arc::new(BtleRadio::new().await?);
    let remembered = sensor.map(|name| SensorIdentity {
        name,
        peripheral: None,
    });
    let delegate: Arc<dyn SensorLinkDelegate> = if json {
        Arc::new(QuietDelegate)
    } else {
        Arc::new(TerminalDelegate)
    };
    let link =
        CentralCoordinator::start(radio, delegate, LinkConfig::default(), remembered).await?;

    if json {
        // JSON mode prints the broadcast stream instead of delegate text.
        let mut events = link.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        });
    }

    info!("monitoring; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    link.stop();
    println!("stopped");
    Ok(())
}
