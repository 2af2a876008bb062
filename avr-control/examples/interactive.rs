//! Interactive receiver console
//!
//! Finds a receiver, prints every state change, and reads commands from
//! stdin. A line starting with an accessor name runs it:
//!
//! ```text
//! setVolume 35
//! getInput
//! on
//! ```
//!
//! Anything else is sent to the receiver as-is (`MV35`, `SI?`, ...).
//!
//! Run with `AVR_LOG_MODE=development` to see connection logs.

use std::net::IpAddr;

use clap::Parser;
use denon_avr::{
    logging, AvrSession, CommandSpec, DiscoveryMode, SessionConfig, StateEvent, StateUpdate,
};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Denon AVR interactive console
#[derive(Parser, Debug)]
#[command(name = "interactive")]
#[command(about = "Control a Denon receiver from the terminal")]
struct Args {
    /// Only adopt beacons advertising this model
    #[arg(short, long, default_value = "AVR-X2400H")]
    model: String,

    /// Resolve this hostname instead of listening for beacons
    #[arg(long)]
    hostname: Option<String>,

    /// Connect to this address directly
    #[arg(short, long)]
    address: Option<IpAddr>,

    /// Control port
    #[arg(short, long, default_value = "23")]
    port: u16,
}

fn print_update(update: &StateUpdate) {
    let snapshot = serde_json::to_string(&update.snapshot).unwrap_or_default();
    match &update.event {
        StateEvent::Property { name, value } => {
            println!("callback: {} = {} {}", name, value, snapshot)
        }
        StateEvent::Unknown { line } => println!("callback: unknown {:?} {}", line, snapshot),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging_from_env()?;
    let args = Args::parse();

    let discovery = match (args.address, args.hostname) {
        (Some(address), _) => DiscoveryMode::Static(address),
        (None, Some(hostname)) => DiscoveryMode::Hostname(hostname),
        (None, None) => DiscoveryMode::Beacon,
    };
    let config = SessionConfig::default()
        .with_model(args.model)
        .with_discovery(discovery)
        .with_port(args.port);

    let session = AvrSession::builder(print_update)
        .with_config(config)
        .build()?;

    session
        .register_command(CommandSpec::new("surroundMode", "MS", "^MS(.+)")?)
        .await?;

    println!("--- Supported accessors");
    for name in session.accessor_names().await? {
        println!("{}", name);
    }
    println!("---");

    let table = session.table().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        let result = if table.resolve_accessor(first).is_ok() {
            session.invoke(first, &args).await.map(Some)
        } else {
            session.command(line).await
        };

        match result {
            Ok(Some(value)) => println!("{} => {}", line, value),
            Ok(None) => println!("{} => sent", line),
            Err(e) => println!("{} => error: {}", line, e),
        }
    }

    session.shutdown().await?;
    Ok(())
}
