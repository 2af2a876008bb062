//! Denon AV receiver control
//!
//! A stateful client for receivers speaking the Denon telnet line protocol
//! (TCP port 23, carriage-return terminated commands such as `MV35` or
//! `SI?`).
//!
//! # Features
//!
//! - **Discovery**: find the receiver from its AMX beacon or a hostname
//! - **Keep-alive**: one long-lived connection, reconnected with exponential
//!   backoff whenever it drops
//! - **Single-flight commands**: one command on the wire at a time, each with
//!   its own timeout and retry budget
//! - **Live state**: every reported property lands in a snapshot handed to
//!   your callback
//! - **Extensible**: register extra commands at runtime
//!
//! # Architecture
//!
//! ```text
//! Discovery ─┐
//!            ├→ Session task ─→ Connection ─→ receiver
//! Handles ───┘   (Dispatcher)  ←─ lines ──┘
//!                    │
//!                    └→ Decoder → PropertyState → callback
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use denon_avr::{AvrSession, SessionConfig, StateEvent};
//!
//! # async fn run() -> denon_avr::Result<()> {
//! let session = AvrSession::builder(|update| {
//!     if let StateEvent::Property { name, value } = &update.event {
//!         println!("{} = {}", name, value);
//!     }
//! })
//! .with_config(SessionConfig::default().with_model("AVR-X2400H"))
//! .build()?;
//!
//! session.power_on().await?;
//! session.set_volume(35).await?;
//! println!("Input: {}", session.input().await?);
//! # Ok(())
//! # }
//! ```
//!
//! # Custom Commands
//!
//! ```rust,no_run
//! use denon_avr::{AvrSession, CommandSpec};
//!
//! # async fn run(session: AvrSession) -> denon_avr::Result<()> {
//! session
//!     .register_command(CommandSpec::new("surroundMode", "MS", "^MS(.+)")?)
//!     .await?;
//! session.set_property("surroundMode", "STEREO").await?;
//! # Ok(())
//! # }
//! ```

mod accessors;
mod backoff;
pub mod codec;
mod command;
mod config;
mod connection;
mod decoder;
mod dispatcher;
mod error;
pub mod logging;
mod session;
mod state;
mod table;

pub use command::{Accessor, CommandSpec, ValueDict};
pub use config::{DiscoveryMode, SessionConfig, DEFAULT_PORT};
pub use connection::{ConnectionState, PROBES};
pub use decoder::classify;
pub use error::{AvrError, Result};
pub use session::{AvrSession, SessionBuilder, SessionStatus, StateCallback};
pub use state::{PropertyState, PropertyValue, StateEvent, StateUpdate};
pub use table::{CommandTable, DYNAMIC_VOLUME, INPUT, MUTED, POWER, VOLUME};

// Re-export discovery types callers need to configure a session
pub use denon_discovery::{BeaconConfig, DiscoveryRecord, DiscoverySource, ReachabilityCheck};
