//! Receiver session
//!
//! An [`AvrSession`] is a cheap handle to a background task that owns
//! everything about one receiver: the command table, the property snapshot,
//! the dispatcher queue and the connection. Handles send requests over a
//! channel and await the reply, so any number of clones can issue commands
//! concurrently while the task keeps a single line of control.
//!
//! The task reacts to four sources:
//!
//! - requests from handles
//! - discovery records (beacon listener or hostname lookup)
//! - connection events (connected, line read, closed)
//! - one timer armed for the earliest pending deadline: command timeout,
//!   retry hold, reconnect backoff, probe spacing or the collect pass
//!
//! # Example
//!
//! ```rust,no_run
//! use denon_avr::{AvrSession, SessionConfig};
//!
//! # async fn run() -> denon_avr::Result<()> {
//! let session = AvrSession::builder(|update| println!("{:?}", update.event))
//!     .with_config(SessionConfig::hostname("denon-avr-x2400h.local"))
//!     .build()?;
//!
//! session.set_volume(35).await?;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use denon_discovery::{
    spawn_beacon_discovery, spawn_hostname_discovery, BeaconConfig, DiscoveryRecord,
    LocalInterfaces, ReachabilityCheck,
};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::command::CommandSpec;
use crate::config::{DiscoveryMode, SessionConfig};
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::decoder;
use crate::dispatcher::{Dispatcher, Matcher, PendingCommand, Reply, TimeoutOutcome};
use crate::error::{AvrError, Result};
use crate::state::{PropertyState, PropertyValue, StateUpdate};
use crate::table::CommandTable;

/// Callback receiving every classified or unknown inbound line.
pub type StateCallback = Arc<dyn Fn(&StateUpdate) + Send + Sync>;

/// Point-in-time view of the session's connection and queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Adopted receiver address
    pub address: Option<SocketAddr>,
    pub connection: ConnectionState,
    /// Commands waiting behind the in-flight one
    pub queued: usize,
    /// Wire text of the command awaiting its response
    pub in_flight: Option<String>,
}

enum Request {
    Set {
        name: String,
        value: PropertyValue,
        reply: Reply,
    },
    Get {
        name: String,
        reply: Reply,
    },
    Raw {
        wire: String,
        pattern: Option<Regex>,
        reply: Reply,
    },
    Register {
        spec: CommandSpec,
        reply: oneshot::Sender<Result<()>>,
    },
    Table {
        reply: oneshot::Sender<CommandTable>,
    },
    Snapshot {
        reply: oneshot::Sender<PropertyState>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Discovered(DiscoveryRecord),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for an [`AvrSession`].
///
/// The state callback is required; everything else has defaults:
/// [`SessionConfig::default`] (beacon discovery), the standard command table
/// and reachability checked against the host's interfaces.
pub struct SessionBuilder {
    config: SessionConfig,
    table: Option<CommandTable>,
    reachability: Arc<dyn ReachabilityCheck>,
    beacon: BeaconConfig,
    callback: StateCallback,
}

impl SessionBuilder {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&StateUpdate) + Send + Sync + 'static,
    {
        Self {
            config: SessionConfig::default(),
            table: None,
            reachability: Arc::new(LocalInterfaces),
            beacon: BeaconConfig::default(),
            callback: Arc::new(callback),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default command table.
    pub fn with_table(mut self, table: CommandTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Replace the check deciding whether a discovered address is usable.
    pub fn with_reachability<R>(mut self, reachability: R) -> Self
    where
        R: ReachabilityCheck + 'static,
    {
        self.reachability = Arc::new(reachability);
        self
    }

    pub fn with_beacon_config(mut self, beacon: BeaconConfig) -> Self {
        self.beacon = beacon;
        self
    }

    /// Validate the configuration, start discovery and spawn the session task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<AvrSession> {
        self.config.validate()?;
        let table = match self.table {
            Some(table) => table,
            None => CommandTable::with_defaults()?,
        };

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();

        let mut discovery_tasks = Vec::new();
        match &self.config.discovery {
            DiscoveryMode::Beacon => {
                let tx = discovery_tx;
                discovery_tasks.push(spawn_beacon_discovery(self.beacon, move |record| {
                    let _ = tx.send(record);
                })?);
            }
            DiscoveryMode::Hostname(hostname) => {
                let tx = discovery_tx;
                discovery_tasks.push(spawn_hostname_discovery(
                    hostname.clone(),
                    self.config.port,
                    move |result| match result {
                        Ok(record) => {
                            let _ = tx.send(record);
                        }
                        Err(e) => tracing::warn!("Hostname discovery failed: {}", e),
                    },
                ));
            }
            DiscoveryMode::Static(_) | DiscoveryMode::Manual => {}
        }

        let actor = SessionActor {
            dispatcher: Dispatcher::new(self.config.command_timeout, self.config.retry_interval),
            connection: ConnectionManager::new(&self.config, event_tx),
            config: self.config,
            table,
            state: PropertyState::new(),
            reachability: self.reachability,
            callback: self.callback,
            requests: request_rx,
            events: event_rx,
            discoveries: discovery_rx,
            discovery_tasks,
        };
        tokio::spawn(actor.run());

        Ok(AvrSession {
            requests: request_tx,
        })
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a running receiver session.
///
/// Cloning is cheap; all clones talk to the same session. The session stops
/// when [`AvrSession::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct AvrSession {
    requests: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for AvrSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvrSession")
            .field("closed", &self.requests.is_closed())
            .finish()
    }
}

impl AvrSession {
    /// Start building a session around a state-change callback.
    pub fn builder<F>(callback: F) -> SessionBuilder
    where
        F: Fn(&StateUpdate) + Send + Sync + 'static,
    {
        SessionBuilder::new(callback)
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| AvrError::SessionClosed)?;
        rx.await.map_err(|_| AvrError::SessionClosed)
    }

    /// Set a property and wait for the receiver to confirm it.
    ///
    /// Resolves immediately, without sending anything, when the cached value
    /// already equals `value`.
    pub async fn set_property(
        &self,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<PropertyValue> {
        let value = value.into();
        let reply = self
            .call(|reply| Request::Set {
                name: name.to_string(),
                value,
                reply,
            })
            .await??;
        require_value(name, reply)
    }

    /// Query a property and wait for the receiver's report.
    pub async fn get_property(&self, name: &str) -> Result<PropertyValue> {
        let reply = self
            .call(|reply| Request::Get {
                name: name.to_string(),
                reply,
            })
            .await??;
        require_value(name, reply)
    }

    /// Send raw wire text.
    ///
    /// When the text starts with a registered prefix the command waits for
    /// that property's response; otherwise it resolves with `None` as soon
    /// as it is written.
    pub async fn command(&self, wire: &str) -> Result<Option<PropertyValue>> {
        self.call(|reply| Request::Raw {
            wire: wire.to_string(),
            pattern: None,
            reply,
        })
        .await?
    }

    /// Send raw wire text and wait for a line matching `pattern`.
    ///
    /// The result is the pattern's first capture group, or the whole match.
    pub async fn command_matching(&self, wire: &str, pattern: &str) -> Result<PropertyValue> {
        let pattern = Regex::new(pattern)?;
        let reply = self
            .call(|reply| Request::Raw {
                wire: wire.to_string(),
                pattern: Some(pattern),
                reply,
            })
            .await??;
        require_value(wire, reply)
    }

    /// Add a command to the session's table.
    pub async fn register_command(&self, spec: CommandSpec) -> Result<()> {
        self.call(|reply| Request::Register { spec, reply }).await?
    }

    /// Copy of the session's command table.
    pub async fn table(&self) -> Result<CommandTable> {
        self.call(|reply| Request::Table { reply }).await
    }

    /// Accessor names derived from the session's command table.
    pub async fn accessor_names(&self) -> Result<Vec<String>> {
        Ok(self.table().await?.accessor_names())
    }

    /// Current property snapshot. Empty while disconnected.
    pub async fn snapshot(&self) -> Result<PropertyState> {
        self.call(|reply| Request::Snapshot { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.call(|reply| Request::Status { reply }).await
    }

    /// Feed a discovery record to the session, as the discovery sources do.
    ///
    /// This is how addresses arrive in [`DiscoveryMode::Manual`].
    pub fn discovered(&self, record: DiscoveryRecord) -> Result<()> {
        self.requests
            .send(Request::Discovered(record))
            .map_err(|_| AvrError::SessionClosed)
    }

    /// Stop the session. Pending commands fail with
    /// [`AvrError::SessionClosed`].
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Request::Shutdown { reply }).await
    }
}

// Property and pattern matchers always produce a value
fn require_value(name: &str, value: Option<PropertyValue>) -> Result<PropertyValue> {
    value.ok_or_else(|| AvrError::UnknownProperty(name.to_string()))
}

// ============================================================================
// Session task
// ============================================================================

struct SessionActor {
    config: SessionConfig,
    table: CommandTable,
    state: PropertyState,
    dispatcher: Dispatcher,
    connection: ConnectionManager,
    reachability: Arc<dyn ReachabilityCheck>,
    callback: StateCallback,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    discoveries: mpsc::UnboundedReceiver<DiscoveryRecord>,
    discovery_tasks: Vec<JoinHandle<()>>,
}

impl SessionActor {
    async fn run(mut self) {
        if let DiscoveryMode::Static(address) = self.config.discovery {
            self.adopt(address);
        }

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                request = self.requests.recv() => {
                    match request {
                        Some(request) => {
                            if !self.handle_request(request) {
                                return;
                            }
                        }
                        None => break,
                    }
                }
                Some(record) = self.discoveries.recv() => {
                    self.on_discovered(record);
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timer().await;
                }
            }

            self.pump().await;
        }

        tracing::debug!("All session handles dropped");
        self.close();
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.dispatcher.next_deadline(), self.connection.next_deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    fn close(&mut self) {
        if !self.dispatcher.is_idle() {
            tracing::debug!("Failing pending commands");
        }
        self.dispatcher.close();
        self.connection.close();
        for task in self.discovery_tasks.drain(..) {
            task.abort();
        }
        tracing::info!("Session closed");
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Returns false once the session should stop.
    fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::Set { name, value, reply } => self.enqueue_set(&name, value, reply),
            Request::Get { name, reply } => self.enqueue_get(&name, reply),
            Request::Raw {
                wire,
                pattern,
                reply,
            } => self.enqueue_raw(wire, pattern, reply),
            Request::Register { spec, reply } => {
                let _ = reply.send(self.table.register(spec));
            }
            Request::Table { reply } => {
                let _ = reply.send(self.table.clone());
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.state.clone());
            }
            Request::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    address: self.connection.target(),
                    connection: self.connection.state(),
                    queued: self.dispatcher.queued(),
                    in_flight: self.dispatcher.in_flight().map(str::to_string),
                });
            }
            Request::Discovered(record) => self.on_discovered(record),
            Request::Shutdown { reply } => {
                self.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn enqueue_set(&mut self, name: &str, value: PropertyValue, reply: Reply) {
        let prepared = self.table.require(name).cloned().and_then(|spec| {
            let value = spec.normalize(value)?;
            let wire = spec.set_command(&value)?;
            Ok((spec, value, wire))
        });
        let (spec, value, wire) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        if self.connection.target().is_none() {
            let _ = reply.send(Err(AvrError::NotReady));
            return;
        }

        if self.state.get(spec.name()) == Some(&value) {
            tracing::debug!("{} already {}; nothing to send", spec.name(), value);
            let _ = reply.send(Ok(Some(value)));
            return;
        }

        self.dispatcher.enqueue(PendingCommand::new(
            wire,
            Matcher::Property(spec),
            self.config.retry_count,
            reply,
        ));
    }

    fn enqueue_get(&mut self, name: &str, reply: Reply) {
        let spec = match self.table.require(name) {
            Ok(spec) => spec.clone(),
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if self.connection.target().is_none() {
            let _ = reply.send(Err(AvrError::NotReady));
            return;
        }

        self.dispatcher.enqueue(PendingCommand::new(
            spec.get_command(),
            Matcher::Property(spec),
            self.config.retry_count,
            reply,
        ));
    }

    fn enqueue_raw(&mut self, wire: String, pattern: Option<Regex>, reply: Reply) {
        if self.connection.target().is_none() {
            let _ = reply.send(Err(AvrError::NotReady));
            return;
        }

        let matcher = match pattern {
            Some(pattern) => Matcher::Pattern(pattern),
            None => self
                .table
                .for_wire(&wire)
                .map(|spec| Matcher::Property(spec.clone()))
                .unwrap_or(Matcher::None),
        };
        self.dispatcher.enqueue(PendingCommand::new(
            wire,
            matcher,
            self.config.retry_count,
            reply,
        ));
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    fn on_discovered(&mut self, record: DiscoveryRecord) {
        if let Some(wanted) = &self.config.model {
            if !record.matches_model(wanted) {
                tracing::debug!(
                    "Ignoring {:?} at {} (want {})",
                    record.model(),
                    record.address,
                    wanted
                );
                return;
            }
        }
        if !self.reachability.is_reachable(record.address) {
            tracing::debug!("Ignoring unreachable receiver at {}", record.address);
            return;
        }
        self.adopt(record.address);
    }

    fn adopt(&mut self, address: IpAddr) {
        let target = SocketAddr::new(address, self.config.port);
        if self.connection.target() == Some(target) {
            return;
        }

        tracing::info!("Adopting receiver at {}", target);
        if self.connection.has_connection() {
            if let Some(command) = self.dispatcher.abort_in_flight() {
                tracing::info!("Aborted {:?}: receiver address changed", command);
            }
            self.connection.close();
            self.state.clear();
        }

        self.connection.set_target(target);
        self.connection.connect();
    }

    // ------------------------------------------------------------------------
    // Connection events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: ConnectionEvent) {
        let Some(event) = self.connection.filter_event(event) else {
            return;
        };
        let now = Instant::now();

        match event {
            ConnectionEvent::Connected { generation, writer } => {
                if self.connection.on_connected(generation, writer, now) {
                    if let Some(target) = self.connection.target() {
                        tracing::info!("Connected to receiver at {}", target);
                    }
                }
            }
            ConnectionEvent::Failed { generation, error } => {
                if self.connection.on_closed(generation, now) {
                    self.state.clear();
                    tracing::warn!("Connecting to receiver failed: {}", error);
                }
            }
            ConnectionEvent::Line { line, .. } => self.on_line(line, now),
            ConnectionEvent::Closed { generation, error } => {
                if self.connection.on_closed(generation, now) {
                    self.state.clear();
                    match error {
                        Some(e) => tracing::warn!("Connection lost: {}", e),
                        None => tracing::info!("Receiver closed the connection"),
                    }
                }
            }
        }
    }

    fn on_line(&mut self, line: String, now: Instant) {
        tracing::debug!("<- {}", line);
        let event = decoder::classify(&self.table, &line);

        if self.dispatcher.on_line(&line, now) {
            decoder::apply(&mut self.state, &event);
            return;
        }

        decoder::apply(&mut self.state, &event);
        (self.callback)(&StateUpdate {
            event,
            snapshot: self.state.clone(),
        });
    }

    // ------------------------------------------------------------------------
    // Timers and writes
    // ------------------------------------------------------------------------

    async fn on_timer(&mut self) {
        let now = Instant::now();

        if self.dispatcher.timed_out(now) {
            if let Some(outcome) = self.dispatcher.on_timeout(now) {
                match &outcome {
                    TimeoutOutcome::Retrying { attempt, .. } => tracing::warn!(
                        "Command {:?} timed out (attempt {}); retrying",
                        outcome.command(),
                        attempt
                    ),
                    TimeoutOutcome::Exhausted { attempts, .. } => tracing::warn!(
                        "Command {:?} failed after {} attempts",
                        outcome.command(),
                        attempts
                    ),
                }
                // An unanswered command means the connection is stuck
                if self.connection.is_connected() {
                    self.drop_connection(now);
                }
            }
        }

        if self.connection.reconnect_due(now) {
            self.connection.connect();
        }

        if let Some(probe) = self.connection.take_due_probe(now) {
            self.write_line(probe).await;
        }

        if self.connection.take_due_collect(now) {
            self.collect().await;
        }
    }

    /// Query every property the probes left unknown.
    async fn collect(&mut self) {
        let queries: Vec<String> = self
            .table
            .iter()
            .filter(|spec| !self.state.contains(spec.name()))
            .map(|spec| spec.get_command())
            .collect();

        tracing::debug!("Collecting {} unknown properties", queries.len());
        for query in queries {
            if !self.write_line(&query).await {
                break;
            }
        }
    }

    /// Dispatch queued commands and write whatever is ready to go.
    async fn pump(&mut self) {
        loop {
            if self.dispatcher.poll_dispatch(Instant::now()) && !self.connection.is_connected() {
                self.connection.ensure_connecting();
            }

            let Some(wire) = self.dispatcher.unsent().map(str::to_string) else {
                break;
            };
            if !self.connection.is_connected() {
                break;
            }
            if !self.write_line(&wire).await {
                break;
            }
            self.dispatcher.mark_sent();
        }
    }

    async fn write_line(&mut self, line: &str) -> bool {
        match self.connection.write(line).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Write to receiver failed: {}", e);
                self.drop_connection(Instant::now());
                false
            }
        }
    }

    fn drop_connection(&mut self, now: Instant) {
        self.connection.disconnect(now);
        self.state.clear();
    }
}
