//! Connection manager
//!
//! Owns the one TCP connection a session keeps to its receiver. Each connect
//! attempt runs on its own task, which after connecting keeps reading lines
//! and forwards them as [`ConnectionEvent`]s tagged with the attempt's
//! generation. The write half is handed back to the session actor, so all
//! writes happen on the actor's task.
//!
//! ```text
//! Disconnected --connect()--> Connecting --Connected--> Connected
//!      ^                           |                        |
//!      +------ reconnect_at <------+----- Failed/Closed ----+
//! ```
//!
//! Retiring a connection (drop, replacement, timeout reset) aborts its task.
//! Any event it already queued carries a generation that no longer matches
//! and is ignored.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::backoff::Backoff;
use crate::codec::LineCodec;
use crate::config::SessionConfig;
use crate::error::ConnectionError;

/// Queries written right after connecting to prime the property state.
pub const PROBES: [&str; 4] = ["ZM?", "MV?", "MU?", "SI?"];

pub(crate) type LineWriter = FramedWrite<OwnedWriteHalf, LineCodec>;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events sent from connection tasks to the session actor.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Connected { generation: u64, writer: LineWriter },
    Failed { generation: u64, error: ConnectionError },
    Line { generation: u64, line: String },
    Closed { generation: u64, error: Option<ConnectionError> },
}

/// Connect to `address` and forward everything read from it.
fn spawn_connection(
    address: SocketAddr,
    generation: u64,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = events.send(ConnectionEvent::Failed {
                    generation,
                    error: e.into(),
                });
                return;
            }
            Err(_) => {
                let _ = events.send(ConnectionEvent::Failed {
                    generation,
                    error: ConnectionError::ConnectTimeout(connect_timeout),
                });
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }

        let (read_half, write_half) = stream.into_split();
        let writer = FramedWrite::new(write_half, LineCodec::new());
        if events
            .send(ConnectionEvent::Connected { generation, writer })
            .is_err()
        {
            return;
        }

        let mut reader = FramedRead::new(read_half, LineCodec::new());
        while let Some(item) = reader.next().await {
            match item {
                Ok(line) => {
                    if events.send(ConnectionEvent::Line { generation, line }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events.send(ConnectionEvent::Closed {
                        generation,
                        error: Some(e.into()),
                    });
                    return;
                }
            }
        }

        let _ = events.send(ConnectionEvent::Closed {
            generation,
            error: None,
        });
    })
}

/// The live connection: its generation, reader task and write half.
#[derive(Debug)]
struct ConnectionHandle {
    generation: u64,
    writer: Option<LineWriter>,
    task: JoinHandle<()>,
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
pub(crate) struct ConnectionManager {
    target: Option<SocketAddr>,
    handle: Option<ConnectionHandle>,
    next_generation: u64,
    backoff: Backoff,
    connect_timeout: Duration,
    probe_interval: Duration,
    collect_delay: Duration,
    reconnect_at: Option<Instant>,
    probes: VecDeque<&'static str>,
    probe_at: Option<Instant>,
    collect_at: Option<Instant>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(config: &SessionConfig, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            target: None,
            handle: None,
            next_generation: 0,
            backoff: Backoff::new(config.reconnect_floor, config.reconnect_ceiling),
            connect_timeout: config.connect_timeout,
            probe_interval: config.probe_interval,
            collect_delay: config.collect_delay,
            reconnect_at: None,
            probes: VecDeque::new(),
            probe_at: None,
            collect_at: None,
            events,
        }
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    pub fn set_target(&mut self, target: SocketAddr) {
        self.target = Some(target);
        self.reconnect_at = None;
        self.backoff.reset();
    }

    pub fn state(&self) -> ConnectionState {
        match &self.handle {
            None => ConnectionState::Disconnected,
            Some(handle) if handle.writer.is_some() => ConnectionState::Connected,
            Some(_) => ConnectionState::Connecting,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn has_connection(&self) -> bool {
        self.handle.is_some()
    }

    #[cfg(test)]
    fn reconnect_delay(&self) -> Duration {
        self.backoff.current()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Start a connect attempt to the target.
    pub fn connect(&mut self) {
        let Some(target) = self.target else {
            return;
        };
        if self.handle.is_some() {
            return;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.reconnect_at = None;

        tracing::debug!("Connecting to {} (generation {})", target, generation);
        let task = spawn_connection(target, generation, self.connect_timeout, self.events.clone());
        self.handle = Some(ConnectionHandle {
            generation,
            writer: None,
            task,
        });
    }

    /// Connect now unless already connected or a reconnect is scheduled.
    pub fn ensure_connecting(&mut self) {
        if self.handle.is_none() && self.reconnect_at.is_none() {
            self.connect();
        }
    }

    /// Accept the write half from a finished connect. Returns false for a
    /// stale generation.
    pub fn on_connected(&mut self, generation: u64, writer: LineWriter, now: Instant) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.writer = Some(writer);
        }

        self.backoff.reset();
        self.probes = PROBES.iter().copied().collect();
        self.probe_at = Some(now);
        self.collect_at = None;
        true
    }

    /// Handle a failed connect or closed stream. Returns false for a stale
    /// generation.
    pub fn on_closed(&mut self, generation: u64, now: Instant) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.disconnect(now);
        true
    }

    /// Tear down the current connection and schedule a reconnect.
    pub fn disconnect(&mut self, now: Instant) {
        self.handle = None;
        self.probes.clear();
        self.probe_at = None;
        self.collect_at = None;
        self.schedule_reconnect(now);
    }

    /// Tear down the current connection without scheduling a reconnect.
    pub fn close(&mut self) {
        self.handle = None;
        self.probes.clear();
        self.probe_at = None;
        self.collect_at = None;
        self.reconnect_at = None;
    }

    /// Arm the reconnect timer; a pending reconnect is left as is.
    pub fn schedule_reconnect(&mut self, now: Instant) {
        if self.reconnect_at.is_some() || self.target.is_none() {
            return;
        }
        let delay = self.backoff.next_delay();
        tracing::debug!("Reconnecting in {:?}", delay);
        self.reconnect_at = Some(now + delay);
    }

    pub fn reconnect_due(&self, now: Instant) -> bool {
        self.reconnect_at.is_some_and(|at| now >= at)
    }

    /// Next probe to write, if one is due.
    pub fn take_due_probe(&mut self, now: Instant) -> Option<&'static str> {
        if !self.probe_at.is_some_and(|at| now >= at) {
            return None;
        }
        let probe = self.probes.pop_front()?;
        if self.probes.is_empty() {
            self.probe_at = None;
            self.collect_at = Some(now + self.collect_delay);
        } else {
            self.probe_at = Some(now + self.probe_interval);
        }
        Some(probe)
    }

    /// Whether the collect pass is due; clears it when it is.
    pub fn take_due_collect(&mut self, now: Instant) -> bool {
        if self.collect_at.is_some_and(|at| now >= at) {
            self.collect_at = None;
            return true;
        }
        false
    }

    /// Earliest connection timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.reconnect_at, self.probe_at, self.collect_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Write one line. The caller drops the connection on error.
    pub async fn write(&mut self, line: &str) -> Result<(), ConnectionError> {
        let writer = self
            .handle
            .as_mut()
            .and_then(|handle| handle.writer.as_mut())
            .ok_or(ConnectionError::Closed)?;

        tracing::debug!("-> {}", line);
        writer.send(line.to_string()).await?;
        Ok(())
    }

    /// Route an event, returning it only when it belongs to the live
    /// connection.
    pub fn filter_event(&self, event: ConnectionEvent) -> Option<ConnectionEvent> {
        let generation = match &event {
            ConnectionEvent::Connected { generation, .. }
            | ConnectionEvent::Failed { generation, .. }
            | ConnectionEvent::Line { generation, .. }
            | ConnectionEvent::Closed { generation, .. } => *generation,
        };
        if self.is_current(generation) {
            Some(event)
        } else {
            tracing::trace!("Dropping event from retired connection {}", generation);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConnectionManager, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig::default()
            .with_reconnect_interval(Duration::from_secs(1), Duration::from_secs(8))
            .with_probe_timing(Duration::from_millis(300), Duration::from_secs(2));
        (ConnectionManager::new(&config, tx), rx)
    }

    #[tokio::test]
    async fn test_reconnect_schedule_is_idempotent() {
        let (mut manager, _rx) = manager();
        manager.set_target("127.0.0.1:23".parse().unwrap());
        let now = Instant::now();

        manager.schedule_reconnect(now);
        manager.schedule_reconnect(now);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(1)));
        // only one failure was counted
        assert_eq!(manager.reconnect_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_no_reconnect_without_target() {
        let (mut manager, _rx) = manager();
        manager.schedule_reconnect(Instant::now());
        assert_eq!(manager.next_deadline(), None);
        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_consecutive_failures_double_the_delay() {
        let (mut manager, mut rx) = manager();
        // Nothing listens on port 1 of the loopback interface
        manager.set_target("127.0.0.1:1".parse().unwrap());

        let mut delays = Vec::new();
        for _ in 0..5 {
            manager.connect();
            assert_eq!(manager.state(), ConnectionState::Connecting);
            let event = rx.recv().await.unwrap();
            let Some(ConnectionEvent::Failed { generation, .. }) = manager.filter_event(event) else {
                panic!("expected connect failure");
            };
            let now = Instant::now();
            assert!(manager.on_closed(generation, now));
            delays.push(manager.next_deadline().unwrap() - now);
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(8),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_resets_backoff_and_probes_in_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (mut manager, mut rx) = manager();
        manager.set_target(address);

        // A prior failure raised the delay
        manager.schedule_reconnect(Instant::now());
        manager.connect();
        let (_server, _) = listener.accept().await.unwrap();

        let ConnectionEvent::Connected { generation, writer } = rx.recv().await.unwrap() else {
            panic!("expected connection");
        };
        let now = Instant::now();
        assert!(manager.on_connected(generation, writer, now));
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_delay(), Duration::from_secs(1));

        let mut at = now;
        let mut probes = Vec::new();
        while let Some(probe) = manager.take_due_probe(at) {
            probes.push(probe);
            at += Duration::from_millis(300);
            assert_eq!(manager.take_due_probe(at - Duration::from_millis(1)), None);
        }
        assert_eq!(probes, PROBES.to_vec());

        let collect_at = manager.next_deadline().unwrap();
        assert!(!manager.take_due_collect(collect_at - Duration::from_millis(1)));
        assert!(manager.take_due_collect(collect_at));
        assert_eq!(manager.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_events_from_retired_connection_are_ignored() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut manager, mut rx) = manager();
        manager.set_target(listener.local_addr().unwrap());

        manager.connect();
        let (_server, _) = listener.accept().await.unwrap();
        let event = rx.recv().await.unwrap();

        manager.close();
        manager.connect();
        assert!(manager.filter_event(event).is_none());
        assert!(!manager.on_closed(0, Instant::now()));
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }
}
