//! Single-flight command dispatcher
//!
//! Commands wait in a FIFO queue. At most one is in flight: popped, timer
//! armed, waiting for a line that matches it. The dispatcher does no I/O and
//! reads no clock; the session actor feeds it the current instant, writes the
//! wire text it hands out, and forwards inbound lines.
//!
//! ```text
//!            enqueue                 poll_dispatch
//!   caller ---------> [ queue ] ----------------------> in flight
//!                        ^                                 |  |
//!                        |  retry (front, after interval)  |  | matched line
//!                        +------------- timeout -----------+  v
//!                                                         resolved
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::command::CommandSpec;
use crate::error::{AvrError, Result};
use crate::state::PropertyValue;

/// Channel through which a command's outcome reaches its caller.
pub(crate) type Reply = oneshot::Sender<Result<Option<PropertyValue>>>;

/// How a command recognizes its response.
#[derive(Debug, Clone)]
pub(crate) enum Matcher {
    /// Lines reporting this property
    Property(Arc<CommandSpec>),
    /// Caller-supplied pattern
    Pattern(Regex),
    /// No response expected; resolved once written
    None,
}

impl Matcher {
    fn matches(&self, line: &str) -> Option<Option<PropertyValue>> {
        match self {
            Self::Property(spec) => spec.decode(line).map(Some),
            Self::Pattern(pattern) => pattern.captures(line).map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| PropertyValue::Text(m.as_str().to_string()))
            }),
            Self::None => None,
        }
    }

    fn settle(&self) -> Duration {
        match self {
            Self::Property(spec) => spec.settle(),
            _ => Duration::ZERO,
        }
    }
}

/// A queued command and the caller waiting on it.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    wire: String,
    matcher: Matcher,
    reply: Option<Reply>,
    retries_remaining: u32,
    attempts: u32,
}

impl PendingCommand {
    pub fn new(wire: impl Into<String>, matcher: Matcher, retries: u32, reply: Reply) -> Self {
        Self {
            wire: wire.into(),
            matcher,
            reply: Some(reply),
            retries_remaining: retries,
            attempts: 0,
        }
    }

    fn wire(&self) -> &str {
        &self.wire
    }

    fn resolve(mut self, value: Option<PropertyValue>) {
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting
            let _ = reply.send(Ok(value));
        }
    }

    fn reject(mut self, error: AvrError) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(error));
        }
    }
}

#[derive(Debug)]
struct InFlight {
    command: PendingCommand,
    deadline: Instant,
    sent: bool,
}

/// What a response timeout led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimeoutOutcome {
    /// The command is back at the head of the queue
    Retrying { command: String, attempt: u32 },
    /// The command failed with [`AvrError::CommandTimeout`]
    Exhausted { command: String, attempts: u32 },
}

impl TimeoutOutcome {
    pub fn command(&self) -> &str {
        match self {
            Self::Retrying { command, .. } | Self::Exhausted { command, .. } => command,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    queue: VecDeque<PendingCommand>,
    in_flight: Option<InFlight>,
    hold_until: Option<Instant>,
    timeout: Duration,
    retry_interval: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            hold_until: None,
            timeout,
            retry_interval,
        }
    }

    pub fn enqueue(&mut self, command: PendingCommand) {
        tracing::debug!("Queued {:?} ({} waiting)", command.wire, self.queue.len());
        self.queue.push_back(command);
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Wire text of the in-flight command, if any.
    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|f| f.command.wire())
    }

    /// Pop the next command if nothing is in flight and no hold is active.
    ///
    /// The response timer starts here, whether or not the command can be
    /// written yet. Returns whether a command was dispatched.
    pub fn poll_dispatch(&mut self, now: Instant) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        if let Some(hold) = self.hold_until {
            if now < hold {
                return false;
            }
            self.hold_until = None;
        }

        let Some(mut command) = self.queue.pop_front() else {
            return false;
        };
        command.attempts += 1;
        tracing::debug!("Dispatching {:?} (attempt {})", command.wire, command.attempts);

        self.in_flight = Some(InFlight {
            command,
            deadline: now + self.timeout,
            sent: false,
        });
        true
    }

    /// Wire text still waiting to be written for the in-flight command.
    pub fn unsent(&self) -> Option<&str> {
        self.in_flight
            .as_ref()
            .filter(|f| !f.sent)
            .map(|f| f.command.wire())
    }

    /// Record that the in-flight command was written.
    ///
    /// Commands that expect no response resolve here.
    pub fn mark_sent(&mut self) {
        let Some(flight) = self.in_flight.as_mut() else {
            return;
        };
        flight.sent = true;

        if matches!(flight.command.matcher, Matcher::None) {
            if let Some(flight) = self.in_flight.take() {
                flight.command.resolve(None);
            }
        }
    }

    /// Offer an inbound line to the in-flight command.
    ///
    /// Returns true when the line resolved it; such a line must not be
    /// reported as an unsolicited update.
    pub fn on_line(&mut self, line: &str, now: Instant) -> bool {
        let Some(value) = self
            .in_flight
            .as_ref()
            .and_then(|f| f.command.matcher.matches(line))
        else {
            return false;
        };

        let Some(flight) = self.in_flight.take() else {
            return false;
        };
        let settle = flight.command.matcher.settle();
        tracing::debug!("{:?} answered by {:?}", flight.command.wire, line);
        flight.command.resolve(value);

        if !settle.is_zero() {
            self.hold_until = Some(now + settle);
        }
        true
    }

    /// Whether the in-flight command has run out of time.
    pub fn timed_out(&self, now: Instant) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| now >= f.deadline)
    }

    /// Handle the in-flight command's timeout.
    ///
    /// The caller is expected to drop the connection in both outcomes.
    pub fn on_timeout(&mut self, now: Instant) -> Option<TimeoutOutcome> {
        let flight = self.in_flight.take()?;
        let mut command = flight.command;
        command.retries_remaining = command.retries_remaining.saturating_sub(1);

        if command.retries_remaining > 0 {
            let outcome = TimeoutOutcome::Retrying {
                command: command.wire.clone(),
                attempt: command.attempts,
            };
            self.queue.push_front(command);
            self.hold_until = Some(now + self.retry_interval);
            Some(outcome)
        } else {
            let outcome = TimeoutOutcome::Exhausted {
                command: command.wire.clone(),
                attempts: command.attempts,
            };
            let error = AvrError::CommandTimeout {
                command: command.wire.clone(),
                attempts: command.attempts,
            };
            command.reject(error);
            Some(outcome)
        }
    }

    /// Fail the in-flight command because its connection was replaced.
    pub fn abort_in_flight(&mut self) -> Option<String> {
        let flight = self.in_flight.take()?;
        let wire = flight.command.wire.clone();
        flight.command.reject(AvrError::ConnectionReplaced {
            command: wire.clone(),
        });
        Some(wire)
    }

    /// Earliest instant the dispatcher needs to be polled again.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.in_flight {
            Some(flight) => Some(flight.deadline),
            None if !self.queue.is_empty() => self.hold_until,
            None => None,
        }
    }

    /// Fail everything still pending.
    pub fn close(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            flight.command.reject(AvrError::SessionClosed);
        }
        for command in self.queue.drain(..) {
            command.reject(AvrError::SessionClosed);
        }
    }
}
