//! Local/remote backend mode switching.
//!
//! A switch must never take effect in the middle of a batch. [`ModeSwitch`]
//! is an explicit state object `{ current, pending, in_flight }` owned by
//! whoever drives the pipeline:
//!
//! - [`request_switch`](ModeSwitch::request_switch) applies immediately
//!   when idle, otherwise queues the request (last request wins);
//! - [`begin_batch`](ModeSwitch::begin_batch) marks a batch in flight and
//!   returns the mode it must run with;
//! - [`on_batch_terminal`](ModeSwitch::on_batch_terminal) marks it done and
//!   applies the queued request once nothing is in flight.
//!
//! Transitions are published as [`ModeEvent`]s on a broadcast channel.

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    Local,
    Remote,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => bail!("Unknown generator mode: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeEvent {
    /// A request arrived while a batch was running.
    SwitchQueued { requested: BackendMode },
    SwitchApplied { from: BackendMode, to: BackendMode },
}

/// What [`ModeSwitch::request_switch`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDecision {
    Applied,
    Queued,
    /// Already in the requested mode with nothing in flight.
    Unchanged,
}

#[derive(Debug)]
struct ModeState {
    current: BackendMode,
    pending: Option<BackendMode>,
    in_flight: usize,
}

pub struct ModeSwitch {
    state: Mutex<ModeState>,
    events: broadcast::Sender<ModeEvent>,
}

impl ModeSwitch {
    pub fn new(initial: BackendMode) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(ModeState {
                current: initial,
                pending: None,
                in_flight: 0,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModeEvent> {
        self.events.subscribe()
    }

    pub fn current(&self) -> BackendMode {
        self.state.lock().unwrap().current
    }

    pub fn pending(&self) -> Option<BackendMode> {
        self.state.lock().unwrap().pending
    }

    pub fn in_flight(&self) -> bool {
        self.state.lock().unwrap().in_flight > 0
    }

    pub fn request_switch(&self, mode: BackendMode) -> SwitchDecision {
        let mut state = self.state.lock().unwrap();
        if state.in_flight > 0 {
            state.pending = Some(mode);
            info!(requested = %mode, "mode switch queued until batch completes");
            self.emit(ModeEvent::SwitchQueued { requested: mode });
            return SwitchDecision::Queued;
        }
        state.pending = None;
        if state.current == mode {
            return SwitchDecision::Unchanged;
        }
        let from = std::mem::replace(&mut state.current, mode);
        info!(from = %from, to = %mode, "mode switched");
        self.emit(ModeEvent::SwitchApplied { from, to: mode });
        SwitchDecision::Applied
    }

    /// Mark a batch in flight; returns the mode it runs with.
    pub fn begin_batch(&self) -> BackendMode {
        let mut state = self.state.lock().unwrap();
        state.in_flight += 1;
        state.current
    }

    /// Mark a batch terminal (success or failure). Returns the newly applied
    /// mode if a queued request took effect.
    pub fn on_batch_terminal(&self) -> Option<BackendMode> {
        let mut state = self.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight > 0 {
            return None;
        }
        let requested = state.pending.take()?;
        if requested == state.current {
            return None;
        }
        let from = std::mem::replace(&mut state.current, requested);
        info!(from = %from, to = %requested, "queued mode switch applied");
        self.emit(ModeEvent::SwitchApplied {
            from,
            to: requested,
        });
        Some(requested)
    }

    fn emit(&self, event: ModeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
