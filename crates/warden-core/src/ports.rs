//! Narrow interfaces between the core and its host.

use std::sync::Mutex;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;

use crate::{
    domain::{Timestamp, UserId},
    error_controller::Module,
};

/// Source of "now". Every time-dependent rule reads the clock through this.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: Timestamp) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Notifications the gate hands to the host. Delivery is best-effort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateEvent {
    AccessExpired {
        identities: Vec<UserId>,
    },
    CredentialReissued {
        identity: UserId,
        code: String,
        expires_at: Timestamp,
    },
    ModuleReset {
        module: Module,
    },
}

pub trait EventSink: Send + Sync {
    /// Returns false if the event could not be handed over.
    fn emit(&self, event: GateEvent) -> bool;
}

/// Discards every event (but reports them as delivered).
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, event: GateEvent) -> bool {
        tracing::debug!(?event, "event dropped (no sink)");
        true
    }
}

/// Forwards events to an unbounded tokio channel; the receiver lives in the host.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<GateEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GateEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: GateEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Host-supplied reachability check used by network retry fixes.
pub trait ConnectivityProbe: Send + Sync {
    fn check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::minutes(11));
        assert_eq!(clock.now(), start + Duration::minutes(11));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        assert!(sink.emit(GateEvent::ModuleReset {
            module: Module::Core
        }));
        drop(rx);
        assert!(!sink.emit(GateEvent::ModuleReset {
            module: Module::Core
        }));
    }
}
