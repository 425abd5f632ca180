//! Structured, append-only control events for observers.
//!
//! Emission never blocks: `ChannelSink` uses a bounded channel with
//! `try_send` and counts what it had to drop.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;

use crate::classifier::ContactMedium;
use crate::ehd::SuctionLevel;
use crate::rafe::RafeMode;
use crate::status::MeasurementSource;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    Blocked {
        reason: String,
    },
    Classified {
        medium: ContactMedium,
        reason: String,
    },
    ModeSwitched {
        analyte: String,
        mode: RafeMode,
    },
    ModeSwitchRejected {
        requested: String,
        current: RafeMode,
        lock_reason: String,
    },
    SuctionChanged {
        from: SuctionLevel,
        to: SuctionLevel,
    },
    SuctionSkipped {
        target: SuctionLevel,
        reason: String,
    },
    StabilizationStarted {
        hold_ms: u64,
    },
    StabilizationEnded {
        held_ms: u64,
        cancelled: bool,
    },
    FailSafeTripped {
        reason: String,
    },
    Fallback {
        reason: String,
    },
    MeasurementCompleted {
        id: uuid::Uuid,
        concentration: f32,
        source: MeasurementSource,
        anomaly: bool,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ControlEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ControlEvent) {}
}

/// Bounded channel sink. Full or disconnected channels drop the event.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<ControlEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<ControlEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ControlEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n.is_power_of_two() {
                    tracing::warn!(dropped = n, "control event sink saturated");
                }
            }
        }
    }
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn emit(&self, event: ControlEvent) {
        (**self).emit(event);
    }
}
