// Domain events
//
// The core never formats user-facing text. It emits these events and an
// outside consumer (the binary's JSON logger, a notifier) renders them.
use crate::models::{ExitReason, Position, TradeSignal};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    Signal {
        signal: TradeSignal,
    },
    SignalRejected {
        signal: TradeSignal,
        reason: String,
    },
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        position: Position,
    },
    SlHit {
        position: Position,
        price: f64,
    },
    TpHit {
        position: Position,
        price: f64,
    },
    OrderFailed {
        symbol: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::Signal { .. } => "SIGNAL",
            DomainEvent::SignalRejected { .. } => "SIGNAL_REJECTED",
            DomainEvent::PositionOpened { .. } => "POSITION_OPENED",
            DomainEvent::PositionClosed { .. } => "POSITION_CLOSED",
            DomainEvent::SlHit { .. } => "SL_HIT",
            DomainEvent::TpHit { .. } => "TP_HIT",
            DomainEvent::OrderFailed { .. } => "ORDER_FAILED",
        }
    }

    /// SL_HIT or TP_HIT for a monitor exit
    pub fn exit_hit(reason: ExitReason, position: Position, price: f64) -> Option<Self> {
        match reason {
            ExitReason::StopLoss => Some(DomainEvent::SlHit { position, price }),
            ExitReason::TakeProfit => Some(DomainEvent::TpHit { position, price }),
            ExitReason::Manual => None,
        }
    }
}

/// Fire-and-forget event delivery. `emit` must never block the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// Bounded channel sink; events are dropped with a warning when the
/// consumer falls behind
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DomainEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: DomainEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let kind = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => ev.kind(),
            };
            tracing::warn!("Dropped {} event: {}", kind, e);
        }
    }
}

/// Sink that records events in memory
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<DomainEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(DomainEvent::kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: DomainEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
