//! What the engine tells the outside world.
//!
//! Progress text and slot status are `watch` channels, so a late subscriber
//! still sees the most recent value. Completed checks go through a bounded
//! queue to the reporter; the engine never waits on it.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

/// One completed monitoring cycle. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub cycle_id: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub slots_found: bool,
    pub slot_labels: Option<Vec<String>>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of a resolved cycle: `labels == None` means checked and nothing
/// available.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatus {
    pub cycle_id: u64,
    pub labels: Option<Vec<String>>,
}

pub struct EventHub {
    state_tx: watch::Sender<String>,
    slots_tx: watch::Sender<Option<SlotStatus>>,
    outcome_tx: mpsc::Sender<CheckOutcome>,
}

impl EventHub {
    pub fn new(outcome_capacity: usize) -> (Self, mpsc::Receiver<CheckOutcome>) {
        let (state_tx, _) = watch::channel("Idle".to_string());
        let (slots_tx, _) = watch::channel(None);
        let (outcome_tx, outcome_rx) = mpsc::channel(outcome_capacity.max(1));
        (Self { state_tx, slots_tx, outcome_tx }, outcome_rx)
    }

    pub fn emit_state(&self, text: impl Into<String>) {
        self.state_tx.send_replace(text.into());
    }

    pub fn publish_slots(&self, cycle_id: u64, labels: Option<Vec<String>>) {
        self.slots_tx.send_replace(Some(SlotStatus { cycle_id, labels }));
    }

    pub fn submit_outcome(&self, outcome: CheckOutcome) {
        if let Err(e) = self.outcome_tx.try_send(outcome) {
            warn!("[Events] Outcome queue unavailable, record dropped: {}", e);
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<String> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_slots(&self) -> watch::Receiver<Option<SlotStatus>> {
        self.slots_tx.subscribe()
    }

    pub fn last_state(&self) -> String {
        self.state_tx.borrow().clone()
    }
}
