//! Outcome reporter: persists every check and sends deduplicated alerts.
//!
//! Runs as its own task fed by the outcome queue. Repeat alerts with an
//! unchanged signature are suppressed until the heartbeat interval has
//! passed since the last successful send.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::{self, Clock};
use crate::error::{Result, WatchError};
use crate::events::CheckOutcome;
use crate::store::StatsStore;
use crate::telegram::AlertSink;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

const META_LAST_SIGNATURE: &str = "alert.last_signature";
const META_LAST_SENT: &str = "alert.last_sent";

/// Dedup key of an outcome; `None` for failed checks, which are never alerted.
/// Labels are hashed as a set, so scroll order does not matter.
pub fn signature(outcome: &CheckOutcome) -> Option<String> {
    if !outcome.success {
        return None;
    }
    let raw = match (&outcome.slot_labels, outcome.slots_found) {
        (Some(labels), true) => {
            let mut sorted: Vec<&str> = labels.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            format!("SLOTS:{}", sorted.join(","))
        }
        _ => "NO_SLOTS".to_string(),
    };
    Some(hex::encode(Sha256::digest(raw.as_bytes())))
}

pub fn format_message(outcome: &CheckOutcome, location: &str, task: &str) -> String {
    match (&outcome.slot_labels, outcome.slots_found) {
        (Some(labels), true) => format!(
            "[OK] Slot available!\nLocation: {}\nTask: {}\nDates: {}",
            location,
            task,
            labels.join(", ")
        ),
        _ => format!("[INFO] Check finished: no slots for '{}' yet.", task),
    }
}

pub fn should_send(
    last_signature: Option<&str>,
    last_sent: Option<DateTime<Utc>>,
    signature: &str,
    now: DateTime<Utc>,
    heartbeat: Duration,
) -> bool {
    if last_signature != Some(signature) {
        return true;
    }
    match last_sent {
        Some(sent) => clock::elapsed(sent, now) > heartbeat,
        None => true,
    }
}

pub struct Reporter {
    store: Arc<StatsStore>,
    alerts: Option<Arc<dyn AlertSink>>,
    clock: Arc<dyn Clock>,
    location: String,
    task: String,
    heartbeat: Duration,
}

impl Reporter {
    pub fn new(
        store: Arc<StatsStore>,
        alerts: Option<Arc<dyn AlertSink>>,
        clock: Arc<dyn Clock>,
        location: impl Into<String>,
        task: impl Into<String>,
    ) -> Self {
        Self {
            store,
            alerts,
            clock,
            location: location.into(),
            task: task.into(),
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }

    pub fn spawn(self, mut rx: mpsc::Receiver<CheckOutcome>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                if let Err(e) = self.handle(outcome).await {
                    warn!("[Reporter] {}", e);
                }
            }
            debug!("[Reporter] Outcome queue closed");
        })
    }

    pub async fn handle(&self, outcome: CheckOutcome) -> Result<()> {
        let record = outcome.clone();
        self.blocking(move |store| store.record(&record).map(|_| ())).await?;

        let Some(sig) = signature(&outcome) else {
            return Ok(());
        };
        let Some(alerts) = self.alerts.clone() else {
            return Ok(());
        };

        let (last_sig, last_sent) = self
            .blocking(|store| Ok((store.get_meta(META_LAST_SIGNATURE)?, store.get_meta(META_LAST_SENT)?)))
            .await?;
        let last_sent = last_sent
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc));

        let now = self.clock.now();
        if !should_send(last_sig.as_deref(), last_sent, &sig, now, self.heartbeat) {
            debug!("[Reporter] Alert suppressed, signature unchanged");
            return Ok(());
        }

        let message = format_message(&outcome, &self.location, &self.task);
        alerts.send(&message).await?;
        info!("[Reporter] Alert sent for cycle #{}", outcome.cycle_id);

        let sent_at = now.to_rfc3339();
        self.blocking(move |store| {
            store.set_meta(META_LAST_SIGNATURE, &sig)?;
            store.set_meta(META_LAST_SENT, &sent_at)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&StatsStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| WatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}
