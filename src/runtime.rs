//! The monitor actor.
//!
//! One task owns the [`Navigator`]. Control messages, tree-change
//! notifications, the watchdog and the cycle scheduler are all funnelled
//! through a single `select!`, so ticks never overlap. Other components talk
//! to it only through a [`MonitorHandle`].

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::actions::{ActionProvider, SnapshotSource};
use crate::config::MonitorConfig;
use crate::error::{Result, WatchError};
use crate::events::{EventHub, SlotStatus};
use crate::navigator::{NavigationState, Navigator, TickOutcome};
use crate::schema::DeviceEvent;

pub const WATCHDOG_PERIOD: Duration = Duration::from_millis(2500);

thread_local! {
    static IN_GUARDED_TICK: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread runs a tick inside the monitor's fault
/// boundary, i.e. a panic right now will be caught and the loop continues.
pub fn in_guarded_tick() -> bool {
    IN_GUARDED_TICK.with(Cell::get)
}

#[derive(Debug)]
pub enum Control {
    Start,
    Stop,
    ReleaseSafeMode,
    Status(oneshot::Sender<MonitorStatus>),
}

#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub monitoring: bool,
    pub state: NavigationState,
    pub progress: String,
    pub cycle_id: Option<u64>,
    pub recovery: String,
    pub safe_mode_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub watchdog: Duration,
    pub check_interval: Duration,
    pub launch_settle: Duration,
    pub target_app: String,
}

impl RuntimeOptions {
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            watchdog: WATCHDOG_PERIOD,
            check_interval: config.check_interval,
            launch_settle: config.launch_settle,
            target_app: config.target_app.clone(),
        }
    }
}

/// Engine handle passed to whoever needs to drive or observe monitoring.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<Control>,
    events: Arc<EventHub>,
}

impl MonitorHandle {
    pub async fn start(&self) -> Result<()> {
        self.send(Control::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Control::Stop).await
    }

    pub async fn release_safe_mode(&self) -> Result<()> {
        self.send(Control::ReleaseSafeMode).await
    }

    pub async fn status(&self) -> Result<MonitorStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Control::Status(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| WatchError::Bridge("monitor did not answer".to_string()))
    }

    pub fn subscribe_state(&self) -> watch::Receiver<String> {
        self.events.subscribe_state()
    }

    pub fn subscribe_slots(&self) -> watch::Receiver<Option<SlotStatus>> {
        self.events.subscribe_slots()
    }

    async fn send(&self, control: Control) -> Result<()> {
        self.tx
            .send(control)
            .await
            .map_err(|_| WatchError::Bridge("monitor task has stopped".to_string()))
    }
}

/// Where the cycle scheduler stands.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Schedule {
    Off,
    LaunchAt(Instant),
    StartAt(Instant),
    Running,
}

impl Schedule {
    fn deadline(self) -> Option<Instant> {
        match self {
            Schedule::LaunchAt(at) | Schedule::StartAt(at) => Some(at),
            Schedule::Off | Schedule::Running => None,
        }
    }
}

struct Monitor {
    navigator: Navigator,
    snapshots: Arc<dyn SnapshotSource>,
    actions: Arc<dyn ActionProvider>,
    events: Arc<EventHub>,
    options: RuntimeOptions,
    schedule: Schedule,
}

pub fn spawn_monitor(
    navigator: Navigator,
    snapshots: Arc<dyn SnapshotSource>,
    actions: Arc<dyn ActionProvider>,
    events: Arc<EventHub>,
    tree_events: mpsc::Receiver<DeviceEvent>,
    options: RuntimeOptions,
) -> (MonitorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(32);
    let monitor = Monitor { navigator, snapshots, actions, events: events.clone(), options, schedule: Schedule::Off };
    let join = tokio::spawn(monitor.run(rx, tree_events));
    (MonitorHandle { tx, events }, join)
}

impl Monitor {
    async fn run(mut self, mut control_rx: mpsc::Receiver<Control>, mut tree_events: mpsc::Receiver<DeviceEvent>) {
        let mut watchdog = time::interval(self.options.watchdog);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;

        loop {
            let deadline = self.schedule.deadline();
            tokio::select! {
                ctrl = control_rx.recv() => match ctrl {
                    Some(ctrl) => self.on_control(ctrl),
                    None => break,
                },
                ev = tree_events.recv(), if events_open => match ev {
                    Some(DeviceEvent::TreeChanged) => self.tick().await,
                    None => {
                        warn!("[Runtime] Tree-change notifications closed, relying on the watchdog");
                        events_open = false;
                    }
                },
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_schedule().await;
                }
                _ = watchdog.tick() => {
                    if self.schedule == Schedule::Running && self.navigator.is_idle() {
                        self.schedule_next(Duration::ZERO);
                    }
                    self.tick().await;
                }
            }
        }

        self.navigator.stop();
        info!("[Runtime] Monitor stopped");
    }

    fn on_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::Start => {
                if self.schedule == Schedule::Off {
                    info!("[Runtime] Monitoring enabled");
                    self.schedule = Schedule::LaunchAt(Instant::now());
                }
            }
            Control::Stop => {
                info!("[Runtime] Monitoring disabled");
                self.schedule = Schedule::Off;
                self.navigator.stop();
            }
            Control::ReleaseSafeMode => {
                self.navigator.recovery_mut().deactivate_safe_mode();
                self.events.emit_state("Safe mode released");
            }
            Control::Status(reply) => {
                let recovery = self.navigator.recovery();
                let status = MonitorStatus {
                    monitoring: self.schedule != Schedule::Off,
                    state: self.navigator.state(),
                    progress: self.events.last_state(),
                    cycle_id: self.navigator.context().map(|c| c.cycle_id),
                    recovery: recovery.status_string(),
                    safe_mode_until: recovery.safe_mode_until(),
                };
                let _ = reply.send(status);
            }
        }
    }

    async fn on_schedule(&mut self) {
        match self.schedule {
            Schedule::LaunchAt(_) => {
                if !self.navigator.is_idle() {
                    self.schedule = Schedule::Running;
                    return;
                }
                if self.navigator.recovery().is_in_safe_mode() {
                    // start_cycle announces the expiry time.
                    self.navigator.start_cycle();
                    self.schedule_next(Duration::ZERO);
                    return;
                }
                info!("[Runtime] Launching {}", self.options.target_app);
                if let Err(e) = self.actions.launch_app(&self.options.target_app) {
                    warn!("[Runtime] Launch not delivered: {}", e);
                }
                self.schedule = Schedule::StartAt(Instant::now() + self.options.launch_settle);
            }
            Schedule::StartAt(_) => {
                if self.navigator.start_cycle() {
                    self.schedule = Schedule::Running;
                    self.tick().await;
                } else {
                    self.schedule_next(Duration::ZERO);
                }
            }
            Schedule::Off | Schedule::Running => {}
        }
    }

    fn schedule_next(&mut self, extra: Duration) {
        if self.schedule == Schedule::Off {
            return;
        }
        let wait = self.options.check_interval + extra;
        debug!("[Runtime] Next cycle in {}ms", wait.as_millis());
        self.schedule = Schedule::LaunchAt(Instant::now() + wait);
    }

    async fn tick(&mut self) {
        if self.navigator.is_idle() {
            return;
        }

        let snapshot = match self.snapshots.current_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("[Runtime] Snapshot unavailable: {}", e);
                None
            }
        };

        let navigator = &mut self.navigator;
        let actions = self.actions.as_ref();
        IN_GUARDED_TICK.with(|flag| flag.set(true));
        let result = panic::catch_unwind(AssertUnwindSafe(|| navigator.tick(snapshot.as_ref(), actions)));
        IN_GUARDED_TICK.with(|flag| flag.set(false));

        match result {
            Ok(TickOutcome::CycleFinished(outcome)) => {
                debug!("[Runtime] Cycle #{} finished", outcome.cycle_id);
                let backoff = self.navigator.recovery().current_backoff();
                self.schedule_next(backoff);
            }
            Ok(_) => {}
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let state = self.navigator.state();
                error!("[Runtime] Tick failed in {}: {}", state, msg);
                if self.navigator.abort_cycle(format!("tick panicked in {}: {}", state, msg)).is_some() {
                    let backoff = self.navigator.recovery().current_backoff();
                    self.schedule_next(backoff);
                }
            }
        }
    }
}
