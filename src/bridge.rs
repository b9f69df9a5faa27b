//! Newline-delimited JSON bridge to the platform adapter process.
//!
//! Requests go out as `{"id","action","payload"}`; the adapter answers with
//! `{"request_id","status","data","error"}` and may push
//! `{"event":"tree_changed"}` at any time. Actions are fire-and-forget, only
//! snapshot requests wait for their reply.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use uuid::Uuid;

use crate::actions::{ActionProvider, SnapshotSource};
use crate::error::{Result, WatchError};
use crate::schema::{DeviceAction, DeviceCommand, DeviceEvent, DeviceResponse, NodeRef, UiElement};

pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<DeviceResponse>>>>;

pub struct AdapterBridge {
    cmd_tx: mpsc::Sender<DeviceCommand>,
    pending: Pending,
    snapshot_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl AdapterBridge {
    /// Starts the adapter from a command line such as `adb-adapter --serial X`.
    pub fn spawn(command_line: &str) -> Result<(Self, mpsc::Receiver<DeviceEvent>)> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| WatchError::Config("SLOT_ADAPTER_CMD is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WatchError::Bridge(format!("failed to spawn adapter '{}': {}", program, e)))?;

        info!("[Bridge] Adapter spawned with PID {:?}", child.id());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WatchError::Bridge("adapter stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WatchError::Bridge("adapter stdout unavailable".to_string()))?;

        let (bridge, events) = Self::from_io(stdout, stdin);
        *bridge.child.lock().unwrap_or_else(|p| p.into_inner()) = Some(child);
        Ok((bridge, events))
    }

    /// Wires the bridge to any byte stream pair.
    pub fn from_io<R, W>(reader: R, writer: W) -> (Self, mpsc::Receiver<DeviceEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<DeviceCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<DeviceEvent>(64);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        task::spawn(write_loop(writer, cmd_rx));
        task::spawn(read_loop(reader, pending.clone(), event_tx));

        let bridge = Self { cmd_tx, pending, snapshot_timeout: SNAPSHOT_TIMEOUT, child: Mutex::new(None) };
        (bridge, event_rx)
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn adapter_pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .and_then(|c| c.id())
    }

    fn fire(&self, action: DeviceAction) -> Result<()> {
        let cmd = DeviceCommand { id: Uuid::new_v4().to_string(), action };
        self.cmd_tx
            .try_send(cmd)
            .map_err(|e| WatchError::ActionDelivery(format!("adapter queue: {}", e)))
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<DeviceResponse>>> {
        lock_pending(&self.pending)
    }
}

fn lock_pending(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<DeviceResponse>>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn write_loop<W>(mut writer: W, mut cmd_rx: mpsc::Receiver<DeviceCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = cmd_rx.recv().await {
        let mut line = match serde_json::to_string(&cmd) {
            Ok(line) => line,
            Err(e) => {
                warn!("[Bridge] Could not encode command: {}", e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("[Bridge] Adapter write failed, stopping writer: {}", e);
            break;
        }
        let _ = writer.flush().await;
    }
}

async fn read_loop<R>(reader: R, pending: Pending, event_tx: mpsc::Sender<DeviceEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("[Bridge] Adapter read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        if let Ok(event) = serde_json::from_str::<DeviceEvent>(&line) {
            // Dropped notifications are harmless, the watchdog ticks anyway.
            let _ = event_tx.try_send(event);
            continue;
        }

        match serde_json::from_str::<DeviceResponse>(&line) {
            Ok(resp) => {
                let waiter = lock_pending(&pending).remove(&resp.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None if resp.status != "success" => {
                        warn!("[Bridge] Action {} failed: {}", resp.request_id, resp.error.unwrap_or_default());
                    }
                    None => {}
                }
            }
            Err(_) => warn!("[Bridge] Failed to parse adapter output: {}", line),
        }
    }
    info!("[Bridge] Adapter output closed");
    // Fail outstanding snapshot requests fast instead of letting them time out.
    lock_pending(&pending).clear();
}

impl ActionProvider for AdapterBridge {
    fn click(&self, target: &NodeRef) -> Result<()> {
        self.fire(DeviceAction::UiClick { path: target.path.clone() })
    }

    fn set_text(&self, target: &NodeRef, text: &str) -> Result<()> {
        self.fire(DeviceAction::UiSetText { path: target.path.clone(), text: text.to_string() })
    }

    fn scroll_forward(&self, target: &NodeRef) -> Result<()> {
        self.fire(DeviceAction::UiScrollForward { path: target.path.clone() })
    }

    fn global_back(&self) -> Result<()> {
        self.fire(DeviceAction::GlobalBack)
    }

    fn global_home(&self) -> Result<()> {
        self.fire(DeviceAction::GlobalHome)
    }

    fn launch_app(&self, app_id: &str) -> Result<()> {
        self.fire(DeviceAction::LaunchApp { app_id: app_id.to_string() })
    }

    fn tap_at(&self, x: i32, y: i32) -> Result<()> {
        self.fire(DeviceAction::UiTap { x, y })
    }
}

#[async_trait]
impl SnapshotSource for AdapterBridge {
    async fn current_snapshot(&self) -> Result<Option<UiElement>> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_lock().insert(id.clone(), tx);

        let cmd = DeviceCommand { id: id.clone(), action: DeviceAction::UiSnapshot };
        if self.cmd_tx.send(cmd).await.is_err() {
            self.pending_lock().remove(&id);
            return Err(WatchError::Bridge("adapter writer is gone".to_string()));
        }

        let resp = match tokio::time::timeout(self.snapshot_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(WatchError::Bridge("adapter closed before replying".to_string())),
            Err(_) => {
                self.pending_lock().remove(&id);
                debug!("[Bridge] Snapshot request {} timed out", id);
                return Ok(None);
            }
        };

        if resp.status != "success" {
            return Err(WatchError::Bridge(resp.error.unwrap_or_else(|| "snapshot failed".to_string())));
        }
        match resp.data {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
        }
    }
}
