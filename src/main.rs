use std::sync::Arc;

use anyhow::anyhow;
use slot_watch::actions::{ActionProvider, SnapshotSource};
use slot_watch::bridge::AdapterBridge;
use slot_watch::clock::{Clock, SystemClock};
use slot_watch::config::{ConfigManager, MonitorConfig};
use slot_watch::events::EventHub;
use slot_watch::navigator::Navigator;
use slot_watch::reporter::Reporter;
use slot_watch::runtime::{self, MonitorHandle, RuntimeOptions};
use slot_watch::store::StatsStore;
use slot_watch::telegram::{AlertSink, TelegramBot};
use slot_watch::env_flag;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
Commands:
  start              begin periodic checks
  stop               stop checking (current cycle is abandoned)
  status             engine state and recovery counters
  stats              summary of stored checks
  history [n]        last n checks (default 10)
  heatmap            slots found by weekday and hour
  clear-stats        delete stored checks
  safe-off           leave safe mode now
  config             show .env settings
  set KEY VALUE      change a .env setting (applies on restart)
  quit               exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if !env_flag("SLOT_PANIC_STD") {
        install_crash_log();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = MonitorConfig::from_env()?;
    tracing::info!(
        location = %config.target_location,
        task = %config.target_task,
        "slot watch starting"
    );

    println!("📅 Slot Watch Started!");
    println!("--------------------------------------------------");
    println!("Location: {}", config.target_location);
    println!("Task:     {}", config.target_task);

    // 1. Storage + reporter
    let store = Arc::new(StatsStore::open(&config.stats_db_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (hub, outcome_rx) = EventHub::new(64);
    let events = Arc::new(hub);

    let alerts: Option<Arc<dyn AlertSink>> = match TelegramBot::from_config(&config) {
        Some(bot) => Some(Arc::new(bot)),
        None => {
            println!("⚠️  TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID not set, alerts disabled.");
            None
        }
    };
    Reporter::new(
        store.clone(),
        alerts,
        clock.clone(),
        config.target_location.clone(),
        config.target_task.clone(),
    )
    .spawn(outcome_rx);

    // 2. Adapter
    let adapter_cmd = config
        .adapter_cmd
        .clone()
        .ok_or_else(|| anyhow!("SLOT_ADAPTER_CMD not set (command that starts the device adapter)"))?;
    let (bridge, tree_events) = AdapterBridge::spawn(&adapter_cmd)?;
    if let Some(pid) = bridge.adapter_pid() {
        println!("🔌 Adapter running (PID {})", pid);
    }
    let bridge = Arc::new(bridge);
    let snapshots: Arc<dyn SnapshotSource> = bridge.clone();
    let actions: Arc<dyn ActionProvider> = bridge;

    // 3. Engine
    let navigator = Navigator::new(config.clone(), clock, events.clone());
    let (monitor, _join) = runtime::spawn_monitor(
        navigator,
        snapshots,
        actions,
        events,
        tree_events,
        RuntimeOptions::from_config(&config),
    );

    spawn_observers(&monitor);

    println!("--------------------------------------------------");
    println!("Type 'help' for commands.");

    // 4. Shell
    let stdin = io::stdin();
    let mut reader = io::BufReader::new(stdin);
    let mut buffer = String::new();
    let config_manager = ConfigManager::new();

    prompt().await;
    while reader.read_line(&mut buffer).await? > 0 {
        let input = buffer.trim().to_string();
        buffer.clear();

        let parts: Vec<&str> = input.split_whitespace().collect();
        let Some(&cmd) = parts.first() else {
            prompt().await;
            continue;
        };

        match cmd {
            "help" => println!("{}", HELP),
            "start" => {
                monitor.start().await?;
                println!("▶️  Monitoring started (every {}s).", config.check_interval.as_secs());
            }
            "stop" => {
                monitor.stop().await?;
                println!("⏹  Monitoring stopped.");
            }
            "status" => {
                let st = monitor.status().await?;
                println!("Monitoring: {}", if st.monitoring { "on" } else { "off" });
                println!("State:      {} ({})", st.state, st.progress);
                if let Some(id) = st.cycle_id {
                    println!("Cycle:      #{}", id);
                }
                println!("Recovery:   {}", st.recovery);
                if let Some(until) = st.safe_mode_until {
                    println!("🛑 Safe mode until {}", until.with_timezone(&chrono::Local).format("%H:%M:%S"));
                }
            }
            "stats" => match store.summary() {
                Ok(s) => {
                    println!("Checks:      {}", s.total);
                    println!("Successful:  {} ({:.1}%)", s.successful, s.success_rate);
                    println!("Slots found: {}", s.slots_found);
                    println!("Avg time:    {:.1}s", s.avg_duration_ms / 1000.0);
                }
                Err(e) => println!("❌ {}", e),
            },
            "history" => {
                let limit = parts.get(1).and_then(|n| n.parse().ok()).unwrap_or(10);
                match store.recent(limit) {
                    Ok(records) if records.is_empty() => println!("No checks yet."),
                    Ok(records) => {
                        for r in records {
                            let when = r.timestamp.with_timezone(&chrono::Local).format("%d.%m %H:%M:%S");
                            let what = if !r.success {
                                format!("❌ {}", r.error.unwrap_or_default())
                            } else if r.slots_found {
                                format!("🎉 {}", r.slot_labels.join(", "))
                            } else {
                                "no slots".to_string()
                            };
                            println!("#{:<5} {} {:>6}ms  {}", r.cycle_id, when, r.duration_ms, what);
                        }
                    }
                    Err(e) => println!("❌ {}", e),
                }
            }
            "heatmap" => match (store.heatmap(), store.slots_by_weekday(), store.slots_by_hour()) {
                (Ok(cells), Ok(by_day), Ok(by_hour)) => {
                    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
                    if cells.is_empty() {
                        println!("No slots recorded yet.");
                    }
                    for c in cells {
                        println!("{} {:02}:00  {}", DAYS[c.weekday as usize % 7], c.hour, "█".repeat(c.count as usize));
                    }
                    let days: Vec<String> =
                        by_day.iter().map(|(d, n)| format!("{}={}", DAYS[*d as usize % 7], n)).collect();
                    let hours: Vec<String> = by_hour.iter().map(|(h, n)| format!("{:02}h={}", h, n)).collect();
                    println!("By weekday: {}", days.join(" "));
                    println!("By hour:    {}", hours.join(" "));
                }
                (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => println!("❌ {}", e),
            },
            "clear-stats" => match store.clear() {
                Ok(n) => println!("🗑  Deleted {} checks.", n),
                Err(e) => println!("❌ {}", e),
            },
            "safe-off" => {
                monitor.release_safe_mode().await?;
                println!("✅ Safe mode released.");
            }
            "config" => {
                let mut all: Vec<(String, String)> = config_manager.get_all().into_iter().collect();
                all.sort();
                for (k, v) in all {
                    let shown = if k.contains("TOKEN") { "********".to_string() } else { v };
                    println!("{}={}", k, shown);
                }
            }
            "set" => {
                if parts.len() < 3 {
                    println!("Usage: set KEY VALUE");
                } else {
                    let value = parts[2..].join(" ");
                    match config_manager.update(parts[1], &value) {
                        Ok(()) => println!("✅ {} updated (restart to apply).", parts[1]),
                        Err(e) => println!("❌ {}", e),
                    }
                }
            }
            "quit" | "exit" => {
                monitor.stop().await.ok();
                println!("👋 Bye.");
                break;
            }
            other => println!("Unknown command '{}'. Type 'help'.", other),
        }

        prompt().await;
    }

    Ok(())
}

/// Appends every panic to `~/.slot_watch/logs/crash.log`. Panics raised
/// inside a monitor tick are caught there and the engine keeps going, so
/// those entries are tagged as recovered instead of being reported as crashes.
fn install_crash_log() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        let at = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let recovered = runtime::in_guarded_tick();

        let (kind, trace) = if recovered {
            ("RECOVERED TICK FAULT", String::new())
        } else {
            ("CRASH", format!("{}\n", std::backtrace::Backtrace::force_capture()))
        };
        let entry = format!("[{}] {} at {}: {}\n{}", chrono::Local::now().to_rfc3339(), kind, at, msg, trace);

        let dir = dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".slot_watch")
            .join("logs");
        let written = std::fs::create_dir_all(&dir).is_ok()
            && std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("crash.log"))
                .and_then(|mut f| std::io::Write::write_all(&mut f, entry.as_bytes()))
                .is_ok();

        if recovered {
            eprintln!("⚠️  Tick fault at {} caught, monitoring continues: {}", at, msg);
        } else {
            eprintln!("❌ PANIC: {}", msg);
            if written {
                eprintln!("📄 Crash report saved to ~/.slot_watch/logs/crash.log");
            }
        }
    }));
}

async fn prompt() {
    print!("> ");
    let _ = io::stdout().flush().await;
}

fn spawn_observers(monitor: &MonitorHandle) {
    let mut state_rx = monitor.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let text = state_rx.borrow_and_update().clone();
            tracing::info!("📍 {}", text);
        }
    });

    let mut slots_rx = monitor.subscribe_slots();
    tokio::spawn(async move {
        while slots_rx.changed().await.is_ok() {
            let status = slots_rx.borrow_and_update().clone();
            if let Some(status) = status {
                match status.labels {
                    Some(labels) => println!("\n🎉 Slots available: {}", labels.join(", ")),
                    None => println!("\nCycle #{}: no slots yet", status.cycle_id),
                }
                prompt().await;
            }
        }
    });
}
