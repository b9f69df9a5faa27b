use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WatchError};

const DEFAULT_ACTION_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_FAST_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// How the slot extractor treats a "no availability" marker that appears
/// next to matched dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMatchPolicy {
    /// Any marker on screen means "not found".
    Strict,
    /// Dates are accepted even when the marker is present.
    Lenient,
}

impl SlotMatchPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "lenient" => Some(Self::Lenient),
            _ => None,
        }
    }
}

/// Strings and anchors of the target interface.
#[derive(Debug, Clone)]
pub struct UiVocabulary {
    pub category_tab_label: String,
    pub category_tab_id: String,
    pub hub_tab_ids: Vec<String>,
    pub hub_payments_label: String,
    pub hub_records_label: String,
    pub list_header: String,
    pub map_label: String,
    pub search_view_id: String,
    pub search_id_fragment: String,
    pub search_description: String,
    pub search_icon_xy: (i32, i32),
    pub enroll_label: String,
    pub schedule_label: String,
    pub region_marker: String,
    pub back_to_tasks_label: String,
    pub choose_time_label: String,
    pub registration_marker: String,
    pub no_slots_marker: String,
}

impl Default for UiVocabulary {
    fn default() -> Self {
        Self {
            category_tab_label: "Склады".to_string(),
            category_tab_id: "warehouseTab".to_string(),
            hub_tab_ids: vec![
                "warehouseTab".to_string(),
                "paymentTab".to_string(),
                "recordsTab".to_string(),
            ],
            hub_payments_label: "Выплаты".to_string(),
            hub_records_label: "Записи".to_string(),
            list_header: "Выберите склад".to_string(),
            map_label: "Карта".to_string(),
            search_view_id: "search_src_text".to_string(),
            search_id_fragment: "search".to_string(),
            search_description: "поиск".to_string(),
            // Centre of the loupe icon, [312,2306][434,2428] on the reference device.
            search_icon_xy: ((312 + 434) / 2, (2306 + 2428) / 2),
            enroll_label: "Записаться".to_string(),
            schedule_label: "ГРАФИК".to_string(),
            region_marker: "Московская область".to_string(),
            back_to_tasks_label: "К списку работ".to_string(),
            choose_time_label: "Выберите время".to_string(),
            registration_marker: "регистрация".to_string(),
            no_slots_marker: "НЕТ МЕСТ".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub target_location: String,
    pub target_task: String,
    pub action_delay_secs: f32,
    pub fast_refresh_enabled: bool,
    pub fast_refresh_delay_secs: f32,
    pub fast_refresh_max_attempts: u32,
    pub check_interval: Duration,
    pub launch_settle: Duration,
    pub max_cycle: Duration,
    pub target_app: String,
    pub match_policy: SlotMatchPolicy,
    pub stats_db_path: PathBuf,
    pub adapter_cmd: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub vocabulary: UiVocabulary,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target_location: "Петровское".to_string(),
            target_task: "Производство непрофиль".to_string(),
            action_delay_secs: DEFAULT_ACTION_DELAY.as_secs_f32(),
            fast_refresh_enabled: false,
            fast_refresh_delay_secs: DEFAULT_FAST_REFRESH_DELAY.as_secs_f32(),
            fast_refresh_max_attempts: 500,
            check_interval: Duration::from_secs(30),
            launch_settle: Duration::from_secs(2),
            max_cycle: Duration::from_secs(300),
            target_app: "ru.ozon.hire".to_string(),
            match_policy: SlotMatchPolicy::Strict,
            stats_db_path: default_db_path(),
            adapter_cmd: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            vocabulary: UiVocabulary::default(),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_map(&vars)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = Self::default();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = get("SLOT_TARGET_LOCATION") {
            cfg.target_location = v.to_string();
        }
        if let Some(v) = get("SLOT_TARGET_TASK") {
            cfg.target_task = v.to_string();
        }
        if let Some(v) = get("SLOT_ACTION_DELAY_SECS") {
            cfg.action_delay_secs = parse_secs("SLOT_ACTION_DELAY_SECS", v)?.clamp(1.0, 10.0);
        }
        if let Some(v) = get("SLOT_FAST_REFRESH") {
            cfg.fast_refresh_enabled = parse_flag(v);
        }
        if let Some(v) = get("SLOT_FAST_REFRESH_DELAY_SECS") {
            cfg.fast_refresh_delay_secs = parse_secs("SLOT_FAST_REFRESH_DELAY_SECS", v)?.max(0.1);
        }
        if let Some(v) = get("SLOT_FAST_REFRESH_MAX_ATTEMPTS") {
            cfg.fast_refresh_max_attempts = parse_num("SLOT_FAST_REFRESH_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = get("SLOT_CHECK_INTERVAL_SECS") {
            cfg.check_interval = Duration::from_secs(parse_num("SLOT_CHECK_INTERVAL_SECS", v)?);
        }
        if let Some(v) = get("SLOT_LAUNCH_SETTLE_SECS") {
            cfg.launch_settle = Duration::from_secs(parse_num("SLOT_LAUNCH_SETTLE_SECS", v)?);
        }
        if let Some(v) = get("SLOT_MAX_CYCLE_SECS") {
            cfg.max_cycle = Duration::from_secs(parse_num("SLOT_MAX_CYCLE_SECS", v)?);
        }
        if let Some(v) = get("SLOT_TARGET_APP") {
            cfg.target_app = v.to_string();
        }
        if let Some(v) = get("SLOT_MATCH_POLICY") {
            cfg.match_policy = SlotMatchPolicy::parse(v)
                .ok_or_else(|| WatchError::Config(format!("SLOT_MATCH_POLICY must be strict or lenient, got '{}'", v)))?;
        }
        if let Some(v) = get("SLOT_STATS_DB") {
            cfg.stats_db_path = PathBuf::from(v);
        }
        cfg.adapter_cmd = get("SLOT_ADAPTER_CMD").map(str::to_string);
        cfg.telegram_bot_token = get("TELEGRAM_BOT_TOKEN").map(str::to_string);
        cfg.telegram_chat_id = get("TELEGRAM_CHAT_ID").map(str::to_string);

        Ok(cfg)
    }

    /// Falls back to the default when the field holds something no
    /// `Duration` can represent.
    pub fn action_delay(&self) -> Duration {
        Duration::try_from_secs_f32(self.action_delay_secs).unwrap_or(DEFAULT_ACTION_DELAY)
    }

    pub fn fast_refresh_delay(&self) -> Duration {
        Duration::try_from_secs_f32(self.fast_refresh_delay_secs).unwrap_or(DEFAULT_FAST_REFRESH_DELAY)
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| WatchError::Config(format!("{} is not a valid number: '{}'", key, raw)))
}

fn parse_secs(key: &str, raw: &str) -> Result<f32> {
    let secs: f32 = parse_num(key, raw)?;
    if !secs.is_finite() {
        return Err(WatchError::Config(format!("{} must be a finite number of seconds, got '{}'", key, raw)));
    }
    Ok(secs)
}

pub(crate) fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn default_db_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".slot_watch").join("slot_stats.db")
}

/// Reads and edits the `.env` file the settings are loaded from.
pub struct ConfigManager {
    env_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::at(PathBuf::from(".env"))
    }

    pub fn at(env_path: PathBuf) -> Self {
        ConfigManager { env_path }
    }

    pub fn get_all(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Ok(content) = fs::read_to_string(&self.env_path) {
            for line in content.lines() {
                if line.trim_start().starts_with('#') {
                    continue;
                }
                if let Some((key, val)) = line.split_once('=') {
                    map.insert(key.trim().to_string(), val.trim().to_string());
                }
            }
        }
        map
    }

    pub fn update(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || key.contains('=') || key.contains(char::is_whitespace) {
            return Err(WatchError::Config(format!("invalid key '{}'", key)));
        }

        let mut lines = Vec::new();
        let mut found = false;

        let content = fs::read_to_string(&self.env_path).unwrap_or_default();

        for line in content.lines() {
            let is_key = line
                .split_once('=')
                .map(|(k, _)| k.trim() == key)
                .unwrap_or(false);
            if is_key {
                lines.push(format!("{}={}", key, value));
                found = true;
            } else {
                lines.push(line.to_string());
            }
        }

        if !found {
            lines.push(format!("{}={}", key, value));
        }

        fs::write(&self.env_path, lines.join("\n") + "\n")?;
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
