//! Bounded recovery from screens the classifier does not recognise.
//!
//! Escalation inside one cycle: back presses, then home + relaunch of the
//! target app, then safe mode. Across cycles the controller tracks the failure
//! trend: a growing backoff and, after enough consecutive failures, a
//! time-bounded safe mode that suspends all automation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::actions::ActionProvider;
use crate::classifier::{ScreenKind, ScreenResult};
use crate::clock::{self, Clock};

// =====================================================
// CONFIGURATION
// =====================================================

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_back_attempts: u32,
    pub max_relaunch_attempts: u32,
    pub failure_threshold: u32,
    pub safe_mode_duration: Duration,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_back_attempts: 5,
            max_relaunch_attempts: 1,
            failure_threshold: 3,
            safe_mode_duration: Duration::from_secs(5 * 60),
            backoff_step: Duration::from_secs(60),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Wait,
    PressBack,
    PressHome,
    RelaunchTargetApp,
    EnterSafeMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryResult {
    /// The screen is recognised again; route normally.
    Success,
    /// An escalation step was taken; look again next tick.
    Continue,
    /// Safe mode is active, either just entered or already running.
    SafeModeActivated,
    /// Reserved for failures no automatic step can address.
    NeedManualHelp,
}

// =====================================================
// CONTROLLER
// =====================================================

pub struct RecoveryController {
    config: RecoveryConfig,
    target_app: String,
    clock: Arc<dyn Clock>,

    // Per cycle
    back_attempts: u32,
    relaunch_attempts: u32,
    home_pressed: bool,

    // Across cycles
    consecutive_failures: u32,
    current_backoff: Duration,
    safe_mode_until: Option<DateTime<Utc>>,
}

impl RecoveryController {
    pub fn new(config: RecoveryConfig, target_app: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            target_app: target_app.into(),
            clock,
            back_attempts: 0,
            relaunch_attempts: 0,
            home_pressed: false,
            consecutive_failures: 0,
            current_backoff: Duration::ZERO,
            safe_mode_until: None,
        }
    }

    /// Next escalation step. Does not change any counter.
    pub fn get_next_action(&self) -> RecoveryAction {
        if self.is_in_safe_mode() {
            return RecoveryAction::Wait;
        }
        if self.back_attempts < self.config.max_back_attempts {
            return RecoveryAction::PressBack;
        }
        if self.relaunch_attempts < self.config.max_relaunch_attempts {
            return if self.home_pressed {
                RecoveryAction::RelaunchTargetApp
            } else {
                RecoveryAction::PressHome
            };
        }
        RecoveryAction::EnterSafeMode
    }

    /// One recovery step against the freshly classified screen.
    pub fn execute_step(&mut self, screen: &ScreenResult, actions: &dyn ActionProvider) -> RecoveryResult {
        if screen.kind != ScreenKind::Unknown {
            info!("[Recovery] Screen recognised again ({}), recovery succeeded", screen.kind);
            self.consecutive_failures = 0;
            self.current_backoff = Duration::ZERO;
            self.reset_for_new_cycle();
            return RecoveryResult::Success;
        }

        match self.get_next_action() {
            RecoveryAction::Wait => RecoveryResult::SafeModeActivated,
            RecoveryAction::PressBack => {
                self.back_attempts += 1;
                info!("[Recovery] Back {}/{}", self.back_attempts, self.config.max_back_attempts);
                if let Err(e) = actions.global_back() {
                    warn!("[Recovery] Back press not delivered: {}", e);
                }
                RecoveryResult::Continue
            }
            RecoveryAction::PressHome => {
                self.home_pressed = true;
                info!("[Recovery] Back presses exhausted, going home before relaunch");
                if let Err(e) = actions.global_home() {
                    warn!("[Recovery] Home press not delivered: {}", e);
                }
                RecoveryResult::Continue
            }
            RecoveryAction::RelaunchTargetApp => {
                self.relaunch_attempts += 1;
                self.home_pressed = false;
                info!(
                    "[Recovery] Relaunching {} ({}/{})",
                    self.target_app, self.relaunch_attempts, self.config.max_relaunch_attempts
                );
                if let Err(e) = actions.launch_app(&self.target_app) {
                    warn!("[Recovery] Relaunch not delivered: {}", e);
                }
                RecoveryResult::Continue
            }
            RecoveryAction::EnterSafeMode => {
                self.activate_safe_mode();
                RecoveryResult::SafeModeActivated
            }
        }
    }

    pub fn on_cycle_failure(&mut self) {
        self.consecutive_failures += 1;
        self.current_backoff = (self.current_backoff + self.config.backoff_step).min(self.config.max_backoff);
        warn!(
            "[Recovery] Cycle failed ({} in a row), backoff now {}ms",
            self.consecutive_failures,
            self.current_backoff.as_millis()
        );
        if self.consecutive_failures >= self.config.failure_threshold && !self.is_in_safe_mode() {
            self.activate_safe_mode();
        }
    }

    pub fn on_cycle_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_backoff = Duration::ZERO;
        self.reset_for_new_cycle();
    }

    /// Clears the per-cycle attempt counters only.
    pub fn reset_for_new_cycle(&mut self) {
        self.back_attempts = 0;
        self.relaunch_attempts = 0;
        self.home_pressed = false;
    }

    pub fn is_in_safe_mode(&self) -> bool {
        self.safe_mode_until.map(|until| self.clock.now() < until).unwrap_or(false)
    }

    pub fn safe_mode_until(&self) -> Option<DateTime<Utc>> {
        self.safe_mode_until.filter(|_| self.is_in_safe_mode())
    }

    /// Lifts safe mode by hand and forgets the failure streak.
    pub fn deactivate_safe_mode(&mut self) {
        if self.safe_mode_until.take().is_some() {
            info!("[Recovery] Safe mode released manually");
        }
        self.consecutive_failures = 0;
    }

    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn status_string(&self) -> String {
        format!(
            "back={}/{}, relaunch={}/{}, failures={}, backoff={}ms, safeMode={}",
            self.back_attempts,
            self.config.max_back_attempts,
            self.relaunch_attempts,
            self.config.max_relaunch_attempts,
            self.consecutive_failures,
            self.current_backoff.as_millis(),
            self.is_in_safe_mode()
        )
    }

    fn activate_safe_mode(&mut self) {
        let now = self.clock.now();
        let until = now + chrono::Duration::from_std(self.config.safe_mode_duration).unwrap_or(chrono::Duration::zero());
        self.safe_mode_until = Some(until);
        warn!(
            "[Recovery] SAFE MODE until {} ({}s)",
            until.format("%H:%M:%S"),
            clock::elapsed(now, until).as_secs()
        );
    }
}
