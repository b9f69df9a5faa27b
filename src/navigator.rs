//! The navigation state machine.
//!
//! One [`Navigator`] owns the current state, the per-cycle context and the
//! recovery controller. Every tick runs the same pipeline: cycle watchdog,
//! throttle, stuck detection, periodic re-sync, opportunistic jump, then the
//! handler of the current state. Handlers only inspect the snapshot and
//! report a [`Step`]; all transitions are applied in one place.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::actions::{self, ActionProvider};
use crate::classifier::{Classifier, ScreenResult};
use crate::clock::{self, Clock};
use crate::config::MonitorConfig;
use crate::events::{CheckOutcome, EventHub};
use crate::recovery::{RecoveryConfig, RecoveryController, RecoveryResult};
use crate::router;
use crate::schema::UiElement;
use crate::slots::SlotExtractor;
use crate::snapshot::{self, contains_ignore_case, equals_ignore_case};

pub const STUCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(4);
pub const MIN_ACTION_SPACING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NavigationState {
    Idle,
    Bootstrap,
    Recovery,
    FindCategoryTab,
    FindSearchField,
    TypeSearchQuery,
    SelectResource,
    ClickEnroll,
    FindTaskCard,
    CheckAvailability,
    RefreshCycle,
}

impl NavigationState {
    pub const ALL: [NavigationState; 11] = [
        NavigationState::Idle,
        NavigationState::Bootstrap,
        NavigationState::Recovery,
        NavigationState::FindCategoryTab,
        NavigationState::FindSearchField,
        NavigationState::TypeSearchQuery,
        NavigationState::SelectResource,
        NavigationState::ClickEnroll,
        NavigationState::FindTaskCard,
        NavigationState::CheckAvailability,
        NavigationState::RefreshCycle,
    ];

    /// Fraction of the base action delay this state waits between actions.
    fn delay_multiplier(self) -> f32 {
        match self {
            NavigationState::Bootstrap => 0.3,
            NavigationState::Recovery | NavigationState::Idle => 1.0,
            NavigationState::FindCategoryTab
            | NavigationState::FindSearchField
            | NavigationState::TypeSearchQuery
            | NavigationState::SelectResource
            | NavigationState::ClickEnroll => 0.5,
            NavigationState::FindTaskCard => 0.4,
            NavigationState::CheckAvailability => 0.2,
            NavigationState::RefreshCycle => 1.0,
        }
    }

    fn description(self) -> &'static str {
        match self {
            NavigationState::Idle => "Idle",
            NavigationState::Bootstrap => "Working out the current screen",
            NavigationState::Recovery => "Recovering from an unknown screen",
            NavigationState::FindCategoryTab => "Opening the locations tab",
            NavigationState::FindSearchField => "Opening location search",
            NavigationState::TypeSearchQuery => "Typing the location name",
            NavigationState::SelectResource => "Selecting the location",
            NavigationState::ClickEnroll => "Opening enrollment",
            NavigationState::FindTaskCard => "Looking for the task",
            NavigationState::CheckAvailability => "Checking availability",
            NavigationState::RefreshCycle => "Refreshing the task list",
        }
    }
}

impl fmt::Display for NavigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Bookkeeping for one monitoring cycle.
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub cycle_id: u64,
    pub start_time: DateTime<Utc>,
    pub refresh_attempts: u32,
    pub last_action_time: Option<DateTime<Utc>>,
    pub last_progress_time: DateTime<Utc>,
    pub last_resync_time: DateTime<Utc>,
}

impl CycleContext {
    fn new(cycle_id: u64, now: DateTime<Utc>) -> Self {
        Self {
            cycle_id,
            start_time: now,
            refresh_attempts: 0,
            last_action_time: None,
            last_progress_time: now,
            last_resync_time: now,
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found(Vec<String>),
    NotFound,
    Failed(String),
}

/// What a state handler observed.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    /// Nothing usable on screen; retry on a later tick.
    Stay,
    /// An action was issued but the state does not change.
    Acted,
    /// Move to another state. `acted` is set when an action was issued.
    Go { to: NavigationState, acted: bool },
    Finish(Resolution),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No cycle is running.
    Inactive,
    Throttled,
    NoSnapshot,
    ForcedBootstrap,
    Handled,
    CycleFinished(CheckOutcome),
}

type Handler = fn(&mut Navigator, &UiElement, &dyn ActionProvider) -> Step;

fn handler_for(state: NavigationState) -> Handler {
    match state {
        NavigationState::Idle => Navigator::handle_idle,
        NavigationState::Bootstrap => Navigator::handle_bootstrap,
        NavigationState::Recovery => Navigator::handle_recovery,
        NavigationState::FindCategoryTab => Navigator::handle_find_category_tab,
        NavigationState::FindSearchField => Navigator::handle_find_search_field,
        NavigationState::TypeSearchQuery => Navigator::handle_type_search_query,
        NavigationState::SelectResource => Navigator::handle_select_resource,
        NavigationState::ClickEnroll => Navigator::handle_click_enroll,
        NavigationState::FindTaskCard => Navigator::handle_find_task_card,
        NavigationState::CheckAvailability => Navigator::handle_check_availability,
        NavigationState::RefreshCycle => Navigator::handle_refresh_cycle,
    }
}

pub struct Navigator {
    config: MonitorConfig,
    classifier: Classifier,
    extractor: SlotExtractor,
    recovery: RecoveryController,
    clock: Arc<dyn Clock>,
    events: Arc<EventHub>,
    state: NavigationState,
    ctx: Option<CycleContext>,
    next_cycle_id: u64,
}

impl Navigator {
    pub fn new(config: MonitorConfig, clock: Arc<dyn Clock>, events: Arc<EventHub>) -> Self {
        let recovery = RecoveryController::new(RecoveryConfig::default(), config.target_app.clone(), clock.clone());
        Self::with_recovery(config, clock, events, recovery)
    }

    pub fn with_recovery(
        config: MonitorConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventHub>,
        recovery: RecoveryController,
    ) -> Self {
        Self {
            classifier: Classifier::new(&config),
            extractor: SlotExtractor::new(config.match_policy, config.vocabulary.no_slots_marker.clone()),
            config,
            recovery,
            clock,
            events,
            state: NavigationState::Idle,
            ctx: None,
            next_cycle_id: 1,
        }
    }

    pub fn state(&self) -> NavigationState {
        self.state
    }

    pub fn context(&self) -> Option<&CycleContext> {
        self.ctx.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.state == NavigationState::Idle
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.recovery
    }

    pub fn recovery_mut(&mut self) -> &mut RecoveryController {
        &mut self.recovery
    }

    pub fn classify(&self, snapshot: Option<&UiElement>) -> ScreenResult {
        self.classifier.classify(snapshot)
    }

    /// Begins a new cycle from Bootstrap. Refused while a cycle is running or
    /// safe mode is active.
    pub fn start_cycle(&mut self) -> bool {
        if !self.is_idle() {
            debug!("[Navigator] Cycle already running in {}", self.state);
            return false;
        }
        if let Some(until) = self.recovery.safe_mode_until() {
            let msg = format!("Safe mode active until {}", until.format("%H:%M:%S"));
            info!("[Navigator] {}, cycle not started", msg);
            self.events.emit_state(msg);
            return false;
        }

        let cycle_id = self.next_cycle_id;
        self.next_cycle_id += 1;
        self.recovery.reset_for_new_cycle();
        self.ctx = Some(CycleContext::new(cycle_id, self.clock.now()));
        info!("[Navigator] Cycle #{} started", cycle_id);
        self.set_state(NavigationState::Bootstrap);
        true
    }

    /// Abandons the running cycle. Actions already issued stay issued.
    pub fn stop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            info!("[Navigator] Cycle #{} stopped in {}", ctx.cycle_id, self.state);
        }
        self.state = NavigationState::Idle;
        self.events.emit_state("Stopped");
    }

    /// Ends the running cycle as failed without touching the device. Used
    /// when a tick faulted and the cycle state can no longer be trusted.
    pub fn abort_cycle(&mut self, reason: impl Into<String>) -> Option<CheckOutcome> {
        if self.ctx.is_none() {
            self.drop_orphaned_state();
            return None;
        }
        self.conclude(Resolution::Failed(reason.into()))
    }

    pub fn tick(&mut self, snapshot: Option<&UiElement>, actions: &dyn ActionProvider) -> TickOutcome {
        let Some(ctx) = self.ctx.as_ref() else {
            self.drop_orphaned_state();
            return TickOutcome::Inactive;
        };
        if self.state == NavigationState::Idle {
            return TickOutcome::Inactive;
        }
        let now = self.clock.now();

        // Cycle watchdog
        if clock::elapsed(ctx.start_time, now) > self.config.max_cycle {
            let reason = format!("cycle timed out in {}", self.state);
            warn!("[Navigator] {}", reason);
            return self.finish(Resolution::Failed(reason), actions);
        }

        // 1. Throttle
        if let Some(last) = ctx.last_action_time {
            if clock::elapsed(last, now) < self.action_delay(self.state) {
                return TickOutcome::Throttled;
            }
        }

        // 2. Stuck detection
        if !matches!(self.state, NavigationState::Bootstrap | NavigationState::Recovery)
            && clock::elapsed(ctx.last_progress_time, now) > STUCK_TIMEOUT
        {
            warn!("[Navigator] No progress in {} for {}s, restarting from Bootstrap", self.state, STUCK_TIMEOUT.as_secs());
            self.set_state(NavigationState::Bootstrap);
            self.mark_progress(now);
            return TickOutcome::ForcedBootstrap;
        }

        let Some(root) = snapshot else {
            debug!("[Navigator] No snapshot available in {}", self.state);
            return TickOutcome::NoSnapshot;
        };

        // 3. Periodic re-sync
        if clock::elapsed(ctx.last_resync_time, now) > RESYNC_INTERVAL {
            self.resync(root, now);
        }

        // 4. Opportunistic jump
        if self.should_jump_to_tasks(root) {
            info!("[Navigator] Task list visible, jumping from {} to FindTaskCard", self.state);
            self.set_state(NavigationState::FindTaskCard);
            self.mark_progress(now);
        }

        // 5. Dispatch
        let step = handler_for(self.state)(self, root, actions);
        self.apply(step, now, actions)
    }

    // =====================================================
    // PIPELINE
    // =====================================================

    fn action_delay(&self, state: NavigationState) -> Duration {
        let delay = match state {
            NavigationState::RefreshCycle => self.config.fast_refresh_delay(),
            other => self.config.action_delay().mul_f32(other.delay_multiplier()),
        };
        delay.max(MIN_ACTION_SPACING)
    }

    fn resync(&mut self, root: &UiElement, now: DateTime<Utc>) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.last_resync_time = now;
        }
        if matches!(self.state, NavigationState::Idle | NavigationState::RefreshCycle) {
            return;
        }

        let screen = self.classifier.classify(Some(root));
        if !screen.is_confident() {
            return;
        }
        let target = router::route(&screen);
        if target == NavigationState::Recovery || target == self.state {
            return;
        }
        if router::belongs_to_screen(self.state, screen.kind) {
            return;
        }

        info!("[Navigator] Re-sync: on {} while in {}, switching to {}", screen.kind, self.state, target);
        self.set_state(target);
        self.mark_progress(now);
    }

    fn should_jump_to_tasks(&self, root: &UiElement) -> bool {
        if matches!(
            self.state,
            NavigationState::FindTaskCard
                | NavigationState::CheckAvailability
                | NavigationState::RefreshCycle
                | NavigationState::Idle
        ) {
            return false;
        }
        let vocab = &self.config.vocabulary;
        let texts = snapshot::collect_texts(root);
        let has = |needle: &str| texts.iter().any(|t| contains_ignore_case(t, needle));

        has(&self.config.target_task) && (has(&vocab.back_to_tasks_label) || has(&vocab.choose_time_label))
    }

    fn apply(&mut self, step: Step, now: DateTime<Utc>, actions: &dyn ActionProvider) -> TickOutcome {
        match step {
            Step::Stay => TickOutcome::Handled,
            Step::Acted => {
                self.mark_action(now);
                TickOutcome::Handled
            }
            Step::Go { to, acted } => {
                if acted {
                    self.mark_action(now);
                }
                if to != self.state {
                    self.set_state(to);
                    self.mark_progress(now);
                }
                TickOutcome::Handled
            }
            Step::Finish(resolution) => self.finish(resolution, actions),
        }
    }

    fn finish(&mut self, resolution: Resolution, actions: &dyn ActionProvider) -> TickOutcome {
        let found = matches!(resolution, Resolution::Found(_));
        let Some(outcome) = self.conclude(resolution) else {
            return TickOutcome::Inactive;
        };
        // The cycle is already closed, so a fault here cannot strand it.
        if found {
            if let Err(e) = actions.global_home() {
                warn!("[Navigator] Home press after success not delivered: {}", e);
            }
        }
        TickOutcome::CycleFinished(outcome)
    }

    fn conclude(&mut self, resolution: Resolution) -> Option<CheckOutcome> {
        let Some(ctx) = self.ctx.take() else {
            self.state = NavigationState::Idle;
            return None;
        };
        let now = self.clock.now();
        let duration_ms = clock::elapsed(ctx.start_time, now).as_millis() as u64;

        let outcome = match resolution {
            Resolution::Found(labels) => {
                info!("[Navigator] Cycle #{}: slots found {:?}", ctx.cycle_id, labels);
                self.events.publish_slots(ctx.cycle_id, Some(labels.clone()));
                self.events.emit_state(format!("Slots found: {}", labels.join(", ")));
                self.recovery.on_cycle_success();
                CheckOutcome {
                    cycle_id: ctx.cycle_id,
                    timestamp: now,
                    success: true,
                    slots_found: true,
                    slot_labels: Some(labels),
                    duration_ms,
                    error: None,
                }
            }
            Resolution::NotFound => {
                info!("[Navigator] Cycle #{}: no slots", ctx.cycle_id);
                self.events.publish_slots(ctx.cycle_id, None);
                self.events.emit_state("No slots");
                self.recovery.on_cycle_success();
                CheckOutcome {
                    cycle_id: ctx.cycle_id,
                    timestamp: now,
                    success: true,
                    slots_found: false,
                    slot_labels: None,
                    duration_ms,
                    error: None,
                }
            }
            Resolution::Failed(reason) => {
                warn!("[Navigator] Cycle #{} failed: {}", ctx.cycle_id, reason);
                self.recovery.on_cycle_failure();
                match self.recovery.safe_mode_until() {
                    Some(until) => self.events.emit_state(format!("Safe mode active until {}", until.format("%H:%M:%S"))),
                    None => self.events.emit_state(format!("Check failed: {}", reason)),
                }
                CheckOutcome {
                    cycle_id: ctx.cycle_id,
                    timestamp: now,
                    success: false,
                    slots_found: false,
                    slot_labels: None,
                    duration_ms,
                    error: Some(reason),
                }
            }
        };

        self.state = NavigationState::Idle;
        self.events.submit_outcome(outcome.clone());
        Some(outcome)
    }

    /// A non-Idle state with no cycle behind it can only follow a faulted tick.
    fn drop_orphaned_state(&mut self) {
        if !self.is_idle() {
            warn!("[Navigator] {} without a cycle, resetting to Idle", self.state);
            self.state = NavigationState::Idle;
        }
    }

    fn set_state(&mut self, state: NavigationState) {
        if self.state != state {
            debug!("[Navigator] {} -> {}", self.state, state);
        }
        self.state = state;
        self.events.emit_state(state.description());
    }

    fn mark_progress(&mut self, now: DateTime<Utc>) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.last_progress_time = now;
        }
    }

    fn mark_action(&mut self, now: DateTime<Utc>) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.last_action_time = Some(now);
        }
    }

    fn text_visible(root: &UiElement, needle: &str) -> bool {
        snapshot::exists(root, |n| {
            contains_ignore_case(n.text_or_empty(), needle) || contains_ignore_case(n.description_or_empty(), needle)
        })
    }

    // =====================================================
    // STATE HANDLERS
    // =====================================================

    fn handle_idle(&mut self, _root: &UiElement, _actions: &dyn ActionProvider) -> Step {
        Step::Stay
    }

    fn handle_bootstrap(&mut self, root: &UiElement, _actions: &dyn ActionProvider) -> Step {
        let screen = self.classifier.classify(Some(root));
        if !router::is_safe_to_automate(&screen) {
            warn!(
                "[Navigator] Screen not recognised (confidence {:.2}), handing over to recovery",
                screen.confidence
            );
            return Step::Go { to: NavigationState::Recovery, acted: false };
        }
        let target = router::route(&screen);
        info!("[Navigator] Bootstrap: {} ({:.2}) -> {}", screen.kind, screen.confidence, target);
        Step::Go { to: target, acted: false }
    }

    fn handle_recovery(&mut self, root: &UiElement, actions: &dyn ActionProvider) -> Step {
        if let Some(until) = self.recovery.safe_mode_until() {
            return Step::Finish(Resolution::Failed(format!(
                "safe mode active until {}",
                until.format("%H:%M:%S")
            )));
        }

        let screen = self.classifier.classify(Some(root));
        match self.recovery.execute_step(&screen, actions) {
            RecoveryResult::Success => Step::Go { to: router::route(&screen), acted: false },
            RecoveryResult::Continue => Step::Acted,
            RecoveryResult::SafeModeActivated => Step::Finish(Resolution::Failed(format!(
                "recovery exhausted ({})",
                self.recovery.status_string()
            ))),
            RecoveryResult::NeedManualHelp => {
                Step::Finish(Resolution::Failed("recovery needs manual help".to_string()))
            }
        }
    }

    fn handle_find_category_tab(&mut self, root: &UiElement, actions: &dyn ActionProvider) -> Step {
        let vocab = &self.config.vocabulary;
        let hit = snapshot::find(root, |n| {
            n.id_or_empty().contains(vocab.category_tab_id.as_str())
                || equals_ignore_case(n.text_or_empty().trim(), &vocab.category_tab_label)
        });
        match hit {
            Some(hit) if actions::click_with_fallback(actions, root, &hit) => {
                Step::Go { to: NavigationState::FindSearchField, acted: true }
            }
            _ => Step::Stay,
        }
    }

    fn handle_find_search_field(&mut self, root: &UiElement, actions: &dyn ActionProvider) -> Step {
        let vocab = &self.config.vocabulary;
        let search_open = snapshot::exists(root, |n| n.id_or_empty().contains(vocab.search_view_id.as_str()))
            || snapshot::find_focused_editable(root).is_some();
        if search_open {
            return Step::Go { to: NavigationState::TypeSearchQuery, acted: false };
        }

        if !Self::text_visible(root, &vocab.list_header) {
            return Step::Stay;
        }
        let (x, y) = vocab.search_icon_xy;
        match actions.tap_at(x, y) {
            Ok(()) => Step::Go { to: NavigationState::TypeSearchQuery, acted: true },
            Err(e) => {
                warn!("[Navigator] Search icon tap not delivered: {}", e);
                Step::Stay
            }
        }
    }

    fn handle_type_search_query(&mut self, root: &UiElement, actions: &dyn ActionProvider) -> Step {
        let search_view_id = self.config.vocabulary.search_view_id.as_str();
        let field = snapshot::find_focused_editable(root)
            .or_else(|| snapshot::find(root, |n| n.editable && n.id_or_empty().contains(search_view_id)));
        let Some(field) = field else {
            return Step::Stay;
        };
        match actions.set_text(&field.node_ref(), &self.config.target_location) {
            Ok(()) => Step::Go { to: NavigationState::SelectResource, acted: true },
            Err(e) => {
                warn!("[Navigator] Typing location not delivered: {}", e);
                Step::Stay
            }
        }
    }

    fn handle_select_resource(&mut self, root: &UiElement, actions: &dyn ActionProvider) -> Step {
        let location = self.config.target_location.as_str();
        let hit = snapshot::find(root, |n| !n.editable && equals_ignore_case(n.text_or_empty().trim(), location));
        match hit {
            Some(hit) if actions::click_with_fallback(actions, root, &hit) => {
                Step::Go { to: NavigationState::ClickEnroll, acted: true }
            }
            _ => Step::Stay,
        }
    }

    fn handle_click_enroll(&mut self, root: &UiElement, actions: &dyn ActionProvider) -> Step {
        let enroll = self.config.vocabulary.enroll_label.as_str();
        let hit = snapshot::find(root, |n| equals_ignore_case(n.text_or_empty().trim(), enroll));
        match hit {
            Some(hit) if actions::click_with_fallback(actions, root, &hit) => {
                Step::Go { to: NavigationState::FindTaskCard, acted: true }
            }
            _ => Step::Stay,
        }
    }

    fn handle_find_task_card(&mut self, root: &UiElement, actions: &dyn ActionProvider) -> Step {
        if Self::text_visible(root, &self.config.target_task) {
            return Step::Go { to: NavigationState::CheckAvailability, acted: false };
        }
        let Some(list) = snapshot::find_scrollable(root) else {
            return Step::Stay;
        };
        match actions.scroll_forward(&list.node_ref()) {
            Ok(()) => Step::Acted,
            Err(e) => {
                warn!("[Navigator] Scroll not delivered: {}", e);
                Step::Stay
            }
        }
    }

    fn handle_check_availability(&mut self, root: &UiElement, _actions: &dyn ActionProvider) -> Step {
        if !Self::text_visible(root, &self.config.target_task) {
            if Self::text_visible(root, &self.config.vocabulary.enroll_label) {
                return Step::Go { to: NavigationState::ClickEnroll, acted: false };
            }
            return Step::Stay;
        }

        let verdict = self.extractor.evaluate(root);
        if verdict.found {
            if let Some(ctx) = self.ctx.as_mut() {
                ctx.refresh_attempts = 0;
            }
            return Step::Finish(Resolution::Found(verdict.labels));
        }

        let max_attempts = self.config.fast_refresh_max_attempts;
        let enabled = self.config.fast_refresh_enabled;
        if let Some(ctx) = self.ctx.as_mut() {
            if enabled && ctx.refresh_attempts < max_attempts {
                ctx.refresh_attempts += 1;
                debug!("[Navigator] No slots, fast refresh {}/{}", ctx.refresh_attempts, max_attempts);
                return Step::Go { to: NavigationState::RefreshCycle, acted: false };
            }
        }
        Step::Finish(Resolution::NotFound)
    }

    fn handle_refresh_cycle(&mut self, _root: &UiElement, actions: &dyn ActionProvider) -> Step {
        match actions.global_back() {
            Ok(()) => Step::Go { to: NavigationState::ClickEnroll, acted: true },
            Err(e) => {
                warn!("[Navigator] Refresh back press not delivered: {}", e);
                Step::Stay
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::{DeviceAction, NodeRef};
    use crate::testing::{
        el, main_hub, resource_card, resource_list, resource_list_with_search_open, task_list, text,
        unknown_screen, RecordingActions,
    };
    use tokio::sync::mpsc;

    struct Harness {
        nav: Navigator,
        clock: Arc<ManualClock>,
        actions: RecordingActions,
        events: Arc<EventHub>,
        outcomes: mpsc::Receiver<CheckOutcome>,
    }

    fn harness_with(config: MonitorConfig) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let (hub, outcomes) = EventHub::new(16);
        let events = Arc::new(hub);
        let nav = Navigator::new(config, clock.clone(), events.clone());
        Harness { nav, clock, actions: RecordingActions::default(), events, outcomes }
    }

    fn harness() -> Harness {
        harness_with(MonitorConfig::default())
    }

    impl Harness {
        /// Waits out the longest per-state delay, then ticks.
        fn step(&mut self, screen: &UiElement) -> TickOutcome {
            self.clock.advance_ms(3_100);
            self.nav.tick(Some(screen), &self.actions)
        }
    }

    #[test]
    fn test_tick_without_cycle_is_inactive() {
        let mut h = harness();
        assert_eq!(h.nav.tick(Some(&main_hub()), &h.actions), TickOutcome::Inactive);
        assert!(h.actions.actions().is_empty());
    }

    #[test]
    fn test_full_cycle_finds_slots() {
        let mut h = harness();
        assert!(h.nav.start_cycle());

        h.step(&main_hub());
        assert_eq!(h.nav.state(), NavigationState::FindCategoryTab);
        h.step(&main_hub());
        assert_eq!(h.nav.state(), NavigationState::FindSearchField);
        assert_eq!(h.actions.actions().last(), Some(&DeviceAction::UiClick { path: vec![1, 0] }));

        h.step(&resource_list());
        assert_eq!(h.nav.state(), NavigationState::TypeSearchQuery);
        assert_eq!(h.actions.actions().last(), Some(&DeviceAction::UiTap { x: 373, y: 2367 }));

        h.step(&resource_list_with_search_open());
        assert_eq!(h.nav.state(), NavigationState::SelectResource);
        assert_eq!(
            h.actions.actions().last(),
            Some(&DeviceAction::UiSetText { path: vec![1], text: "Петровское".to_string() })
        );

        h.step(&resource_list_with_search_open());
        assert_eq!(h.nav.state(), NavigationState::ClickEnroll);
        assert_eq!(h.actions.actions().last(), Some(&DeviceAction::UiClick { path: vec![2, 0] }));

        h.step(&resource_card());
        assert_eq!(h.nav.state(), NavigationState::FindTaskCard);
        assert_eq!(h.actions.actions().last(), Some(&DeviceAction::UiClick { path: vec![2] }));

        let tasks = task_list(&["7 февраля, Сб", "8 февраля, Вс"]);
        h.step(&tasks);
        assert_eq!(h.nav.state(), NavigationState::CheckAvailability);

        let outcome = match h.step(&tasks) {
            TickOutcome::CycleFinished(outcome) => outcome,
            other => panic!("expected finished cycle, got {:?}", other),
        };
        assert!(outcome.success && outcome.slots_found);
        assert_eq!(outcome.slot_labels, Some(vec!["7 февраля, Сб".to_string(), "8 февраля, Вс".to_string()]));
        assert!(h.nav.is_idle());
        assert_eq!(h.actions.actions().last(), Some(&DeviceAction::GlobalHome));

        let status = h.events.subscribe_slots().borrow().clone().unwrap();
        assert_eq!(status.labels.unwrap().len(), 2);
        assert_eq!(h.outcomes.try_recv().unwrap(), outcome);
        assert!(h.outcomes.try_recv().is_err());
    }

    #[test]
    fn test_no_slots_finishes_once() {
        let mut h = harness();
        h.nav.start_cycle();
        let tasks = task_list(&["7 февраля, Сб", "НЕТ МЕСТ"]);
        h.step(&tasks); // bootstrap, jump, task visible
        assert_eq!(h.nav.state(), NavigationState::CheckAvailability);
        let outcome = match h.step(&tasks) {
            TickOutcome::CycleFinished(o) => o,
            other => panic!("unexpected {:?}", other),
        };
        assert!(outcome.success);
        assert!(!outcome.slots_found);
        assert_eq!(h.events.subscribe_slots().borrow().clone().unwrap().labels, None);
        assert_eq!(h.step(&tasks), TickOutcome::Inactive);
        assert!(h.outcomes.try_recv().is_ok());
        assert!(h.outcomes.try_recv().is_err());
    }

    #[test]
    fn test_fast_refresh_loops_back_to_enroll() {
        let config = MonitorConfig { fast_refresh_enabled: true, fast_refresh_max_attempts: 1, ..MonitorConfig::default() };
        let mut h = harness_with(config);
        h.nav.start_cycle();
        let tasks = task_list(&["НЕТ МЕСТ"]);

        h.step(&tasks);
        assert_eq!(h.nav.state(), NavigationState::CheckAvailability);
        h.step(&tasks);
        assert_eq!(h.nav.state(), NavigationState::RefreshCycle);
        assert_eq!(h.nav.context().unwrap().refresh_attempts, 1);

        h.step(&tasks);
        assert_eq!(h.nav.state(), NavigationState::ClickEnroll);
        assert_eq!(h.actions.actions().last(), Some(&DeviceAction::GlobalBack));

        h.step(&resource_card());
        h.step(&tasks);
        assert_eq!(h.nav.state(), NavigationState::CheckAvailability);
        assert!(matches!(h.step(&tasks), TickOutcome::CycleFinished(_)));
    }

    #[test]
    fn test_throttle_blocks_fast_ticks() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&main_hub());
        h.step(&main_hub()); // click, action time recorded
        h.clock.advance_ms(500);
        assert_eq!(h.nav.tick(Some(&resource_list()), &h.actions), TickOutcome::Throttled);
        h.clock.advance_ms(1_100);
        assert_eq!(h.nav.tick(Some(&resource_list()), &h.actions), TickOutcome::Handled);
        assert_eq!(h.nav.state(), NavigationState::TypeSearchQuery);
    }

    #[test]
    fn test_delays_respect_floor() {
        let config = MonitorConfig { action_delay_secs: 0.2, fast_refresh_delay_secs: 0.01, ..MonitorConfig::default() };
        let h = harness_with(config);
        for state in NavigationState::ALL {
            assert!(h.nav.action_delay(state) >= MIN_ACTION_SPACING);
        }
    }

    /// Task list that does not show the target task yet.
    fn other_tasks() -> UiElement {
        el().child(text("К списку работ"))
            .child(text("Выберите время"))
            .child(el().scrollable().child(text("Сортировка")))
    }

    #[test]
    fn test_scenario_d_stuck_forces_bootstrap() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&other_tasks());
        assert_eq!(h.nav.state(), NavigationState::FindTaskCard);

        h.clock.advance(Duration::from_secs(11));
        assert_eq!(h.nav.tick(Some(&other_tasks()), &h.actions), TickOutcome::ForcedBootstrap);
        assert_eq!(h.nav.state(), NavigationState::Bootstrap);
    }

    #[test]
    fn test_scrolling_is_not_progress() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&other_tasks());
        assert_eq!(h.nav.state(), NavigationState::FindTaskCard);
        for _ in 0..3 {
            assert_eq!(h.step(&other_tasks()), TickOutcome::Handled);
        }
        assert_eq!(h.nav.state(), NavigationState::FindTaskCard);
        assert_eq!(h.step(&other_tasks()), TickOutcome::ForcedBootstrap);
        assert_eq!(h.actions.actions().len(), 3);
        assert!(h.actions.actions().iter().all(|a| matches!(a, DeviceAction::UiScrollForward { .. })));
    }

    #[test]
    fn test_resync_corrects_desync() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&main_hub());
        assert_eq!(h.nav.state(), NavigationState::FindCategoryTab);

        // The app jumped to the card on its own; after the resync interval the
        // machine follows it instead of hunting for the tab.
        h.clock.advance(Duration::from_secs(2));
        h.step(&resource_card());
        assert_eq!(h.nav.state(), NavigationState::FindTaskCard);
        assert_eq!(h.actions.actions().last(), Some(&DeviceAction::UiClick { path: vec![2] }));
    }

    #[test]
    fn test_resync_keeps_sibling_states_on_same_screen() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&resource_list());
        h.step(&resource_list()); // tap search icon
        assert_eq!(h.nav.state(), NavigationState::TypeSearchQuery);
        h.clock.advance(Duration::from_secs(5));
        h.step(&resource_list_with_search_open());
        assert_eq!(h.nav.state(), NavigationState::SelectResource);
    }

    #[test]
    fn test_opportunistic_jump_needs_confirming_marker() {
        let mut h = harness();
        h.nav.start_cycle();
        h.clock.advance_ms(200);
        h.nav.tick(Some(&main_hub()), &h.actions);
        assert_eq!(h.nav.state(), NavigationState::FindCategoryTab);

        let lone_label = el()
            .child(text("Производство непрофиль"))
            .child(text("Склады").with_id("ru.ozon.hire:id/warehouseTab").clickable());
        h.clock.advance_ms(200);
        h.nav.tick(Some(&lone_label), &h.actions);
        assert_eq!(h.nav.state(), NavigationState::FindSearchField);

        h.clock.advance_ms(1_600);
        h.nav.tick(Some(&task_list(&[])), &h.actions);
        assert_eq!(h.nav.state(), NavigationState::CheckAvailability);
    }

    #[test]
    fn test_unknown_screen_goes_through_recovery_to_safe_mode() {
        let mut h = harness();
        h.nav.start_cycle();
        let screen = unknown_screen();
        h.step(&screen);
        assert_eq!(h.nav.state(), NavigationState::Recovery);

        let mut finished = None;
        for _ in 0..10 {
            if let TickOutcome::CycleFinished(o) = h.step(&screen) {
                finished = Some(o);
                break;
            }
        }
        let outcome = finished.expect("recovery should exhaust");
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("recovery exhausted"));
        assert!(h.nav.recovery().is_in_safe_mode());
        assert!(!h.nav.start_cycle());
        assert!(h.events.last_state().starts_with("Safe mode active until"));
    }

    #[test]
    fn test_recovery_success_routes_normally() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&unknown_screen());
        h.step(&unknown_screen());
        assert_eq!(h.actions.actions(), vec![DeviceAction::GlobalBack]);
        h.step(&resource_card());
        assert_eq!(h.nav.state(), NavigationState::ClickEnroll);
    }

    #[test]
    fn test_check_availability_falls_back_to_enroll() {
        let mut h = harness();
        h.nav.start_cycle();
        h.clock.advance_ms(200);
        h.nav.tick(Some(&task_list(&[])), &h.actions);
        assert_eq!(h.nav.state(), NavigationState::CheckAvailability);
        h.clock.advance_ms(200);
        h.nav.tick(Some(&resource_card()), &h.actions);
        assert_eq!(h.nav.state(), NavigationState::ClickEnroll);
        assert!(h.actions.actions().is_empty());
    }

    #[test]
    fn test_stop_suppresses_ticks() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&main_hub());
        h.nav.stop();
        assert!(h.nav.is_idle());
        assert_eq!(h.step(&main_hub()), TickOutcome::Inactive);
        assert!(h.actions.actions().is_empty());
        assert_eq!(h.events.last_state(), "Stopped");
        assert!(h.outcomes.try_recv().is_err());
    }

    #[test]
    fn test_cycle_watchdog_fails_long_cycles() {
        let config = MonitorConfig { max_cycle: Duration::from_secs(20), ..MonitorConfig::default() };
        let mut h = harness_with(config);
        h.nav.start_cycle();
        h.clock.advance(Duration::from_secs(21));
        match h.nav.tick(Some(&main_hub()), &h.actions) {
            TickOutcome::CycleFinished(o) => assert_eq!(o.error.as_deref(), Some("cycle timed out in Bootstrap")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.nav.recovery().consecutive_failures(), 1);
    }

    #[test]
    fn test_click_failure_taps_once_and_advances() {
        let mut h = harness();
        h.actions = RecordingActions::failing_clicks();
        h.nav.start_cycle();
        h.step(&main_hub());
        h.step(&main_hub());
        assert_eq!(h.actions.actions(), vec![DeviceAction::UiTap { x: 100, y: 2350 }]);
        assert_eq!(h.nav.state(), NavigationState::FindSearchField);
    }

    /// Finishing a found cycle presses home; this one blows up doing it.
    struct HomeBlowsUp(RecordingActions);

    impl ActionProvider for HomeBlowsUp {
        fn click(&self, target: &NodeRef) -> crate::error::Result<()> {
            self.0.click(target)
        }
        fn set_text(&self, target: &NodeRef, text: &str) -> crate::error::Result<()> {
            self.0.set_text(target, text)
        }
        fn scroll_forward(&self, target: &NodeRef) -> crate::error::Result<()> {
            self.0.scroll_forward(target)
        }
        fn global_back(&self) -> crate::error::Result<()> {
            self.0.global_back()
        }
        fn global_home(&self) -> crate::error::Result<()> {
            panic!("home button gone")
        }
        fn launch_app(&self, app_id: &str) -> crate::error::Result<()> {
            self.0.launch_app(app_id)
        }
        fn tap_at(&self, x: i32, y: i32) -> crate::error::Result<()> {
            self.0.tap_at(x, y)
        }
    }

    #[test]
    fn test_fault_while_pressing_home_leaves_cycle_closed() {
        let mut h = harness();
        let actions = HomeBlowsUp(RecordingActions::default());
        let tasks = task_list(&["7 февраля, Сб"]);
        assert!(h.nav.start_cycle());

        h.clock.advance_ms(3_100);
        h.nav.tick(Some(&tasks), &actions);
        assert_eq!(h.nav.state(), NavigationState::CheckAvailability);

        h.clock.advance_ms(3_100);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| h.nav.tick(Some(&tasks), &actions)));
        assert!(result.is_err());

        assert!(h.nav.is_idle());
        assert!(h.nav.context().is_none());
        let outcome = h.outcomes.try_recv().unwrap();
        assert!(outcome.slots_found);
        assert!(h.nav.start_cycle());
    }

    #[test]
    fn test_state_without_cycle_heals_to_idle() {
        let mut h = harness();
        h.nav.state = NavigationState::CheckAvailability;
        assert_eq!(h.step(&task_list(&["7 февраля, Сб"])), TickOutcome::Inactive);
        assert!(h.nav.is_idle());
        assert!(h.nav.start_cycle());
    }

    #[test]
    fn test_abort_cycle_reports_failure() {
        let mut h = harness();
        h.nav.start_cycle();
        h.step(&main_hub());
        assert_eq!(h.nav.state(), NavigationState::FindCategoryTab);

        let outcome = h.nav.abort_cycle("tick panicked in FindCategoryTab").unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("tick panicked in FindCategoryTab"));
        assert!(h.nav.is_idle());
        assert_eq!(h.nav.recovery().consecutive_failures(), 1);
        assert_eq!(h.outcomes.try_recv().unwrap(), outcome);

        assert!(h.nav.abort_cycle("again").is_none());
        assert!(h.outcomes.try_recv().is_err());
    }

    #[test]
    fn test_every_transition_stays_in_state_set() {
        let screens = [
            main_hub(),
            resource_list(),
            resource_list_with_search_open(),
            resource_card(),
            task_list(&["7 февраля, Сб"]),
            task_list(&["НЕТ МЕСТ"]),
            unknown_screen(),
        ];
        let mut h = harness_with(MonitorConfig { fast_refresh_enabled: true, ..MonitorConfig::default() });
        h.nav.start_cycle();
        for i in 0..200usize {
            let screen = &screens[(i * 7 + i / 3) % screens.len()];
            h.step(screen);
            assert!(NavigationState::ALL.contains(&h.nav.state()));
            if h.nav.is_idle() {
                h.nav.recovery_mut().deactivate_safe_mode();
                h.nav.start_cycle();
            }
        }
    }
}
