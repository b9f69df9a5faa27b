//! Shared fixtures for unit tests.

use std::sync::Mutex;

use crate::actions::ActionProvider;
use crate::error::{Result, WatchError};
use crate::schema::{Bounds, DeviceAction, NodeRef, UiElement};

pub fn el() -> UiElement {
    UiElement::default()
}

pub fn text(value: &str) -> UiElement {
    UiElement { text: Some(value.to_string()), ..UiElement::default() }
}

pub fn desc(value: &str) -> UiElement {
    UiElement { description: Some(value.to_string()), ..UiElement::default() }
}

impl UiElement {
    pub fn child(mut self, child: UiElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn clickable(mut self) -> Self {
        self.clickable = true;
        self
    }

    pub fn scrollable(mut self) -> Self {
        self.scrollable = true;
        self
    }

    pub fn focused_input(mut self) -> Self {
        self.focused = true;
        self.editable = true;
        self
    }

    pub fn at(mut self, left: i32, top: i32, right: i32, bottom: i32) -> Self {
        self.bounds = Bounds::new(left, top, right, bottom);
        self
    }
}

/// Action provider that records every action it receives.
#[derive(Default)]
pub struct RecordingActions {
    pub log: Mutex<Vec<DeviceAction>>,
    pub fail_clicks: bool,
}

impl RecordingActions {
    pub fn failing_clicks() -> Self {
        Self { fail_clicks: true, ..Self::default() }
    }

    pub fn actions(&self) -> Vec<DeviceAction> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    fn push(&self, action: DeviceAction) {
        if let Ok(mut l) = self.log.lock() {
            l.push(action);
        }
    }
}

impl ActionProvider for RecordingActions {
    fn click(&self, target: &NodeRef) -> Result<()> {
        if self.fail_clicks {
            return Err(WatchError::ActionDelivery("click rejected".to_string()));
        }
        self.push(DeviceAction::UiClick { path: target.path.clone() });
        Ok(())
    }

    fn set_text(&self, target: &NodeRef, text: &str) -> Result<()> {
        self.push(DeviceAction::UiSetText { path: target.path.clone(), text: text.to_string() });
        Ok(())
    }

    fn scroll_forward(&self, target: &NodeRef) -> Result<()> {
        self.push(DeviceAction::UiScrollForward { path: target.path.clone() });
        Ok(())
    }

    fn global_back(&self) -> Result<()> {
        self.push(DeviceAction::GlobalBack);
        Ok(())
    }

    fn global_home(&self) -> Result<()> {
        self.push(DeviceAction::GlobalHome);
        Ok(())
    }

    fn launch_app(&self, app_id: &str) -> Result<()> {
        self.push(DeviceAction::LaunchApp { app_id: app_id.to_string() });
        Ok(())
    }

    fn tap_at(&self, x: i32, y: i32) -> Result<()> {
        self.push(DeviceAction::UiTap { x, y });
        Ok(())
    }
}

// --- Screens of the target interface, as the default vocabulary sees them ---

pub fn main_hub() -> UiElement {
    el().child(text("Записи"))
        .child(
            el().child(text("Склады").with_id("ru.ozon.hire:id/warehouseTab").clickable().at(0, 2300, 200, 2400))
                .child(text("Выплаты").with_id("ru.ozon.hire:id/paymentTab").clickable())
                .child(text("Записи").with_id("ru.ozon.hire:id/recordsTab").clickable()),
        )
}

pub fn resource_list() -> UiElement {
    el().child(text("Выберите склад"))
        .child(text("Карта"))
        .child(desc("Поиск").with_id("ru.ozon.hire:id/search_button").clickable())
        .child(el().scrollable().child(text("Шушары").clickable()))
}

pub fn resource_list_with_search_open() -> UiElement {
    el().child(text("Выберите склад"))
        .child(el().with_id("ru.ozon.hire:id/search_src_text").focused_input())
        .child(el().scrollable().child(el().clickable().child(text("Петровское"))))
}

pub fn resource_card() -> UiElement {
    el().child(text("Петровское"))
        .child(text("Московская область, Раменский район"))
        .child(el().clickable().at(100, 1800, 900, 1900).child(text("Записаться")))
}

pub fn task_list(extra: &[&str]) -> UiElement {
    let mut list = el().scrollable().child(text("Производство непрофиль"));
    for t in extra {
        list = list.child(text(t));
    }
    el().child(text("К списку работ")).child(text("Выберите время")).child(list)
}

pub fn unknown_screen() -> UiElement {
    el().child(text("Обновите приложение")).child(text("Позже"))
}
