use async_trait::async_trait;
use log::warn;

use crate::error::Result;
use crate::schema::{NodeRef, UiElement};
use crate::snapshot::{self, Hit};

/// Input side of the platform. Every call is fire-and-forget: `Ok` means the
/// action was handed over, not that the interface reacted to it.
pub trait ActionProvider: Send + Sync {
    fn click(&self, target: &NodeRef) -> Result<()>;
    fn set_text(&self, target: &NodeRef, text: &str) -> Result<()>;
    fn scroll_forward(&self, target: &NodeRef) -> Result<()>;
    fn global_back(&self) -> Result<()>;
    fn global_home(&self) -> Result<()>;
    fn launch_app(&self, app_id: &str) -> Result<()>;
    fn tap_at(&self, x: i32, y: i32) -> Result<()>;
}

/// Observation side of the platform.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// The current element tree, `None` when the platform has nothing to show.
    async fn current_snapshot(&self) -> Result<Option<UiElement>>;
}

/// Clicks the nearest clickable ancestor of `hit`. When there is none, or the
/// click is rejected, taps the centre of the matched element once instead.
/// Returns whether some action was delivered.
pub fn click_with_fallback(actions: &dyn ActionProvider, root: &UiElement, hit: &Hit<'_>) -> bool {
    if let Some(target) = snapshot::clickable_ancestor(root, hit) {
        match actions.click(&target.node_ref()) {
            Ok(()) => return true,
            Err(e) => warn!("[Actions] click at {:?} failed ({}), falling back to tap", target.path, e),
        }
    }

    let (x, y) = hit.node.bounds.center();
    match actions.tap_at(x, y) {
        Ok(()) => true,
        Err(e) => {
            warn!("[Actions] tap at ({}, {}) failed: {}", x, y, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DeviceAction;
    use crate::testing::{el, text, RecordingActions};

    #[test]
    fn test_clicks_clickable_ancestor() {
        let root = el().child(el().clickable().child(text("Записаться")));
        let hit = snapshot::find(&root, |n| n.text_or_empty() == "Записаться").unwrap();
        let actions = RecordingActions::default();

        assert!(click_with_fallback(&actions, &root, &hit));
        assert_eq!(actions.actions(), vec![DeviceAction::UiClick { path: vec![0] }]);
    }

    #[test]
    fn test_taps_centre_without_clickable_ancestor() {
        let root = el().child(text("Записаться").at(100, 200, 300, 400));
        let hit = snapshot::find(&root, |n| n.text_or_empty() == "Записаться").unwrap();
        let actions = RecordingActions::default();

        assert!(click_with_fallback(&actions, &root, &hit));
        assert_eq!(actions.actions(), vec![DeviceAction::UiTap { x: 200, y: 300 }]);
    }

    #[test]
    fn test_rejected_click_falls_back_to_single_tap() {
        let root = el().child(el().clickable().at(0, 0, 10, 10).child(text("Записаться").at(2, 2, 8, 8)));
        let hit = snapshot::find(&root, |n| n.text_or_empty() == "Записаться").unwrap();
        let actions = RecordingActions::failing_clicks();

        assert!(click_with_fallback(&actions, &root, &hit));
        assert_eq!(actions.actions(), vec![DeviceAction::UiTap { x: 5, y: 5 }]);
    }
}
