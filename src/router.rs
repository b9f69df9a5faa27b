use crate::classifier::{ScreenKind, ScreenResult};
use crate::navigator::NavigationState;

/// Below this, an unknown screen is not even worth a recovery guess.
pub const UNSAFE_CONFIDENCE_FLOOR: f32 = 0.3;

/// State whose handler makes forward progress from the classified screen.
pub fn route(screen: &ScreenResult) -> NavigationState {
    route_kind(screen.kind)
}

pub fn route_kind(kind: ScreenKind) -> NavigationState {
    match kind {
        ScreenKind::MainHub => NavigationState::FindCategoryTab,
        ScreenKind::ResourceSelectionList => NavigationState::FindSearchField,
        ScreenKind::ResourceCard => NavigationState::ClickEnroll,
        ScreenKind::TaskList => NavigationState::FindTaskCard,
        ScreenKind::Unknown => NavigationState::Recovery,
    }
}

pub fn is_safe_to_automate(screen: &ScreenResult) -> bool {
    !(screen.kind == ScreenKind::Unknown && screen.confidence < UNSAFE_CONFIDENCE_FLOOR)
}

/// Screen a navigation state expects to be acting on, `None` for states that
/// are not tied to one screen.
pub fn expected_screen(state: NavigationState) -> Option<ScreenKind> {
    match state {
        NavigationState::FindCategoryTab => Some(ScreenKind::MainHub),
        NavigationState::FindSearchField
        | NavigationState::TypeSearchQuery
        | NavigationState::SelectResource => Some(ScreenKind::ResourceSelectionList),
        NavigationState::ClickEnroll => Some(ScreenKind::ResourceCard),
        NavigationState::FindTaskCard | NavigationState::CheckAvailability => Some(ScreenKind::TaskList),
        NavigationState::Idle
        | NavigationState::Bootstrap
        | NavigationState::Recovery
        | NavigationState::RefreshCycle => None,
    }
}

/// Whether `state` is a legitimate state to be in while `kind` is on screen.
/// Several states share one screen, so re-sync uses this rather than a plain
/// equality with [`route`].
pub fn belongs_to_screen(state: NavigationState, kind: ScreenKind) -> bool {
    expected_screen(state) == Some(kind)
}
