use serde::{Deserialize, Serialize};

/// Screen rectangle of an element, in device pixels.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }
}

/// One node of a UI snapshot. The tree is owned and read-only; it lives for a
/// single tick and is dropped afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UiElement {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bounds: Bounds,
    #[serde(default)]
    pub clickable: bool,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub scrollable: bool,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub children: Vec<UiElement>,
}

impl UiElement {
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn description_or_empty(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    pub fn id_or_empty(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }
}

/// Address of an element inside the snapshot it was found in: child indices
/// from the root, plus its bounds for coordinate fallbacks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub path: Vec<usize>,
    pub bounds: Bounds,
}

// --- Adapter wire format ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", content = "payload")]
pub enum DeviceAction {
    // Observe
    #[serde(rename = "ui.snapshot")]
    UiSnapshot,

    // Act
    #[serde(rename = "ui.click")]
    UiClick { path: Vec<usize> },
    #[serde(rename = "ui.set_text")]
    UiSetText { path: Vec<usize>, text: String },
    #[serde(rename = "ui.scroll_forward")]
    UiScrollForward { path: Vec<usize> },
    #[serde(rename = "ui.tap")]
    UiTap { x: i32, y: i32 },

    // System
    #[serde(rename = "system.back")]
    GlobalBack,
    #[serde(rename = "system.home")]
    GlobalHome,
    #[serde(rename = "system.launch")]
    LaunchApp { app_id: String },
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeviceCommand {
    pub id: String,
    #[serde(flatten)]
    pub action: DeviceAction,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DeviceResponse {
    pub request_id: String,
    pub status: String, // "success", "fail"
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Unsolicited notification pushed by the adapter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeviceEvent {
    TreeChanged,
}
