//! The page seam: everything the agent needs from a live document.
//!
//! [`PageDriver`] is implemented for a real browser tab by
//! [`EokaDriver`](crate::page::EokaDriver) and for a synthetic DOM in tests.
//! Elements are addressed by an opaque `handle` (a selector that uniquely
//! identifies the node for as long as it stays attached).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::Result;

/// Bounding box in viewport coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center_x(&self) -> f64 {
        self.x + self.width / 2.0
    }
}

/// Viewport size in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280.0,
            height: 720.0,
        }
    }
}

/// Snapshot of one element, as seen at query time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    /// Selector that addresses exactly this node.
    pub handle: String,
    /// Lowercase tag name.
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    /// Raw `class` attribute.
    #[serde(default)]
    pub class: String,
    /// Selected attributes (aria-label, title, type, role, data-testid, placeholder, name).
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Visible text, trimmed and truncated.
    #[serde(default)]
    pub text: String,
    /// Length of the full visible text.
    #[serde(default)]
    pub text_len: usize,
    #[serde(default)]
    pub bbox: BBox,
    /// Not hidden by `display`, `visibility` or `opacity`.
    #[serde(default)]
    pub style_visible: bool,
    /// Not `disabled` and not `aria-disabled="true"`.
    #[serde(default)]
    pub enabled: bool,
    /// Accepts text entry (textarea, text-like input, contenteditable).
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub in_form: bool,
    #[serde(default)]
    pub has_icon: bool,
    /// Depth in the DOM tree (html = 0).
    #[serde(default)]
    pub depth: u32,
    /// Position in document order among all elements of the query.
    #[serde(default)]
    pub order: usize,
}

impl ElementInfo {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }
}

/// How text ended up in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsertMethod {
    /// The platform's rich-text insertion primitive.
    InsertText,
    /// Direct value assignment plus synthetic `input`/`change` events.
    ValueAssign,
}

/// Result of inserting prompt text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    pub method: InsertMethod,
    /// Inserted content was found in the field afterwards.
    pub verified: bool,
}

/// Response content as extracted from the page, before cleaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extracted {
    /// `innerHTML` of the container with interactive chrome removed.
    pub html: String,
    /// Plain text of the same container.
    pub text: String,
}

/// Operations the agent performs against a page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// All elements matching `selector`, in document order. Invalid selectors yield nothing.
    async fn query(&self, selector: &str) -> Result<Vec<ElementInfo>>;

    /// Current viewport size.
    async fn viewport(&self) -> Result<Viewport>;

    /// Focus, clear and insert `text` into the element.
    async fn insert_text(&self, handle: &str, text: &str) -> Result<InsertReport>;

    /// Current text content of an input-like element (`None` if detached).
    async fn read_input(&self, handle: &str) -> Result<Option<String>>;

    async fn scroll_into_view(&self, handle: &str) -> Result<()>;

    /// Plain DOM `click()`.
    async fn click(&self, handle: &str) -> Result<()>;

    /// Low-level pointer press/release at the element's center.
    async fn pointer_click(&self, handle: &str) -> Result<()>;

    /// Rendered text length of the element (`None` if detached).
    async fn measure(&self, handle: &str) -> Result<Option<usize>>;

    /// Content of a response container.
    async fn extract(&self, handle: &str) -> Result<Extracted>;

    /// Current document URL.
    async fn url(&self) -> Result<String>;

    /// Change notifications from the page, if the driver can deliver them.
    fn changes(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}
