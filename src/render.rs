//! Renderer-side collaborators: HTML normalization before anything is rendered, and height
//! measurement of rendered HTML.
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Action URL that closes the content block.
pub const CLOSE_ACTION_URL: &str = "https://exponea.com/close_action";

/// Sanitized HTML plus the actions it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedHtml {
    /// Markup ready to be handed to a renderer.
    pub html: String,
    /// Links found in the markup, in document order.
    pub actions: Vec<ContentBlockAction>,
}

/// An actionable element of a content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlockAction {
    /// Button label, if any.
    pub name: Option<String>,
    /// Link target.
    pub url: String,
    /// How the host reacts when the action is triggered.
    pub kind: ActionKind,
}

impl ContentBlockAction {
    /// Create an action, deriving its kind from the URL.
    pub fn new(name: Option<String>, url: impl Into<String>) -> ContentBlockAction {
        let url = url.into();
        ContentBlockAction {
            kind: ActionKind::from_url(&url),
            name,
            url,
        }
    }
}

/// What happens when an action is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Dismiss the block.
    Close,
    /// Open a web page.
    Browser,
    /// Open an app deeplink.
    Deeplink,
}

impl ActionKind {
    /// Classify an action URL.
    pub fn from_url(url: &str) -> ActionKind {
        if url == CLOSE_ACTION_URL {
            ActionKind::Close
        } else if url.starts_with("http://") || url.starts_with("https://") {
            ActionKind::Browser
        } else {
            ActionKind::Deeplink
        }
    }
}

/// Turns raw server HTML into HTML that is safe to hand to a renderer.
pub trait HtmlNormalizer: Send + Sync {
    /// Normalize `raw`.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptedContent`] if the HTML cannot be shown as a whole.
    fn normalize(&self, raw: &str) -> Result<NormalizedHtml>;
}

impl<T: Fn(&str) -> Result<NormalizedHtml> + Send + Sync> HtmlNormalizer for T {
    fn normalize(&self, raw: &str) -> Result<NormalizedHtml> {
        self(raw)
    }
}

/// Normalizer that accepts any non-blank HTML as-is and exposes no actions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughNormalizer;

impl HtmlNormalizer for PassthroughNormalizer {
    fn normalize(&self, raw: &str) -> Result<NormalizedHtml> {
        if raw.trim().is_empty() {
            return Err(Error::CorruptedContent("empty html".to_owned()));
        }
        Ok(NormalizedHtml {
            html: raw.to_owned(),
            actions: Vec::new(),
        })
    }
}

/// Measures the height a piece of HTML takes when rendered (e.g., in a hidden web view).
///
/// Only one measurement runs at a time: the fetch coordinator owns the measurer and drives it
/// from its single worker.
pub trait HeightMeasurer: Send + Sync + 'static {
    /// Render `html` and report its height in points.
    fn measure(&self, html: &str) -> impl Future<Output = Result<f32>> + Send;
}

/// Measurer reporting the same height for everything. Useful for headless hosts.
#[derive(Debug, Clone, Copy)]
pub struct FixedHeightMeasurer(pub f32);

impl HeightMeasurer for FixedHeightMeasurer {
    async fn measure(&self, _html: &str) -> Result<f32> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionKind, ContentBlockAction, HtmlNormalizer, PassthroughNormalizer};
    use crate::Error;

    #[test]
    fn classifies_action_urls() {
        assert_eq!(
            ActionKind::from_url("https://exponea.com/close_action"),
            ActionKind::Close
        );
        assert_eq!(
            ActionKind::from_url("https://example.com/sale"),
            ActionKind::Browser
        );
        assert_eq!(ActionKind::from_url("myapp://cart"), ActionKind::Deeplink);

        let action = ContentBlockAction::new(Some("Buy".to_owned()), "http://example.com");
        assert_eq!(action.kind, ActionKind::Browser);
    }

    #[test]
    fn passthrough_rejects_blank_html() {
        assert!(matches!(
            PassthroughNormalizer.normalize("   "),
            Err(Error::CorruptedContent(_))
        ));
        assert_eq!(
            PassthroughNormalizer.normalize("<p>hi</p>").unwrap().html,
            "<p>hi</p>"
        );
    }
}
