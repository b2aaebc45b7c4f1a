//! Analytics events emitted on display and interaction transitions.
use serde::Serialize;

use crate::{clock::Timestamp, models::ContentBlockDefinition};

/// What happened to a content block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TrackingAction {
    /// Block became visible.
    Show,
    /// User triggered an action of the block.
    Click {
        /// Button label, if any.
        label: Option<String>,
        /// Link target.
        url: String,
    },
    /// User dismissed the block.
    Close,
    /// Block could not be shown.
    Error {
        /// Why the block was rejected.
        message: String,
    },
}

impl TrackingAction {
    /// Clicks and closes are interactions and count for `UntilInteracted`.
    pub fn is_interaction(&self) -> bool {
        matches!(self, TrackingAction::Click { .. } | TrackingAction::Close)
    }
}

/// Metadata attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetaData {
    /// Always `"content_blocks"`.
    pub sdk_name: &'static str,
    /// Crate version the event was produced by.
    pub sdk_version: &'static str,
}

impl Default for EventMetaData {
    fn default() -> EventMetaData {
        EventMetaData {
            sdk_name: env!("CARGO_PKG_NAME"),
            sdk_version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// An event that needs to be delivered to the analytics pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentBlockEvent {
    /// What happened. Flattened into the event object.
    #[serde(flatten)]
    pub action: TrackingAction,
    /// Placeholder the block was shown in.
    pub placeholder_key: String,
    #[allow(missing_docs)]
    pub block_id: String,
    #[allow(missing_docs)]
    pub block_name: String,
    /// Personalized variant that was shown. Absent for static content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<i64>,
    /// Name of [`Self::variant_id`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    /// Whether the customer consented to tracking of this block, as reported by the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_tracking_consent: Option<bool>,
    /// Consent category the block is tracked under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_category: Option<String>,
    /// When the action happened, per the engine clock.
    pub timestamp: Timestamp,
    /// SDK name and version.
    pub meta_data: EventMetaData,
}

impl ContentBlockEvent {
    /// Build an event for `block` shown in `placeholder_key`.
    pub fn new(
        action: TrackingAction,
        placeholder_key: impl Into<String>,
        block: &ContentBlockDefinition,
        timestamp: Timestamp,
    ) -> ContentBlockEvent {
        let personalization = block.personalization.as_ref();
        ContentBlockEvent {
            action,
            placeholder_key: placeholder_key.into(),
            block_id: block.id.clone(),
            block_name: block.name.clone(),
            variant_id: personalization.and_then(|p| p.variant_id),
            variant_name: personalization.and_then(|p| p.variant_name.clone()),
            has_tracking_consent: personalization.and_then(|p| p.has_tracking_consent),
            consent_category: block.consent_category.clone(),
            timestamp,
            meta_data: EventMetaData::default(),
        }
    }
}

/// Receives content block events. Delivery to an analytics backend is up to the implementation.
pub trait TrackingSink: Send + Sync {
    /// Deliver `event`. Must not block.
    fn track(&self, event: ContentBlockEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrackingSink;

impl TrackingSink for NoopTrackingSink {
    fn track(&self, _event: ContentBlockEvent) {}
}

impl<T: Fn(ContentBlockEvent) + Send + Sync> TrackingSink for T {
    fn track(&self, event: ContentBlockEvent) {
        self(event);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{ContentBlockEvent, TrackingAction};
    use crate::models::ContentBlockDefinition;

    #[test]
    fn interactions() {
        assert!(TrackingAction::Close.is_interaction());
        assert!(TrackingAction::Click {
            label: None,
            url: "myapp://cart".to_owned()
        }
        .is_interaction());
        assert!(!TrackingAction::Show.is_interaction());
        assert!(!TrackingAction::Error {
            message: "boom".to_owned()
        }
        .is_interaction());
    }

    #[test]
    fn serializes_flat_event() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let block = ContentBlockDefinition::new("a", now).with_name("Banner");
        let event = ContentBlockEvent::new(
            TrackingAction::Click {
                label: Some("Buy".to_owned()),
                url: "https://example.com".to_owned(),
            },
            "home_top",
            &block,
            now,
        );

        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["action"], json!("click"));
        assert_eq!(value["label"], json!("Buy"));
        assert_eq!(value["placeholderKey"], json!("home_top"));
        assert_eq!(value["blockName"], json!("Banner"));
        assert_eq!(value["metaData"]["sdkName"], json!("content_blocks"));
        assert!(value.get("variantId").is_none());
    }
}
