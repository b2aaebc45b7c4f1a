//! Content block definitions and personalization payloads, both in the shape the server sends them
//! and in the shape the registry keeps them.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    clock::{after, Timestamp},
    render::{HtmlNormalizer, NormalizedHtml},
    render_session::RenderTag,
};

/// Response of the definitions endpoint: every content block configured for the project.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DefinitionsResponse {
    /// Block definitions.
    ///
    /// Each entry is wrapped in `TryParse` so that one block in an unexpected format does not
    /// prevent the others from being served.
    #[serde(rename = "in_app_content_blocks", default)]
    pub content_blocks: Vec<TryParse<ContentBlockWire>>,
    /// `false` when the server refused the request.
    pub success: bool,
}

impl DefinitionsResponse {
    /// Convert parsed entries into registry definitions, skipping entries that failed to parse.
    pub fn into_definitions(self, session_start: Timestamp) -> Vec<ContentBlockDefinition> {
        self.content_blocks
            .into_iter()
            .filter_map(|entry| match entry {
                TryParse::Parsed(wire) => Some(wire.into_definition(session_start)),
                TryParse::ParseFailed(value) => {
                    log::warn!(target: "content_blocks",
                               id:display = value.get("id").and_then(|id| id.as_str()).unwrap_or("<unknown>");
                               "skipping content block definition that failed to parse");
                    None
                }
            })
            .collect()
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A content block definition as served by the definitions endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct ContentBlockWire {
    pub id: String,
    pub name: String,
    pub date_filter: DateFilter,
    #[serde(default)]
    pub frequency: FrequencyPolicy,
    #[serde(default)]
    pub load_priority: Option<i64>,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(rename = "consent_category_tracking", default)]
    pub consent_category: Option<String>,
    pub placeholders: Vec<String>,
}

impl ContentBlockWire {
    /// Build the registry representation, stamping it with the session it was loaded in.
    pub fn into_definition(self, session_start: Timestamp) -> ContentBlockDefinition {
        ContentBlockDefinition {
            id: self.id,
            name: self.name,
            placeholder_keys: self.placeholders.into_iter().collect(),
            frequency_policy: self.frequency,
            priority: self.load_priority.unwrap_or(0),
            date_filter: Some(self.date_filter).filter(|filter| filter.enabled),
            raw_content: self
                .content
                .map(|content| content.html)
                .filter(|html| !html.is_empty()),
            personalization: None,
            tags: BTreeSet::new(),
            session_start,
            consent_category: self.consent_category,
        }
    }
}

/// HTML content attached to a block or to a personalized variant.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Content {
    /// Raw markup, before normalization.
    pub html: String,
}

/// How often a block may be shown relative to its display and interaction history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FrequencyPolicy {
    /// Show every time.
    #[default]
    Always,
    /// Show until displayed once.
    OncePerVisit,
    /// Show once per app session.
    OnlyOnce,
    /// Show until the user clicks or closes it.
    UntilInteracted,
    /// A policy this version does not recognize. Evaluated as [`FrequencyPolicy::Always`].
    Unknown(String),
}

impl From<String> for FrequencyPolicy {
    fn from(value: String) -> FrequencyPolicy {
        match value.as_str() {
            "always" => FrequencyPolicy::Always,
            "once_per_visit" => FrequencyPolicy::OncePerVisit,
            "only_once" => FrequencyPolicy::OnlyOnce,
            "until_visitor_interacts" => FrequencyPolicy::UntilInteracted,
            _ => FrequencyPolicy::Unknown(value),
        }
    }
}

impl From<FrequencyPolicy> for String {
    fn from(value: FrequencyPolicy) -> String {
        match value {
            FrequencyPolicy::Always => "always".to_owned(),
            FrequencyPolicy::OncePerVisit => "once_per_visit".to_owned(),
            FrequencyPolicy::OnlyOnce => "only_once".to_owned(),
            FrequencyPolicy::UntilInteracted => "until_visitor_interacts".to_owned(),
            FrequencyPolicy::Unknown(value) => value,
        }
    }
}

/// Date window in which a block may be shown. Bounds are epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateFilter {
    /// A disabled filter allows every instant.
    pub enabled: bool,
    /// Inclusive lower bound.
    #[serde(default)]
    pub from_date: Option<u64>,
    /// Inclusive upper bound.
    #[serde(default)]
    pub to_date: Option<u64>,
}

impl DateFilter {
    /// Return `true` if `now` falls inside the window (or the filter is disabled).
    pub fn allows(&self, now: Timestamp) -> bool {
        if !self.enabled {
            return true;
        }
        let now = now.timestamp();
        let forbidden = matches!(self.from_date, Some(from) if now < from as i64)
            || matches!(self.to_date, Some(to) if now > to as i64);
        !forbidden
    }
}

/// Personalized response: one entry per requested block id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PersonalizedResponse {
    /// One entry per requested block. Malformed entries are isolated.
    #[serde(default)]
    pub data: Vec<TryParse<PersonalizedContentBlock>>,
}

/// Server verdict for a personalized block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersonalizationStatus {
    /// Block is personalized for the customer and may be shown.
    #[serde(rename = "OK")]
    Ok,
    /// Customer does not match the block's audience filter.
    #[serde(rename = "filter_not_matched")]
    FilterNotMatched,
    /// Block no longer exists on the server.
    #[serde(rename = "does_not_exist")]
    DoesNotExist,
    /// Status added on the server after this version was released.
    #[serde(other)]
    Unknown,
}

/// One personalized entry as served by the personalization endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[allow(missing_docs)]
pub struct PersonalizedContentBlock {
    pub id: String,
    pub status: PersonalizationStatus,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub variant_id: Option<i64>,
    #[serde(default)]
    pub variant_name: Option<String>,
    #[serde(default)]
    pub has_tracking_consent: Option<bool>,
    #[serde(default)]
    pub content: Option<Content>,
}

impl PersonalizedContentBlock {
    /// Normalize the payload and stamp the TTL observation.
    ///
    /// Content failing normalization is kept as a corrupted personalization so the block stays
    /// excluded until the next successful fetch.
    pub fn into_personalization(
        self,
        normalizer: &dyn HtmlNormalizer,
        observed_at: Timestamp,
    ) -> Personalization {
        let mut corrupted = false;
        let html_payload = match (self.status, self.content) {
            (PersonalizationStatus::Ok, Some(content)) => {
                match normalizer.normalize(&content.html) {
                    Ok(normalized) => Some(normalized),
                    Err(err) => {
                        log::warn!(target: "content_blocks",
                                   block_id:display = self.id;
                                   "personalized content rejected by normalizer: {err}");
                        corrupted = true;
                        None
                    }
                }
            }
            _ => None,
        };

        Personalization {
            status: self.status,
            ttl_seconds: self.ttl_seconds,
            ttl_observed_at: observed_at,
            html_payload,
            variant_id: self.variant_id,
            variant_name: self.variant_name,
            has_tracking_consent: self.has_tracking_consent,
            corrupted,
        }
    }
}

/// Personalized payload currently held for a block.
#[derive(Debug, Clone, PartialEq)]
pub struct Personalization {
    /// Server verdict for the block.
    pub status: PersonalizationStatus,
    /// How long the payload may be reused.
    pub ttl_seconds: u64,
    /// When the payload was received. TTL counts from here.
    pub ttl_observed_at: Timestamp,
    /// Normalized content. `None` unless the status is OK and the content passed normalization.
    pub html_payload: Option<NormalizedHtml>,
    /// Variant the customer was assigned to.
    pub variant_id: Option<i64>,
    #[allow(missing_docs)]
    pub variant_name: Option<String>,
    /// Copied into tracking events.
    pub has_tracking_consent: Option<bool>,
    /// Payload failed normalization.
    pub corrupted: bool,
}

impl Personalization {
    /// Instant after which the payload must be re-fetched.
    pub fn expires_at(&self) -> Timestamp {
        after(
            self.ttl_observed_at,
            std::time::Duration::from_secs(self.ttl_seconds),
        )
    }

    /// Return `true` if the payload can be rendered.
    pub fn is_showable(&self) -> bool {
        self.status == PersonalizationStatus::Ok && !self.corrupted && self.html_payload.is_some()
    }
}

/// A content block known to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentBlockDefinition {
    /// Unique across the registry.
    pub id: String,
    /// Human-readable name, used for carousel ordering and tracking.
    pub name: String,
    /// Placeholders this block may be shown in.
    pub placeholder_keys: BTreeSet<String>,
    /// How often the block may be shown.
    pub frequency_policy: FrequencyPolicy,
    /// Higher shows first.
    pub priority: i64,
    /// Enabled date window, if any.
    pub date_filter: Option<DateFilter>,
    /// Static HTML that needs no personalization.
    pub raw_content: Option<String>,
    /// Last fetched payload, if any.
    pub personalization: Option<Personalization>,
    /// Render sessions currently showing this block.
    pub tags: BTreeSet<RenderTag>,
    /// When the definition was loaded. `OnlyOnce` is evaluated against it.
    pub session_start: Timestamp,
    /// Consent category required to track interactions.
    pub consent_category: Option<String>,
}

impl ContentBlockDefinition {
    /// Create an unresolved definition with default settings.
    pub fn new(id: impl Into<String>, session_start: Timestamp) -> ContentBlockDefinition {
        let id = id.into();
        ContentBlockDefinition {
            name: id.clone(),
            id,
            placeholder_keys: BTreeSet::new(),
            frequency_policy: FrequencyPolicy::Always,
            priority: 0,
            date_filter: None,
            raw_content: None,
            personalization: None,
            tags: BTreeSet::new(),
            session_start,
            consent_category: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> ContentBlockDefinition {
        self.name = name.into();
        self
    }

    /// Replace the placeholders the block serves.
    pub fn with_placeholders<I, S>(mut self, placeholders: I) -> ContentBlockDefinition
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.placeholder_keys = placeholders.into_iter().map(Into::into).collect();
        self
    }

    /// Set the load priority. Higher wins.
    pub fn with_priority(mut self, priority: i64) -> ContentBlockDefinition {
        self.priority = priority;
        self
    }

    /// Set the frequency policy.
    pub fn with_frequency(mut self, policy: FrequencyPolicy) -> ContentBlockDefinition {
        self.frequency_policy = policy;
        self
    }

    /// Restrict the block to a date window.
    pub fn with_date_filter(mut self, filter: DateFilter) -> ContentBlockDefinition {
        self.date_filter = Some(filter);
        self
    }

    /// Give the block static HTML, making it resolved without a fetch.
    pub fn with_raw_content(mut self, html: impl Into<String>) -> ContentBlockDefinition {
        self.raw_content = Some(html.into());
        self
    }

    /// A block with neither static content nor a personalization must be fetched before it can
    /// be selected.
    pub fn is_unresolved(&self) -> bool {
        self.raw_content.is_none() && self.personalization.is_none()
    }

    /// Return `true` if the block may appear in `placeholder_key`.
    pub fn serves(&self, placeholder_key: &str) -> bool {
        self.placeholder_keys.contains(placeholder_key)
    }

    /// HTML to hand to a renderer: static content wins over the personalized payload.
    pub fn html(&self) -> Option<&str> {
        if let Some(raw) = &self.raw_content {
            return Some(raw);
        }
        self.personalization
            .as_ref()
            .filter(|p| p.is_showable())
            .and_then(|p| p.html_payload.as_ref())
            .map(|payload| payload.html.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use chrono::{TimeZone, Utc};

    use super::{
        DateFilter, DefinitionsResponse, FrequencyPolicy, PersonalizationStatus,
        PersonalizedContentBlock, PersonalizedResponse, TryParse,
    };
    use crate::render::PassthroughNormalizer;

    #[test]
    fn parse_definitions_fixture() {
        let f = File::open("tests/data/content_blocks.json")
            .expect("Failed to open tests/data/content_blocks.json");
        let response: DefinitionsResponse = serde_json::from_reader(BufReader::new(f)).unwrap();
        assert!(response.success);

        let definitions = response.into_definitions(Utc::now());
        let banner = definitions.iter().find(|d| d.id == "banner-static").unwrap();
        assert_eq!(banner.frequency_policy, FrequencyPolicy::Always);
        assert!(banner.raw_content.is_some());
        assert!(banner.serves("home_top"));

        let promo = definitions.iter().find(|d| d.id == "promo-personal").unwrap();
        assert!(promo.is_unresolved());
        assert_eq!(promo.priority, 5);
        assert_eq!(promo.frequency_policy, FrequencyPolicy::OnlyOnce);
    }

    #[test]
    fn parse_personalized_fixture() {
        let f = File::open("tests/data/personalized.json")
            .expect("Failed to open tests/data/personalized.json");
        let response: PersonalizedResponse = serde_json::from_reader(BufReader::new(f)).unwrap();

        let entries: Vec<PersonalizedContentBlock> = response
            .data
            .into_iter()
            .filter_map(Option::from)
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, PersonalizationStatus::Ok);
        assert_eq!(entries[1].status, PersonalizationStatus::FilterNotMatched);
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let response: DefinitionsResponse = serde_json::from_str(
            r#"
              {
                "success": true,
                "in_app_content_blocks": [
                  {
                    "id": "ok",
                    "name": "ok",
                    "date_filter": {"enabled": false},
                    "frequency": "some_new_policy",
                    "placeholders": ["p1"]
                  },
                  {
                    "id": "broken",
                    "name": "broken",
                    "placeholders": "not-a-list"
                  }
                ]
              }
            "#,
        )
        .unwrap();

        assert!(matches!(response.content_blocks[0], TryParse::Parsed(_)));
        assert!(matches!(response.content_blocks[1], TryParse::ParseFailed(_)));

        let definitions = response.into_definitions(Utc::now());
        assert_eq!(definitions.len(), 1);
        assert_eq!(
            definitions[0].frequency_policy,
            FrequencyPolicy::Unknown("some_new_policy".to_owned())
        );
    }

    #[test]
    fn date_filter_window() {
        let filter = DateFilter {
            enabled: true,
            from_date: Some(1_000),
            to_date: Some(2_000),
        };

        assert!(!filter.allows(Utc.timestamp_opt(999, 0).unwrap()));
        assert!(filter.allows(Utc.timestamp_opt(1_000, 0).unwrap()));
        assert!(filter.allows(Utc.timestamp_opt(2_000, 0).unwrap()));
        assert!(!filter.allows(Utc.timestamp_opt(2_001, 0).unwrap()));

        let disabled = DateFilter {
            enabled: false,
            ..filter
        };
        assert!(disabled.allows(Utc.timestamp_opt(5_000, 0).unwrap()));
    }

    #[test]
    fn corrupted_payload_is_not_showable() {
        let response: PersonalizedResponse = serde_json::from_str(
            r#"{"data": [{"id": "a", "status": "OK", "ttl_seconds": 60, "content": {"html": ""}}]}"#,
        )
        .unwrap();
        let entry: Option<PersonalizedContentBlock> =
            response.data.into_iter().next().and_then(Option::from);
        let personalization = entry
            .unwrap()
            .into_personalization(&PassthroughNormalizer, Utc::now());

        assert!(personalization.corrupted);
        assert!(!personalization.is_showable());
    }
}
