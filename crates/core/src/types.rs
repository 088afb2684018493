use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

pub type EventId = Uuid;

/// Free-form event metadata. Values may be scalars or nested objects.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ─── Events ─────────────────────────────────────────────────────────────────

/// Name of a tracked interaction. The recognized names drive the rule
/// classifier; anything else is carried through as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    PageView,
    ProductView,
    AddToCart,
    CtaClick,
    Purchase,
    Other(String),
}

impl EventName {
    pub fn as_str(&self) -> &str {
        match self {
            EventName::PageView => "page_view",
            EventName::ProductView => "product_view",
            EventName::AddToCart => "add_to_cart",
            EventName::CtaClick => "cta_click",
            EventName::Purchase => "purchase",
            EventName::Other(name) => name,
        }
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        match name {
            "page_view" => EventName::PageView,
            "product_view" => EventName::ProductView,
            "add_to_cart" => EventName::AddToCart,
            "cta_click" => EventName::CtaClick,
            "purchase" => EventName::Purchase,
            other => EventName::Other(other.to_string()),
        }
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        EventName::from(name.as_str())
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventName::from(raw))
    }
}

/// An immutable, appended interaction for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub session_id: String,
    pub event_name: EventName,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Insertion order within the log, used to break timestamp ties.
    pub sequence: u64,
}

/// Input to `EventLog::append`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub session_id: String,
    pub event_name: EventName,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewEvent {
    pub fn new(session_id: impl Into<String>, event_name: impl Into<EventName>) -> Self {
        Self {
            session_id: session_id.into(),
            event_name: event_name.into(),
            timestamp: None,
            metadata: Metadata::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// ─── Stages ─────────────────────────────────────────────────────────────────

/// Funnel position assigned to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Awareness,
    Consideration,
    Intent,
    /// Defined for prediction backends; the rule classifier never yields it.
    Decision,
    Purchase,
    Unknown,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Awareness,
        Stage::Consideration,
        Stage::Intent,
        Stage::Decision,
        Stage::Purchase,
        Stage::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Awareness => "Awareness",
            Stage::Consideration => "Consideration",
            Stage::Intent => "Intent",
            Stage::Decision => "Decision",
            Stage::Purchase => "Purchase",
            Stage::Unknown => "Unknown",
        }
    }

    /// The automated action for this stage, if any.
    pub fn action(&self) -> Option<ActionType> {
        match self {
            Stage::Awareness => Some(ActionType::WelcomeMessage),
            Stage::Consideration => Some(ActionType::InformationalContent),
            Stage::Intent => Some(ActionType::IncentiveOffer),
            Stage::Purchase => Some(ActionType::PurchaseConfirmation),
            Stage::Decision | Stage::Unknown => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    /// Case-insensitive match against the six stage names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| format!("unrecognized stage '{trimmed}'"))
    }
}

/// Where an annotation's stage came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    Prediction,
    Rules,
}

/// The current derived stage of a session. Overwritten, never appended, by
/// the reconciler; `generation` orders competing writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAnnotation {
    pub session_id: String,
    pub stage: Stage,
    pub confidence: f64,
    pub source: StageSource,
    /// When the reconciliation that produced this annotation started.
    pub computed_at: DateTime<Utc>,
    /// Strictly increasing per process, allocated at reconciliation start.
    pub generation: u64,
    pub anchor_event_id: Option<EventId>,
    pub anchor_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_error: Option<String>,
}

impl StageAnnotation {
    /// Placeholder for a session with no events.
    pub fn unknown(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            stage: Stage::Unknown,
            confidence: 0.0,
            source: StageSource::Rules,
            computed_at: Utc::now(),
            generation: 0,
            anchor_event_id: None,
            anchor_timestamp: None,
            prediction_error: None,
        }
    }
}

// ─── Actions ────────────────────────────────────────────────────────────────

/// Externally visible action triggered by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    WelcomeMessage,
    InformationalContent,
    IncentiveOffer,
    PurchaseConfirmation,
}

impl ActionType {
    pub fn display_name(&self) -> &'static str {
        match self {
            ActionType::WelcomeMessage => "welcome_message",
            ActionType::InformationalContent => "informational_content",
            ActionType::IncentiveOffer => "incentive_offer",
            ActionType::PurchaseConfirmation => "purchase_confirmation",
        }
    }
}

/// Marks that an action was dispatched for a session at a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionWindowRecord {
    pub session_id: String,
    pub stage: Stage,
    /// Sweep number in which the action was dispatched.
    pub window_id: u64,
}

// ─── Analytics ──────────────────────────────────────────────────────────────

/// Inclusive time range over the annotation's anchor event timestamp.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AnalyticsFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AnalyticsFilter {
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Annotations without an anchor only match an unbounded filter.
    pub fn matches(&self, timestamp: Option<DateTime<Utc>>) -> bool {
        if self.from.is_none() && self.to.is_none() {
            return true;
        }
        let Some(ts) = timestamp else {
            return false;
        };
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCount {
    pub stage: Stage,
    pub count: u64,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDwell {
    pub stage: Stage,
    pub avg_hours: f64,
    pub samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_round_trips_known_and_unknown() {
        assert_eq!(EventName::from("add_to_cart"), EventName::AddToCart);
        assert_eq!(
            EventName::from("newsletter_signup"),
            EventName::Other("newsletter_signup".to_string())
        );

        let json = serde_json::to_string(&EventName::CtaClick).unwrap();
        assert_eq!(json, "\"cta_click\"");
        let parsed: EventName = serde_json::from_str("\"search\"").unwrap();
        assert_eq!(parsed.as_str(), "search");
    }

    #[test]
    fn test_stage_parse_is_case_insensitive() {
        assert_eq!("intent".parse::<Stage>().unwrap(), Stage::Intent);
        assert_eq!(" DECISION ".parse::<Stage>().unwrap(), Stage::Decision);
        assert!("Loyalty".parse::<Stage>().is_err());
    }

    #[test]
    fn test_stage_actions() {
        assert_eq!(Stage::Awareness.action(), Some(ActionType::WelcomeMessage));
        assert_eq!(Stage::Intent.action(), Some(ActionType::IncentiveOffer));
        assert_eq!(Stage::Decision.action(), None);
        assert_eq!(Stage::Unknown.action(), None);
    }

    #[test]
    fn test_filter_bounds() {
        let now = Utc::now();
        let hour = chrono::Duration::hours(1);
        let filter = AnalyticsFilter::between(now - hour, now + hour);

        assert!(filter.matches(Some(now)));
        assert!(!filter.matches(Some(now - hour * 2)));
        assert!(!filter.matches(None));
        assert!(AnalyticsFilter::default().matches(None));
    }
}
