//! Analytics event records.
//!
//! Un [`AnalyticsEvent`] nasce da una chiamata di instrumentazione (o da un
//! page-view automatico) e resta immutabile nel buffer. L'unica
//! trasformazione ammessa è [`AnalyticsEvent::noised`], che produce un
//! **nuovo** [`NoisedEvent`] con il conteggio perturbato e l'epsilon usato.

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::identity::AttributionContext;

/// Device class derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    /// Desktop / laptop browser (fallback when nothing matches).
    Desktop,
    /// Phone.
    Mobile,
    /// Tablet.
    Tablet,
}

impl DeviceClass {
    /// Human-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "Desktop",
            Self::Mobile => "Mobile",
            Self::Tablet => "Tablet",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the host page currently is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageContext {
    /// Full URL, query string included.
    pub url: String,
    /// Path component of the URL (`/pricing`).
    pub page: String,
    /// Referrer, if the host knows one.
    pub referrer: Option<String>,
    /// Raw user agent string.
    pub user_agent: String,
}

impl PageContext {
    /// Builds a context from a URL, deriving `page` from its path.
    ///
    /// Se l'URL non è parsabile lo si conserva così com'è e `page` diventa `/`.
    #[must_use]
    pub fn new(url: &str, referrer: Option<String>, user_agent: &str) -> Self {
        let page = Url::parse(url).map_or_else(|_| "/".to_owned(), |u| u.path().to_owned());
        Self {
            url: url.to_owned(),
            page,
            referrer: referrer.filter(|r| !r.is_empty()),
            user_agent: user_agent.to_owned(),
        }
    }
}

/// A single analytics event waiting in the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    /// Event name (`pageview`, `session_start`, `signup`, ...).
    pub event_type: String,
    /// Raw count before noise.
    pub count: f64,
    /// Creation time, serialized as ISO-8601.
    pub timestamp: DateTime<Utc>,
    /// Session identifier.
    pub session_id: String,
    /// Device class.
    pub device: DeviceClass,
    /// Full page URL.
    pub url: String,
    /// Page path.
    pub page: String,
    /// Referrer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    /// Campaign source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Campaign medium.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    /// Campaign name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    /// Campaign term.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    /// Campaign content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Caller-supplied properties.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalyticsEvent {
    /// Builds an event from the current identity and page context.
    #[must_use]
    pub fn new(
        event_type: &str,
        count: f64,
        session_id: &str,
        device: DeviceClass,
        page: &PageContext,
        attribution: &AttributionContext,
    ) -> Self {
        Self {
            event_type: event_type.to_owned(),
            count,
            timestamp: Utc::now(),
            session_id: session_id.to_owned(),
            device,
            url: page.url.clone(),
            page: page.page.clone(),
            referrer: page.referrer.clone(),
            source: attribution.source.clone(),
            medium: attribution.medium.clone(),
            campaign: attribution.campaign.clone(),
            term: attribution.term.clone(),
            content: attribution.content.clone(),
            extra: Map::new(),
        }
    }

    /// Merges caller-supplied properties on top of the defaults.
    ///
    /// Le chiavi extra vincono sui campi di default con lo stesso nome
    /// (`page`, `referrer`, `source`, ...). Se un override rende il record
    /// non valido (es. `count: "abc"`) le chiavi in conflitto vengono
    /// scartate e le altre conservate in `extra`.
    #[must_use]
    pub fn with_extra(self, mut extra: Map<String, Value>) -> Self {
        if extra.remove(EPSILON_FIELD).is_some() {
            warn!("`epsilon` is reserved for the noised record, extra property dropped");
        }
        if extra.is_empty() {
            return self;
        }

        let mut record = match serde_json::to_value(&self) {
            Ok(Value::Object(map)) => map,
            _ => return self.with_extra_fallback(extra),
        };
        record.extend(extra.clone());

        match serde_json::from_value::<Self>(Value::Object(record)) {
            Ok(merged) => merged,
            Err(err) => {
                warn!(error = %err, "extra properties override core fields with invalid values, keeping defaults");
                self.with_extra_fallback(extra)
            }
        }
    }

    fn with_extra_fallback(mut self, extra: Map<String, Value>) -> Self {
        for (key, value) in extra {
            if !is_core_field(&key) {
                self.extra.insert(key, value);
            }
        }
        self
    }

    /// Attribution fields carried by this event.
    #[must_use]
    pub fn attribution(&self) -> AttributionContext {
        AttributionContext {
            source: self.source.clone(),
            medium: self.medium.clone(),
            campaign: self.campaign.clone(),
            term: self.term.clone(),
            content: self.content.clone(),
        }
    }

    /// Produces a new record with a perturbed count. `self` is untouched.
    #[must_use]
    pub fn noised(&self, noise: f64, epsilon: f64) -> NoisedEvent {
        let mut event = self.clone();
        event.count = self.count + noise;
        event.extra.remove(EPSILON_FIELD);
        NoisedEvent { event, epsilon }
    }
}

/// Key written by [`NoisedEvent`]; never accepted as an extra property.
const EPSILON_FIELD: &str = "epsilon";

fn is_core_field(key: &str) -> bool {
    matches!(
        key,
        "eventType"
            | "count"
            | "timestamp"
            | "sessionId"
            | "device"
            | "url"
            | "page"
            | "referrer"
            | "source"
            | "medium"
            | "campaign"
            | "term"
            | "content"
    )
}

/// Event as it leaves the device: noised count plus the epsilon used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoisedEvent {
    /// Event with its `count` already perturbed.
    #[serde(flatten)]
    pub event: AnalyticsEvent,
    /// Epsilon in force when the noise was drawn.
    pub epsilon: f64,
}
