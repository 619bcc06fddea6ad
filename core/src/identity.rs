//! Identity & context resolution.
//!
//! Tre responsabilità, tutte sincrone e senza I/O oltre allo storage:
//!
//! - session id persistente ([`IdentityResolver::get_or_create_session_id`]);
//! - classificazione del device dallo user agent ([`classify_device`]);
//! - parametri di campagna dall'URL ([`resolve_attribution`]).

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::DeviceClass;
use crate::storage::{self, KeyValueStore, ATTRIBUTION_KEY, SESSION_ID_KEY};

// Tablet prima di mobile: molti tablet dichiarano anche "Android"/"Mobile".
static TABLET_UA: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)ipad|tablet|kindle|silk/|playbook|nexus (7|9|10)|sm-t\d").ok());

static MOBILE_UA: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)mobi|iphone|ipod|android|blackberry|iemobile|opera mini|webos|windows phone")
        .ok()
});

static ANDROID_UA: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)android").ok());

static MOBILE_TOKEN_UA: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)mobile").ok());

fn ua_matches(pattern: &Lazy<Option<Regex>>, user_agent: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(user_agent))
}

/// Classifies a user agent string. Pure function of its input.
///
/// Ordine dei controlli:
/// 1. pattern tablet (iPad, Kindle, "Tablet", ...);
/// 2. Android **senza** token "Mobile" → tablet;
/// 3. pattern mobile generici;
/// 4. altrimenti `Desktop`.
#[must_use]
pub fn classify_device(user_agent: &str) -> DeviceClass {
    if ua_matches(&TABLET_UA, user_agent) {
        return DeviceClass::Tablet;
    }
    if ua_matches(&ANDROID_UA, user_agent) && !ua_matches(&MOBILE_TOKEN_UA, user_agent) {
        return DeviceClass::Tablet;
    }
    if ua_matches(&MOBILE_UA, user_agent) {
        return DeviceClass::Mobile;
    }
    DeviceClass::Desktop
}

/// Campaign-attribution parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionContext {
    /// `utm_source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// `utm_medium`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    /// `utm_campaign`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
    /// `utm_term`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    /// `utm_content`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl AttributionContext {
    /// `true` when no parameter is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.source.is_none()
            && self.medium.is_none()
            && self.campaign.is_none()
            && self.term.is_none()
            && self.content.is_none()
    }

    /// Extracts the recognised `utm_*` parameters from a URL.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        let Ok(parsed) = Url::parse(url) else {
            return Self::default();
        };

        let mut ctx = Self::default();
        for (key, value) in parsed.query_pairs() {
            if value.is_empty() {
                continue;
            }
            let slot = match key.as_ref() {
                "utm_source" => &mut ctx.source,
                "utm_medium" => &mut ctx.medium,
                "utm_campaign" => &mut ctx.campaign,
                "utm_term" => &mut ctx.term,
                "utm_content" => &mut ctx.content,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        ctx
    }
}

/// Outcome of [`resolve_attribution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttribution {
    /// Attribution in force for this navigation.
    pub context: AttributionContext,
    /// `true` when the URL carried fresh parameters that must replace the stored ones.
    pub replaced: bool,
}

/// Resolves attribution for a navigation.
///
/// Se l'URL contiene almeno un parametro riconosciuto, il nuovo set
/// **sostituisce** interamente quello salvato (nessun merge parziale);
/// altrimenti si restituisce quello salvato, invariato.
#[must_use]
pub fn resolve_attribution(
    current_url: &str,
    stored: Option<&AttributionContext>,
) -> ResolvedAttribution {
    let fresh = AttributionContext::from_url(current_url);
    if fresh.is_empty() {
        ResolvedAttribution {
            context: stored.cloned().unwrap_or_default(),
            replaced: false,
        }
    } else {
        ResolvedAttribution {
            context: fresh,
            replaced: true,
        }
    }
}

/// Result of a session lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLookup {
    /// Session identifier.
    pub session_id: String,
    /// `true` only on the call that created the identifier.
    pub created: bool,
}

/// Resolves and persists identity data against the two storage scopes.
pub struct IdentityResolver {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    // Cache per la durata del processo: rende l'id stabile anche se lo
    // storage non è disponibile.
    session_id: Mutex<Option<String>>,
}

impl IdentityResolver {
    /// Creates a resolver over a durable and a session-scoped store.
    #[must_use]
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self {
            durable,
            session,
            session_id: Mutex::new(None),
        }
    }

    /// Reads the persisted session id or creates and persists a new one.
    ///
    /// Lo storage durevole viene letto a ogni chiamata: se è stato svuotato
    /// nasce una nuova sessione. La cache in memoria vale solo quando lo
    /// storage non è leggibile.
    pub fn get_or_create_session_id(&self) -> SessionLookup {
        let mut cached = self.session_id.lock();

        match self.durable.get(SESSION_ID_KEY) {
            Ok(Some(id)) if !id.is_empty() => {
                *cached = Some(id.clone());
                return SessionLookup {
                    session_id: id,
                    created: false,
                };
            }
            Ok(_) => {}
            Err(err) => {
                if let Some(id) = cached.as_ref() {
                    return SessionLookup {
                        session_id: id.clone(),
                        created: false,
                    };
                }
                warn!(error = %err, "session id unreadable, generating an ephemeral one");
            }
        }

        let id = Uuid::new_v4().to_string();
        if let Err(err) = self.durable.set(SESSION_ID_KEY, &id) {
            warn!(error = %err, "unable to persist session id, it will last for this process only");
        }
        debug!(session_id = %id, "new session created");
        *cached = Some(id.clone());
        SessionLookup {
            session_id: id,
            created: true,
        }
    }

    /// Attribution previously stored for this browsing session.
    #[must_use]
    pub fn stored_attribution(&self) -> Option<AttributionContext> {
        storage::load_json(self.session.as_ref(), ATTRIBUTION_KEY)
    }

    /// Resolves attribution for `url` and persists it when replaced.
    pub fn resolve_for(&self, url: &str) -> AttributionContext {
        let stored = self.stored_attribution();
        let resolved = resolve_attribution(url, stored.as_ref());
        if resolved.replaced {
            storage::save_json(self.session.as_ref(), ATTRIBUTION_KEY, &resolved.context);
        }
        resolved.context
    }
}
