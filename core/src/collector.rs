//! The collector instance exposed to the host application.
//!
//! Un [`Collector`] possiede buffer, stato di privacy, identità e
//! scheduler: viene costruito una volta con [`CollectorBuilder`] e passato
//! all'host, che lo usa tramite `record` / `flush_now` / `status` /
//! `set_epsilon`. Nessuno stato globale, nessun probing di capability
//! opzionali: quello che serve (storage, transport, callback di sync delle
//! impostazioni) viene iniettato in costruzione.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::EventBuffer;
use crate::config::CollectorConfig;
use crate::error::Result;
use crate::event::{AnalyticsEvent, DeviceClass, PageContext};
use crate::flush::{FlushController, FlushOutcome, FlushTrigger};
use crate::identity::{classify_device, AttributionContext, IdentityResolver};
use crate::preferences::{DigestPreference, PreferenceStore};
use crate::privacy::{
    noise_magnitude_label, privacy_level, PrivacyLevel, PrivacyState, PrivacyStore, DAILY_BUDGET,
};
use crate::scheduler::FlushScheduler;
use crate::storage::{KeyValueStore, MemoryStore};
use crate::transport::{HttpTransport, Transport};

/// Event type recorded when a new session id is created.
pub const SESSION_START_EVENT: &str = "session_start";
/// Event type recorded on navigation.
pub const PAGE_VIEW_EVENT: &str = "pageview";

/// Callback invoked after every accepted epsilon change.
pub type SettingsHook = Arc<dyn Fn(&PrivacyState) + Send + Sync>;

/// Debug / introspection view of a collector.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorStatus {
    /// Session identifier.
    pub session_id: String,
    /// Current device class.
    pub device: DeviceClass,
    /// Attribution in force.
    pub attribution: AttributionContext,
    /// Pending events.
    pub buffer_size: usize,
    /// Copy of the pending events.
    pub buffer_contents: Vec<AnalyticsEvent>,
    /// Current epsilon.
    pub epsilon: f64,
    /// Privacy level for `epsilon`.
    pub privacy_level: PrivacyLevel,
    /// Noise band for `epsilon`.
    pub noise_magnitude: &'static str,
    /// Daily budget usage, capped at 100 for display.
    pub budget_used_percent: f64,
    /// Successful flushes.
    pub flush_count: u64,
    /// Last successful flush.
    pub last_flush_at: Option<DateTime<Utc>>,
    /// `true` while a flush is running.
    pub flush_in_progress: bool,
}

#[derive(Debug, Clone)]
struct PageState {
    context: PageContext,
    device: DeviceClass,
    attribution: AttributionContext,
}

/// Builder for [`Collector`].
pub struct CollectorBuilder {
    config: CollectorConfig,
    durable: Option<Arc<dyn KeyValueStore>>,
    session: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn Transport>>,
    page: PageContext,
    settings_hook: Option<SettingsHook>,
    seed: Option<u64>,
}

impl CollectorBuilder {
    /// Starts a builder from a configuration.
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            durable: None,
            session: None,
            transport: None,
            page: PageContext::default(),
            settings_hook: None,
            seed: None,
        }
    }

    /// Durable storage (session id, privacy state, preferences).
    #[must_use]
    pub fn durable_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Session-scoped storage (attribution snapshot).
    #[must_use]
    pub fn session_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.session = Some(store);
        self
    }

    /// Transport for batches. Defaults to [`HttpTransport`] on `config.endpoint`.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Initial page context.
    #[must_use]
    pub fn page(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    /// Callback notified after each accepted epsilon change.
    #[must_use]
    pub fn on_settings_change(mut self, hook: SettingsHook) -> Self {
        self.settings_hook = Some(hook);
        self
    }

    /// Seeds noise and scheduling RNGs (reproducible runs).
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Wires everything together and resolves the session.
    ///
    /// Se la sessione è nuova, un evento `session_start` viene accodato
    /// prima di restituire il collector.
    pub fn build(self) -> anyhow::Result<Collector> {
        self.config.validate()?;

        let durable = self
            .durable
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let session = self
            .session
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(
                self.config.endpoint.clone(),
                self.config.request_timeout(),
            )?),
        };

        let buffer = Arc::new(EventBuffer::new());
        let privacy = Arc::new(PrivacyStore::load(Arc::clone(&durable)));
        let preferences = PreferenceStore::load(Arc::clone(&durable));
        let identity = IdentityResolver::new(durable, session);

        let (flush_rng, schedule_rng) = match self.seed {
            Some(seed) => (
                StdRng::seed_from_u64(seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        };
        let flusher = Arc::new(FlushController::with_rng(
            Arc::clone(&buffer),
            Arc::clone(&privacy),
            transport,
            flush_rng,
        ));
        let scheduler = Arc::new(FlushScheduler::with_rng(
            self.config.scheduler(),
            Arc::clone(&buffer),
            Arc::clone(&flusher),
            schedule_rng,
        ));

        let page = PageState {
            device: classify_device(&self.page.user_agent),
            attribution: identity.resolve_for(&self.page.url),
            context: self.page,
        };

        let collector = Collector {
            config: self.config,
            identity,
            privacy,
            preferences,
            buffer,
            flusher,
            scheduler,
            page: RwLock::new(page),
            settings_hook: self.settings_hook,
        };
        let session_id = collector.get_or_create_session_id();
        info!(%session_id, device = %collector.page.read().device, "collector ready");
        Ok(collector)
    }
}

/// Differentially private analytics collector.
pub struct Collector {
    config: CollectorConfig,
    identity: IdentityResolver,
    privacy: Arc<PrivacyStore>,
    preferences: PreferenceStore,
    buffer: Arc<EventBuffer>,
    flusher: Arc<FlushController>,
    scheduler: Arc<FlushScheduler>,
    page: RwLock<PageState>,
    settings_hook: Option<SettingsHook>,
}

impl Collector {
    /// Shorthand for [`CollectorBuilder::new`].
    #[must_use]
    pub fn builder(config: CollectorConfig) -> CollectorBuilder {
        CollectorBuilder::new(config)
    }

    /// Returns the session id, creating it (and a `session_start` event) once.
    pub fn get_or_create_session_id(&self) -> String {
        let lookup = self.identity.get_or_create_session_id();
        if lookup.created {
            self.enqueue(SESSION_START_EVENT, 1.0, Map::new(), &lookup.session_id);
        }
        lookup.session_id
    }

    /// Records an event with count 1 and no extra properties.
    pub fn record(&self, event_type: &str) -> AnalyticsEvent {
        self.record_with(event_type, 1.0, Map::new())
    }

    /// Records an event. Synchronous: builds the record and enqueues it.
    ///
    /// Le proprietà in `extra` vengono applicate per ultime e possono
    /// sovrascrivere i campi di default.
    pub fn record_with(&self, event_type: &str, count: f64, extra: Map<String, Value>) -> AnalyticsEvent {
        let count = if count.is_finite() {
            count
        } else {
            warn!(event_type, count, "non-finite count replaced with 1");
            1.0
        };
        let session_id = self.get_or_create_session_id();
        self.enqueue(event_type, count, extra, &session_id)
    }

    fn enqueue(
        &self,
        event_type: &str,
        count: f64,
        extra: Map<String, Value>,
        session_id: &str,
    ) -> AnalyticsEvent {
        let event = {
            let page = self.page.read();
            AnalyticsEvent::new(
                event_type,
                count,
                session_id,
                page.device,
                &page.context,
                &page.attribution,
            )
        }
        .with_extra(extra);

        let size = self.buffer.push(event.clone());
        debug!(event_type, size, "event recorded");
        if self.scheduler.threshold_reached(size) {
            self.scheduler.notify_threshold();
        }
        event
    }

    /// Updates the page context after a navigation.
    ///
    /// L'attribuzione viene ricalcolata dal nuovo URL; con `auto_page_view`
    /// attivo viene registrato anche un evento `pageview`.
    pub fn page_view(&self, context: PageContext) -> Option<AnalyticsEvent> {
        let attribution = self.identity.resolve_for(&context.url);
        {
            let mut page = self.page.write();
            page.device = classify_device(&context.user_agent);
            page.attribution = attribution;
            page.context = context;
        }

        self.config
            .auto_page_view
            .then(|| self.record(PAGE_VIEW_EVENT))
    }

    /// Flushes now, independently of the timer, and reports the outcome.
    pub async fn flush_now(&self) -> FlushOutcome {
        self.flusher.flush(FlushTrigger::Manual).await
    }

    /// Starts the randomized flush loop on the current Tokio runtime.
    pub fn start_scheduler(&self) -> JoinHandle<()> {
        self.scheduler.spawn()
    }

    /// Settings-update entry point: validates, stores and notifies the hook.
    pub fn set_epsilon(&self, value: f64) -> Result<PrivacyState> {
        let state = self.privacy.set_epsilon(value)?;
        if let Some(hook) = &self.settings_hook {
            hook(&state);
        }
        Ok(state)
    }

    /// Current epsilon.
    #[must_use]
    pub fn epsilon(&self) -> f64 {
        self.privacy.epsilon()
    }

    /// Copy of the privacy state.
    #[must_use]
    pub fn privacy_state(&self) -> PrivacyState {
        self.privacy.snapshot()
    }

    /// Digest preference.
    #[must_use]
    pub fn digest_preference(&self) -> DigestPreference {
        self.preferences.digest()
    }

    /// Updates the digest preference.
    pub fn set_digest_preference(&self, preference: DigestPreference) {
        self.preferences.set_digest(preference);
    }

    /// Pending events.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer.size()
    }

    /// Introspection snapshot.
    #[must_use]
    pub fn status(&self) -> CollectorStatus {
        let session_id = self.get_or_create_session_id();
        let (device, attribution) = {
            let page = self.page.read();
            (page.device, page.attribution.clone())
        };
        let privacy = self.privacy.snapshot();
        let stats = self.flusher.stats();
        let buffer_contents = self.buffer.peek_all();

        CollectorStatus {
            session_id,
            device,
            attribution,
            buffer_size: buffer_contents.len(),
            buffer_contents,
            epsilon: privacy.epsilon,
            privacy_level: privacy_level(privacy.epsilon),
            noise_magnitude: noise_magnitude_label(privacy.epsilon),
            budget_used_percent: privacy.budget_used_percent(DAILY_BUDGET),
            flush_count: stats.flush_count,
            last_flush_at: stats.last_flush_at,
            flush_in_progress: self.flusher.is_flushing(),
        }
    }
}
