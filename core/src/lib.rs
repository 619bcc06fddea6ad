//! Veil — differentially private client-side analytics.
//!
//! Questo crate implementa il collector lato client:
//!
//! - identità di sessione persistente e attribuzione UTM,
//! - classificazione del device dallo user agent,
//! - stato di privacy (ε, storico, budget giornaliero),
//! - buffer FIFO di eventi con rumore di Laplace applicato al flush,
//! - flush single-flight con scheduler a intervallo randomizzato.
//!
//! L'host costruisce un [`Collector`] con [`CollectorBuilder`] e usa
//! `record` / `flush_now` / `status` / `set_epsilon`. I conteggi restano
//! esatti nel buffer: il rumore viene aggiunto solo sulla copia inviata.
//!
//! # Panoramica
//!
//! ```text
//! record ──► EventBuffer ──► FlushController ──► Transport ──► endpoint
//!               ▲   │              │  ▲
//!   restore_front   │   apply_noise│  │ ε corrente
//!   (fallimento)    │              ▼  │
//!                   │          noise  PrivacyStore
//!                   ▼
//!             FlushScheduler  (20–80 s random, soglia immediata)
//! ```

#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

/// Buffer FIFO degli eventi in attesa di trasmissione.
pub mod buffer;
/// Istanza del collector esposta all'host.
pub mod collector;
/// Configurazione da variabili d'ambiente o YAML.
pub mod config;
/// Tassonomia degli errori.
pub mod error;
/// Record degli eventi e contesto di pagina.
pub mod event;
/// Orchestrazione del flush (single-flight, restore su errore).
pub mod flush;
/// Sessione, device e attribuzione.
pub mod identity;
/// Meccanismo di Laplace.
pub mod noise;
/// Preferenze utente non legate alla privacy.
pub mod preferences;
/// Epsilon, livelli di privacy e budget giornaliero.
pub mod privacy;
/// Scheduler del flush a intervallo randomizzato.
pub mod scheduler;
/// Key-value store durevoli e di sessione.
pub mod storage;
/// Trasmissione dei batch all'endpoint di ingestione.
pub mod transport;

pub use buffer::EventBuffer;
pub use collector::{Collector, CollectorBuilder, CollectorStatus, SettingsHook};
pub use config::CollectorConfig;
pub use error::{Result, StorageError, TransmissionError, VeilError};
pub use event::{AnalyticsEvent, DeviceClass, NoisedEvent, PageContext};
pub use flush::{FlushController, FlushOutcome, FlushReport, FlushStats, FlushTrigger};
pub use identity::{classify_device, AttributionContext, IdentityResolver};
pub use noise::apply_noise;
pub use preferences::{DigestFrequency, DigestPreference};
pub use privacy::{PrivacyLevel, PrivacyState, PrivacyStore};
pub use scheduler::{FlushScheduler, SchedulerConfig, TickAction};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{HttpTransport, ServerAck, Transport};
