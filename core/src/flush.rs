//! Flush orchestration: drain → noise → transmit → commit or restore.
//!
//! Usata sia dal timer dello scheduler sia dal flush manuale. Regole:
//!
//! 1. un solo flush alla volta (single-flight): un secondo tentativo
//!    concorrente riceve [`FlushOutcome::InProgress`] senza toccare il buffer;
//! 2. ε viene letto **al momento del flush**, non alla creazione dell'evento;
//! 3. ogni tentativo genera rumore nuovo, anche per eventi ritentati;
//! 4. in caso di fallimento gli eventi originali (non rumorizzati) tornano
//!    in testa al buffer e la contabilità dei flush non avanza.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::buffer::EventBuffer;
use crate::error::TransmissionError;
use crate::event::AnalyticsEvent;
use crate::noise::apply_noise;
use crate::privacy::PrivacyStore;
use crate::transport::{ServerAck, Transport};

/// What started a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Randomized timer tick.
    Timer,
    /// Buffer reached the immediate-flush threshold.
    Threshold,
    /// Explicit call from the host.
    Manual,
}

impl FlushTrigger {
    /// Human-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Threshold => "threshold",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Details of a successful flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    /// Events transmitted.
    pub events: usize,
    /// Epsilon used for this attempt.
    pub epsilon: f64,
    /// Running count of successful flushes, this one included.
    pub flush_count: u64,
    /// When the flush completed.
    pub flushed_at: DateTime<Utc>,
    /// Endpoint acknowledgement.
    pub ack: ServerAck,
}

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Batch transmitted and discarded.
    Flushed(FlushReport),
    /// Buffer was empty.
    NothingToFlush,
    /// Another flush was running; nothing was done.
    InProgress,
    /// Transmission failed; the batch is back in the buffer.
    Failed {
        /// Events restored.
        events: usize,
        /// Why it failed.
        error: TransmissionError,
    },
}

impl FlushOutcome {
    /// `true` for [`FlushOutcome::Flushed`].
    #[must_use]
    pub const fn is_flushed(&self) -> bool {
        matches!(self, Self::Flushed(_))
    }

    /// `true` for [`FlushOutcome::Failed`].
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Flush bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Successful flushes.
    pub flush_count: u64,
    /// Failed transmission attempts.
    pub failed_attempts: u64,
    /// Completion time of the last successful flush.
    pub last_flush_at: Option<DateTime<Utc>>,
}

/// Single-flight flush orchestrator.
pub struct FlushController {
    buffer: Arc<EventBuffer>,
    privacy: Arc<PrivacyStore>,
    transport: Arc<dyn Transport>,
    rng: Mutex<StdRng>,
    in_progress: AtomicBool,
    stats: Mutex<FlushStats>,
}

impl FlushController {
    /// Creates a controller with an entropy-seeded RNG.
    #[must_use]
    pub fn new(
        buffer: Arc<EventBuffer>,
        privacy: Arc<PrivacyStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_rng(buffer, privacy, transport, StdRng::from_entropy())
    }

    /// Creates a controller with an explicit RNG (reproducible tests).
    #[must_use]
    pub fn with_rng(
        buffer: Arc<EventBuffer>,
        privacy: Arc<PrivacyStore>,
        transport: Arc<dyn Transport>,
        rng: StdRng,
    ) -> Self {
        Self {
            buffer,
            privacy,
            transport,
            rng: Mutex::new(rng),
            in_progress: AtomicBool::new(false),
            stats: Mutex::new(FlushStats::default()),
        }
    }

    /// `true` while a flush is running.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Copy of the bookkeeping.
    #[must_use]
    pub fn stats(&self) -> FlushStats {
        *self.stats.lock()
    }

    /// Runs one flush attempt.
    pub async fn flush(&self, trigger: FlushTrigger) -> FlushOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.in_progress) else {
            debug!(%trigger, "flush already in progress, skipping");
            return FlushOutcome::InProgress;
        };

        let mut pending = PendingBatch::new(&self.buffer, self.buffer.drain());
        if pending.is_empty() {
            debug!(%trigger, "nothing to flush");
            return FlushOutcome::NothingToFlush;
        }

        let epsilon = self.privacy.epsilon();
        let noised = {
            let mut rng = self.rng.lock();
            apply_noise(pending.events(), epsilon, &mut *rng)
        };
        let count = noised.len();

        match self.transport.send_batch(&noised).await {
            Ok(ack) => {
                pending.commit();
                let flushed_at = Utc::now();
                let flush_count = {
                    let mut stats = self.stats.lock();
                    stats.flush_count += 1;
                    stats.last_flush_at = Some(flushed_at);
                    stats.flush_count
                };
                info!(%trigger, events = count, epsilon, flush_count, "batch flushed");
                FlushOutcome::Flushed(FlushReport {
                    events: count,
                    epsilon,
                    flush_count,
                    flushed_at,
                    ack,
                })
            }
            Err(error) => {
                drop(pending);
                self.stats.lock().failed_attempts += 1;
                warn!(
                    %trigger,
                    events = count,
                    status = ?error.status(),
                    error = %error,
                    "flush failed, batch restored for retry"
                );
                FlushOutcome::Failed {
                    events: count,
                    error,
                }
            }
        }
    }
}

/// Clears the in-progress flag on drop.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Drained batch that goes back to the front of the buffer unless committed.
///
/// Copre anche il caso in cui il future del flush venga droppato a metà
/// trasmissione: gli eventi non vanno persi.
struct PendingBatch<'a> {
    buffer: &'a EventBuffer,
    events: Option<Vec<AnalyticsEvent>>,
}

impl<'a> PendingBatch<'a> {
    fn new(buffer: &'a EventBuffer, events: Vec<AnalyticsEvent>) -> Self {
        Self {
            buffer,
            events: Some(events),
        }
    }

    fn is_empty(&self) -> bool {
        self.events.as_ref().map_or(true, Vec::is_empty)
    }

    fn events(&self) -> &[AnalyticsEvent] {
        self.events.as_deref().unwrap_or_default()
    }

    fn commit(&mut self) {
        self.events = None;
    }
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            self.buffer.restore_front(events);
        }
    }
}
