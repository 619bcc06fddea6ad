//! Flush scheduler for the Veil collector.
//!
//! Questo modulo implementa il percorso "timer" del flush:
//!
//! - **intervallo randomizzato**: il prossimo tick cade in una finestra
//!   `[min_interval, max_interval]` estratta ogni volta da capo, così i
//!   batch in uscita non hanno una cadenza riconoscibile sulla rete;
//! - **soglia immediata**: quando il buffer raggiunge la soglia, `record`
//!   sveglia lo scheduler tramite [`FlushScheduler::notify_threshold`]
//!   senza attendere il timer; se trova un flush già in corso ritenta
//!   dopo [`BUSY_RETRY_DELAY`];
//! - **auto-rischedulazione**: il prossimo tick viene pianificato alla fine
//!   del tick corrente (flush eseguito o saltato), mai a periodo fisso.
//!
//! Il flush manuale passa direttamente da [`FlushController`] e non
//! resetta né cancella il timer. Nessuno stato terminale: il loop vive
//! quanto il processo (o finché il `JoinHandle` non viene abortito).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::buffer::EventBuffer;
use crate::flush::{FlushController, FlushOutcome, FlushTrigger};

/// Pausa prima di ritentare una soglia trovata con un flush già in corso.
pub const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Configurazione dello scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Lower bound of the randomized tick interval.
    pub min_interval: Duration,
    /// Upper bound of the randomized tick interval.
    pub max_interval: Duration,
    /// Buffer size that triggers an immediate flush.
    pub immediate_flush_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(20),
            max_interval: Duration::from_secs(80),
            immediate_flush_threshold: 20,
        }
    }
}

/// What a tick decided to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    /// Buffer empty, nothing sent.
    Skipped,
    /// A flush was attempted.
    Flushed {
        /// Why the flush ran.
        trigger: FlushTrigger,
        /// Flush result.
        outcome: FlushOutcome,
    },
}

impl fmt::Display for TickAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Flushed { trigger, .. } => write!(f, "flushed ({trigger})"),
        }
    }
}

/// Randomized, self-rescheduling flush timer.
pub struct FlushScheduler {
    config: SchedulerConfig,
    buffer: Arc<EventBuffer>,
    controller: Arc<FlushController>,
    wake: Notify,
    rng: Mutex<StdRng>,
    ticks: AtomicU64,
}

impl FlushScheduler {
    /// Creates a scheduler with an entropy-seeded RNG.
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        buffer: Arc<EventBuffer>,
        controller: Arc<FlushController>,
    ) -> Self {
        Self::with_rng(config, buffer, controller, StdRng::from_entropy())
    }

    /// Creates a scheduler with an explicit RNG.
    #[must_use]
    pub fn with_rng(
        config: SchedulerConfig,
        buffer: Arc<EventBuffer>,
        controller: Arc<FlushController>,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            buffer,
            controller,
            wake: Notify::new(),
            rng: Mutex::new(rng),
            ticks: AtomicU64::new(0),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Ticks executed so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// `true` when `size` has reached the immediate-flush threshold.
    #[must_use]
    pub const fn threshold_reached(&self, size: usize) -> bool {
        size >= self.config.immediate_flush_threshold
    }

    /// Wakes the loop for an immediate tick. Synchronous, never blocks.
    pub fn notify_threshold(&self) {
        self.wake.notify_one();
    }

    /// Draws the delay before the next tick.
    pub fn next_delay(&self) -> Duration {
        let (min, max) = (self.config.min_interval, self.config.max_interval);
        if max <= min {
            return min;
        }
        let millis = self
            .rng
            .lock()
            .gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Delay before the tick that follows `action`.
    ///
    /// Una soglia che trova un flush già in corso non aspetta l'intervallo
    /// casuale: si ritenta dopo [`BUSY_RETRY_DELAY`], finché il buffer
    /// resta sopra soglia.
    pub fn delay_after(&self, action: &TickAction) -> Duration {
        let busy_over_threshold = matches!(
            action,
            TickAction::Flushed {
                outcome: FlushOutcome::InProgress,
                ..
            }
        ) && self.threshold_reached(self.buffer.size());

        if busy_over_threshold {
            debug!("threshold reached during a running flush, retrying soon");
            BUSY_RETRY_DELAY.min(self.config.min_interval)
        } else {
            self.next_delay()
        }
    }

    /// Runs one tick: threshold flush, regular flush, or skip.
    pub async fn tick(&self) -> TickAction {
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let size = self.buffer.size();
        let trigger = if self.threshold_reached(size) {
            FlushTrigger::Threshold
        } else if size > 0 {
            FlushTrigger::Timer
        } else {
            debug!("buffer empty, tick skipped");
            return TickAction::Skipped;
        };

        let outcome = self.controller.flush(trigger).await;
        TickAction::Flushed { trigger, outcome }
    }

    /// Loop forever: wait a random delay (or a threshold wake-up), then tick.
    pub async fn run(self: Arc<Self>) {
        info!(
            min_secs = self.config.min_interval.as_secs_f64(),
            max_secs = self.config.max_interval.as_secs_f64(),
            threshold = self.config.immediate_flush_threshold,
            "flush scheduler started"
        );

        let mut delay = self.next_delay();
        loop {
            debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "next flush tick scheduled"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.wake.notified() => {
                    debug!("woken by buffer threshold");
                }
            }

            let action = self.tick().await;
            debug!(%action, "tick completed");
            delay = self.delay_after(&action);
        }
    }

    /// Spawns [`FlushScheduler::run`] on the current Tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::TransmissionError;
    use crate::event::{AnalyticsEvent, DeviceClass, NoisedEvent, PageContext};
    use crate::identity::AttributionContext;
    use crate::privacy::PrivacyStore;
    use crate::storage::MemoryStore;
    use crate::transport::{ServerAck, Transport};

    #[derive(Default)]
    struct CountingTransport {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send_batch(&self, batch: &[NoisedEvent]) -> Result<ServerAck, TransmissionError> {
            self.batches.lock().push(batch.len());
            Ok(ServerAck {
                status: 200,
                body: json!({"success": true}),
            })
        }
    }

    /// Transport che tiene occupato il flush per 5 secondi.
    #[derive(Default)]
    struct SlowTransport {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send_batch(&self, batch: &[NoisedEvent]) -> Result<ServerAck, TransmissionError> {
            self.batches.lock().push(batch.len());
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ServerAck {
                status: 200,
                body: json!({"success": true}),
            })
        }
    }

    fn event() -> AnalyticsEvent {
        AnalyticsEvent::new(
            "click",
            1.0,
            "sess",
            DeviceClass::Desktop,
            &PageContext::default(),
            &AttributionContext::default(),
        )
    }

    fn scheduler(config: SchedulerConfig) -> (Arc<EventBuffer>, Arc<CountingTransport>, Arc<FlushScheduler>) {
        let buffer = Arc::new(EventBuffer::new());
        let transport = Arc::new(CountingTransport::default());
        let privacy = Arc::new(PrivacyStore::load(Arc::new(MemoryStore::new())));
        let controller = Arc::new(FlushController::new(buffer.clone(), privacy, transport.clone()));
        let scheduler = Arc::new(FlushScheduler::with_rng(
            config,
            buffer.clone(),
            controller,
            StdRng::seed_from_u64(17),
        ));
        (buffer, transport, scheduler)
    }

    #[test]
    fn delays_are_randomized_within_window() {
        let (_b, _t, scheduler) = scheduler(SchedulerConfig::default());
        let delays: Vec<Duration> = (0..200).map(|_| scheduler.next_delay()).collect();

        for delay in &delays {
            assert!(*delay >= Duration::from_secs(20));
            assert!(*delay <= Duration::from_secs(80));
        }
        let distinct: HashSet<Duration> = delays.into_iter().collect();
        assert!(distinct.len() > 100);
    }

    #[test]
    fn degenerate_window_uses_min() {
        let (_b, _t, scheduler) = scheduler(SchedulerConfig {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(5),
            immediate_flush_threshold: 1,
        });
        assert_eq!(scheduler.next_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn tick_skips_when_empty_and_flushes_otherwise() {
        let (buffer, transport, scheduler) = scheduler(SchedulerConfig {
            immediate_flush_threshold: 3,
            ..SchedulerConfig::default()
        });

        assert_eq!(scheduler.tick().await, TickAction::Skipped);

        buffer.push(event());
        match scheduler.tick().await {
            TickAction::Flushed { trigger, outcome } => {
                assert_eq!(trigger, FlushTrigger::Timer);
                assert!(outcome.is_flushed());
            }
            TickAction::Skipped => panic!("expected a flush"),
        }

        for _ in 0..3 {
            buffer.push(event());
        }
        match scheduler.tick().await {
            TickAction::Flushed { trigger, .. } => assert_eq!(trigger, FlushTrigger::Threshold),
            TickAction::Skipped => panic!("expected a flush"),
        }

        assert_eq!(*transport.batches.lock(), vec![1, 3]);
        assert_eq!(scheduler.ticks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flushes_within_the_window() {
        let (buffer, transport, scheduler) = scheduler(SchedulerConfig::default());
        buffer.push(event());

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_secs(19)).await;
        assert!(transport.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(*transport.batches.lock(), vec![1]);
        assert!(buffer.is_empty());

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_during_running_flush_is_retried_soon() {
        let buffer = Arc::new(EventBuffer::new());
        let transport = Arc::new(SlowTransport::default());
        let privacy = Arc::new(PrivacyStore::load(Arc::new(MemoryStore::new())));
        let controller = Arc::new(FlushController::new(buffer.clone(), privacy, transport.clone()));
        let scheduler = Arc::new(FlushScheduler::with_rng(
            SchedulerConfig {
                immediate_flush_threshold: 2,
                ..SchedulerConfig::default()
            },
            buffer.clone(),
            controller.clone(),
            StdRng::seed_from_u64(5),
        ));
        let handle = scheduler.spawn();
        tokio::task::yield_now().await;

        buffer.push(event());
        buffer.push(event());
        let manual = tokio::spawn({
            let controller = controller.clone();
            async move { controller.flush(FlushTrigger::Manual).await }
        });
        tokio::task::yield_now().await;
        assert!(controller.is_flushing());

        buffer.push(event());
        let size = buffer.push(event());
        assert!(scheduler.threshold_reached(size));
        scheduler.notify_threshold();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*transport.batches.lock(), vec![2]);
        assert_eq!(buffer.size(), 2);

        // Il flush manuale finisce a t=5s; il retry parte prima del timer casuale (≥ 20s).
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(manual.await.expect("join").is_flushed());
        assert_eq!(*transport.batches.lock(), vec![2, 2]);
        assert!(buffer.is_empty());

        handle.abort();
    }

    #[tokio::test]
    async fn busy_threshold_tick_uses_the_short_retry_delay() {
        let (buffer, _t, scheduler) = scheduler(SchedulerConfig {
            immediate_flush_threshold: 1,
            ..SchedulerConfig::default()
        });
        buffer.push(event());
        let busy = TickAction::Flushed {
            trigger: FlushTrigger::Threshold,
            outcome: FlushOutcome::InProgress,
        };
        assert_eq!(scheduler.delay_after(&busy), BUSY_RETRY_DELAY);

        let delay = scheduler.delay_after(&TickAction::Skipped);
        assert!(delay >= Duration::from_secs(20));

        let _ = buffer.drain();
        assert!(scheduler.delay_after(&busy) >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_wakes_the_loop_early() {
        let (buffer, transport, scheduler) = scheduler(SchedulerConfig {
            immediate_flush_threshold: 2,
            ..SchedulerConfig::default()
        });
        let handle = scheduler.spawn();
        tokio::task::yield_now().await;

        buffer.push(event());
        let size = buffer.push(event());
        assert!(scheduler.threshold_reached(size));
        scheduler.notify_threshold();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*transport.batches.lock(), vec![2]);

        handle.abort();
    }
}
