//! FIFO buffer of pending analytics events.
//!
//! Ordine di inserimento = ordine di trasmissione. Il buffer si svuota
//! solo con [`EventBuffer::drain`], e in caso di trasmissione fallita il
//! batch torna **in testa** con [`EventBuffer::restore_front`], davanti
//! agli eventi registrati nel frattempo.

use std::collections::VecDeque;
use std::mem;

use parking_lot::Mutex;

use crate::event::AnalyticsEvent;

/// Thread-safe ordered queue of events.
///
/// Ogni operazione prende il lock una sola volta: `drain` è atomico
/// rispetto a `push` concorrenti (un evento finisce o nello snapshot o
/// nel buffer, mai in entrambi, mai in nessuno).
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Mutex<VecDeque<AnalyticsEvent>>,
}

impl EventBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event and returns the new size.
    pub fn push(&self, event: AnalyticsEvent) -> usize {
        let mut events = self.events.lock();
        events.push_back(event);
        events.len()
    }

    /// Copy of the current contents, in order.
    #[must_use]
    pub fn peek_all(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Empties the buffer and returns its prior contents as one snapshot.
    pub fn drain(&self) -> Vec<AnalyticsEvent> {
        let taken = mem::take(&mut *self.events.lock());
        taken.into()
    }

    /// Puts a failed batch back ahead of anything recorded since the drain.
    pub fn restore_front(&self, batch: Vec<AnalyticsEvent>) {
        if batch.is_empty() {
            return;
        }
        let mut events = self.events.lock();
        let newer = mem::take(&mut *events);
        events.extend(batch);
        events.extend(newer);
    }

    /// Number of pending events.
    #[must_use]
    pub fn size(&self) -> usize {
        self.events.lock().len()
    }

    /// `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use crate::event::{DeviceClass, PageContext};
    use crate::identity::AttributionContext;

    fn event(seq: u64) -> AnalyticsEvent {
        let mut extra = serde_json::Map::new();
        extra.insert("seq".into(), json!(seq));
        AnalyticsEvent::new(
            "click",
            1.0,
            "sess",
            DeviceClass::Desktop,
            &PageContext::default(),
            &AttributionContext::default(),
        )
        .with_extra(extra)
    }

    fn seq(event: &AnalyticsEvent) -> u64 {
        event.extra["seq"].as_u64().unwrap_or(u64::MAX)
    }

    #[test]
    fn push_peek_drain_in_fifo_order() {
        let buffer = EventBuffer::new();
        assert!(buffer.is_empty());

        assert_eq!(buffer.push(event(1)), 1);
        assert_eq!(buffer.push(event(2)), 2);

        let peeked: Vec<u64> = buffer.peek_all().iter().map(seq).collect();
        assert_eq!(peeked, vec![1, 2]);
        assert_eq!(buffer.size(), 2);

        let drained: Vec<u64> = buffer.drain().iter().map(seq).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn restore_front_puts_batch_ahead_of_newer_events() {
        let buffer = EventBuffer::new();
        buffer.push(event(1));
        buffer.push(event(2));

        let batch = buffer.drain();
        buffer.push(event(3));
        buffer.restore_front(batch);

        let order: Vec<u64> = buffer.peek_all().iter().map(seq).collect();
        assert_eq!(order, vec![1, 2, 3]);

        buffer.restore_front(Vec::new());
        assert_eq!(buffer.size(), 3);
    }

    #[test]
    fn concurrent_push_and_drain_loses_and_duplicates_nothing() {
        const WRITERS: u64 = 4;
        const PER_WRITER: u64 = 2_000;

        let buffer = Arc::new(EventBuffer::new());
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        buffer.push(event(w * PER_WRITER + i));
                    }
                })
            })
            .collect();

        let drainer = {
            let buffer = Arc::clone(&buffer);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while !done.load(Ordering::Acquire) {
                    seen.extend(buffer.drain().iter().map(seq));
                    thread::yield_now();
                }
                seen
            })
        };

        for writer in writers {
            writer.join().expect("writer thread");
        }
        done.store(true, Ordering::Release);
        let mut seen = drainer.join().expect("drainer thread");
        seen.extend(buffer.drain().iter().map(seq));

        let unique: HashSet<u64> = seen.iter().copied().collect();
        assert_eq!(seen.len() as u64, WRITERS * PER_WRITER);
        assert_eq!(unique.len(), seen.len());
    }
}
