//! Noise injection for outgoing batches.
//!
//! Meccanismo di Laplace per conteggi (sensibilità 1):
//!
//! ```text
//! count' = count + Lap(0, b),   b = SENSITIVITY / ε
//! ```
//!
//! Campionamento via CDF inversa: con `u ~ Uniform(-0.5, 0.5)`,
//! `x = -b · sign(u) · ln(1 − 2|u|)` è distribuito come `Lap(0, b)`.
//!
//! Questo è l'unico punto del crate che genera rumore. Le etichette di
//! [`crate::privacy::noise_magnitude_label`] descrivono proprio `b` in
//! percentuale di un conteggio unitario.

use rand::Rng;

use crate::event::{AnalyticsEvent, NoisedEvent};

/// L1 sensitivity of a single event count.
pub const SENSITIVITY: f64 = 1.0;

/// Laplace scale `b` for an epsilon.
#[must_use]
pub fn laplace_scale(epsilon: f64) -> f64 {
    SENSITIVITY / epsilon
}

/// Draws one sample from `Lap(0, SENSITIVITY / epsilon)`.
pub fn noise_sample<R: Rng + ?Sized>(epsilon: f64, rng: &mut R) -> f64 {
    let scale = laplace_scale(epsilon);
    loop {
        let u: f64 = rng.gen_range(-0.5..0.5);
        let tail = 1.0 - 2.0 * u.abs();
        // u = -0.5 darebbe ln(0): si ricampiona.
        if tail > 0.0 {
            return -scale * u.signum() * tail.ln();
        }
    }
}

/// Noises every event with a fresh sample drawn at `epsilon`.
///
/// Gli eventi originali non vengono toccati: si restituiscono nuovi record.
pub fn apply_noise<R: Rng + ?Sized>(
    events: &[AnalyticsEvent],
    epsilon: f64,
    rng: &mut R,
) -> Vec<NoisedEvent> {
    events
        .iter()
        .map(|event| event.noised(noise_sample(epsilon, rng), epsilon))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::event::{DeviceClass, PageContext};
    use crate::identity::AttributionContext;

    const DRAWS: usize = 20_000;

    fn draws(epsilon: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..DRAWS).map(|_| noise_sample(epsilon, &mut rng)).collect()
    }

    fn mean(xs: &[f64]) -> f64 {
        xs.iter().sum::<f64>() / xs.len() as f64
    }

    fn variance(xs: &[f64]) -> f64 {
        let m = mean(xs);
        xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
    }

    fn event(count: f64) -> AnalyticsEvent {
        AnalyticsEvent::new(
            "pageview",
            count,
            "sess",
            DeviceClass::Mobile,
            &PageContext::default(),
            &AttributionContext::default(),
        )
    }

    #[test]
    fn noise_is_centered_on_zero() {
        for (epsilon, seed) in [(0.5, 1_u64), (1.0, 2), (2.0, 3)] {
            let samples = draws(epsilon, seed);
            // Errore standard della media: sqrt(2)·b / sqrt(N).
            let tolerance = 5.0 * (2.0_f64).sqrt() * laplace_scale(epsilon) / (DRAWS as f64).sqrt();
            assert!(
                mean(&samples).abs() < tolerance,
                "mean {} too far from 0 for epsilon {epsilon}",
                mean(&samples)
            );
        }
    }

    #[test]
    fn spread_shrinks_as_epsilon_grows() {
        let strong = variance(&draws(0.5, 11));
        let weak = variance(&draws(2.0, 12));
        assert!(strong > weak * 4.0, "strong {strong} vs weak {weak}");
    }

    #[test]
    fn variance_matches_laplace() {
        let epsilon = 1.0;
        let expected = 2.0 * laplace_scale(epsilon).powi(2);
        let observed = variance(&draws(epsilon, 21));
        assert!(
            (observed - expected).abs() / expected < 0.15,
            "observed {observed}, expected {expected}"
        );
    }

    #[test]
    fn apply_noise_attaches_epsilon_and_keeps_originals() {
        let mut rng = StdRng::seed_from_u64(7);
        let events = vec![event(1.0), event(5.0)];

        let noised = apply_noise(&events, 1.5, &mut rng);

        assert_eq!(noised.len(), 2);
        assert!((events[0].count - 1.0).abs() < f64::EPSILON);
        assert!((events[1].count - 5.0).abs() < f64::EPSILON);
        for (orig, out) in events.iter().zip(&noised) {
            assert!((out.epsilon - 1.5).abs() < f64::EPSILON);
            assert_eq!(out.event.event_type, orig.event_type);
            assert!(out.event.count.is_finite());
        }
    }

    #[test]
    fn every_attempt_draws_fresh_noise() {
        let mut rng = StdRng::seed_from_u64(99);
        let events = vec![event(1.0)];

        let first = apply_noise(&events, 1.0, &mut rng);
        let second = apply_noise(&events, 1.0, &mut rng);

        assert!((first[0].event.count - second[0].event.count).abs() > 0.0);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(apply_noise(&[], 1.0, &mut rng).is_empty());
    }
}
