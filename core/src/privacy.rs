//! Privacy parameter store for Veil.
//!
//! Questo modulo tiene:
//! - il parametro ε corrente (default 1.0, dominio `[0.1, 5.0]`);
//! - la storia delle ultime 10 modifiche di ε;
//! - il consumo giornaliero del budget di privacy.
//!
//! Tutte le interpretazioni di ε (costo, livello di privacy, etichetta
//! del rumore) passano da **una sola** tabella, [`PRIVACY_TIERS`]: il
//! costo addebitato al budget e l'indicatore mostrato in UI non possono
//! divergere.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, VeilError};
use crate::storage::{self, KeyValueStore, PRIVACY_STATE_KEY};

/// Smallest accepted epsilon.
pub const MIN_EPSILON: f64 = 0.1;
/// Largest accepted epsilon.
pub const MAX_EPSILON: f64 = 5.0;
/// Epsilon used until the user picks one.
pub const DEFAULT_EPSILON: f64 = 1.0;
/// Capacity of the epsilon history ring buffer.
pub const EPSILON_HISTORY_CAPACITY: usize = 10;
/// Budget considered "fully spent" for display purposes.
pub const DAILY_BUDGET: f64 = 1.0;

/// Privacy level shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrivacyLevel {
    /// ε ≤ 0.5.
    High,
    /// 0.5 < ε ≤ 1.0.
    Moderate,
    /// 1.0 < ε ≤ 1.5.
    Balanced,
    /// ε > 1.5.
    Low,
}

impl PrivacyLevel {
    /// Human-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Moderate => "Moderate",
            Self::Balanced => "Balanced",
            Self::Low => "Low",
        }
    }
}

impl fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the epsilon interpretation table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrivacyTier {
    /// Inclusive upper bound of ε for this tier (`f64::INFINITY` for the last).
    pub max_epsilon: f64,
    /// Level shown in the UI.
    pub level: PrivacyLevel,
    /// Budget charged by a `set_epsilon` landing in this tier.
    pub cost: f64,
    /// Expected noise, as the Laplace scale `1/ε` relative to a unit count.
    pub noise_label: &'static str,
}

/// The single epsilon interpretation table, ordered by `max_epsilon`.
pub const PRIVACY_TIERS: [PrivacyTier; 4] = [
    PrivacyTier {
        max_epsilon: 0.5,
        level: PrivacyLevel::High,
        cost: 0.40,
        noise_label: "≥200%",
    },
    PrivacyTier {
        max_epsilon: 1.0,
        level: PrivacyLevel::Moderate,
        cost: 0.25,
        noise_label: "100–200%",
    },
    PrivacyTier {
        max_epsilon: 1.5,
        level: PrivacyLevel::Balanced,
        cost: 0.15,
        noise_label: "67–100%",
    },
    PrivacyTier {
        max_epsilon: f64::INFINITY,
        level: PrivacyLevel::Low,
        cost: 0.10,
        noise_label: "<67%",
    },
];

/// Tier an epsilon falls in.
#[must_use]
pub fn tier_for(epsilon: f64) -> &'static PrivacyTier {
    PRIVACY_TIERS
        .iter()
        .find(|tier| epsilon <= tier.max_epsilon)
        .unwrap_or(&PRIVACY_TIERS[PRIVACY_TIERS.len() - 1])
}

/// Privacy level for an epsilon.
#[must_use]
pub fn privacy_level(epsilon: f64) -> PrivacyLevel {
    tier_for(epsilon).level
}

/// Noise-magnitude band for an epsilon.
#[must_use]
pub fn noise_magnitude_label(epsilon: f64) -> &'static str {
    tier_for(epsilon).noise_label
}

/// Budget cost of switching to an epsilon. Lower ε ⇒ higher cost.
#[must_use]
pub fn privacy_cost(epsilon: f64) -> f64 {
    tier_for(epsilon).cost
}

/// Checks an epsilon against the supported domain. NaN is rejected.
pub fn validate_epsilon(value: f64) -> Result<f64> {
    if (MIN_EPSILON..=MAX_EPSILON).contains(&value) {
        Ok(value)
    } else {
        Err(VeilError::EpsilonOutOfRange {
            value,
            min: MIN_EPSILON,
            max: MAX_EPSILON,
        })
    }
}

/// One entry of the epsilon history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsilonChange {
    /// New epsilon.
    pub value: f64,
    /// When it was set.
    pub timestamp: DateTime<Utc>,
}

/// Persisted privacy state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyState {
    /// Current epsilon.
    pub epsilon: f64,
    /// Most recent changes, oldest first, at most [`EPSILON_HISTORY_CAPACITY`].
    pub epsilon_history: VecDeque<EpsilonChange>,
    /// Budget consumed since `budget_reset_at`. Never negative, never clamped.
    pub daily_budget_used: f64,
    /// Start of the current budget day.
    pub budget_reset_at: DateTime<Utc>,
}

impl PrivacyState {
    /// Fresh state starting its budget day at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            epsilon_history: VecDeque::with_capacity(EPSILON_HISTORY_CAPACITY),
            daily_budget_used: 0.0,
            budget_reset_at: now,
        }
    }

    /// Resets usage when a full day has elapsed since `budget_reset_at`.
    ///
    /// Restituisce `true` se il reset è avvenuto.
    pub fn roll_budget_day(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.budget_reset_at >= Duration::days(1) {
            self.daily_budget_used = 0.0;
            self.budget_reset_at = now;
            true
        } else {
            false
        }
    }

    /// Applies a validated epsilon change at `now`.
    pub fn apply_epsilon(&mut self, value: f64, now: DateTime<Utc>) -> f64 {
        self.roll_budget_day(now);

        let cost = privacy_cost(value);
        self.epsilon = value;
        if self.epsilon_history.len() == EPSILON_HISTORY_CAPACITY {
            self.epsilon_history.pop_front();
        }
        self.epsilon_history.push_back(EpsilonChange {
            value,
            timestamp: now,
        });
        self.daily_budget_used += cost;
        cost
    }

    /// Usage as a percentage of `daily_budget`, capped at 100 for display.
    #[must_use]
    pub fn budget_used_percent(&self, daily_budget: f64) -> f64 {
        if daily_budget <= 0.0 {
            return 100.0;
        }
        (self.daily_budget_used / daily_budget * 100.0).min(100.0)
    }

    // Riporta nel dominio uno stato letto da storage (es. file editato a mano).
    fn sanitized(mut self) -> Self {
        if validate_epsilon(self.epsilon).is_err() {
            self.epsilon = DEFAULT_EPSILON;
        }
        if !self.daily_budget_used.is_finite() || self.daily_budget_used < 0.0 {
            self.daily_budget_used = 0.0;
        }
        while self.epsilon_history.len() > EPSILON_HISTORY_CAPACITY {
            self.epsilon_history.pop_front();
        }
        self
    }
}

/// Thread-safe owner of [`PrivacyState`], persisted on every change.
pub struct PrivacyStore {
    state: Mutex<PrivacyState>,
    durable: Arc<dyn KeyValueStore>,
}

impl PrivacyStore {
    /// Loads the state from durable storage, or starts from defaults.
    ///
    /// Un budget giornaliero già scaduto viene azzerato (e salvato) subito.
    #[must_use]
    pub fn load(durable: Arc<dyn KeyValueStore>) -> Self {
        let mut state = storage::load_json::<PrivacyState>(durable.as_ref(), PRIVACY_STATE_KEY)
            .map_or_else(|| PrivacyState::new(Utc::now()), PrivacyState::sanitized);
        if state.roll_budget_day(Utc::now()) {
            debug!("stored budget day expired, usage reset");
            storage::save_json(durable.as_ref(), PRIVACY_STATE_KEY, &state);
        }
        debug!(epsilon = state.epsilon, "privacy state loaded");
        Self {
            state: Mutex::new(state),
            durable,
        }
    }

    /// Current epsilon.
    #[must_use]
    pub fn epsilon(&self) -> f64 {
        self.state.lock().epsilon
    }

    /// Copy of the whole state, with the budget day rolled to now.
    #[must_use]
    pub fn snapshot(&self) -> PrivacyState {
        self.snapshot_at(Utc::now())
    }

    /// Copy of the whole state as seen at `now`.
    ///
    /// Se è passato un giorno da `budget_reset_at` il consumo torna a zero
    /// e lo stato aggiornato viene persistito.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> PrivacyState {
        let (snapshot, rolled) = {
            let mut state = self.state.lock();
            let rolled = state.roll_budget_day(now);
            (state.clone(), rolled)
        };
        if rolled {
            debug!("budget day rolled over");
            storage::save_json(self.durable.as_ref(), PRIVACY_STATE_KEY, &snapshot);
        }
        snapshot
    }

    /// Sets epsilon now. See [`PrivacyStore::set_epsilon_at`].
    pub fn set_epsilon(&self, value: f64) -> Result<PrivacyState> {
        self.set_epsilon_at(value, Utc::now())
    }

    /// Validates `value`, charges its cost to the daily budget and persists.
    ///
    /// I valori fuori da `[MIN_EPSILON, MAX_EPSILON]` sono rifiutati e lo
    /// stato resta invariato.
    pub fn set_epsilon_at(&self, value: f64, now: DateTime<Utc>) -> Result<PrivacyState> {
        let value = validate_epsilon(value)?;

        let snapshot = {
            let mut state = self.state.lock();
            let cost = state.apply_epsilon(value, now);
            info!(
                epsilon = value,
                level = %privacy_level(value),
                cost,
                budget_used = state.daily_budget_used,
                "epsilon updated"
            );
            state.clone()
        };

        storage::save_json(self.durable.as_ref(), PRIVACY_STATE_KEY, &snapshot);
        Ok(snapshot)
    }
}
