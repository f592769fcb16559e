// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-wide token budget accounting.
//!
//! Tracks total budget T, used U, and reserved R (available = T − U − R).
//! Phases pre-commit capacity with [`TokenBudget::reserve`], record actual
//! usage with [`TokenBudget::consume`], and hand back the remainder with
//! [`TokenBudget::release`]. A one-shot warning fires at 80% usage
//! (configurable) and an exceeded signal whenever usage crosses the total;
//! both are delivered through registered callbacks and never as errors.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// The one-shot warning trips once usage reaches this fraction of the
/// total.
const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a reservation's tokens are spent on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCategory {
    /// Analyze-phase calls.
    Analyze,
    /// Plan-phase calls.
    Plan,
    /// Generate-phase calls.
    Generate,
    /// Validate-phase calls.
    Validate,
    /// Sub-agent execution.
    Agentic,
}

impl BudgetCategory {
    /// Stable wire string for this category.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Generate => "generate",
            Self::Validate => "validate",
            Self::Agentic => "agentic",
        }
    }
}

/// A pre-committed slice of the budget owned by a single operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id (`res_<n>`).
    pub id: String,
    /// Spend category.
    pub category: BudgetCategory,
    /// Amount set aside.
    pub reserved: u64,
    /// Amount consumed so far; never exceeds `reserved`.
    pub consumed: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Signals emitted by the budget, delivered via callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetSignal {
    /// Usage crossed the warning threshold (fires once).
    Warning {
        /// Tokens used.
        used: u64,
        /// Total budget.
        total: u64,
        /// Usage percentage at fire time.
        usage_pct: f64,
    },
    /// Usage exceeded the total budget.
    Exceeded {
        /// Tokens used.
        used: u64,
        /// Total budget.
        total: u64,
    },
}

/// Errors from budget operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BudgetError {
    /// Not enough unreserved budget for the requested reservation.
    #[error("insufficient budget: requested {requested}, available {available}")]
    InsufficientBudget {
        /// Tokens requested.
        requested: u64,
        /// Tokens currently available (T − U − R).
        available: u64,
    },
    /// The reservation id is unknown or already closed.
    #[error("invalid reservation: {id}")]
    InvalidReservation {
        /// The offending id.
        id: String,
    },
    /// The consume would exceed the reservation's remaining capacity.
    #[error("reservation {id} exceeded: requested {requested}, remaining {remaining}")]
    ReservationExceeded {
        /// The reservation id.
        id: String,
        /// Tokens the caller tried to consume.
        requested: u64,
        /// Unconsumed remainder of the reservation.
        remaining: u64,
    },
}

/// Point-in-time snapshot of the budget state.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    /// Total budget T.
    pub total: u64,
    /// Tokens consumed U.
    pub used: u64,
    /// Tokens reserved R.
    pub reserved: u64,
    /// Available = T − U − R (saturating).
    pub available: u64,
    /// Consumption per category.
    pub by_category: BTreeMap<BudgetCategory, u64>,
    /// Live reservations.
    pub reservations: Vec<Reservation>,
    /// Whether the one-shot warning has fired.
    pub warning_fired: bool,
    /// Whether usage exceeds the total.
    pub exceeded: bool,
}

// ---------------------------------------------------------------------------
// TokenBudget
// ---------------------------------------------------------------------------

type SignalCallback = Box<dyn Fn(&BudgetSignal) + Send + Sync>;

struct Ledger {
    total: u64,
    used: u64,
    reserved: u64,
    by_category: BTreeMap<BudgetCategory, u64>,
    reservations: BTreeMap<String, Reservation>,
    next_id: u64,
    warning_fired: bool,
}

impl Ledger {
    fn available(&self) -> u64 {
        self.total.saturating_sub(self.used + self.reserved)
    }
}

/// The process-wide token accountant.
///
/// All mutating operations serialize on one internal lock, preserving
/// `used + reserved ≤ total` for every successful operation. Signal
/// callbacks run outside the lock.
///
/// # Examples
///
/// ```
/// use forge_budget::{TokenBudget, BudgetCategory};
///
/// let budget = TokenBudget::new(1_000);
/// let res = budget.reserve(BudgetCategory::Analyze, 300).unwrap();
/// budget.consume(&res, 120).unwrap();
/// budget.release(&res).unwrap();
/// assert_eq!(budget.remaining(), 880);
/// ```
pub struct TokenBudget {
    ledger: Mutex<Ledger>,
    warning_threshold: f64,
    callbacks: Mutex<Vec<SignalCallback>>,
}

impl TokenBudget {
    /// Create a budget with the given total and the default 80% warning
    /// threshold.
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self::with_warning_threshold(total, DEFAULT_WARNING_THRESHOLD)
    }

    /// Create a budget with an explicit warning threshold (fraction of T).
    #[must_use]
    pub fn with_warning_threshold(total: u64, warning_threshold: f64) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                total,
                used: 0,
                reserved: 0,
                by_category: BTreeMap::new(),
                reservations: BTreeMap::new(),
                next_id: 0,
                warning_fired: false,
            }),
            warning_threshold,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback for [`BudgetSignal`]s.
    pub fn on_signal(&self, callback: impl Fn(&BudgetSignal) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .expect("callback lock poisoned")
            .push(Box::new(callback));
    }

    /// Set aside `amount` tokens for `category`.
    ///
    /// # Errors
    ///
    /// [`BudgetError::InsufficientBudget`] when `amount` exceeds the
    /// currently available budget.
    pub fn reserve(&self, category: BudgetCategory, amount: u64) -> Result<String, BudgetError> {
        let mut ledger = self.ledger.lock().expect("budget lock poisoned");
        let available = ledger.available();
        if amount > available {
            return Err(BudgetError::InsufficientBudget {
                requested: amount,
                available,
            });
        }
        ledger.next_id += 1;
        let id = format!("res_{}", ledger.next_id);
        ledger.reserved += amount;
        ledger.reservations.insert(
            id.clone(),
            Reservation {
                id: id.clone(),
                category,
                reserved: amount,
                consumed: 0,
                created_at: Utc::now(),
            },
        );
        debug!(
            target: "forge.budget",
            id = %id,
            category = category.as_str(),
            amount,
            "reserved"
        );
        Ok(id)
    }

    /// Record `amount` tokens of actual usage against a reservation.
    ///
    /// Moves `amount` from reserved to used and the reservation's category
    /// bucket. A fully consumed reservation is removed.
    ///
    /// # Errors
    ///
    /// [`BudgetError::InvalidReservation`] for unknown ids,
    /// [`BudgetError::ReservationExceeded`] when `amount` is larger than the
    /// reservation's unconsumed remainder (the overshoot is rejected, not
    /// recorded).
    pub fn consume(&self, reservation_id: &str, amount: u64) -> Result<(), BudgetError> {
        let signals = {
            let mut ledger = self.ledger.lock().expect("budget lock poisoned");
            let reservation = ledger.reservations.get_mut(reservation_id).ok_or_else(|| {
                BudgetError::InvalidReservation {
                    id: reservation_id.to_string(),
                }
            })?;
            let remaining = reservation.reserved - reservation.consumed;
            if amount > remaining {
                return Err(BudgetError::ReservationExceeded {
                    id: reservation_id.to_string(),
                    requested: amount,
                    remaining,
                });
            }
            reservation.consumed += amount;
            let category = reservation.category;
            let done = reservation.consumed == reservation.reserved;
            if done {
                ledger.reservations.remove(reservation_id);
            }
            ledger.reserved -= amount;
            ledger.used += amount;
            *ledger.by_category.entry(category).or_insert(0) += amount;
            self.collect_signals(&mut ledger)
        };
        self.fire(&signals);
        Ok(())
    }

    /// Return a reservation's unconsumed remainder to the available pool and
    /// remove it.
    ///
    /// # Errors
    ///
    /// [`BudgetError::InvalidReservation`] for unknown ids.
    pub fn release(&self, reservation_id: &str) -> Result<u64, BudgetError> {
        let mut ledger = self.ledger.lock().expect("budget lock poisoned");
        let reservation = ledger.reservations.remove(reservation_id).ok_or_else(|| {
            BudgetError::InvalidReservation {
                id: reservation_id.to_string(),
            }
        })?;
        let remainder = reservation.reserved - reservation.consumed;
        ledger.reserved -= remainder;
        debug!(
            target: "forge.budget",
            id = %reservation_id,
            remainder,
            "released"
        );
        Ok(remainder)
    }

    /// Whether `amount` fits into the currently available budget.
    #[must_use]
    pub fn can_afford(&self, amount: u64) -> bool {
        self.ledger.lock().expect("budget lock poisoned").available() >= amount
    }

    /// Currently available tokens (T − U − R).
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.ledger.lock().expect("budget lock poisoned").available()
    }

    /// Tokens consumed so far.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.ledger.lock().expect("budget lock poisoned").used
    }

    /// Snapshot of the full budget state.
    #[must_use]
    pub fn report(&self) -> BudgetReport {
        let ledger = self.ledger.lock().expect("budget lock poisoned");
        BudgetReport {
            total: ledger.total,
            used: ledger.used,
            reserved: ledger.reserved,
            available: ledger.available(),
            by_category: ledger.by_category.clone(),
            reservations: ledger.reservations.values().cloned().collect(),
            warning_fired: ledger.warning_fired,
            exceeded: ledger.used > ledger.total,
        }
    }

    /// Zero all counters and drop live reservations. The warning re-arms.
    pub fn reset(&self) {
        let mut ledger = self.ledger.lock().expect("budget lock poisoned");
        ledger.used = 0;
        ledger.reserved = 0;
        ledger.by_category.clear();
        ledger.reservations.clear();
        ledger.warning_fired = false;
    }

    // --- helpers ---

    fn collect_signals(&self, ledger: &mut Ledger) -> Vec<BudgetSignal> {
        let mut signals = Vec::new();
        if ledger.total > 0 {
            let pct = ledger.used as f64 / ledger.total as f64;
            if !ledger.warning_fired && pct >= self.warning_threshold {
                ledger.warning_fired = true;
                signals.push(BudgetSignal::Warning {
                    used: ledger.used,
                    total: ledger.total,
                    usage_pct: pct * 100.0,
                });
            }
        }
        if ledger.used > ledger.total {
            signals.push(BudgetSignal::Exceeded {
                used: ledger.used,
                total: ledger.total,
            });
        }
        signals
    }

    fn fire(&self, signals: &[BudgetSignal]) {
        if signals.is_empty() {
            return;
        }
        let callbacks = self.callbacks.lock().expect("callback lock poisoned");
        for signal in signals {
            if matches!(signal, BudgetSignal::Exceeded { .. }) {
                warn!(target: "forge.budget", ?signal, "budget exceeded");
            } else {
                warn!(target: "forge.budget", ?signal, "budget warning");
            }
            for cb in callbacks.iter() {
                cb(signal);
            }
        }
    }
}

impl std::fmt::Debug for TokenBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let report = self.report();
        f.debug_struct("TokenBudget")
            .field("total", &report.total)
            .field("used", &report.used)
            .field("reserved", &report.reserved)
            .field("reservations", &report.reservations.len())
            .finish()
    }
}
