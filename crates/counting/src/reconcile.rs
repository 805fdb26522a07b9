//! Reconciliation engine: turns a set of count values into a resolution.
//!
//! [`evaluate`] is a pure function of the theoretical quantity, the submitted
//! values and the session policy. It never looks at arrival order, so
//! submissions from different counters commute.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stocktake_core::ValueObject;

use crate::Quantity;
use crate::item::{FlagReason, ResolutionMethod};

/// Default |variance %| above which an auto-resolved item is flagged.
pub const DEFAULT_FLAG_THRESHOLD_PCT: u32 = 5;

/// Session-scoped reconciliation parameters, captured when the session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationPolicy {
    pub flag_threshold_pct: Quantity,
}

impl ValueObject for ReconciliationPolicy {}

impl Default for ReconciliationPolicy {
    fn default() -> Self {
        Self {
            flag_threshold_pct: Decimal::from(DEFAULT_FLAG_THRESHOLD_PCT),
        }
    }
}

impl ReconciliationPolicy {
    pub fn new(flag_threshold_pct: Quantity) -> Self {
        Self { flag_threshold_pct }
    }

    /// `None` (undefined percentage) is always over the threshold.
    pub fn exceeds_threshold(&self, variance_percentage: Option<Quantity>) -> bool {
        match variance_percentage {
            Some(pct) => pct.abs() > self.flag_threshold_pct,
            None => true,
        }
    }
}

/// What the engine sees of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inputs {
    pub theoretical: Quantity,
    pub count_1: Option<Quantity>,
    pub count_2: Option<Quantity>,
    pub count_3: Option<Quantity>,
    pub requires_count_2: bool,
    /// The item has been named in a third-count trigger.
    pub in_third_round: bool,
}

/// Result of evaluating one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Required counts are still missing.
    Waiting,
    /// Counts are in but disagree; the item stays `pending` and is flagged.
    Unresolved(FlagReason),
    Resolved(Resolution),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub method: ResolutionMethod,
    pub final_qty: Quantity,
    pub variance: Quantity,
    pub variance_percentage: Option<Quantity>,
    pub flag: Option<FlagReason>,
    pub notes: Option<String>,
}

impl Resolution {
    pub fn new(
        policy: &ReconciliationPolicy,
        method: ResolutionMethod,
        final_qty: Quantity,
        theoretical: Quantity,
        notes: Option<String>,
    ) -> Self {
        let variance = final_qty - theoretical;
        let variance_percentage = variance_percentage(variance, theoretical);
        let flag = policy
            .exceeds_threshold(variance_percentage)
            .then_some(FlagReason::VarianceExceedsThreshold);
        Self {
            method,
            final_qty,
            variance,
            variance_percentage,
            flag,
            notes,
        }
    }
}

/// `variance / theoretical × 100`, rounded to two decimals.
///
/// With a zero theoretical quantity the percentage is `0` for a zero variance
/// and undefined otherwise.
pub fn variance_percentage(variance: Quantity, theoretical: Quantity) -> Option<Quantity> {
    if theoretical.is_zero() {
        return variance.is_zero().then_some(Decimal::ZERO);
    }
    variance
        .checked_div(theoretical)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .map(|pct| pct.round_dp(2))
}

pub fn evaluate(policy: &ReconciliationPolicy, inputs: &Inputs) -> Outcome {
    let t = inputs.theoretical;
    let Some(c1) = inputs.count_1 else {
        return Outcome::Waiting;
    };

    if !inputs.requires_count_2 {
        return if c1 == t {
            Outcome::Resolved(Resolution::new(
                policy,
                ResolutionMethod::AutoAllMatch,
                c1,
                t,
                None,
            ))
        } else {
            Outcome::Unresolved(FlagReason::CountMismatch)
        };
    }

    let Some(c2) = inputs.count_2 else {
        return Outcome::Waiting;
    };
    if c1 == c2 {
        return Outcome::Resolved(Resolution::new(
            policy,
            ResolutionMethod::AutoCountersAgree,
            c1,
            t,
            None,
        ));
    }

    if !inputs.in_third_round {
        return Outcome::Unresolved(FlagReason::NeedsAttention);
    }
    let Some(c3) = inputs.count_3 else {
        return Outcome::Waiting;
    };

    let decisive = if c3 == c1 {
        Some((c1, 2, c2))
    } else if c3 == c2 {
        Some((c2, 1, c1))
    } else {
        None
    };
    match decisive {
        Some((shared, outlier, outlier_qty)) => {
            let notes = format!(
                "third count agreed on {shared}; count {outlier} ({outlier_qty}) was the outlier"
            );
            Outcome::Resolved(Resolution::new(
                policy,
                ResolutionMethod::ThirdCountDecisive,
                shared,
                t,
                Some(notes),
            ))
        }
        None => Outcome::Unresolved(FlagReason::ManualOverrideRequired),
    }
}
