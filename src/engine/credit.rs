//! Credit gate — can an upstream dealer absorb a transfer?
//!
//! Only linked targets are gated; manual targets carry no credit
//! obligation here. A dealer's pending deduction is a cached figure that is
//! only ever overwritten by a full rescan, never adjusted in place.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::storage::CreditStore;
use crate::types::{DealerCredit, LedgerError, Round, RoundStatus, TransferRecord, WagerRecord};

// ---------------------------------------------------------------------------
// Pending deduction
// ---------------------------------------------------------------------------

/// Obligations of a dealer across its unsettled rounds.
///
/// Open rounds count every active wager. Closed but unsettled rounds still
/// count the active wagers transferred in from downstream dealers.
/// Settled rounds count nothing.
///
/// `transfers_in` are ledger rows from downstream rounds that have not
/// settled. A linked row into this dealer that never got its mirror wager
/// counts at its stake.
pub fn pending_deduction(
    dealer_id: &str,
    rounds: &[Round],
    wagers: &[WagerRecord],
    transfers_in: &[TransferRecord],
) -> Decimal {
    let mut total = Decimal::ZERO;
    for round in rounds.iter().filter(|r| r.dealer_id == dealer_id) {
        let mirrored_only = match round.status {
            RoundStatus::Open => false,
            RoundStatus::Closed => true,
            RoundStatus::Settled => continue,
        };
        total += wagers
            .iter()
            .filter(|w| w.active && w.round_id == round.id)
            .filter(|w| !mirrored_only || w.is_mirror())
            .map(|w| w.amount)
            .sum::<Decimal>();
    }
    total += transfers_in
        .iter()
        .filter(|t| !t.is_mirrored())
        .filter(|t| t.target.linked_dealer().map(String::as_str) == Some(dealer_id))
        .map(|t| t.stake)
        .sum::<Decimal>();
    total
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CreditReason {
    Ok,
    /// Allowed, but the remaining credit is at or under the dealer's warning level.
    LowCredit { remaining: Decimal },
    Blocked,
    Insufficient { available: Decimal, requested: Decimal },
    UnknownDealer,
}

impl fmt::Display for CreditReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreditReason::Ok => write!(f, "ok"),
            CreditReason::LowCredit { remaining } => {
                write!(f, "allowed, remaining credit low ({remaining:.2})")
            }
            CreditReason::Blocked => write!(f, "dealer is blocked"),
            CreditReason::Insufficient { available, requested } => {
                write!(f, "requested {requested:.2} exceeds available {available:.2}")
            }
            CreditReason::UnknownDealer => write!(f, "dealer has no credit record"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditDecision {
    pub allowed: bool,
    pub reason: CreditReason,
}

impl CreditDecision {
    /// Turn a refusal into the engine error for `dealer_id`.
    pub fn into_result(self, dealer_id: &str) -> Result<CreditDecision, LedgerError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(LedgerError::InsufficientUpstreamCredit {
                dealer_id: dealer_id.to_string(),
                reason: self.reason.to_string(),
            })
        }
    }
}

/// Pure affordability check. The boundary is inclusive: a transfer that
/// brings available credit to exactly zero is allowed.
pub fn assess(credit: Option<&DealerCredit>, amount: Decimal) -> CreditDecision {
    let Some(credit) = credit else {
        return CreditDecision {
            allowed: false,
            reason: CreditReason::UnknownDealer,
        };
    };
    if credit.is_blocked {
        return CreditDecision {
            allowed: false,
            reason: CreditReason::Blocked,
        };
    }
    let available = credit.available();
    let remaining = available - amount;
    if remaining < Decimal::ZERO {
        return CreditDecision {
            allowed: false,
            reason: CreditReason::Insufficient {
                available,
                requested: amount,
            },
        };
    }
    let reason = if credit.warning_threshold > Decimal::ZERO && remaining <= credit.warning_threshold {
        CreditReason::LowCredit { remaining }
    } else {
        CreditReason::Ok
    };
    CreditDecision {
        allowed: true,
        reason,
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct CreditGate<S: ?Sized> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S: CreditStore + ?Sized> CreditGate<S> {
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Whether `target_dealer_id` can take `amount` more obligations.
    ///
    /// The lookup is bounded by the gate's timeout; a late answer is an
    /// `UpstreamLookupTimeout`, never an implicit approval.
    pub async fn evaluate(
        &self,
        target_dealer_id: &str,
        amount: Decimal,
    ) -> Result<CreditDecision, LedgerError> {
        let credit = tokio::time::timeout(self.timeout, self.store.dealer_credit(target_dealer_id))
            .await
            .map_err(|_| {
                LedgerError::UpstreamLookupTimeout(format!("credit check for {target_dealer_id}"))
            })??;

        let decision = assess(credit.as_ref(), amount);
        if decision.allowed {
            debug!(
                dealer_id = target_dealer_id,
                amount = %amount,
                reason = %decision.reason,
                "Credit check passed"
            );
        } else {
            warn!(
                dealer_id = target_dealer_id,
                amount = %amount,
                reason = %decision.reason,
                "Credit check failed"
            );
        }
        Ok(decision)
    }

    /// Rescan the dealer's obligations and overwrite its pending deduction.
    /// Idempotent; concurrent calls each write a complete recompute.
    pub async fn recompute_pending_deduction(
        &self,
        dealer_id: &str,
    ) -> Result<Option<DealerCredit>, LedgerError> {
        let refreshed = self.store.recompute_pending_deduction(dealer_id).await?;
        if let Some(ref credit) = refreshed {
            info!(
                dealer_id,
                pending = %credit.pending_deduction,
                available = %credit.available(),
                "Pending deduction recomputed"
            );
        }
        Ok(refreshed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
