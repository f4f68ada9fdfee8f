//! Transfer desk — the service layer over the engine components.
//!
//! Runs the full transfer-out flow for a round:
//!   1. Validate the requested items
//!   2. Resolve each linked upstream dealer (credit check + open round lookup)
//!   3. Apply the linked-failure policy
//!   4. Commit ledger rows and mirror wagers as one unit
//!
//! Also owns wager submission and the reads the API needs.

use chrono::Utc;
use futures::future::try_join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::credit::{CreditDecision, CreditGate};
use crate::engine::ledger::{validate_request, CommitOutcome, TransferLedger};
use crate::engine::mirror::MirrorSubmitter;
use crate::exposure::ExposureCalculator;
use crate::storage::{BatchDraft, LedgerStore, StagedTransfer};
use crate::types::{
    BatchSummary, BetType, CapSpec, DealerCredit, DealerId, ExcessItem, LedgerError, Round,
    RoundId, TransferRecord, TransferRequest, TransferTarget, UndoSummary, WagerRecord,
};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// What to do when a linked target fails its credit check or has no open
/// round to mirror into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkedFailurePolicy {
    /// Reject the whole batch.
    #[default]
    Block,
    /// Commit the dealer's items as manual entries, without credit or mirror.
    CommitUnlinked,
}

impl fmt::Display for LinkedFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkedFailurePolicy::Block => write!(f, "block"),
            LinkedFailurePolicy::CommitUnlinked => write!(f, "commit_unlinked"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeskSettings {
    pub upstream_timeout: Duration,
    pub linked_failure_policy: LinkedFailurePolicy,
}

impl Default for DeskSettings {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_millis(2_000),
            linked_failure_policy: LinkedFailurePolicy::Block,
        }
    }
}

/// Resolution of one linked dealer before commit.
#[derive(Debug)]
struct Route {
    dealer_id: DealerId,
    mirror_round_id: Option<RoundId>,
    failure: Option<LedgerError>,
}

/// A new wager as submitted by a bettor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerSubmission {
    pub bettor_id: String,
    pub bet_type: BetType,
    pub numbers: String,
    pub amount: Decimal,
    #[serde(default)]
    pub commission: Decimal,
}

// ---------------------------------------------------------------------------
// Desk
// ---------------------------------------------------------------------------

pub struct TransferDesk<S: ?Sized> {
    store: Arc<S>,
    ledger: TransferLedger<S>,
    credit: CreditGate<S>,
    mirrors: MirrorSubmitter<S>,
    policy: LinkedFailurePolicy,
}

impl<S: LedgerStore + ?Sized> TransferDesk<S> {
    pub fn new(store: Arc<S>, settings: DeskSettings) -> Self {
        Self {
            ledger: TransferLedger::new(store.clone()),
            credit: CreditGate::new(store.clone(), settings.upstream_timeout),
            mirrors: MirrorSubmitter::new(store.clone(), settings.upstream_timeout),
            store,
            policy: settings.linked_failure_policy,
        }
    }

    pub fn policy(&self) -> LinkedFailurePolicy {
        self.policy
    }

    async fn require_round(&self, round_id: &str) -> Result<Round, LedgerError> {
        self.store
            .round(round_id)
            .await?
            .ok_or_else(|| LedgerError::RoundNotFound(round_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Exposure
    // -----------------------------------------------------------------------

    /// Current excess list of a round, from a fresh read of every input.
    pub async fn excess(&self, round_id: &str) -> Result<Vec<ExcessItem>, LedgerError> {
        let round = self.require_round(round_id).await?;
        let wagers = self.store.active_wagers(round_id).await?;
        let caps = self.store.cap_spec(round_id).await?;
        let transfers = self.store.transfers(round_id, None).await?;
        Ok(ExposureCalculator::compute(&wagers, &caps, &transfers, &round.variant))
    }

    // -----------------------------------------------------------------------
    // Transfers
    // -----------------------------------------------------------------------

    /// Transfer the requested items out of a round as one batch.
    pub async fn transfer_out(
        &self,
        round_id: &str,
        requests: Vec<TransferRequest>,
    ) -> Result<CommitOutcome, LedgerError> {
        if requests.is_empty() {
            return Err(LedgerError::InvalidTransferRequest("empty batch".into()));
        }
        for request in &requests {
            validate_request(request)?;
        }
        let round = self.require_round(round_id).await?;
        let now = Utc::now();

        let mut stakes: BTreeMap<DealerId, Decimal> = BTreeMap::new();
        for request in &requests {
            if let Some(dealer_id) = request.target.linked_dealer() {
                *stakes.entry(dealer_id.clone()).or_default() +=
                    round.variant.stake_for(request.bet_type, request.amount);
            }
        }

        let routes = try_join_all(
            stakes
                .iter()
                .map(|(dealer_id, stake)| self.resolve(&round, dealer_id, *stake, now)),
        )
        .await?;

        let mut mirror_rounds: BTreeMap<DealerId, RoundId> = BTreeMap::new();
        let mut demoted: Vec<DealerId> = Vec::new();
        for route in routes {
            match (route.failure, self.policy) {
                (None, _) => {
                    if let Some(id) = route.mirror_round_id {
                        mirror_rounds.insert(route.dealer_id, id);
                    }
                }
                (Some(err), LinkedFailurePolicy::Block) => {
                    warn!(
                        round_id,
                        dealer_id = %route.dealer_id,
                        error = %err,
                        "Linked transfer blocked"
                    );
                    return Err(err);
                }
                (Some(err), LinkedFailurePolicy::CommitUnlinked) => {
                    warn!(
                        round_id,
                        dealer_id = %route.dealer_id,
                        error = %err,
                        "Linked target unavailable, committing as manual entry"
                    );
                    demoted.push(route.dealer_id);
                }
            }
        }

        let items = requests
            .into_iter()
            .map(|mut request| {
                let linked = request.target.linked_dealer().cloned();
                match linked {
                    Some(dealer_id) if demoted.contains(&dealer_id) => {
                        request.target = TransferTarget::manual(&dealer_id);
                        StagedTransfer::unmirrored(request)
                    }
                    Some(dealer_id) => StagedTransfer {
                        request,
                        mirror_round_id: mirror_rounds.get(&dealer_id).cloned(),
                    },
                    None => StagedTransfer::unmirrored(request),
                }
            })
            .collect();

        let draft = BatchDraft {
            round_id: round_id.to_string(),
            batch_id: TransferLedger::<S>::new_batch_id(),
            created_at: now,
            items,
        };
        match self.ledger.commit(draft).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(round_id, error = %e, "Transfer batch rejected");
                Err(e)
            }
        }
    }

    /// Credit check and round lookup for one linked dealer. Upstream
    /// problems are captured in the route; storage failures propagate.
    async fn resolve(
        &self,
        round: &Round,
        dealer_id: &str,
        stake: Decimal,
        now: chrono::DateTime<Utc>,
    ) -> Result<Route, LedgerError> {
        let mut route = Route {
            dealer_id: dealer_id.to_string(),
            mirror_round_id: None,
            failure: None,
        };

        let decision = match self.credit.evaluate(dealer_id, stake).await {
            Ok(decision) => decision.into_result(dealer_id),
            Err(e) => Err(e),
        };
        if let Err(e) = decision {
            if !e.is_upstream_unavailable() {
                return Err(e);
            }
            route.failure = Some(e);
            return Ok(route);
        }

        match self
            .mirrors
            .require_open_round(dealer_id, &round.lottery_type, round.round_date, now)
            .await
        {
            Ok(upstream) => route.mirror_round_id = Some(upstream.id),
            Err(e) if e.is_upstream_unavailable() => route.failure = Some(e),
            Err(e) => return Err(e),
        }
        Ok(route)
    }

    pub async fn transfers(
        &self,
        round_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        self.ledger.list_by_round(round_id, batch_id).await
    }

    pub async fn batches(&self, round_id: &str) -> Result<Vec<BatchSummary>, LedgerError> {
        self.ledger.list_batches(round_id).await
    }

    pub async fn undo(&self, batch_id: &str) -> Result<UndoSummary, LedgerError> {
        self.ledger.undo_batch(batch_id).await
    }

    // -----------------------------------------------------------------------
    // Wagers
    // -----------------------------------------------------------------------

    /// Accept a bettor's wager into an open round.
    pub async fn submit_wager(
        &self,
        round_id: &str,
        submission: WagerSubmission,
    ) -> Result<WagerRecord, LedgerError> {
        let round = self.require_round(round_id).await?;
        if !round.is_open_at(Utc::now()) {
            return Err(LedgerError::InvalidWager(format!("round {round_id} is not open")));
        }
        let WagerSubmission {
            bettor_id,
            bet_type,
            numbers,
            amount,
            commission,
        } = submission;

        if bettor_id.trim().is_empty() {
            return Err(LedgerError::InvalidWager("missing bettor".into()));
        }
        if !bet_type.accepts(&numbers) {
            return Err(LedgerError::InvalidWager(format!(
                "{bet_type} numbers must be {} digits, got {numbers:?}",
                bet_type.digits()
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidWager(format!("amount must be positive, got {amount}")));
        }
        if commission < Decimal::ZERO {
            return Err(LedgerError::InvalidWager(format!("negative commission {commission}")));
        }
        if round.variant.is_set_priced(bet_type) {
            let price = round.variant.unit_price(bet_type);
            if (amount % price) != Decimal::ZERO {
                return Err(LedgerError::InvalidWager(format!(
                    "{bet_type} amount {amount} is not a whole number of {price} sets"
                )));
            }
        }

        let wager = WagerRecord::new(round_id, &bettor_id, bet_type, &numbers, amount, commission);
        self.store.append_wager(&wager).await?;
        info!(
            round_id,
            wager_id = %wager.id,
            bet_type = %bet_type,
            numbers = %wager.numbers,
            amount = %amount,
            "Wager accepted"
        );
        Ok(wager)
    }

    /// Soft-delete a wager. Settled rounds are frozen.
    pub async fn delete_wager(&self, wager_id: &str) -> Result<bool, LedgerError> {
        let Some(wager) = self.store.wager(wager_id).await? else {
            return Ok(false);
        };
        let round = self.require_round(&wager.round_id).await?;
        if round.is_settled() {
            return Err(LedgerError::InvalidWager(format!(
                "round {} is settled",
                round.id
            )));
        }
        let deleted = self.store.deactivate_wager(wager_id).await?;
        if deleted {
            info!(wager_id, round_id = %round.id, mirror = wager.is_mirror(), "Wager deleted");
        }
        Ok(deleted)
    }

    pub async fn wagers(&self, round_id: &str) -> Result<Vec<WagerRecord>, LedgerError> {
        self.require_round(round_id).await?;
        self.store.active_wagers(round_id).await
    }

    // -----------------------------------------------------------------------
    // Rounds & caps
    // -----------------------------------------------------------------------

    pub async fn round(&self, round_id: &str) -> Result<Round, LedgerError> {
        self.require_round(round_id).await
    }

    pub async fn save_round(&self, round: &Round) -> Result<(), LedgerError> {
        self.store.save_round(round).await?;
        info!(round_id = %round.id, dealer_id = %round.dealer_id, status = %round.status, "Round saved");
        Ok(())
    }

    pub async fn caps(&self, round_id: &str) -> Result<CapSpec, LedgerError> {
        self.require_round(round_id).await?;
        self.store.cap_spec(round_id).await
    }

    pub async fn save_caps(&self, round_id: &str, caps: &CapSpec) -> Result<(), LedgerError> {
        self.require_round(round_id).await?;
        self.store.save_cap_spec(round_id, caps).await?;
        info!(
            round_id,
            type_caps = caps.type_caps.len(),
            number_caps = caps.number_caps.len(),
            suffix_caps = caps.suffix_caps.len(),
            "Caps saved"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Credit
    // -----------------------------------------------------------------------

    pub async fn credit(&self, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError> {
        self.store.dealer_credit(dealer_id).await
    }

    /// Whether a linked dealer could take `amount` right now.
    pub async fn check_credit(&self, dealer_id: &str, amount: Decimal) -> Result<CreditDecision, LedgerError> {
        self.credit.evaluate(dealer_id, amount).await
    }

    /// Upsert a dealer's credit settings and return the stored row, with a
    /// freshly recomputed pending deduction.
    pub async fn save_credit(&self, credit: &DealerCredit) -> Result<Option<DealerCredit>, LedgerError> {
        self.store.save_dealer_credit(credit).await?;
        self.credit.recompute_pending_deduction(&credit.dealer_id).await
    }

    pub async fn recompute(&self, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError> {
        self.credit.recompute_pending_deduction(dealer_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
