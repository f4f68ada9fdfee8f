//! Transfer ledger — append / undo-by-batch record of transfer-out decisions.
//!
//! Every write goes through `verify_batch`, which the store runs against a
//! context read inside its write transaction. The live excess is therefore
//! recomputed at commit time, and two racing commits on the same key can
//! never jointly exceed it.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::credit::assess;
use crate::engine::mirror::mirror;
use crate::exposure::ExposureCalculator;
use crate::storage::{
    BatchDraft, CommitContext, CommitPlan, LedgerStore, MirrorWarning, StagedTransfer,
};
use crate::types::{
    BatchId, BatchSummary, CapTier, DealerId, LedgerError, LotteryVariant, TransferRecord,
    TransferRequest, UndoSummary,
};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a committed batch produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub batch_id: BatchId,
    pub records: Vec<TransferRecord>,
    /// Mirrors that could not be attached. The ledger rows stand regardless.
    pub warnings: Vec<MirrorWarning>,
}

impl CommitOutcome {
    pub fn total_amount(&self) -> Decimal {
        self.records.iter().map(|r| r.amount).sum()
    }

    pub fn mirrored(&self) -> usize {
        self.records.iter().filter(|r| r.is_mirrored()).count()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Shape checks that need no stored state.
pub fn validate_request(request: &TransferRequest) -> Result<(), LedgerError> {
    if request.amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidTransferRequest(format!(
            "{}: amount must be positive, got {}",
            request.key(),
            request.amount
        )));
    }
    if !request.target.has_identity() {
        return Err(LedgerError::InvalidTransferRequest(format!(
            "{}: target has no identity",
            request.key()
        )));
    }
    if !request.bet_type.accepts(&request.numbers) {
        return Err(LedgerError::InvalidTransferRequest(format!(
            "{}: numbers must be {} digits",
            request.key(),
            request.bet_type.digits()
        )));
    }
    Ok(())
}

/// Tier and unit checks that depend on the round's variant.
fn validate_for_variant(request: &TransferRequest, variant: &LotteryVariant) -> Result<(), LedgerError> {
    let set_priced = variant.is_set_priced(request.bet_type);
    let tier_ok = match request.tier {
        CapTier::Standard => !set_priced,
        CapTier::Exact | CapTier::Suffix => set_priced,
    };
    if !tier_ok {
        return Err(LedgerError::InvalidTransferRequest(format!(
            "{}: tier does not apply to this round",
            request.key()
        )));
    }
    if set_priced && request.amount.fract() != Decimal::ZERO {
        return Err(LedgerError::InvalidTransferRequest(format!(
            "{}: set transfers must be whole sets, got {}",
            request.key(),
            request.amount
        )));
    }
    Ok(())
}

/// Commit-time check run by the store inside its write transaction.
///
/// Items are checked in order, each against the live excess with the
/// batch's earlier items already applied. Linked dealers are re-checked
/// for credit against the batch's total stake into them. A mirror whose
/// upstream round is no longer open is dropped with a warning.
pub fn verify_batch(ctx: &CommitContext, draft: &BatchDraft) -> Result<CommitPlan, LedgerError> {
    let variant = &ctx.round.variant;
    let mut transfers = ctx.transfers.clone();
    let mut plan = CommitPlan::default();
    let mut linked_stake: BTreeMap<DealerId, Decimal> = BTreeMap::new();

    for StagedTransfer { request, mirror_round_id } in &draft.items {
        validate_request(request)?;
        validate_for_variant(request, variant)?;

        let key = request.key();
        let live = ExposureCalculator::excess_for(&key, &ctx.wagers, &ctx.caps, &transfers, variant);
        if request.amount > live {
            return Err(LedgerError::InvalidTransferRequest(format!(
                "{key}: amount {} exceeds live excess {live}",
                request.amount
            )));
        }

        let stake = variant.stake_for(request.bet_type, request.amount);
        let linked_dealer = request.target.linked_dealer().cloned();
        let mut record = TransferRecord {
            id: uuid::Uuid::new_v4().to_string(),
            round_id: ctx.round.id.clone(),
            bet_type: request.bet_type,
            numbers: request.numbers.clone(),
            tier: request.tier,
            amount: request.amount,
            stake,
            batch_id: draft.batch_id.clone(),
            target: request.target.clone(),
            linked: linked_dealer.is_some(),
            target_round_id: None,
            target_wager_id: None,
            created_at: draft.created_at,
        };

        if let Some(dealer_id) = linked_dealer {
            if dealer_id == ctx.round.dealer_id {
                return Err(LedgerError::InvalidTransferRequest(format!(
                    "{key}: cannot transfer to the round's own dealer"
                )));
            }
            *linked_stake.entry(dealer_id.clone()).or_default() += stake;

            if let Some(round_id) = mirror_round_id {
                match ctx.mirror_rounds.get(round_id) {
                    Some(upstream) if upstream.is_open_at(draft.created_at) => {
                        let wager = mirror(&key, stake, upstream, &ctx.round.dealer_id, &record.id, draft.created_at);
                        record.target_round_id = Some(upstream.id.clone());
                        record.target_wager_id = Some(wager.id.clone());
                        plan.mirrors.push(wager);
                    }
                    _ => plan.warnings.push(MirrorWarning {
                        transfer_id: record.id.clone(),
                        dealer_id,
                        reason: format!("upstream round {round_id} no longer open"),
                    }),
                }
            }
        }

        transfers.push(record.clone());
        plan.transfers.push(record);
    }

    for (dealer_id, stake) in &linked_stake {
        assess(ctx.credits.get(dealer_id), *stake).into_result(dealer_id)?;
    }

    Ok(plan)
}

/// Group ledger rows into per-batch summaries, oldest batch first.
pub fn summarize_batches(records: &[TransferRecord]) -> Vec<BatchSummary> {
    let mut order: Vec<BatchId> = Vec::new();
    let mut by_batch: BTreeMap<BatchId, BatchSummary> = BTreeMap::new();
    for r in records {
        let summary = by_batch.entry(r.batch_id.clone()).or_insert_with(|| {
            order.push(r.batch_id.clone());
            BatchSummary {
                batch_id: r.batch_id.clone(),
                round_id: r.round_id.clone(),
                count: 0,
                total_amount: Decimal::ZERO,
                total_stake: Decimal::ZERO,
                linked: 0,
                created_at: r.created_at,
            }
        });
        summary.count += 1;
        summary.total_amount += r.amount;
        summary.total_stake += r.stake;
        if r.linked {
            summary.linked += 1;
        }
        summary.created_at = summary.created_at.min(r.created_at);
    }
    let mut summaries: Vec<BatchSummary> = order
        .into_iter()
        .filter_map(|id| by_batch.remove(&id))
        .collect();
    summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    summaries
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct TransferLedger<S: ?Sized> {
    store: Arc<S>,
}

impl<S: LedgerStore + ?Sized> TransferLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn new_batch_id() -> BatchId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Record one unmirrored transfer, in `batch_id` or a fresh batch.
    pub async fn create(
        &self,
        round_id: &str,
        request: TransferRequest,
        batch_id: Option<BatchId>,
    ) -> Result<TransferRecord, LedgerError> {
        let draft = BatchDraft {
            round_id: round_id.to_string(),
            batch_id: batch_id.unwrap_or_else(Self::new_batch_id),
            created_at: Utc::now(),
            items: vec![StagedTransfer::unmirrored(request)],
        };
        let outcome = self.commit(draft).await?;
        outcome
            .records
            .into_iter()
            .next()
            .ok_or_else(|| LedgerError::Storage("commit returned no record".into()))
    }

    /// Record several unmirrored transfers under one new batch id.
    pub async fn create_batch(
        &self,
        round_id: &str,
        requests: Vec<TransferRequest>,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        let draft = BatchDraft {
            round_id: round_id.to_string(),
            batch_id: Self::new_batch_id(),
            created_at: Utc::now(),
            items: requests.into_iter().map(StagedTransfer::unmirrored).collect(),
        };
        Ok(self.commit(draft).await?.records)
    }

    /// Validate and write a staged batch as one unit. All items commit or
    /// none do.
    pub async fn commit(&self, draft: BatchDraft) -> Result<CommitOutcome, LedgerError> {
        if draft.items.is_empty() {
            return Err(LedgerError::InvalidTransferRequest("empty batch".into()));
        }
        for item in &draft.items {
            validate_request(&item.request)?;
        }

        debug!(
            round_id = %draft.round_id,
            batch_id = %draft.batch_id,
            items = draft.items.len(),
            "Committing transfer batch"
        );

        let plan = self.store.commit_batch(&draft, &verify_batch).await?;

        for w in &plan.warnings {
            warn!(
                transfer_id = %w.transfer_id,
                dealer_id = %w.dealer_id,
                reason = %w.reason,
                "Transfer committed without mirror"
            );
        }

        let outcome = CommitOutcome {
            batch_id: draft.batch_id,
            records: plan.transfers,
            warnings: plan.warnings,
        };
        info!(
            round_id = %draft.round_id,
            batch_id = %outcome.batch_id,
            count = outcome.records.len(),
            mirrored = outcome.mirrored(),
            total = %outcome.total_amount(),
            "Transfer batch committed"
        );
        Ok(outcome)
    }

    /// Ledger rows of a round, optionally restricted to one batch.
    pub async fn list_by_round(
        &self,
        round_id: &str,
        batch_filter: Option<&str>,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        self.store.transfers(round_id, batch_filter).await
    }

    pub async fn list_batches(&self, round_id: &str) -> Result<Vec<BatchSummary>, LedgerError> {
        let records = self.store.transfers(round_id, None).await?;
        Ok(summarize_batches(&records))
    }

    /// Delete every row of a batch. Undoing an unknown (or already undone)
    /// batch is a no-op with a zero count.
    pub async fn undo_batch(&self, batch_id: &str) -> Result<UndoSummary, LedgerError> {
        let deleted = self.store.delete_batch(batch_id).await?;
        let summary = UndoSummary {
            batch_id: batch_id.to_string(),
            count: deleted.records.len(),
            total_amount: deleted.records.iter().map(|r| r.amount).sum(),
            recomputed_dealers: deleted.recomputed_dealers,
        };
        if summary.count == 0 {
            debug!(batch_id, "Undo found nothing to delete");
        } else {
            info!(
                batch_id,
                count = summary.count,
                total = %summary.total_amount,
                recomputed = summary.recomputed_dealers.len(),
                "Transfer batch undone"
            );
        }
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
