//! In-process store.
//!
//! All state lives behind one mutex. Every trait method takes the lock once
//! and does its work synchronously, so a batch commit (context read, check,
//! write, pending recompute) is serialised against every other call.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::debug;

use super::{
    BatchDraft, CommitCheck, CommitContext, CommitPlan, CreditStore, DeletedBatch, LimitRegistry,
    RoundDirectory, SubmissionStore, TransferStore,
};
use crate::engine::credit::pending_deduction;
use crate::types::{
    CapSpec, DealerCredit, DealerId, LedgerError, Round, RoundId, RoundStatus, TransferRecord,
    WagerRecord,
};

#[derive(Debug, Default)]
struct State {
    rounds: HashMap<RoundId, Round>,
    /// Insertion order.
    wagers: Vec<WagerRecord>,
    caps: HashMap<RoundId, CapSpec>,
    /// Insertion order, which is commit order.
    transfers: Vec<TransferRecord>,
    credits: HashMap<DealerId, DealerCredit>,
}

impl State {
    fn owner_of(&self, round_id: &str) -> Option<DealerId> {
        self.rounds.get(round_id).map(|r| r.dealer_id.clone())
    }

    /// Full rescan of a dealer's obligations into its credit row.
    fn recompute(&mut self, dealer_id: &str) -> Option<DealerCredit> {
        let rounds: Vec<Round> = self
            .rounds
            .values()
            .filter(|r| r.dealer_id == dealer_id)
            .cloned()
            .collect();
        let transfers_in: Vec<TransferRecord> = self
            .transfers
            .iter()
            .filter(|t| {
                self.rounds
                    .get(&t.round_id)
                    .is_some_and(|r| r.status != RoundStatus::Settled)
            })
            .cloned()
            .collect();
        let pending = pending_deduction(dealer_id, &rounds, &self.wagers, &transfers_in);
        let credit = self.credits.get_mut(dealer_id)?;
        credit.pending_deduction = pending;
        Some(credit.clone())
    }

    fn active_wagers(&self, round_id: &str) -> Vec<WagerRecord> {
        self.wagers
            .iter()
            .filter(|w| w.active && w.round_id == round_id)
            .cloned()
            .collect()
    }

    fn transfers(&self, round_id: &str, batch_id: Option<&str>) -> Vec<TransferRecord> {
        self.transfers
            .iter()
            .filter(|t| t.round_id == round_id)
            .filter(|t| batch_id.map_or(true, |b| t.batch_id == b))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T, LedgerError>) -> Result<T, LedgerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| LedgerError::Storage("memory store lock poisoned".into()))?;
        f(&mut state)
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn active_wagers(&self, round_id: &str) -> Result<Vec<WagerRecord>, LedgerError> {
        self.with_state(|s| Ok(s.active_wagers(round_id)))
    }

    async fn wager(&self, wager_id: &str) -> Result<Option<WagerRecord>, LedgerError> {
        self.with_state(|s| Ok(s.wagers.iter().find(|w| w.id == wager_id).cloned()))
    }

    async fn append_wager(&self, wager: &WagerRecord) -> Result<(), LedgerError> {
        self.with_state(|s| {
            if s.wagers.iter().any(|w| w.id == wager.id) {
                return Err(LedgerError::Storage(format!("duplicate wager id {}", wager.id)));
            }
            s.wagers.push(wager.clone());
            if let Some(owner) = s.owner_of(&wager.round_id) {
                s.recompute(&owner);
            }
            Ok(())
        })
    }

    async fn deactivate_wager(&self, wager_id: &str) -> Result<bool, LedgerError> {
        self.with_state(|s| {
            let Some(wager) = s.wagers.iter_mut().find(|w| w.id == wager_id && w.active) else {
                return Ok(false);
            };
            wager.active = false;
            let round_id = wager.round_id.clone();
            if let Some(owner) = s.owner_of(&round_id) {
                s.recompute(&owner);
            }
            Ok(true)
        })
    }
}

#[async_trait]
impl LimitRegistry for MemoryStore {
    async fn cap_spec(&self, round_id: &str) -> Result<CapSpec, LedgerError> {
        self.with_state(|s| Ok(s.caps.get(round_id).cloned().unwrap_or_default()))
    }

    async fn save_cap_spec(&self, round_id: &str, caps: &CapSpec) -> Result<(), LedgerError> {
        self.with_state(|s| {
            s.caps.insert(round_id.to_string(), caps.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl RoundDirectory for MemoryStore {
    async fn round(&self, round_id: &str) -> Result<Option<Round>, LedgerError> {
        self.with_state(|s| Ok(s.rounds.get(round_id).cloned()))
    }

    async fn dealer_rounds(&self, dealer_id: &str) -> Result<Vec<Round>, LedgerError> {
        self.with_state(|s| {
            let mut rounds: Vec<Round> = s
                .rounds
                .values()
                .filter(|r| r.dealer_id == dealer_id)
                .cloned()
                .collect();
            rounds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(rounds)
        })
    }

    async fn save_round(&self, round: &Round) -> Result<(), LedgerError> {
        self.with_state(|s| {
            let previous_owner = s.rounds.insert(round.id.clone(), round.clone()).map(|r| r.dealer_id);
            s.recompute(&round.dealer_id);
            if let Some(prev) = previous_owner.filter(|p| *p != round.dealer_id) {
                s.recompute(&prev);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl CreditStore for MemoryStore {
    async fn dealer_credit(&self, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError> {
        self.with_state(|s| Ok(s.credits.get(dealer_id).cloned()))
    }

    async fn save_dealer_credit(&self, credit: &DealerCredit) -> Result<(), LedgerError> {
        self.with_state(|s| {
            s.credits.insert(credit.dealer_id.clone(), credit.clone());
            s.recompute(&credit.dealer_id);
            Ok(())
        })
    }

    async fn recompute_pending_deduction(
        &self,
        dealer_id: &str,
    ) -> Result<Option<DealerCredit>, LedgerError> {
        self.with_state(|s| Ok(s.recompute(dealer_id)))
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn transfers(
        &self,
        round_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        self.with_state(|s| Ok(s.transfers(round_id, batch_id)))
    }

    async fn commit_batch(
        &self,
        draft: &BatchDraft,
        check: &CommitCheck<'_>,
    ) -> Result<CommitPlan, LedgerError> {
        self.with_state(|s| {
            let round = s
                .rounds
                .get(&draft.round_id)
                .cloned()
                .ok_or_else(|| LedgerError::RoundNotFound(draft.round_id.clone()))?;
            let ctx = CommitContext {
                wagers: s.active_wagers(&round.id),
                caps: s.caps.get(&round.id).cloned().unwrap_or_default(),
                transfers: s.transfers(&round.id, None),
                credits: draft
                    .linked_dealers()
                    .into_iter()
                    .filter_map(|d| s.credits.get(&d).cloned().map(|c| (d, c)))
                    .collect(),
                mirror_rounds: draft
                    .mirror_round_ids()
                    .into_iter()
                    .filter_map(|id| s.rounds.get(&id).cloned().map(|r| (id, r)))
                    .collect(),
                round,
            };

            let plan = check(&ctx, draft)?;

            s.transfers.extend(plan.transfers.iter().cloned());
            s.wagers.extend(plan.mirrors.iter().cloned());
            for dealer_id in plan.linked_dealers() {
                s.recompute(&dealer_id);
            }
            debug!(
                batch_id = %draft.batch_id,
                transfers = plan.transfers.len(),
                mirrors = plan.mirrors.len(),
                "Memory commit applied"
            );
            Ok(plan)
        })
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<DeletedBatch, LedgerError> {
        self.with_state(|s| {
            let (records, kept): (Vec<TransferRecord>, Vec<TransferRecord>) = std::mem::take(&mut s.transfers)
                .into_iter()
                .partition(|t| t.batch_id == batch_id);
            s.transfers = kept;

            let dealers: BTreeSet<DealerId> = records
                .iter()
                .filter_map(|t| t.target.linked_dealer().cloned())
                .collect();
            for dealer_id in &dealers {
                s.recompute(dealer_id);
            }
            Ok(DeletedBatch {
                records,
                recomputed_dealers: dealers.into_iter().collect(),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
