//! Persistence layer.
//!
//! The engine talks to its collaborators only through the traits below:
//! wagers (`SubmissionStore`), caps (`LimitRegistry`), rounds
//! (`RoundDirectory`), dealer credit (`CreditStore`) and the transfer
//! ledger itself (`TransferStore`). Two backends implement all of them:
//! an in-process store and SQLite via `sqlx`.
//!
//! Every mutation that changes a dealer's obligations recomputes that
//! dealer's pending deduction inside the same transaction (or lock) as the
//! mutation itself.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

use crate::types::{
    BatchId, CapSpec, DealerCredit, DealerId, LedgerError, Round, RoundId, TransferId,
    TransferRecord, TransferRequest, WagerRecord,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Wager records per round.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Active wagers of a round.
    async fn active_wagers(&self, round_id: &str) -> Result<Vec<WagerRecord>, LedgerError>;

    async fn wager(&self, wager_id: &str) -> Result<Option<WagerRecord>, LedgerError>;

    /// Append a wager and recompute the round owner's pending deduction.
    async fn append_wager(&self, wager: &WagerRecord) -> Result<(), LedgerError>;

    /// Soft-delete a wager and recompute the round owner's pending
    /// deduction. Returns false if the wager was unknown or already inactive.
    async fn deactivate_wager(&self, wager_id: &str) -> Result<bool, LedgerError>;
}

/// Per-round caps. Always read fresh; never cached across calls.
#[async_trait]
pub trait LimitRegistry: Send + Sync {
    /// Caps of a round (empty spec, i.e. unbounded, if none configured).
    async fn cap_spec(&self, round_id: &str) -> Result<CapSpec, LedgerError>;

    async fn save_cap_spec(&self, round_id: &str, caps: &CapSpec) -> Result<(), LedgerError>;
}

/// Round lookup across dealers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundDirectory: Send + Sync {
    async fn round(&self, round_id: &str) -> Result<Option<Round>, LedgerError>;

    /// All rounds owned by a dealer.
    async fn dealer_rounds(&self, dealer_id: &str) -> Result<Vec<Round>, LedgerError>;

    /// Insert or replace a round and recompute its owner's pending deduction.
    async fn save_round(&self, round: &Round) -> Result<(), LedgerError>;
}

/// Dealer credit state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn dealer_credit(&self, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError>;

    /// Insert or replace balance, block flag and warning threshold. The
    /// stored pending deduction is recomputed, never taken from `credit`.
    async fn save_dealer_credit(&self, credit: &DealerCredit) -> Result<(), LedgerError>;

    /// Full rescan of the dealer's obligations, overwriting the cached
    /// value. Returns the refreshed credit row, if the dealer has one.
    async fn recompute_pending_deduction(
        &self,
        dealer_id: &str,
    ) -> Result<Option<DealerCredit>, LedgerError>;
}

/// The transfer-out ledger.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Ledger rows of a round, oldest first, optionally for one batch.
    async fn transfers(
        &self,
        round_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Vec<TransferRecord>, LedgerError>;

    /// Atomically validate and write a batch.
    ///
    /// Reads a fresh `CommitContext`, hands it to `check`, and writes the
    /// returned plan (ledger rows plus mirror wagers) in one unit, then
    /// recomputes the pending deduction of every dealer that received a
    /// mirror wager. Concurrent commits on the same store are serialised.
    async fn commit_batch(
        &self,
        draft: &BatchDraft,
        check: &CommitCheck<'_>,
    ) -> Result<CommitPlan, LedgerError>;

    /// Delete every row of a batch in one unit and recompute the pending
    /// deduction of dealers whose mirror wagers came from it.
    async fn delete_batch(&self, batch_id: &str) -> Result<DeletedBatch, LedgerError>;
}

/// Every collaborator the engine needs, behind one object.
pub trait LedgerStore:
    SubmissionStore + LimitRegistry + RoundDirectory + CreditStore + TransferStore
{
}

impl<T> LedgerStore for T where
    T: SubmissionStore + LimitRegistry + RoundDirectory + CreditStore + TransferStore
{
}

// ---------------------------------------------------------------------------
// Commit protocol
// ---------------------------------------------------------------------------

/// One requested transfer, with the upstream round it should mirror into.
#[derive(Debug, Clone)]
pub struct StagedTransfer {
    pub request: TransferRequest,
    pub mirror_round_id: Option<RoundId>,
}

impl StagedTransfer {
    pub fn unmirrored(request: TransferRequest) -> Self {
        Self {
            request,
            mirror_round_id: None,
        }
    }
}

/// A batch as requested, before the commit-time check.
#[derive(Debug, Clone)]
pub struct BatchDraft {
    pub round_id: RoundId,
    pub batch_id: BatchId,
    pub created_at: DateTime<Utc>,
    pub items: Vec<StagedTransfer>,
}

impl BatchDraft {
    /// Linked dealers whose credit the check needs.
    pub fn linked_dealers(&self) -> BTreeSet<DealerId> {
        self.items
            .iter()
            .filter_map(|i| i.request.target.linked_dealer().cloned())
            .collect()
    }

    /// Upstream rounds the check needs.
    pub fn mirror_round_ids(&self) -> BTreeSet<RoundId> {
        self.items
            .iter()
            .filter_map(|i| i.mirror_round_id.clone())
            .collect()
    }
}

/// Fresh state read inside the commit transaction.
#[derive(Debug, Clone)]
pub struct CommitContext {
    pub round: Round,
    pub wagers: Vec<WagerRecord>,
    pub caps: CapSpec,
    pub transfers: Vec<TransferRecord>,
    pub credits: HashMap<DealerId, DealerCredit>,
    pub mirror_rounds: HashMap<RoundId, Round>,
}

/// A mirror that could not be attached; the ledger row stands without it.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MirrorWarning {
    pub transfer_id: TransferId,
    pub dealer_id: DealerId,
    pub reason: String,
}

/// What a commit writes.
#[derive(Debug, Clone, Default)]
pub struct CommitPlan {
    pub transfers: Vec<TransferRecord>,
    pub mirrors: Vec<WagerRecord>,
    pub warnings: Vec<MirrorWarning>,
}

impl CommitPlan {
    /// Linked dealers whose obligations the commit changes.
    pub fn linked_dealers(&self) -> BTreeSet<DealerId> {
        self.transfers
            .iter()
            .filter_map(|t| t.target.linked_dealer().cloned())
            .collect()
    }
}

/// Commit-time validation: fresh context + draft → plan to write.
pub type CommitCheck<'a> =
    dyn Fn(&CommitContext, &BatchDraft) -> Result<CommitPlan, LedgerError> + Send + Sync + 'a;

/// Rows removed by a batch undo.
#[derive(Debug, Clone, Default)]
pub struct DeletedBatch {
    pub records: Vec<TransferRecord>,
    pub recomputed_dealers: Vec<DealerId>,
}
