//! Upstream lookups that do not answer in time.
//!
//! `SlowStore` wraps the in-memory store and delays the upstream reads the
//! desk makes before committing (credit and round lookups).

use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use layoff::engine::{DeskSettings, LinkedFailurePolicy, TransferDesk};
use layoff::storage::{
    BatchDraft, CommitCheck, CommitPlan, CreditStore, DeletedBatch, LimitRegistry, MemoryStore,
    RoundDirectory, SubmissionStore, TransferStore,
};
use layoff::types::*;

use crate::fixtures::{seed, submission, UPSTREAM};

struct SlowStore {
    inner: MemoryStore,
    credit_delay: Duration,
    rounds_delay: Duration,
}

#[async_trait]
impl SubmissionStore for SlowStore {
    async fn active_wagers(&self, round_id: &str) -> Result<Vec<WagerRecord>, LedgerError> {
        self.inner.active_wagers(round_id).await
    }

    async fn wager(&self, wager_id: &str) -> Result<Option<WagerRecord>, LedgerError> {
        self.inner.wager(wager_id).await
    }

    async fn append_wager(&self, wager: &WagerRecord) -> Result<(), LedgerError> {
        self.inner.append_wager(wager).await
    }

    async fn deactivate_wager(&self, wager_id: &str) -> Result<bool, LedgerError> {
        self.inner.deactivate_wager(wager_id).await
    }
}

#[async_trait]
impl LimitRegistry for SlowStore {
    async fn cap_spec(&self, round_id: &str) -> Result<CapSpec, LedgerError> {
        self.inner.cap_spec(round_id).await
    }

    async fn save_cap_spec(&self, round_id: &str, caps: &CapSpec) -> Result<(), LedgerError> {
        self.inner.save_cap_spec(round_id, caps).await
    }
}

#[async_trait]
impl RoundDirectory for SlowStore {
    async fn round(&self, round_id: &str) -> Result<Option<Round>, LedgerError> {
        self.inner.round(round_id).await
    }

    async fn dealer_rounds(&self, dealer_id: &str) -> Result<Vec<Round>, LedgerError> {
        tokio::time::sleep(self.rounds_delay).await;
        self.inner.dealer_rounds(dealer_id).await
    }

    async fn save_round(&self, round: &Round) -> Result<(), LedgerError> {
        self.inner.save_round(round).await
    }
}

#[async_trait]
impl CreditStore for SlowStore {
    async fn dealer_credit(&self, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError> {
        tokio::time::sleep(self.credit_delay).await;
        self.inner.dealer_credit(dealer_id).await
    }

    async fn save_dealer_credit(&self, credit: &DealerCredit) -> Result<(), LedgerError> {
        self.inner.save_dealer_credit(credit).await
    }

    async fn recompute_pending_deduction(
        &self,
        dealer_id: &str,
    ) -> Result<Option<DealerCredit>, LedgerError> {
        self.inner.recompute_pending_deduction(dealer_id).await
    }
}

#[async_trait]
impl TransferStore for SlowStore {
    async fn transfers(
        &self,
        round_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        self.inner.transfers(round_id, batch_id).await
    }

    async fn commit_batch(
        &self,
        draft: &BatchDraft,
        check: &CommitCheck<'_>,
    ) -> Result<CommitPlan, LedgerError> {
        self.inner.commit_batch(draft, check).await
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<DeletedBatch, LedgerError> {
        self.inner.delete_batch(batch_id).await
    }
}

async fn slow_desk(
    credit_delay: Duration,
    rounds_delay: Duration,
    policy: LinkedFailurePolicy,
) -> TransferDesk<SlowStore> {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        credit_delay,
        rounds_delay,
    });
    let caps = CapSpec::default().with_type_cap(BetType::TwoTop, dec!(100));
    seed(&store.inner, LotteryVariant::default(), &caps, dec!(10_000)).await;

    let desk = TransferDesk::new(
        store,
        DeskSettings {
            upstream_timeout: Duration::from_millis(50),
            linked_failure_policy: policy,
        },
    );
    desk.submit_wager("down-r1", submission(BetType::TwoTop, "59", dec!(300)))
        .await
        .unwrap();
    desk
}

fn linked() -> TransferRequest {
    TransferRequest::new(BetType::TwoTop, "59", dec!(200), TransferTarget::linked(UPSTREAM))
}

#[tokio::test]
async fn test_slow_credit_check_is_a_timeout_not_an_approval() {
    let desk = slow_desk(Duration::from_secs(5), Duration::ZERO, LinkedFailurePolicy::Block).await;
    let err = desk.transfer_out("down-r1", vec![linked()]).await.unwrap_err();
    assert!(matches!(err, LedgerError::UpstreamLookupTimeout(_)));
    assert!(desk.transfers("down-r1", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_round_lookup_is_a_timeout() {
    let desk = slow_desk(Duration::ZERO, Duration::from_secs(5), LinkedFailurePolicy::Block).await;
    let err = desk.transfer_out("down-r1", vec![linked()]).await.unwrap_err();
    assert!(matches!(err, LedgerError::UpstreamLookupTimeout(_)));
}

#[tokio::test]
async fn test_timeout_under_commit_unlinked_records_manual_entry() {
    let desk = slow_desk(Duration::from_secs(5), Duration::ZERO, LinkedFailurePolicy::CommitUnlinked).await;
    let outcome = desk.transfer_out("down-r1", vec![linked()]).await.unwrap();
    let record = &outcome.records[0];
    assert!(!record.linked);
    assert!(record.target_wager_id.is_none());
    assert_eq!(record.target, TransferTarget::manual(UPSTREAM));
}

#[tokio::test]
async fn test_manual_target_never_waits_on_upstream() {
    let desk = slow_desk(Duration::from_secs(5), Duration::from_secs(5), LinkedFailurePolicy::Block).await;
    let manual = TransferRequest::new(BetType::TwoTop, "59", dec!(200), TransferTarget::manual("Aunt Noi"));
    let outcome = tokio::time::timeout(Duration::from_secs(1), desk.transfer_out("down-r1", vec![manual]))
        .await
        .expect("manual transfer should not touch upstream lookups")
        .unwrap();
    assert_eq!(outcome.records.len(), 1);
}
