//! Shared fixtures: rounds, seeded stores and desks.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use layoff::engine::{DeskSettings, LinkedFailurePolicy, TransferDesk, WagerSubmission};
use layoff::storage::{CreditStore, LedgerStore, LimitRegistry, MemoryStore, RoundDirectory};
use layoff::types::*;

pub const DOWNSTREAM: &str = "dealer-down";
pub const UPSTREAM: &str = "dealer-up";

/// A round of `dealer` open for the next hour.
pub fn open_round(id: &str, dealer: &str, variant: LotteryVariant) -> Round {
    let now = Utc::now();
    Round {
        id: id.to_string(),
        dealer_id: dealer.to_string(),
        lottery_type: "hanoi".to_string(),
        round_date: now.date_naive(),
        open_at: now - Duration::hours(1),
        close_at: now + Duration::hours(1),
        status: RoundStatus::Open,
        variant,
        created_at: now,
    }
}

pub fn submission(bet_type: BetType, numbers: &str, amount: Decimal) -> WagerSubmission {
    WagerSubmission {
        bettor_id: format!("bettor-{numbers}"),
        bet_type,
        numbers: numbers.to_string(),
        amount,
        commission: Decimal::ZERO,
    }
}

pub fn settings(policy: LinkedFailurePolicy) -> DeskSettings {
    DeskSettings {
        linked_failure_policy: policy,
        ..DeskSettings::default()
    }
}

/// Downstream round `down-r1` with `caps`, upstream round `up-r1`, and
/// `upstream_balance` of credit for the upstream dealer.
pub async fn seed<S: LedgerStore + ?Sized>(
    store: &S,
    variant: LotteryVariant,
    caps: &CapSpec,
    upstream_balance: Decimal,
) {
    store
        .save_round(&open_round("down-r1", DOWNSTREAM, variant))
        .await
        .unwrap();
    store
        .save_round(&open_round("up-r1", UPSTREAM, LotteryVariant::default()))
        .await
        .unwrap();
    store.save_cap_spec("down-r1", caps).await.unwrap();
    store
        .save_dealer_credit(&DealerCredit::new(UPSTREAM, upstream_balance))
        .await
        .unwrap();
}

pub async fn memory_desk(
    variant: LotteryVariant,
    caps: CapSpec,
    upstream_balance: Decimal,
    policy: LinkedFailurePolicy,
) -> (Arc<MemoryStore>, TransferDesk<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    seed(store.as_ref(), variant, &caps, upstream_balance).await;
    let desk = TransferDesk::new(store.clone(), settings(policy));
    (store, desk)
}
