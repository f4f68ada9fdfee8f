//! Concurrent commits against the same key.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use layoff::engine::TransferLedger;
use layoff::storage::{LedgerStore, MemoryStore, SqliteStore, SubmissionStore};
use layoff::types::*;

use crate::fixtures::seed;

fn request(amount: Decimal) -> TransferRequest {
    TransferRequest::new(BetType::TwoTop, "59", amount, TransferTarget::manual("Uncle Lek"))
}

/// Cap 500 with 800 staked: 300 of live excess.
async fn seeded<S: LedgerStore + ?Sized>(store: &S) {
    let caps = CapSpec::default().with_type_cap(BetType::TwoTop, dec!(500));
    seed(store, LotteryVariant::default(), &caps, dec!(0)).await;
    let wager = WagerRecord::new("down-r1", "bettor", BetType::TwoTop, "59", dec!(800), Decimal::ZERO);
    store.append_wager(&wager).await.unwrap();
}

async fn committed<S: LedgerStore + ?Sized>(ledger: &TransferLedger<S>) -> Decimal {
    ledger
        .list_by_round("down-r1", None)
        .await
        .unwrap()
        .iter()
        .map(|r| r.amount)
        .sum()
}

#[tokio::test]
async fn test_two_racing_creates_never_exceed_excess() {
    let store = Arc::new(MemoryStore::new());
    seeded(store.as_ref()).await;
    let ledger = TransferLedger::new(store.clone());

    let (a, b) = tokio::join!(
        ledger.create("down-r1", request(dec!(200)), None),
        ledger.create("down-r1", request(dec!(200)), None),
    );

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(loser, LedgerError::InvalidTransferRequest(_)));
    assert_eq!(committed(&ledger).await, dec!(200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_spawned_creates_on_memory_store() {
    let store = Arc::new(MemoryStore::new());
    seeded(store.as_ref()).await;
    let ledger = Arc::new(TransferLedger::new(store.clone()));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.create("down-r1", request(dec!(40)), None).await })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    // 300 of excess fits seven transfers of 40.
    assert_eq!(ok, 7);
    assert_eq!(committed(ledger.as_ref()).await, dec!(280));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_spawned_creates_on_sqlite_store() {
    let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    seeded(store.as_ref()).await;
    let ledger = Arc::new(TransferLedger::new(store.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.create("down-r1", request(dec!(100)), None).await })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    assert_eq!(ok, 3);
    assert_eq!(committed(ledger.as_ref()).await, dec!(300));
}
