//! The desk over the SQLite store, including reopening the database.

use rust_decimal_macros::dec;
use std::sync::Arc;

use layoff::engine::{LinkedFailurePolicy, TransferDesk};
use layoff::storage::{LedgerStore, SqliteStore, SubmissionStore};
use layoff::types::*;

use crate::fixtures::{seed, settings, submission, UPSTREAM};

fn temp_db_url() -> (String, std::path::PathBuf) {
    let mut path = std::env::temp_dir();
    path.push(format!("layoff_test_{}.db", uuid::Uuid::new_v4()));
    (format!("sqlite://{}", path.to_string_lossy()), path)
}

async fn sqlite_desk(url: &str) -> (Arc<dyn LedgerStore>, TransferDesk<dyn LedgerStore>) {
    let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::connect(url).await.unwrap());
    let desk = TransferDesk::new(store.clone(), settings(LinkedFailurePolicy::Block));
    (store, desk)
}

#[tokio::test]
async fn test_linked_flow_on_sqlite() {
    let (store, desk) = sqlite_desk("sqlite::memory:").await;
    let caps = CapSpec::default().with_type_cap(BetType::ThreeTop, dec!(1_000));
    seed(store.as_ref(), LotteryVariant::default(), &caps, dec!(5_000)).await;

    desk.submit_wager("down-r1", submission(BetType::ThreeTop, "123", dec!(1_600)))
        .await
        .unwrap();
    let request = TransferRequest::new(BetType::ThreeTop, "123", dec!(600), TransferTarget::linked(UPSTREAM));
    let outcome = desk.transfer_out("down-r1", vec![request]).await.unwrap();

    assert!(outcome.records[0].is_mirrored());
    assert!(desk.excess("down-r1").await.unwrap().is_empty());
    let upstream = desk.credit(UPSTREAM).await.unwrap().unwrap();
    assert_eq!(upstream.pending_deduction, dec!(600));
    assert_eq!(upstream.available(), dec!(4_400));

    let undo = desk.undo(&outcome.batch_id).await.unwrap();
    assert_eq!(undo.count, 1);
    assert_eq!(undo.total_amount, dec!(600));
    assert_eq!(undo.recomputed_dealers, vec![UPSTREAM.to_string()]);
    assert_eq!(desk.excess("down-r1").await.unwrap()[0].excess, dec!(600));
}

#[tokio::test]
async fn test_rejected_batch_leaves_no_rows() {
    let (store, desk) = sqlite_desk("sqlite::memory:").await;
    let caps = CapSpec::default().with_type_cap(BetType::TwoTop, dec!(100));
    seed(store.as_ref(), LotteryVariant::default(), &caps, dec!(5_000)).await;
    desk.submit_wager("down-r1", submission(BetType::TwoTop, "59", dec!(300)))
        .await
        .unwrap();

    let ok = TransferRequest::new(BetType::TwoTop, "59", dec!(100), TransferTarget::linked(UPSTREAM));
    let too_much = TransferRequest::new(BetType::TwoTop, "59", dec!(150), TransferTarget::manual("x"));
    let err = desk.transfer_out("down-r1", vec![ok, too_much]).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTransferRequest(_)));

    assert!(desk.transfers("down-r1", None).await.unwrap().is_empty());
    assert!(store.active_wagers("up-r1").await.unwrap().is_empty());
    assert_eq!(
        desk.credit(UPSTREAM).await.unwrap().unwrap().pending_deduction,
        dec!(0)
    );
}

#[tokio::test]
async fn test_ledger_survives_reopen() {
    let (url, path) = temp_db_url();
    let batch_id = {
        let (store, desk) = sqlite_desk(&url).await;
        let caps = CapSpec::default()
            .with_type_cap(BetType::FourTop, dec!(2))
            .with_suffix_cap(BetType::FourTop, dec!(10));
        seed(store.as_ref(), LotteryVariant::set_based(dec!(120)), &caps, dec!(5_000)).await;
        desk.submit_wager("down-r1", submission(BetType::FourTop, "9999", dec!(600)))
            .await
            .unwrap();
        let request = TransferRequest::new(BetType::FourTop, "9999", dec!(3), TransferTarget::manual("Uncle Lek"))
            .with_tier(CapTier::Exact);
        desk.transfer_out("down-r1", vec![request]).await.unwrap().batch_id
    };

    let (_, desk) = sqlite_desk(&url).await;
    let records = desk.transfers("down-r1", None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].batch_id, batch_id);
    assert_eq!(records[0].stake, dec!(360));
    assert_eq!(records[0].tier, CapTier::Exact);
    assert!(desk.excess("down-r1").await.unwrap().is_empty());

    let batches = desk.batches("down-r1").await.unwrap();
    assert_eq!(batches[0].total_amount, dec!(3));
    assert_eq!(batches[0].total_stake, dec!(360));

    let _ = std::fs::remove_file(path);
}
