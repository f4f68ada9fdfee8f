//! End-to-end transfer-out flows through the desk and ledger.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use tokio_test::assert_ok;

use layoff::engine::{LinkedFailurePolicy, TransferLedger};
use layoff::exposure::ExposureCalculator;
use layoff::storage::{BatchDraft, CreditStore, RoundDirectory, StagedTransfer, SubmissionStore};
use layoff::types::*;

use crate::fixtures::{memory_desk, open_round, submission, UPSTREAM};

#[tokio::test]
async fn test_suffix_example_transfer_mirror_and_undo() {
    let caps = CapSpec::default()
        .with_suffix_cap(BetType::FourTop, dec!(6))
        .with_suffix_digits(2);
    let (store, desk) = memory_desk(
        LotteryVariant::set_based(dec!(100)),
        caps,
        dec!(10_000),
        LinkedFailurePolicy::Block,
    )
    .await;

    desk.submit_wager("down-r1", submission(BetType::FourTop, "1234", dec!(500)))
        .await
        .unwrap();
    let late = desk
        .submit_wager("down-r1", submission(BetType::FourTop, "1634", dec!(300)))
        .await
        .unwrap();

    let before = desk.excess("down-r1").await.unwrap();
    assert_eq!(before.len(), 1);
    let item = &before[0];
    assert_eq!(item.numbers, "1634");
    assert_eq!(item.tier, CapTier::Suffix);
    assert_eq!(item.excess, dec!(2));
    assert_eq!(item.static_cap, dec!(1));
    assert_eq!(item.shares[0].wager_id, late.id);

    let request = TransferRequest::new(BetType::FourTop, "1634", dec!(2), TransferTarget::linked(UPSTREAM))
        .with_tier(CapTier::Suffix);
    let outcome = desk.transfer_out("down-r1", vec![request]).await.unwrap();
    let record = &outcome.records[0];
    assert_eq!(record.amount, dec!(2));
    assert_eq!(record.stake, dec!(200));
    assert!(record.is_mirrored());

    assert!(desk.excess("down-r1").await.unwrap().is_empty());
    let mirrored = store.active_wagers("up-r1").await.unwrap();
    assert_eq!(mirrored[0].amount, dec!(200));
    assert_eq!(mirrored[0].transfer_id.as_ref(), Some(&record.id));
    assert_eq!(
        desk.credit(UPSTREAM).await.unwrap().unwrap().pending_deduction,
        dec!(200)
    );

    desk.undo(&outcome.batch_id).await.unwrap();
    assert_eq!(desk.excess("down-r1").await.unwrap(), before);
}

#[tokio::test]
async fn test_conservation_against_brute_force() {
    let caps = CapSpec::default()
        .with_type_cap(BetType::TwoTop, dec!(500))
        .with_type_cap(BetType::ThreeTop, dec!(100))
        .with_number_cap(BetType::TwoTop, "00", dec!(50));
    let (store, desk) = memory_desk(LotteryVariant::default(), caps.clone(), dec!(0), LinkedFailurePolicy::Block).await;

    let bets = [
        (BetType::TwoTop, "59", dec!(400)),
        (BetType::TwoTop, "59", dec!(250)),
        (BetType::TwoTop, "00", dec!(80)),
        (BetType::TwoTop, "12", dec!(100)),
        (BetType::ThreeTop, "123", dec!(90)),
        (BetType::ThreeTop, "123", dec!(45)),
        (BetType::TwoBottom, "59", dec!(9_999)),
    ];
    for (bet_type, numbers, amount) in bets {
        desk.submit_wager("down-r1", submission(bet_type, numbers, amount)).await.unwrap();
    }

    let items = desk.excess("down-r1").await.unwrap();

    let mut exposure: BTreeMap<(BetType, String), Decimal> = BTreeMap::new();
    for (bet_type, numbers, amount) in bets {
        *exposure.entry((bet_type, numbers.to_string())).or_default() += amount;
    }
    let brute: Decimal = exposure
        .iter()
        .map(|((bet_type, numbers), total)| match caps.cap_for(*bet_type, numbers) {
            Some(cap) => (*total - cap).max(Decimal::ZERO),
            None => Decimal::ZERO,
        })
        .sum();

    assert_eq!(ExposureCalculator::total_excess(&items), brute);
    assert_eq!(brute, dec!(150) + dec!(30) + dec!(35));

    let mut reversed = store.active_wagers("down-r1").await.unwrap();
    reversed.reverse();
    let round = store.round("down-r1").await.unwrap().unwrap();
    let again = ExposureCalculator::compute(&reversed, &caps, &[], &round.variant);
    assert_eq!(again, items);
}

#[tokio::test]
async fn test_commit_reduces_excess_exactly() {
    let caps = CapSpec::default().with_type_cap(BetType::ThreeTop, dec!(100));
    let (_, desk) = memory_desk(LotteryVariant::default(), caps, dec!(0), LinkedFailurePolicy::Block).await;
    desk.submit_wager("down-r1", submission(BetType::ThreeTop, "777", dec!(400)))
        .await
        .unwrap();

    for (x, left) in [(dec!(75), dec!(225)), (dec!(0.5), dec!(224.5)), (dec!(224.5), dec!(0))] {
        let request = TransferRequest::new(BetType::ThreeTop, "777", x, TransferTarget::manual("Aunt Noi"));
        assert_ok!(desk.transfer_out("down-r1", vec![request]).await);
        let remaining = ExposureCalculator::total_excess(&desk.excess("down-r1").await.unwrap());
        assert_eq!(remaining, left);
    }
    assert_eq!(desk.batches("down-r1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_mirror_round_closed_at_commit_keeps_ledger_row() {
    let caps = CapSpec::default().with_type_cap(BetType::TwoTop, dec!(100));
    let (store, desk) = memory_desk(LotteryVariant::default(), caps, dec!(10_000), LinkedFailurePolicy::Block).await;
    desk.submit_wager("down-r1", submission(BetType::TwoTop, "59", dec!(300)))
        .await
        .unwrap();

    // Looked up while open, closed before the commit ran.
    let mut closed = open_round("up-r1", UPSTREAM, LotteryVariant::default());
    closed.status = RoundStatus::Closed;
    store.save_round(&closed).await.unwrap();

    let ledger = TransferLedger::new(store.clone());
    let draft = BatchDraft {
        round_id: "down-r1".into(),
        batch_id: "race-batch".into(),
        created_at: Utc::now(),
        items: vec![StagedTransfer {
            request: TransferRequest::new(BetType::TwoTop, "59", dec!(200), TransferTarget::linked(UPSTREAM)),
            mirror_round_id: Some("up-r1".into()),
        }],
    };
    let outcome = ledger.commit(draft).await.unwrap();

    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].dealer_id, UPSTREAM);
    let record = &outcome.records[0];
    assert!(record.linked);
    assert!(!record.is_mirrored());
    assert!(store.active_wagers("up-r1").await.unwrap().is_empty());
    // The upstream still owes the stake it was credit-checked for.
    let upstream = desk.credit(UPSTREAM).await.unwrap().unwrap();
    assert_eq!(upstream.pending_deduction, dec!(200));

    let listed = desk.transfers("down-r1", Some("race-batch")).await.unwrap();
    assert_eq!(listed.len(), 1);
    let undone = desk.undo("race-batch").await.unwrap();
    assert_eq!(undone.count, 1);
    assert_eq!(undone.recomputed_dealers, vec![UPSTREAM.to_string()]);
    assert_eq!(
        desk.credit(UPSTREAM).await.unwrap().unwrap().pending_deduction,
        Decimal::ZERO
    );
}

#[tokio::test]
async fn test_undo_twice_is_harmless() {
    let caps = CapSpec::default().with_type_cap(BetType::TwoTop, dec!(100));
    let (_, desk) = memory_desk(LotteryVariant::default(), caps, dec!(0), LinkedFailurePolicy::Block).await;
    desk.submit_wager("down-r1", submission(BetType::TwoTop, "59", dec!(300)))
        .await
        .unwrap();
    let request = TransferRequest::new(BetType::TwoTop, "59", dec!(200), TransferTarget::manual("x"));
    let outcome = desk.transfer_out("down-r1", vec![request]).await.unwrap();

    assert_eq!(desk.undo(&outcome.batch_id).await.unwrap().count, 1);
    let second = desk.undo(&outcome.batch_id).await.unwrap();
    assert_eq!(second.count, 0);
    assert_eq!(second.total_amount, Decimal::ZERO);
}

#[tokio::test]
async fn test_low_credit_warning_does_not_block() {
    let caps = CapSpec::default().with_type_cap(BetType::TwoTop, dec!(100));
    let (store, desk) = memory_desk(LotteryVariant::default(), caps, dec!(1_000), LinkedFailurePolicy::Block).await;
    let mut credit = store.dealer_credit(UPSTREAM).await.unwrap().unwrap();
    credit.warning_threshold = dec!(500);
    desk.save_credit(&credit).await.unwrap();
    desk.submit_wager("down-r1", submission(BetType::TwoTop, "59", dec!(900)))
        .await
        .unwrap();

    let request = TransferRequest::new(BetType::TwoTop, "59", dec!(800), TransferTarget::linked(UPSTREAM));
    let outcome = desk.transfer_out("down-r1", vec![request]).await.unwrap();
    assert!(outcome.records[0].is_mirrored());
    assert_eq!(desk.credit(UPSTREAM).await.unwrap().unwrap().available(), dec!(200));

    // The remaining 200 of available credit is now the boundary.
    desk.submit_wager("down-r1", submission(BetType::TwoTop, "59", dec!(300)))
        .await
        .unwrap();
    let over = TransferRequest::new(BetType::TwoTop, "59", dec!(201), TransferTarget::linked(UPSTREAM));
    let err = desk.transfer_out("down-r1", vec![over]).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientUpstreamCredit { .. }));
    let exact = TransferRequest::new(BetType::TwoTop, "59", dec!(200), TransferTarget::linked(UPSTREAM));
    assert_ok!(desk.transfer_out("down-r1", vec![exact]).await);
}
