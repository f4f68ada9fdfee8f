//! Randomised suffix groups for set-priced 4-digit bets.
//!
//! Every group has two to four numbers sharing a suffix, so the shared cap
//! always applies. Transfers are drawn from the live excess and committed
//! through the desk.

use chrono::{Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use layoff::engine::{LinkedFailurePolicy, TransferDesk};
use layoff::storage::{MemoryStore, SubmissionStore};
use layoff::types::*;

use crate::fixtures::memory_desk;

const UNIT_PRICE: Decimal = dec!(100);
const SUFFIXES: [&str; 2] = ["234", "555"];

/// Wagers per suffix, with shuffled submission times. Returns sets per suffix.
async fn place_wagers(rng: &mut StdRng, store: &MemoryStore) -> BTreeMap<String, Decimal> {
    let base = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let mut sets_by_suffix = BTreeMap::new();

    for suffix in SUFFIXES {
        let width: u32 = rng.random_range(2..=4);
        let start: u32 = rng.random_range(0..10);
        for i in 0..width {
            let numbers = format!("{}{suffix}", (start + i) % 10);
            for _ in 0..rng.random_range(1..=3) {
                let sets = Decimal::from(rng.random_range(1..=5u32));
                let mut wager = WagerRecord::new(
                    "down-r1",
                    "bettor",
                    BetType::FourTop,
                    &numbers,
                    sets * UNIT_PRICE,
                    Decimal::ZERO,
                );
                wager.created_at = base + Duration::minutes(rng.random_range(0..600));
                store.append_wager(&wager).await.unwrap();
                *sets_by_suffix.entry(suffix.to_string()).or_default() += sets;
            }
        }
    }
    sets_by_suffix
}

async fn excess_by_number(desk: &TransferDesk<MemoryStore>) -> BTreeMap<String, Decimal> {
    let items = desk.excess("down-r1").await.unwrap();
    assert!(items.iter().all(|i| i.tier == CapTier::Suffix));
    items.into_iter().map(|i| (i.numbers, i.excess)).collect()
}

fn assert_groups_conserve(
    excess: &BTreeMap<String, Decimal>,
    sets_by_suffix: &BTreeMap<String, Decimal>,
    moved: &BTreeMap<String, Decimal>,
    suffix_cap: Decimal,
    seed: u64,
) {
    for (suffix, sets) in sets_by_suffix {
        let live: Decimal = excess
            .iter()
            .filter(|(numbers, _)| numbers.ends_with(suffix.as_str()))
            .map(|(_, e)| *e)
            .sum();
        let expected = (*sets - suffix_cap).max(Decimal::ZERO) - moved.get(suffix).copied().unwrap_or_default();
        assert_eq!(live, expected, "seed {seed}, suffix {suffix}");
    }
}

#[tokio::test]
async fn test_random_suffix_groups_conserve_and_credit_the_transferred_number() {
    for seed in 0..40u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let suffix_cap = Decimal::from(rng.random_range(1..=10u32));
        let caps = CapSpec::default().with_suffix_cap(BetType::FourTop, suffix_cap);
        let (store, desk) = memory_desk(
            LotteryVariant::set_based(UNIT_PRICE),
            caps,
            Decimal::ZERO,
            LinkedFailurePolicy::Block,
        )
        .await;
        let sets_by_suffix = place_wagers(&mut rng, &store).await;
        let mut moved: BTreeMap<String, Decimal> = BTreeMap::new();

        for _ in 0..6 {
            let before = excess_by_number(&desk).await;
            assert_groups_conserve(&before, &sets_by_suffix, &moved, suffix_cap, seed);
            if before.is_empty() {
                break;
            }

            let pick = rng.random_range(0..before.len());
            let (numbers, excess) = before
                .iter()
                .nth(pick)
                .map(|(n, e)| (n.clone(), *e))
                .unwrap();
            let whole = excess.to_u32().unwrap();
            let x = Decimal::from(rng.random_range(1..=whole));

            let request = TransferRequest::new(BetType::FourTop, &numbers, x, TransferTarget::manual("Uncle Lek"))
                .with_tier(CapTier::Suffix);
            desk.transfer_out("down-r1", vec![request]).await.unwrap();
            *moved.entry(numbers[1..].to_string()).or_default() += x;

            let after = excess_by_number(&desk).await;
            assert_eq!(
                after.get(&numbers).copied().unwrap_or_default(),
                excess - x,
                "seed {seed}: transfer of {x} on {numbers}"
            );
            for (other, e) in before.iter().filter(|(n, _)| **n != numbers) {
                assert_eq!(after.get(other), Some(e), "seed {seed}: {other} moved");
            }
            assert!(after.keys().all(|n| before.contains_key(n)));
        }

        let final_excess = excess_by_number(&desk).await;
        assert_groups_conserve(&final_excess, &sets_by_suffix, &moved, suffix_cap, seed);
    }
}
