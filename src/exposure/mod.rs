//! Exposure calculator — live wagers vs. caps → excess items.
//!
//! Pure and deterministic: the same wagers, caps, transfers and variant
//! always produce the same items in the same order, whatever order the
//! wagers arrive in. Every commit path re-runs this immediately before
//! writing; a previously displayed result is never trusted.

mod suffix;

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::types::{
    BetType, CapSpec, CapTier, ExcessItem, ExcessKey, ExcessShare, LotteryVariant,
    TransferRecord, WagerRecord, WagerId,
};

// ---------------------------------------------------------------------------
// Contributions
// ---------------------------------------------------------------------------

/// One active wager's contribution to a key, in exposure units.
#[derive(Debug, Clone)]
pub(crate) struct Contribution {
    pub wager_id: WagerId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub units: Decimal,
}

fn total(contribs: &[Contribution]) -> Decimal {
    contribs.iter().map(|c| c.units).sum()
}

/// Split `excess` units off the newest end of an oldest-first list.
///
/// Returns the retained (oldest) portion and the removed shares, newest
/// first. A wager straddling the boundary is split.
pub(crate) fn split_newest(
    contribs: &[Contribution],
    excess: Decimal,
) -> (Vec<Contribution>, Vec<ExcessShare>) {
    let mut remaining = excess;
    let mut shares = Vec::new();
    let mut kept = contribs.to_vec();

    while remaining > Decimal::ZERO {
        let Some(last) = kept.last_mut() else { break };
        let take = last.units.min(remaining);
        shares.push(ExcessShare {
            wager_id: last.wager_id.clone(),
            units: take,
        });
        remaining -= take;
        last.units -= take;
        if last.units <= Decimal::ZERO {
            kept.pop();
        }
    }

    (kept, shares)
}

// ---------------------------------------------------------------------------
// Transfer totals
// ---------------------------------------------------------------------------

/// Amounts already transferred out, per key and tier.
#[derive(Debug, Default)]
pub(crate) struct TransferTotals {
    by_key: HashMap<ExcessKey, Decimal>,
}

impl TransferTotals {
    pub fn from_records(transfers: &[TransferRecord]) -> Self {
        let mut totals = Self::default();
        for t in transfers {
            *totals.by_key.entry(t.key()).or_default() += t.amount;
        }
        totals
    }

    pub fn for_key(&self, key: &ExcessKey) -> Decimal {
        self.by_key.get(key).copied().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

pub struct ExposureCalculator;

impl ExposureCalculator {
    /// Compute every over-cap item for a round.
    ///
    /// Inactive wagers are ignored. Items are ordered by bet type, then by
    /// number; for set-priced types all exact-tier items precede the
    /// suffix-tier items of that type.
    pub fn compute(
        wagers: &[WagerRecord],
        caps: &CapSpec,
        transfers: &[TransferRecord],
        variant: &LotteryVariant,
    ) -> Vec<ExcessItem> {
        let buckets = group_active(wagers, variant);
        let totals = TransferTotals::from_records(transfers);

        let mut items = Vec::new();
        let mut set_groups: BTreeMap<BetType, Vec<(String, Vec<Contribution>)>> = BTreeMap::new();

        for ((bet_type, numbers), contribs) in buckets {
            if variant.is_set_priced(bet_type) {
                set_groups.entry(bet_type).or_default().push((numbers, contribs));
                continue;
            }
            if let Some(item) = amount_item(bet_type, &numbers, &contribs, caps, &totals) {
                items.push(item);
            }
        }

        for (bet_type, numbers) in set_groups {
            items.extend(suffix::two_tier(bet_type, numbers, caps, &totals));
        }

        debug!(
            wagers = wagers.len(),
            transfers = transfers.len(),
            items = items.len(),
            "Exposure computed"
        );

        items
    }

    /// Live excess for a single key (zero when the key is within cap).
    pub fn excess_for(
        key: &ExcessKey,
        wagers: &[WagerRecord],
        caps: &CapSpec,
        transfers: &[TransferRecord],
        variant: &LotteryVariant,
    ) -> Decimal {
        Self::compute(wagers, caps, transfers, variant)
            .into_iter()
            .find(|item| item.key() == *key)
            .map(|item| item.excess)
            .unwrap_or_default()
    }

    /// Sum of all excess across a round.
    pub fn total_excess(items: &[ExcessItem]) -> Decimal {
        items.iter().map(|i| i.excess).sum()
    }
}

/// Active wagers grouped by key, each group ordered oldest first.
fn group_active(
    wagers: &[WagerRecord],
    variant: &LotteryVariant,
) -> BTreeMap<(BetType, String), Vec<Contribution>> {
    let mut buckets: BTreeMap<(BetType, String), Vec<Contribution>> = BTreeMap::new();
    for w in wagers.iter().filter(|w| w.active) {
        buckets
            .entry((w.bet_type, w.numbers.clone()))
            .or_default()
            .push(Contribution {
                wager_id: w.id.clone(),
                created_at: w.created_at,
                units: variant.units_for(w.bet_type, w.amount),
            });
    }
    for contribs in buckets.values_mut() {
        contribs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.wager_id.cmp(&b.wager_id))
        });
    }
    buckets
}

fn amount_item(
    bet_type: BetType,
    numbers: &str,
    contribs: &[Contribution],
    caps: &CapSpec,
    totals: &TransferTotals,
) -> Option<ExcessItem> {
    let cap = caps.cap_for(bet_type, numbers)?;
    let key = ExcessKey::new(bet_type, numbers, CapTier::Standard);
    let exposure = total(contribs);
    let transferred = totals.for_key(&key);
    let excess = exposure - cap - transferred;
    if excess <= Decimal::ZERO {
        return None;
    }
    let (_, shares) = split_newest(contribs, excess);
    Some(ExcessItem {
        bet_type,
        numbers: numbers.to_string(),
        tier: CapTier::Standard,
        in_sets: false,
        exposure,
        static_cap: cap,
        transferred,
        excess,
        suffix: None,
        shares,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
