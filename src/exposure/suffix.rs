//! Two-tier caps for set-priced 4-digit bets.
//!
//! Each 4-digit number has its own cap (exact tier). Two or more numbers
//! sharing their trailing digits (three by default) also share a second cap
//! (suffix tier). Sets that fit the exact cap are walked against the shared
//! suffix capacity in first-come order: the number whose earliest wager is
//! oldest is served first, and overflow lands on the newest wagers of the
//! later numbers. A suffix-tier transfer offsets the overflow of the number
//! it was made for, never a neighbour's.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::{split_newest, total, Contribution, TransferTotals};
use crate::types::{BetType, CapSpec, CapTier, ExcessItem, ExcessKey};

/// Sets of one number left after the exact tier took its overflow.
struct Retained {
    numbers: String,
    earliest: chrono::DateTime<chrono::Utc>,
    earliest_id: String,
    kept: Vec<Contribution>,
    within: Decimal,
}

/// Run both tiers for one set-priced bet type.
///
/// `numbers` holds each distinct number with its contributions, oldest
/// first, already in key order.
pub(super) fn two_tier(
    bet_type: BetType,
    numbers: Vec<(String, Vec<Contribution>)>,
    caps: &CapSpec,
    totals: &TransferTotals,
) -> Vec<ExcessItem> {
    let mut items = Vec::new();
    let mut retained = Vec::with_capacity(numbers.len());

    // Exact tier
    for (number, contribs) in numbers {
        let Some(first) = contribs.first() else { continue };
        let earliest = first.created_at;
        let earliest_id = first.wager_id.clone();
        let sets = total(&contribs);

        let kept = match caps.cap_for(bet_type, &number) {
            Some(cap) => {
                let key = ExcessKey::new(bet_type, &number, CapTier::Exact);
                let transferred = totals.for_key(&key);
                let overflow = sets - cap - transferred;
                if overflow > Decimal::ZERO {
                    let (kept, shares) = split_newest(&contribs, overflow);
                    items.push(ExcessItem {
                        bet_type,
                        numbers: number.clone(),
                        tier: CapTier::Exact,
                        in_sets: true,
                        exposure: sets,
                        static_cap: cap,
                        transferred,
                        excess: overflow,
                        suffix: None,
                        shares,
                    });
                    kept
                } else {
                    contribs
                }
            }
            None => contribs,
        };

        let within = total(&kept);
        retained.push(Retained {
            numbers: number,
            earliest,
            earliest_id,
            kept,
            within,
        });
    }

    // Suffix tier
    let Some(suffix_cap) = caps.suffix_cap(bet_type) else {
        return items;
    };

    let mut groups: BTreeMap<String, Vec<Retained>> = BTreeMap::new();
    for r in retained {
        groups.entry(caps.suffix_of(&r.numbers).to_string()).or_default().push(r);
    }

    for (suffix, mut members) in groups {
        if members.len() < 2 {
            continue;
        }

        members.sort_by(|a, b| {
            a.earliest
                .cmp(&b.earliest)
                .then_with(|| a.earliest_id.cmp(&b.earliest_id))
                .then_with(|| a.numbers.cmp(&b.numbers))
        });

        let mut remaining = suffix_cap;
        for member in members {
            let capacity_left = remaining.min(member.within);
            remaining -= capacity_left;

            let key = ExcessKey::new(bet_type, &member.numbers, CapTier::Suffix);
            let transferred = totals.for_key(&key);
            let excess = member.within - capacity_left - transferred;
            if excess <= Decimal::ZERO {
                continue;
            }

            let (_, shares) = split_newest(&member.kept, excess);
            items.push(ExcessItem {
                bet_type,
                numbers: member.numbers,
                tier: CapTier::Suffix,
                in_sets: true,
                exposure: member.within,
                static_cap: capacity_left,
                transferred,
                excess,
                suffix: Some(suffix.clone()),
                shares,
            });
        }
    }

    items
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
