//! Mirror submitter — transferred risk as a wager in the upstream's round.
//!
//! A mirror wager is built here and written by the ledger commit in the
//! same unit as its ledger row, so neither can exist without the other.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::RoundDirectory;
use crate::types::{ExcessKey, LedgerError, Round, TransferId, WagerRecord};

pub struct MirrorSubmitter<S: ?Sized> {
    rounds: Arc<S>,
    timeout: Duration,
}

impl<S: RoundDirectory + ?Sized> MirrorSubmitter<S> {
    pub fn new(rounds: Arc<S>, timeout: Duration) -> Self {
        Self { rounds, timeout }
    }

    /// The upstream dealer's round to mirror into: the most recently created
    /// round of that lottery and date that is open at `now`.
    pub async fn find_open_round(
        &self,
        upstream_dealer_id: &str,
        lottery_type: &str,
        round_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<Round>, LedgerError> {
        let rounds = tokio::time::timeout(self.timeout, self.rounds.dealer_rounds(upstream_dealer_id))
            .await
            .map_err(|_| {
                LedgerError::UpstreamLookupTimeout(format!("open round lookup for {upstream_dealer_id}"))
            })??;

        let found = select_open_round(&rounds, lottery_type, round_date, now);
        match found {
            Some(ref round) => debug!(
                dealer_id = upstream_dealer_id,
                round_id = %round.id,
                "Upstream round found"
            ),
            None => warn!(
                dealer_id = upstream_dealer_id,
                lottery_type,
                %round_date,
                "No open upstream round"
            ),
        }
        Ok(found)
    }

    /// Same lookup, with a missing round reported as `MirrorUnavailable`.
    pub async fn require_open_round(
        &self,
        upstream_dealer_id: &str,
        lottery_type: &str,
        round_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Round, LedgerError> {
        self.find_open_round(upstream_dealer_id, lottery_type, round_date, now)
            .await?
            .ok_or_else(|| LedgerError::MirrorUnavailable {
                dealer_id: upstream_dealer_id.to_string(),
                reason: format!("no open {lottery_type} round for {round_date}"),
            })
    }
}

/// Pick the newest open round matching lottery and date.
pub fn select_open_round(
    rounds: &[Round],
    lottery_type: &str,
    round_date: NaiveDate,
    now: DateTime<Utc>,
) -> Option<Round> {
    rounds
        .iter()
        .filter(|r| r.lottery_type == lottery_type && r.round_date == round_date)
        .filter(|r| r.is_open_at(now))
        .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        .cloned()
}

/// Synthetic wager in `round` carrying `stake` for `key`, attributed to the
/// transferring dealer with zero commission and linked to `transfer_id`.
pub fn mirror(
    key: &ExcessKey,
    stake: Decimal,
    round: &Round,
    source_dealer_id: &str,
    transfer_id: &TransferId,
    created_at: DateTime<Utc>,
) -> WagerRecord {
    WagerRecord {
        id: uuid::Uuid::new_v4().to_string(),
        round_id: round.id.clone(),
        bettor_id: source_dealer_id.to_string(),
        bet_type: key.bet_type,
        numbers: key.numbers.clone(),
        amount: stake,
        commission: Decimal::ZERO,
        created_at,
        active: true,
        transfer_id: Some(transfer_id.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
