//! Shared types for the LAYOFF engine.
//!
//! These types form the data model used across all modules: wagers,
//! caps, rounds, transfer-out ledger rows, and dealer credit. They are
//! kept free of storage concerns so that the exposure, engine, and
//! storage modules can depend on them without circular references.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type RoundId = String;
pub type WagerId = String;
pub type TransferId = String;
pub type BatchId = String;
pub type DealerId = String;

/// Unit price of one set when a variant does not configure one.
pub const DEFAULT_UNIT_PRICE: Decimal = dec!(100);

/// Trailing digits shared by a suffix group unless a round configures otherwise.
pub const SUFFIX_DIGITS: usize = 3;

// ---------------------------------------------------------------------------
// Bet types
// ---------------------------------------------------------------------------

/// Wager type. Each type fixes the length of the digit string it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetType {
    FourTop,
    ThreeTop,
    ThreeTod,
    ThreeBottom,
    TwoTop,
    TwoBottom,
    RunTop,
    RunBottom,
}

impl BetType {
    pub const ALL: &'static [BetType] = &[
        BetType::FourTop,
        BetType::ThreeTop,
        BetType::ThreeTod,
        BetType::ThreeBottom,
        BetType::TwoTop,
        BetType::TwoBottom,
        BetType::RunTop,
        BetType::RunBottom,
    ];

    /// Length of the digit string this bet type takes.
    pub fn digits(&self) -> usize {
        match self {
            BetType::FourTop => 4,
            BetType::ThreeTop | BetType::ThreeTod | BetType::ThreeBottom => 3,
            BetType::TwoTop | BetType::TwoBottom => 2,
            BetType::RunTop | BetType::RunBottom => 1,
        }
    }

    /// Whether `numbers` is a digit string of the right length.
    pub fn accepts(&self, numbers: &str) -> bool {
        numbers.len() == self.digits() && numbers.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for BetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BetType::FourTop => "4-top",
            BetType::ThreeTop => "3-top",
            BetType::ThreeTod => "3-tod",
            BetType::ThreeBottom => "3-bottom",
            BetType::TwoTop => "2-top",
            BetType::TwoBottom => "2-bottom",
            BetType::RunTop => "run-top",
            BetType::RunBottom => "run-bottom",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BetType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "four_top" | "4_top" => Ok(BetType::FourTop),
            "three_top" | "3_top" => Ok(BetType::ThreeTop),
            "three_tod" | "3_tod" => Ok(BetType::ThreeTod),
            "three_bottom" | "3_bottom" => Ok(BetType::ThreeBottom),
            "two_top" | "2_top" => Ok(BetType::TwoTop),
            "two_bottom" | "2_bottom" => Ok(BetType::TwoBottom),
            "run_top" => Ok(BetType::RunTop),
            "run_bottom" => Ok(BetType::RunBottom),
            _ => Err(anyhow::anyhow!("Unknown bet type: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Lottery variant
// ---------------------------------------------------------------------------

/// How a round measures stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Accounting {
    /// Stake and caps are currency amounts.
    #[default]
    Amount,
    /// 4-digit bets are sold in fixed-price sets and capped in sets.
    Sets,
}

/// Per-round accounting flavour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotteryVariant {
    #[serde(default)]
    pub accounting: Accounting,
    /// Unit price per set-priced bet type.
    #[serde(default)]
    pub unit_prices: BTreeMap<BetType, Decimal>,
    #[serde(default = "default_unit_price")]
    pub default_unit_price: Decimal,
}

fn default_unit_price() -> Decimal {
    DEFAULT_UNIT_PRICE
}

impl Default for LotteryVariant {
    fn default() -> Self {
        Self::amount_based()
    }
}

impl LotteryVariant {
    pub fn amount_based() -> Self {
        Self {
            accounting: Accounting::Amount,
            unit_prices: BTreeMap::new(),
            default_unit_price: DEFAULT_UNIT_PRICE,
        }
    }

    pub fn set_based(unit_price: Decimal) -> Self {
        Self {
            accounting: Accounting::Sets,
            unit_prices: BTreeMap::new(),
            default_unit_price: unit_price,
        }
    }

    /// Set-priced bet types are the 4-digit ones in a set-based round.
    pub fn is_set_priced(&self, bet_type: BetType) -> bool {
        self.accounting == Accounting::Sets && bet_type.digits() == 4
    }

    pub fn unit_price(&self, bet_type: BetType) -> Decimal {
        self.unit_prices
            .get(&bet_type)
            .copied()
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(self.default_unit_price)
    }

    /// Exposure units contributed by one wager: currency for amount-based
    /// types, sets (rounded up) for set-priced ones.
    pub fn units_for(&self, bet_type: BetType, amount: Decimal) -> Decimal {
        if !self.is_set_priced(bet_type) {
            return amount;
        }
        let price = self.unit_price(bet_type);
        if price <= Decimal::ZERO {
            return amount;
        }
        (amount / price).ceil()
    }

    /// Currency value of `units` exposure units.
    pub fn stake_for(&self, bet_type: BetType, units: Decimal) -> Decimal {
        if self.is_set_priced(bet_type) {
            units * self.unit_price(bet_type)
        } else {
            units
        }
    }
}

// ---------------------------------------------------------------------------
// Rounds & wagers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    Closed,
    Settled,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundStatus::Open => write!(f, "open"),
            RoundStatus::Closed => write!(f, "closed"),
            RoundStatus::Settled => write!(f, "settled"),
        }
    }
}

impl std::str::FromStr for RoundStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(RoundStatus::Open),
            "closed" => Ok(RoundStatus::Closed),
            "settled" => Ok(RoundStatus::Settled),
            _ => Err(anyhow::anyhow!("Unknown round status: {s}")),
        }
    }
}

/// A dealer's draw for one lottery on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub dealer_id: DealerId,
    pub lottery_type: String,
    pub round_date: NaiveDate,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub status: RoundStatus,
    #[serde(default)]
    pub variant: LotteryVariant,
    pub created_at: DateTime<Utc>,
}

impl Round {
    /// Whether the round accepts wagers at `now`.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RoundStatus::Open && self.open_at <= now && now < self.close_at
    }

    pub fn is_settled(&self) -> bool {
        self.status == RoundStatus::Settled
    }
}

/// One wager on one number. Never mutated once active; deletion only
/// clears `active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WagerRecord {
    pub id: WagerId,
    pub round_id: RoundId,
    pub bettor_id: String,
    pub bet_type: BetType,
    pub numbers: String,
    /// Stake in currency.
    pub amount: Decimal,
    #[serde(default)]
    pub commission: Decimal,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    /// Ledger entry this wager mirrors, for wagers transferred in.
    #[serde(default)]
    pub transfer_id: Option<TransferId>,
}

impl WagerRecord {
    pub fn new(
        round_id: &str,
        bettor_id: &str,
        bet_type: BetType,
        numbers: &str,
        amount: Decimal,
        commission: Decimal,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            round_id: round_id.to_string(),
            bettor_id: bettor_id.to_string(),
            bet_type,
            numbers: numbers.to_string(),
            amount,
            commission,
            created_at: Utc::now(),
            active: true,
            transfer_id: None,
        }
    }

    pub fn is_mirror(&self) -> bool {
        self.transfer_id.is_some()
    }
}

impl fmt::Display for WagerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.2} by {}{}",
            self.bet_type,
            self.numbers,
            self.amount,
            self.bettor_id,
            if self.active { "" } else { " (deleted)" },
        )
    }
}

// ---------------------------------------------------------------------------
// Caps
// ---------------------------------------------------------------------------

/// Cap override for one specific number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberCap {
    pub bet_type: BetType,
    pub numbers: String,
    pub max_amount: Decimal,
}

/// Per-round risk caps. Values are currency, or sets for set-priced types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapSpec {
    #[serde(default)]
    pub type_caps: BTreeMap<BetType, Decimal>,
    #[serde(default)]
    pub number_caps: Vec<NumberCap>,
    /// Shared cap per suffix group of set-priced 4-digit types.
    #[serde(default)]
    pub suffix_caps: BTreeMap<BetType, Decimal>,
    /// How many trailing digits define a suffix group.
    #[serde(default = "default_suffix_digits")]
    pub suffix_digits: usize,
}

fn default_suffix_digits() -> usize {
    SUFFIX_DIGITS
}

impl Default for CapSpec {
    fn default() -> Self {
        Self {
            type_caps: BTreeMap::new(),
            number_caps: Vec::new(),
            suffix_caps: BTreeMap::new(),
            suffix_digits: SUFFIX_DIGITS,
        }
    }
}

impl CapSpec {
    /// Effective static cap for a key. `None` means unbounded: a cap of zero
    /// is indistinguishable from no cap at all.
    pub fn cap_for(&self, bet_type: BetType, numbers: &str) -> Option<Decimal> {
        let override_cap = self
            .number_caps
            .iter()
            .rev()
            .find(|c| c.bet_type == bet_type && c.numbers == numbers)
            .map(|c| c.max_amount);
        override_cap
            .or_else(|| self.type_caps.get(&bet_type).copied())
            .filter(|cap| *cap > Decimal::ZERO)
    }

    /// Shared suffix cap for a set-priced 4-digit type. Same zero rule.
    pub fn suffix_cap(&self, bet_type: BetType) -> Option<Decimal> {
        self.suffix_caps
            .get(&bet_type)
            .copied()
            .filter(|cap| *cap > Decimal::ZERO)
    }

    pub fn with_type_cap(mut self, bet_type: BetType, cap: Decimal) -> Self {
        self.type_caps.insert(bet_type, cap);
        self
    }

    pub fn with_number_cap(mut self, bet_type: BetType, numbers: &str, cap: Decimal) -> Self {
        self.number_caps.push(NumberCap {
            bet_type,
            numbers: numbers.to_string(),
            max_amount: cap,
        });
        self
    }

    pub fn with_suffix_cap(mut self, bet_type: BetType, cap: Decimal) -> Self {
        self.suffix_caps.insert(bet_type, cap);
        self
    }

    pub fn with_suffix_digits(mut self, digits: usize) -> Self {
        self.suffix_digits = digits;
        self
    }

    /// Suffix group a number belongs to.
    pub fn suffix_of<'a>(&self, numbers: &'a str) -> &'a str {
        let digits = if self.suffix_digits == 0 { SUFFIX_DIGITS } else { self.suffix_digits };
        let start = numbers.len().saturating_sub(digits);
        numbers.get(start..).unwrap_or(numbers)
    }
}

// ---------------------------------------------------------------------------
// Excess
// ---------------------------------------------------------------------------

/// Which cap produced an excess item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapTier {
    /// Single cap of an amount-based key.
    Standard,
    /// Own cap of one set-priced 4-digit number.
    Exact,
    /// Shared cap of numbers with the same last three digits.
    Suffix,
}

impl fmt::Display for CapTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapTier::Standard => write!(f, "standard"),
            CapTier::Exact => write!(f, "exact"),
            CapTier::Suffix => write!(f, "suffix"),
        }
    }
}

impl std::str::FromStr for CapTier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(CapTier::Standard),
            "exact" => Ok(CapTier::Exact),
            "suffix" => Ok(CapTier::Suffix),
            _ => Err(anyhow::anyhow!("Unknown cap tier: {s}")),
        }
    }
}

/// Identity of an excess item and of the transfers made against it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExcessKey {
    pub bet_type: BetType,
    pub numbers: String,
    pub tier: CapTier,
}

impl ExcessKey {
    pub fn new(bet_type: BetType, numbers: &str, tier: CapTier) -> Self {
        Self {
            bet_type,
            numbers: numbers.to_string(),
            tier,
        }
    }
}

impl fmt::Display for ExcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.bet_type, self.numbers, self.tier)
    }
}

/// Portion of an excess item attributed to one wager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcessShare {
    pub wager_id: WagerId,
    pub units: Decimal,
}

/// Over-cap stake on one key. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcessItem {
    pub bet_type: BetType,
    pub numbers: String,
    pub tier: CapTier,
    /// True when `exposure`, caps and `excess` count sets rather than currency.
    pub in_sets: bool,
    /// Stake (or sets) measured against the cap of this tier.
    pub exposure: Decimal,
    pub static_cap: Decimal,
    /// Already transferred out against this tier.
    pub transferred: Decimal,
    pub excess: Decimal,
    /// Shared suffix, for suffix-tier items.
    pub suffix: Option<String>,
    /// Wagers the excess is attributed to, newest first.
    pub shares: Vec<ExcessShare>,
}

impl ExcessItem {
    pub fn key(&self) -> ExcessKey {
        ExcessKey::new(self.bet_type, &self.numbers, self.tier)
    }

    pub fn effective_cap(&self) -> Decimal {
        self.static_cap + self.transferred
    }
}

impl fmt::Display for ExcessItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = if self.in_sets { " sets" } else { "" };
        write!(
            f,
            "{} {} [{}] exposure={}{unit} cap={}{unit} excess={}{unit}",
            self.bet_type,
            self.numbers,
            self.tier,
            self.exposure,
            self.effective_cap(),
            self.excess,
        )
    }
}

// ---------------------------------------------------------------------------
// Transfer ledger
// ---------------------------------------------------------------------------

/// Who receives a transfer-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferTarget {
    /// Free-text recipient with no credit relationship.
    Manual {
        name: String,
        #[serde(default)]
        contact: Option<String>,
    },
    /// Upstream dealer with an approved link.
    Linked { dealer_id: DealerId },
}

impl TransferTarget {
    pub fn manual(name: &str) -> Self {
        TransferTarget::Manual {
            name: name.to_string(),
            contact: None,
        }
    }

    pub fn linked(dealer_id: &str) -> Self {
        TransferTarget::Linked {
            dealer_id: dealer_id.to_string(),
        }
    }

    pub fn linked_dealer(&self) -> Option<&DealerId> {
        match self {
            TransferTarget::Linked { dealer_id } => Some(dealer_id),
            TransferTarget::Manual { .. } => None,
        }
    }

    /// Whether the target identifies somebody.
    pub fn has_identity(&self) -> bool {
        match self {
            TransferTarget::Manual { name, .. } => !name.trim().is_empty(),
            TransferTarget::Linked { dealer_id } => !dealer_id.trim().is_empty(),
        }
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTarget::Manual { name, contact: Some(c) } => write!(f, "{name} ({c})"),
            TransferTarget::Manual { name, contact: None } => write!(f, "{name}"),
            TransferTarget::Linked { dealer_id } => write!(f, "dealer:{dealer_id}"),
        }
    }
}

/// One transfer-out decision, as requested by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub bet_type: BetType,
    pub numbers: String,
    #[serde(default = "default_tier")]
    pub tier: CapTier,
    /// In the key's exposure unit (currency or sets).
    pub amount: Decimal,
    pub target: TransferTarget,
}

fn default_tier() -> CapTier {
    CapTier::Standard
}

impl TransferRequest {
    pub fn new(bet_type: BetType, numbers: &str, amount: Decimal, target: TransferTarget) -> Self {
        Self {
            bet_type,
            numbers: numbers.to_string(),
            tier: CapTier::Standard,
            amount,
            target,
        }
    }

    pub fn with_tier(mut self, tier: CapTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn key(&self) -> ExcessKey {
        ExcessKey::new(self.bet_type, &self.numbers, self.tier)
    }
}

/// Committed ledger row. Immutable; removed only by undoing its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub round_id: RoundId,
    pub bet_type: BetType,
    pub numbers: String,
    pub tier: CapTier,
    /// In the key's exposure unit (currency or sets).
    pub amount: Decimal,
    /// Currency value of `amount`.
    pub stake: Decimal,
    pub batch_id: BatchId,
    pub target: TransferTarget,
    pub linked: bool,
    pub target_round_id: Option<RoundId>,
    pub target_wager_id: Option<WagerId>,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn key(&self) -> ExcessKey {
        ExcessKey::new(self.bet_type, &self.numbers, self.tier)
    }

    pub fn is_mirrored(&self) -> bool {
        self.target_wager_id.is_some()
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] {} -> {} (batch {}{})",
            self.bet_type,
            self.numbers,
            self.tier,
            self.amount,
            self.target,
            self.batch_id,
            if self.is_mirrored() { ", mirrored" } else { "" },
        )
    }
}

/// Aggregate view of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub round_id: RoundId,
    pub count: usize,
    pub total_amount: Decimal,
    pub total_stake: Decimal,
    pub linked: usize,
    pub created_at: DateTime<Utc>,
}

/// Result of undoing a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoSummary {
    pub batch_id: BatchId,
    pub count: usize,
    pub total_amount: Decimal,
    /// Upstream dealers whose pending deduction was recomputed.
    pub recomputed_dealers: Vec<DealerId>,
}

// ---------------------------------------------------------------------------
// Dealer credit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealerCredit {
    pub dealer_id: DealerId,
    pub balance: Decimal,
    /// Cached obligations; only ever overwritten by a full recompute.
    #[serde(default)]
    pub pending_deduction: Decimal,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub warning_threshold: Decimal,
}

impl DealerCredit {
    pub fn new(dealer_id: &str, balance: Decimal) -> Self {
        Self {
            dealer_id: dealer_id.to_string(),
            balance,
            pending_deduction: Decimal::ZERO,
            is_blocked: false,
            warning_threshold: Decimal::ZERO,
        }
    }

    pub fn available(&self) -> Decimal {
        self.balance - self.pending_deduction
    }
}

impl fmt::Display for DealerCredit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} balance={:.2} pending={:.2} available={:.2}{}",
            self.dealer_id,
            self.balance,
            self.pending_deduction,
            self.available(),
            if self.is_blocked { " BLOCKED" } else { "" },
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Engine error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid transfer request: {0}")]
    InvalidTransferRequest(String),

    #[error("Insufficient upstream credit ({dealer_id}): {reason}")]
    InsufficientUpstreamCredit { dealer_id: DealerId, reason: String },

    #[error("Mirror unavailable ({dealer_id}): {reason}")]
    MirrorUnavailable { dealer_id: DealerId, reason: String },

    #[error("Upstream lookup timed out: {0}")]
    UpstreamLookupTimeout(String),

    #[error("Round not found: {0}")]
    RoundNotFound(RoundId),

    #[error("Invalid wager: {0}")]
    InvalidWager(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// Whether the error came from an upstream dealer being unusable
    /// (rather than from the request itself or from storage).
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientUpstreamCredit { .. }
                | LedgerError::MirrorUnavailable { .. }
                | LedgerError::UpstreamLookupTimeout(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
