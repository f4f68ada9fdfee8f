//! SQLite store via `sqlx`.
//!
//! Decimals are stored as TEXT, timestamps as RFC 3339 with nanoseconds,
//! and nested values (lottery variant, caps, transfer target) as JSON.
//! Batch commits and undos run in one transaction each, behind a write
//! lock so that concurrent commits on the same store never interleave.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    BatchDraft, CommitCheck, CommitContext, CommitPlan, CreditStore, DeletedBatch, LimitRegistry,
    RoundDirectory, SubmissionStore, TransferStore,
};
use crate::engine::credit::pending_deduction;
use crate::types::{
    CapSpec, DealerCredit, DealerId, LedgerError, Round, RoundStatus, TransferRecord, WagerRecord,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS rounds (
        id TEXT PRIMARY KEY,
        dealer_id TEXT NOT NULL,
        lottery_type TEXT NOT NULL,
        round_date TEXT NOT NULL,
        open_at TEXT NOT NULL,
        close_at TEXT NOT NULL,
        status TEXT NOT NULL,
        variant TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_rounds_dealer ON rounds (dealer_id)",
    "CREATE TABLE IF NOT EXISTS wagers (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        round_id TEXT NOT NULL,
        bettor_id TEXT NOT NULL,
        bet_type TEXT NOT NULL,
        numbers TEXT NOT NULL,
        amount TEXT NOT NULL,
        commission TEXT NOT NULL,
        created_at TEXT NOT NULL,
        active INTEGER NOT NULL,
        transfer_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_wagers_round ON wagers (round_id)",
    "CREATE TABLE IF NOT EXISTS cap_specs (
        round_id TEXT PRIMARY KEY,
        spec TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transfers (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        round_id TEXT NOT NULL,
        bet_type TEXT NOT NULL,
        numbers TEXT NOT NULL,
        tier TEXT NOT NULL,
        amount TEXT NOT NULL,
        stake TEXT NOT NULL,
        batch_id TEXT NOT NULL,
        target TEXT NOT NULL,
        linked INTEGER NOT NULL,
        target_round_id TEXT,
        target_wager_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_transfers_round ON transfers (round_id)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_batch ON transfers (batch_id)",
    "CREATE TABLE IF NOT EXISTS dealer_credit (
        dealer_id TEXT PRIMARY KEY,
        balance TEXT NOT NULL,
        pending_deduction TEXT NOT NULL,
        is_blocked INTEGER NOT NULL,
        warning_threshold TEXT NOT NULL
    )",
];

pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and apply
    /// the schema. In-memory URLs get a single long-lived connection, since
    /// every connection to `:memory:` is its own database.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };
        let pool = pool_options.connect_with(options).await?;

        let store = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        store.migrate().await?;
        info!(database_url, "SQLite store ready");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, LedgerError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!(statements = SCHEMA.len(), "Schema applied");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Storage(format!("bad timestamp {s:?}: {e}")))
}

fn parse_dec(s: &str) -> Result<Decimal, LedgerError> {
    Decimal::from_str(s).map_err(|e| LedgerError::Storage(format!("bad decimal {s:?}: {e}")))
}

fn parse_enum<T: FromStr<Err = anyhow::Error>>(s: &str) -> Result<T, LedgerError> {
    s.parse().map_err(|e: anyhow::Error| LedgerError::Storage(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, LedgerError> {
    serde_json::to_string(value).map_err(|e| LedgerError::Storage(format!("encode: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str) -> Result<T, LedgerError> {
    serde_json::from_str(s).map_err(|e| LedgerError::Storage(format!("decode: {e}")))
}

fn round_from_row(row: &SqliteRow) -> Result<Round, LedgerError> {
    let round_date: String = row.try_get("round_date")?;
    Ok(Round {
        id: row.try_get("id")?,
        dealer_id: row.try_get("dealer_id")?,
        lottery_type: row.try_get("lottery_type")?,
        round_date: NaiveDate::from_str(&round_date)
            .map_err(|e| LedgerError::Storage(format!("bad date {round_date:?}: {e}")))?,
        open_at: parse_ts(&row.try_get::<String, _>("open_at")?)?,
        close_at: parse_ts(&row.try_get::<String, _>("close_at")?)?,
        status: parse_enum(&row.try_get::<String, _>("status")?)?,
        variant: from_json(&row.try_get::<String, _>("variant")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn wager_from_row(row: &SqliteRow) -> Result<WagerRecord, LedgerError> {
    Ok(WagerRecord {
        id: row.try_get("id")?,
        round_id: row.try_get("round_id")?,
        bettor_id: row.try_get("bettor_id")?,
        bet_type: parse_enum(&row.try_get::<String, _>("bet_type")?)?,
        numbers: row.try_get("numbers")?,
        amount: parse_dec(&row.try_get::<String, _>("amount")?)?,
        commission: parse_dec(&row.try_get::<String, _>("commission")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        active: row.try_get("active")?,
        transfer_id: row.try_get("transfer_id")?,
    })
}

fn transfer_from_row(row: &SqliteRow) -> Result<TransferRecord, LedgerError> {
    Ok(TransferRecord {
        id: row.try_get("id")?,
        round_id: row.try_get("round_id")?,
        bet_type: parse_enum(&row.try_get::<String, _>("bet_type")?)?,
        numbers: row.try_get("numbers")?,
        tier: parse_enum(&row.try_get::<String, _>("tier")?)?,
        amount: parse_dec(&row.try_get::<String, _>("amount")?)?,
        stake: parse_dec(&row.try_get::<String, _>("stake")?)?,
        batch_id: row.try_get("batch_id")?,
        target: from_json(&row.try_get::<String, _>("target")?)?,
        linked: row.try_get("linked")?,
        target_round_id: row.try_get("target_round_id")?,
        target_wager_id: row.try_get("target_wager_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn credit_from_row(row: &SqliteRow) -> Result<DealerCredit, LedgerError> {
    Ok(DealerCredit {
        dealer_id: row.try_get("dealer_id")?,
        balance: parse_dec(&row.try_get::<String, _>("balance")?)?,
        pending_deduction: parse_dec(&row.try_get::<String, _>("pending_deduction")?)?,
        is_blocked: row.try_get("is_blocked")?,
        warning_threshold: parse_dec(&row.try_get::<String, _>("warning_threshold")?)?,
    })
}

// ---------------------------------------------------------------------------
// Queries (usable inside or outside a transaction)
// ---------------------------------------------------------------------------

async fn fetch_round(conn: &mut SqliteConnection, round_id: &str) -> Result<Option<Round>, LedgerError> {
    let row = sqlx::query("SELECT * FROM rounds WHERE id = ?")
        .bind(round_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(round_from_row).transpose()
}

async fn fetch_dealer_rounds(conn: &mut SqliteConnection, dealer_id: &str) -> Result<Vec<Round>, LedgerError> {
    let rows = sqlx::query("SELECT * FROM rounds WHERE dealer_id = ? ORDER BY created_at, id")
        .bind(dealer_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(round_from_row).collect()
}

async fn fetch_active_wagers(conn: &mut SqliteConnection, round_id: &str) -> Result<Vec<WagerRecord>, LedgerError> {
    let rows = sqlx::query("SELECT * FROM wagers WHERE round_id = ? AND active = 1 ORDER BY seq")
        .bind(round_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(wager_from_row).collect()
}

async fn fetch_caps(conn: &mut SqliteConnection, round_id: &str) -> Result<CapSpec, LedgerError> {
    let row = sqlx::query("SELECT spec FROM cap_specs WHERE round_id = ?")
        .bind(round_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => from_json(&row.try_get::<String, _>("spec")?),
        None => Ok(CapSpec::default()),
    }
}

async fn fetch_transfers(
    conn: &mut SqliteConnection,
    round_id: &str,
    batch_id: Option<&str>,
) -> Result<Vec<TransferRecord>, LedgerError> {
    let rows = match batch_id {
        Some(batch_id) => {
            sqlx::query("SELECT * FROM transfers WHERE round_id = ? AND batch_id = ? ORDER BY seq")
                .bind(round_id)
                .bind(batch_id)
                .fetch_all(&mut *conn)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM transfers WHERE round_id = ? ORDER BY seq")
                .bind(round_id)
                .fetch_all(&mut *conn)
                .await?
        }
    };
    rows.iter().map(transfer_from_row).collect()
}

async fn fetch_credit(conn: &mut SqliteConnection, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError> {
    let row = sqlx::query("SELECT * FROM dealer_credit WHERE dealer_id = ?")
        .bind(dealer_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(credit_from_row).transpose()
}

async fn insert_wager(conn: &mut SqliteConnection, w: &WagerRecord) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO wagers (id, round_id, bettor_id, bet_type, numbers, amount, commission, created_at, active, transfer_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&w.id)
    .bind(&w.round_id)
    .bind(&w.bettor_id)
    .bind(w.bet_type.to_string())
    .bind(&w.numbers)
    .bind(w.amount.to_string())
    .bind(w.commission.to_string())
    .bind(ts(w.created_at))
    .bind(w.active)
    .bind(&w.transfer_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_transfer(conn: &mut SqliteConnection, t: &TransferRecord) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO transfers (id, round_id, bet_type, numbers, tier, amount, stake, batch_id, target, linked, target_round_id, target_wager_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&t.id)
    .bind(&t.round_id)
    .bind(t.bet_type.to_string())
    .bind(&t.numbers)
    .bind(t.tier.to_string())
    .bind(t.amount.to_string())
    .bind(t.stake.to_string())
    .bind(&t.batch_id)
    .bind(to_json(&t.target)?)
    .bind(t.linked)
    .bind(&t.target_round_id)
    .bind(&t.target_wager_id)
    .bind(ts(t.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn owner_of(conn: &mut SqliteConnection, round_id: &str) -> Result<Option<DealerId>, LedgerError> {
    let row = sqlx::query("SELECT dealer_id FROM rounds WHERE id = ?")
        .bind(round_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(match row {
        Some(row) => Some(row.try_get("dealer_id")?),
        None => None,
    })
}

/// Full rescan of a dealer's obligations into its credit row.
async fn recompute(conn: &mut SqliteConnection, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError> {
    let Some(mut credit) = fetch_credit(conn, dealer_id).await? else {
        return Ok(None);
    };
    let rounds = fetch_dealer_rounds(conn, dealer_id).await?;
    let rows = sqlx::query(
        "SELECT w.* FROM wagers w JOIN rounds r ON w.round_id = r.id
         WHERE r.dealer_id = ? AND w.active = 1",
    )
    .bind(dealer_id)
    .fetch_all(&mut *conn)
    .await?;
    let wagers = rows.iter().map(wager_from_row).collect::<Result<Vec<_>, _>>()?;
    let rows = sqlx::query(
        "SELECT t.* FROM transfers t JOIN rounds r ON t.round_id = r.id
         WHERE t.linked = 1 AND t.target_wager_id IS NULL AND r.status != ?",
    )
    .bind(RoundStatus::Settled.to_string())
    .fetch_all(&mut *conn)
    .await?;
    let transfers_in = rows.iter().map(transfer_from_row).collect::<Result<Vec<_>, _>>()?;

    credit.pending_deduction = pending_deduction(dealer_id, &rounds, &wagers, &transfers_in);
    sqlx::query("UPDATE dealer_credit SET pending_deduction = ? WHERE dealer_id = ?")
        .bind(credit.pending_deduction.to_string())
        .bind(dealer_id)
        .execute(&mut *conn)
        .await?;
    Ok(Some(credit))
}

// ---------------------------------------------------------------------------
// Trait impls
// ---------------------------------------------------------------------------

#[async_trait]
impl SubmissionStore for SqliteStore {
    async fn active_wagers(&self, round_id: &str) -> Result<Vec<WagerRecord>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_active_wagers(&mut conn, round_id).await
    }

    async fn wager(&self, wager_id: &str) -> Result<Option<WagerRecord>, LedgerError> {
        let row = sqlx::query("SELECT * FROM wagers WHERE id = ?")
            .bind(wager_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wager_from_row).transpose()
    }

    async fn append_wager(&self, wager: &WagerRecord) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        insert_wager(&mut tx, wager).await?;
        if let Some(owner) = owner_of(&mut tx, &wager.round_id).await? {
            recompute(&mut tx, &owner).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_wager(&self, wager_id: &str) -> Result<bool, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE wagers SET active = 0 WHERE id = ? AND active = 1")
            .bind(wager_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Ok(false);
        }
        let row = sqlx::query("SELECT round_id FROM wagers WHERE id = ?")
            .bind(wager_id)
            .fetch_one(&mut *tx)
            .await?;
        let round_id: String = row.try_get("round_id")?;
        if let Some(owner) = owner_of(&mut tx, &round_id).await? {
            recompute(&mut tx, &owner).await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl LimitRegistry for SqliteStore {
    async fn cap_spec(&self, round_id: &str) -> Result<CapSpec, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_caps(&mut conn, round_id).await
    }

    async fn save_cap_spec(&self, round_id: &str, caps: &CapSpec) -> Result<(), LedgerError> {
        sqlx::query("INSERT OR REPLACE INTO cap_specs (round_id, spec) VALUES (?, ?)")
            .bind(round_id)
            .bind(to_json(caps)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RoundDirectory for SqliteStore {
    async fn round(&self, round_id: &str) -> Result<Option<Round>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_round(&mut conn, round_id).await
    }

    async fn dealer_rounds(&self, dealer_id: &str) -> Result<Vec<Round>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_dealer_rounds(&mut conn, dealer_id).await
    }

    async fn save_round(&self, round: &Round) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let previous_owner = owner_of(&mut tx, &round.id).await?;
        sqlx::query(
            "INSERT OR REPLACE INTO rounds (id, dealer_id, lottery_type, round_date, open_at, close_at, status, variant, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&round.id)
        .bind(&round.dealer_id)
        .bind(&round.lottery_type)
        .bind(round.round_date.to_string())
        .bind(ts(round.open_at))
        .bind(ts(round.close_at))
        .bind(round.status.to_string())
        .bind(to_json(&round.variant)?)
        .bind(ts(round.created_at))
        .execute(&mut *tx)
        .await?;

        recompute(&mut tx, &round.dealer_id).await?;
        if let Some(prev) = previous_owner.filter(|p| *p != round.dealer_id) {
            recompute(&mut tx, &prev).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CreditStore for SqliteStore {
    async fn dealer_credit(&self, dealer_id: &str) -> Result<Option<DealerCredit>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_credit(&mut conn, dealer_id).await
    }

    async fn save_dealer_credit(&self, credit: &DealerCredit) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO dealer_credit (dealer_id, balance, pending_deduction, is_blocked, warning_threshold)
             VALUES (?, ?, '0', ?, ?)",
        )
        .bind(&credit.dealer_id)
        .bind(credit.balance.to_string())
        .bind(credit.is_blocked)
        .bind(credit.warning_threshold.to_string())
        .execute(&mut *tx)
        .await?;
        recompute(&mut tx, &credit.dealer_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn recompute_pending_deduction(
        &self,
        dealer_id: &str,
    ) -> Result<Option<DealerCredit>, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let refreshed = recompute(&mut tx, dealer_id).await?;
        tx.commit().await?;
        Ok(refreshed)
    }
}

#[async_trait]
impl TransferStore for SqliteStore {
    async fn transfers(
        &self,
        round_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Vec<TransferRecord>, LedgerError> {
        let mut conn = self.pool.acquire().await?;
        fetch_transfers(&mut conn, round_id, batch_id).await
    }

    async fn commit_batch(
        &self,
        draft: &BatchDraft,
        check: &CommitCheck<'_>,
    ) -> Result<CommitPlan, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let round = fetch_round(&mut tx, &draft.round_id)
            .await?
            .ok_or_else(|| LedgerError::RoundNotFound(draft.round_id.clone()))?;
        let mut credits = HashMap::new();
        for dealer_id in draft.linked_dealers() {
            if let Some(credit) = fetch_credit(&mut tx, &dealer_id).await? {
                credits.insert(dealer_id, credit);
            }
        }
        let mut mirror_rounds = HashMap::new();
        for round_id in draft.mirror_round_ids() {
            if let Some(upstream) = fetch_round(&mut tx, &round_id).await? {
                mirror_rounds.insert(round_id, upstream);
            }
        }
        let ctx = CommitContext {
            wagers: fetch_active_wagers(&mut tx, &round.id).await?,
            caps: fetch_caps(&mut tx, &round.id).await?,
            transfers: fetch_transfers(&mut tx, &round.id, None).await?,
            credits,
            mirror_rounds,
            round,
        };

        // Dropping `tx` on error rolls back.
        let plan = check(&ctx, draft)?;

        for wager in &plan.mirrors {
            insert_wager(&mut tx, wager).await?;
        }
        for record in &plan.transfers {
            insert_transfer(&mut tx, record).await?;
        }
        for dealer_id in plan.linked_dealers() {
            recompute(&mut tx, &dealer_id).await?;
        }
        tx.commit().await?;

        debug!(
            batch_id = %draft.batch_id,
            transfers = plan.transfers.len(),
            mirrors = plan.mirrors.len(),
            "SQLite commit applied"
        );
        Ok(plan)
    }

    async fn delete_batch(&self, batch_id: &str) -> Result<DeletedBatch, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT * FROM transfers WHERE batch_id = ? ORDER BY seq")
            .bind(batch_id)
            .fetch_all(&mut *tx)
            .await?;
        let records = rows.iter().map(transfer_from_row).collect::<Result<Vec<_>, _>>()?;

        sqlx::query("DELETE FROM transfers WHERE batch_id = ?")
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;

        let dealers: BTreeSet<DealerId> = records
            .iter()
            .filter_map(|t| t.target.linked_dealer().cloned())
            .collect();
        for dealer_id in &dealers {
            recompute(&mut tx, dealer_id).await?;
        }
        tx.commit().await?;

        Ok(DeletedBatch {
            records,
            recomputed_dealers: dealers.into_iter().collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
