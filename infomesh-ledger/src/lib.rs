use std::time::{SystemTime, UNIX_EPOCH};

use infomesh_core::{
    tier_for_score, Action, ContributionTier, CreditState, DEBT_COST_MULTIPLIER,
    GRACE_PERIOD_HOURS, LLM_CREDIT_CAP_RATIO, OFF_PEAK_MULTIPLIER,
};
use infomesh_crypto::{canonical_entry_bytes, content_hash, sign_hex, CryptoError};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

/// A single signed-or-unsigned credit ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEntry {
    pub entry_id: i64,
    pub action: Action,
    pub quantity: f64,
    pub weight: f64,
    pub multiplier: f64,
    pub credits: f64,
    pub timestamp: f64,
    pub note: String,
    pub entry_hash: String,
    pub signature: Option<String>,
}

/// A single spend against the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingEntry {
    pub spend_id: i64,
    pub amount: f64,
    pub reason: String,
    pub timestamp: f64,
}

/// Result of a search-cost check. Search is never blocked — only the
/// effective cost changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchAllowance {
    pub state: CreditState,
    pub search_cost: f64,
    pub grace_remaining_hours: Option<f64>,
    pub debt_amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_earned: f64,
    pub total_spent: f64,
    pub balance: f64,
    pub contribution_score: f64,
    pub tier: ContributionTier,
    pub search_cost: f64,
    pub llm_credits: f64,
    pub non_llm_credits: f64,
    pub credit_state: CreditState,
    pub grace_remaining_hours: Option<f64>,
    pub debt_amount: f64,
}

// --- pure state-machine functions (C4) -------------------------------------
//
// These take balance/grace_start/now as plain arguments so they can be
// exercised without a database, matching spec.md §4.4's "pure function of
// (balance, grace_start, now)" framing.

pub fn credit_state(balance: f64, grace_start: Option<f64>, now_ts: f64) -> CreditState {
    if balance > 0.0 {
        return CreditState::Normal;
    }
    let Some(grace_start) = grace_start else {
        return CreditState::Normal;
    };
    let elapsed_hours = (now_ts - grace_start) / 3600.0;
    if elapsed_hours <= GRACE_PERIOD_HOURS {
        CreditState::Grace
    } else {
        CreditState::Debt
    }
}

pub fn debt_amount(balance: f64) -> f64 {
    (-balance).max(0.0)
}

pub fn grace_remaining_hours(balance: f64, grace_start: Option<f64>, now_ts: f64) -> Option<f64> {
    if credit_state(balance, grace_start, now_ts) != CreditState::Grace {
        return None;
    }
    let grace_start = grace_start?;
    let elapsed = (now_ts - grace_start) / 3600.0;
    Some((GRACE_PERIOD_HOURS - elapsed).max(0.0))
}

pub fn search_allowance(
    balance: f64,
    grace_start: Option<f64>,
    base_cost: f64,
    now_ts: f64,
) -> SearchAllowance {
    let state = credit_state(balance, grace_start, now_ts);
    let search_cost = if state == CreditState::Debt {
        base_cost * DEBT_COST_MULTIPLIER
    } else {
        base_cost
    };
    SearchAllowance {
        state,
        search_cost,
        grace_remaining_hours: grace_remaining_hours(balance, grace_start, now_ts),
        debt_amount: debt_amount(balance),
    }
}

/// Fold raw LLM/non-LLM credit totals into a contribution score, capping
/// the LLM share at `LLM_CREDIT_CAP_RATIO` of the total to prevent
/// LLM-only farming.
pub fn contribution_score(non_llm: f64, llm_raw: f64) -> f64 {
    let total_uncapped = non_llm + llm_raw;
    let llm_capped = if total_uncapped > 0.0 && llm_raw / total_uncapped > LLM_CREDIT_CAP_RATIO {
        non_llm * (LLM_CREDIT_CAP_RATIO / (1.0 - LLM_CREDIT_CAP_RATIO))
    } else {
        llm_raw
    };
    non_llm + llm_capped
}

// --- Postgres-backed ledger (C3) -------------------------------------------

#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
    peer_id: String,
    signing_key: Option<[u8; 32]>,
}

impl CreditLedger {
    pub async fn connect(url: &str, max_connections: u32, peer_id: impl Into<String>) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let ledger = Self {
            pool,
            peer_id: peer_id.into(),
            signing_key: None,
        };
        ledger.migrate().await?;
        Ok(ledger)
    }

    /// Attach an Ed25519 secret key so future `record_action` calls sign
    /// their entries, enabling P2P credit-proof verification.
    pub fn with_signing_key(mut self, secret_key: [u8; 32]) -> Self {
        self.signing_key = Some(secret_key);
        self
    }

    async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
        CREATE TABLE IF NOT EXISTS credit_entries(
            entry_id    BIGSERIAL PRIMARY KEY,
            action      TEXT NOT NULL,
            quantity    DOUBLE PRECISION NOT NULL,
            weight      DOUBLE PRECISION NOT NULL,
            multiplier  DOUBLE PRECISION NOT NULL DEFAULT 1.0,
            credits     DOUBLE PRECISION NOT NULL,
            timestamp   DOUBLE PRECISION NOT NULL,
            note        TEXT NOT NULL DEFAULT '',
            entry_hash  TEXT NOT NULL DEFAULT '',
            signature   TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_credit_entries_action ON credit_entries(action);
        CREATE INDEX IF NOT EXISTS idx_credit_entries_ts ON credit_entries(timestamp);

        CREATE TABLE IF NOT EXISTS credit_spending(
            spend_id    BIGSERIAL PRIMARY KEY,
            amount      DOUBLE PRECISION NOT NULL,
            reason      TEXT NOT NULL DEFAULT 'search',
            timestamp   DOUBLE PRECISION NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_credit_spending_ts ON credit_spending(timestamp);

        CREATE TABLE IF NOT EXISTS credit_grace(
            id          INTEGER PRIMARY KEY CHECK (id = 1),
            grace_start DOUBLE PRECISION
        );
        INSERT INTO credit_grace(id, grace_start) VALUES (1, NULL) ON CONFLICT (id) DO NOTHING;
        "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Earning ------------------------------------------------------

    pub async fn record_action(
        &self,
        action: Action,
        quantity: f64,
        off_peak: bool,
        note: &str,
    ) -> Result<CreditEntry, LedgerError> {
        if quantity <= 0.0 {
            return Err(LedgerError::InvalidArgument(format!(
                "quantity must be positive, got {quantity}"
            )));
        }

        let weight = action.weight();
        let multiplier = if off_peak && action.is_llm() {
            OFF_PEAK_MULTIPLIER
        } else {
            1.0
        };
        let credits = weight * quantity * multiplier;
        let ts = now();

        let canonical = canonical_entry_bytes(action, quantity, weight, multiplier, credits, ts, note);
        let entry_hash = content_hash(&canonical);
        let signature = match &self.signing_key {
            Some(sk) => Some(sign_hex(sk, &canonical)?),
            None => None,
        };

        let entry_id: i64 = sqlx::query(
            r#"INSERT INTO credit_entries
               (action, quantity, weight, multiplier, credits, timestamp, note, entry_hash, signature)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               RETURNING entry_id"#,
        )
        .bind(action.as_str())
        .bind(quantity)
        .bind(weight)
        .bind(multiplier)
        .bind(credits)
        .bind(ts)
        .bind(note)
        .bind(&entry_hash)
        .bind(&signature)
        .fetch_one(&self.pool)
        .await?
        .try_get("entry_id")?;

        if self.balance().await? > 0.0 {
            self.clear_grace().await?;
        }

        debug!(event = "credit_earned", action = action.as_str(), quantity, multiplier, credits);

        Ok(CreditEntry {
            entry_id,
            action,
            quantity,
            weight,
            multiplier,
            credits,
            timestamp: ts,
            note: note.to_string(),
            entry_hash,
            signature,
        })
    }

    // --- Spending -------------------------------------------------------

    /// Deduct credits. Always succeeds — debt is allowed. Runs at
    /// `SERIALIZABLE` isolation and takes a row lock on the grace cell
    /// (`SELECT … FOR UPDATE`) so the grace-start write can never race a
    /// concurrent spend's read of the same balance/grace state.
    pub async fn spend(&self, amount: f64, reason: &str) -> Result<SpendingEntry, LedgerError> {
        if amount <= 0.0 {
            return Err(LedgerError::InvalidArgument(format!(
                "amount must be positive, got {amount}"
            )));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        let ts = now();

        let spend_id: i64 = sqlx::query(
            "INSERT INTO credit_spending(amount, reason, timestamp) VALUES ($1, $2, $3) RETURNING spend_id",
        )
        .bind(amount)
        .bind(reason)
        .bind(ts)
        .fetch_one(&mut *tx)
        .await?
        .try_get("spend_id")?;

        let earned: f64 = sqlx::query("SELECT COALESCE(SUM(credits), 0) AS s FROM credit_entries")
            .fetch_one(&mut *tx)
            .await?
            .try_get("s")?;
        let spent: f64 = sqlx::query("SELECT COALESCE(SUM(amount), 0) AS s FROM credit_spending")
            .fetch_one(&mut *tx)
            .await?
            .try_get("s")?;
        let new_balance = earned - spent;

        if new_balance <= 0.0 {
            // FOR UPDATE takes a row lock on the singleton grace cell so a
            // concurrent spend cannot read the same NULL grace_start and
            // both race to set it — the TOCTOU spec.md §4.3/§5 calls out.
            let existing: Option<f64> = sqlx::query("SELECT grace_start FROM credit_grace WHERE id = 1 FOR UPDATE")
                .fetch_one(&mut *tx)
                .await?
                .try_get("grace_start")?;
            if existing.is_none() {
                sqlx::query("UPDATE credit_grace SET grace_start = $1 WHERE id = 1")
                    .bind(ts)
                    .execute(&mut *tx)
                    .await?;
                info!(event = "grace_period_started", balance = new_balance);
            }
        }

        tx.commit().await?;
        debug!(event = "credit_spent", amount, reason, balance = new_balance);

        Ok(SpendingEntry { spend_id, amount, reason: reason.to_string(), timestamp: ts })
    }

    // --- Queries ----------------------------------------------------------

    pub async fn total_earned(&self) -> Result<f64, LedgerError> {
        let row = sqlx::query("SELECT COALESCE(SUM(credits), 0) AS s FROM credit_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("s")?)
    }

    pub async fn total_spent(&self) -> Result<f64, LedgerError> {
        let row = sqlx::query("SELECT COALESCE(SUM(amount), 0) AS s FROM credit_spending")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("s")?)
    }

    pub async fn balance(&self) -> Result<f64, LedgerError> {
        Ok(self.total_earned().await? - self.total_spent().await?)
    }

    async fn grace_start(&self) -> Result<Option<f64>, LedgerError> {
        let row = sqlx::query("SELECT grace_start FROM credit_grace WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("grace_start")?)
    }

    async fn clear_grace(&self) -> Result<(), LedgerError> {
        let existing = self.grace_start().await?;
        if existing.is_some() {
            sqlx::query("UPDATE credit_grace SET grace_start = NULL WHERE id = 1")
                .execute(&self.pool)
                .await?;
            info!(event = "grace_period_resolved", msg = "balance restored to positive");
        }
        Ok(())
    }

    pub async fn credit_state(&self) -> Result<CreditState, LedgerError> {
        let balance = self.balance().await?;
        if balance > 0.0 {
            self.clear_grace().await?;
            return Ok(CreditState::Normal);
        }
        Ok(credit_state(balance, self.grace_start().await?, now()))
    }

    pub async fn grace_remaining_hours(&self) -> Result<Option<f64>, LedgerError> {
        let balance = self.balance().await?;
        Ok(grace_remaining_hours(balance, self.grace_start().await?, now()))
    }

    async fn llm_non_llm_totals(&self) -> Result<(f64, f64), LedgerError> {
        let llm: f64 = sqlx::query(
            "SELECT COALESCE(SUM(credits), 0) AS s FROM credit_entries WHERE action IN ($1, $2)",
        )
        .bind(Action::LlmOwn.as_str())
        .bind(Action::LlmPeer.as_str())
        .fetch_one(&self.pool)
        .await?
        .try_get("s")?;
        let non_llm: f64 = sqlx::query(
            "SELECT COALESCE(SUM(credits), 0) AS s FROM credit_entries WHERE action NOT IN ($1, $2)",
        )
        .bind(Action::LlmOwn.as_str())
        .bind(Action::LlmPeer.as_str())
        .fetch_one(&self.pool)
        .await?
        .try_get("s")?;
        Ok((non_llm, llm))
    }

    pub async fn contribution_score(&self) -> Result<f64, LedgerError> {
        let (non_llm, llm) = self.llm_non_llm_totals().await?;
        Ok(contribution_score(non_llm, llm))
    }

    pub async fn tier(&self) -> Result<ContributionTier, LedgerError> {
        Ok(tier_for_score(self.contribution_score().await?).0)
    }

    pub async fn search_cost(&self) -> Result<f64, LedgerError> {
        Ok(tier_for_score(self.contribution_score().await?).1)
    }

    pub async fn search_allowance(&self) -> Result<SearchAllowance, LedgerError> {
        let balance = self.balance().await?;
        let base_cost = self.search_cost().await?;
        Ok(search_allowance(balance, self.grace_start().await?, base_cost, now()))
    }

    pub async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let (non_llm, llm) = self.llm_non_llm_totals().await?;
        let earned = self.total_earned().await?;
        let spent = self.total_spent().await?;
        let score = contribution_score(non_llm, llm);
        let tier = tier_for_score(score).0;
        let allowance = self.search_allowance().await?;
        Ok(LedgerStats {
            total_earned: earned,
            total_spent: spent,
            balance: earned - spent,
            contribution_score: score,
            tier,
            search_cost: allowance.search_cost,
            llm_credits: llm,
            non_llm_credits: non_llm,
            credit_state: allowance.state,
            grace_remaining_hours: allowance.grace_remaining_hours,
            debt_amount: allowance.debt_amount,
        })
    }

    pub async fn recent_entries(&self, limit: i64) -> Result<Vec<CreditEntry>, LedgerError> {
        let rows = sqlx::query(
            r#"SELECT entry_id, action, quantity, weight, multiplier, credits, timestamp, note, entry_hash, signature
               FROM credit_entries ORDER BY timestamp DESC LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    /// All entries carrying a signature, in chronological order — the
    /// input to the Merkle credit-proof builder.
    pub async fn signed_entries(&self) -> Result<Vec<CreditEntry>, LedgerError> {
        let rows = sqlx::query(
            r#"SELECT entry_id, action, quantity, weight, multiplier, credits, timestamp, note, entry_hash, signature
               FROM credit_entries
               WHERE entry_hash != '' AND signature IS NOT NULL
               ORDER BY timestamp ASC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    pub async fn earnings_by_action(&self) -> Result<std::collections::HashMap<Action, f64>, LedgerError> {
        let rows = sqlx::query("SELECT action, COALESCE(SUM(credits), 0) AS s FROM credit_entries GROUP BY action")
            .fetch_all(&self.pool)
            .await?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            let action_str: String = row.try_get("action")?;
            let sum: f64 = row.try_get("s")?;
            if let Some(action) = Action::parse(&action_str) {
                out.insert(action, sum);
            }
        }
        Ok(out)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<CreditEntry, LedgerError> {
    let action_str: String = row.try_get("action")?;
    let action = Action::parse(&action_str)
        .ok_or_else(|| LedgerError::InvalidArgument(format!("unknown action in storage: {action_str}")))?;
    Ok(CreditEntry {
        entry_id: row.try_get("entry_id")?,
        action,
        quantity: row.try_get("quantity")?,
        weight: row.try_get("weight")?,
        multiplier: row.try_get("multiplier")?,
        credits: row.try_get("credits")?,
        timestamp: row.try_get("timestamp")?,
        note: row.try_get("note")?,
        entry_hash: row.try_get("entry_hash")?,
        signature: row.try_get("signature")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_state_when_balance_positive() {
        assert_eq!(credit_state(5.0, None, 1000.0), CreditState::Normal);
    }

    #[test]
    fn normal_state_at_exact_zero_without_grace_start() {
        assert_eq!(credit_state(0.0, None, 1000.0), CreditState::Normal);
    }

    #[test]
    fn grace_within_window() {
        let start = 1000.0;
        let inside = start + 71.0 * 3600.0;
        assert_eq!(credit_state(-1.0, Some(start), inside), CreditState::Grace);
    }

    #[test]
    fn debt_after_grace_window_expires() {
        let start = 1000.0;
        let after = start + 73.0 * 3600.0;
        assert_eq!(credit_state(-1.0, Some(start), after), CreditState::Debt);
    }

    #[test]
    fn debt_search_cost_doubles() {
        let allowance = search_allowance(-10.0, Some(0.0), 0.1, 73.0 * 3600.0);
        assert_eq!(allowance.state, CreditState::Debt);
        assert_eq!(allowance.search_cost, 0.1 * DEBT_COST_MULTIPLIER);
    }

    #[test]
    fn grace_remaining_hours_counts_down() {
        let start = 0.0;
        let remaining = grace_remaining_hours(-1.0, Some(start), 3600.0).unwrap();
        assert!((remaining - 71.0).abs() < 1e-9);
    }

    #[test]
    fn debt_amount_is_never_negative() {
        assert_eq!(debt_amount(10.0), 0.0);
        assert_eq!(debt_amount(-10.0), 10.0);
    }

    #[test]
    fn llm_credits_capped_at_60_percent() {
        // 100 non-LLM, 1000 raw LLM — far over the cap.
        let score = contribution_score(100.0, 1000.0);
        // capped = 100 * (0.6/0.4) = 150; score = 100 + 150 = 250
        assert!((score - 250.0).abs() < 1e-9);
    }

    #[test]
    fn llm_credits_uncapped_below_ratio() {
        let score = contribution_score(100.0, 10.0);
        assert!((score - 110.0).abs() < 1e-9);
    }

    #[tokio::test]
    #[ignore]
    async fn record_and_spend_round_trip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL for test");
        let ledger = CreditLedger::connect(&url, 5, "test-peer").await.unwrap();
        ledger.record_action(Action::Crawl, 10.0, false, "").await.unwrap();
        assert_eq!(ledger.balance().await.unwrap(), 10.0);
        ledger.spend(3.0, "search").await.unwrap();
        assert_eq!(ledger.balance().await.unwrap(), 7.0);
        assert_eq!(ledger.credit_state().await.unwrap(), CreditState::Normal);
    }
}
