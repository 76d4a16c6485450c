//! Incremental synchronization run executed inside one execution unit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Days, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use txscout_adapters::{row_source_for_type, AdapterError, RowSource, SourceParams};
use txscout_core::{
    DateWindow, OutboundTransaction, RawTransactionRow, ACCOUNT_PARAMETER_ID, ENV_LEDGER_API_URL,
    ENV_PARAM_PREFIX, ENV_RUN_DEADLINE_SECS, ENV_SCRAPER_ID, ENV_SCRAPER_TYPE_ID, ENV_TENANT_ID,
    INITIALIZATION_REFERENCE_ID,
};
use txscout_storage::{HttpLedgerClient, LedgerApi, LedgerClientConfig, StorageError, WatermarkStore};
use uuid::Uuid;

pub const CRATE_NAME: &str = "txscout-sync";

/// How far back the first run of a scraper reaches.
pub const INITIAL_LOOKBACK_MONTHS: u32 = 6;

/// The synthetic opening-balance row is dated this many days before the first real row.
pub const INITIALIZATION_LEAD_DAYS: u64 = 7;

pub const DEFAULT_RUN_DEADLINE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("login failed: {0}")]
    Authentication(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("row {reference_id} has {reason}")]
    InvalidRow { reference_id: String, reason: &'static str },
    #[error("row {reference_id} carries no balance")]
    MissingBalance { reference_id: String },
    #[error("balance mismatch at row {reference_id}: previous row left {expected}, row implies {found}")]
    Reconciliation {
        reference_id: String,
        expected: Decimal,
        found: Decimal,
    },
    #[error("transaction {reference_id} has no positive amount")]
    MissingAmount { reference_id: String },
    #[error("submitting transaction {reference_id} (sequence {sequence}) failed: {source}")]
    Submission {
        reference_id: String,
        sequence: u32,
        #[source]
        source: StorageError,
    },
    #[error("reading tenant ledger failed: {0}")]
    Ledger(#[source] StorageError),
    #[error("watermark update failed: {0}")]
    Watermark(#[source] StorageError),
    #[error("run exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Authentication(msg) => SyncError::Authentication(msg),
            other => SyncError::Navigation(other.to_string()),
        }
    }
}

/// Progress of one run; a failure at any step leaves the watermark untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Idle,
    RangeSelected,
    RowsCollected,
    Reconciled,
    Submitted,
    WatermarkAdvanced,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Idle => "idle",
            SyncStage::RangeSelected => "range_selected",
            SyncStage::RowsCollected => "rows_collected",
            SyncStage::Reconciled => "reconciled",
            SyncStage::Submitted => "submitted",
            SyncStage::WatermarkAdvanced => "watermark_advanced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub window: Option<DateWindow>,
    pub submitted: usize,
    pub bootstrapped: bool,
    pub watermark: Option<NaiveDate>,
}

fn end_of_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .unwrap_or(date)
}

/// Next date window to scrape, or `None` when the scraper is already caught up.
///
/// Never reaches today: the current day is still settling on most sites.
pub fn select_window(watermark: Option<NaiveDate>, today: NaiveDate) -> Option<DateWindow> {
    let yesterday = today.pred_opt()?;
    let start = match watermark {
        Some(w) if w >= yesterday => return None,
        Some(w) => w.succ_opt()?,
        None => today
            .checked_sub_months(Months::new(INITIAL_LOOKBACK_MONTHS))?
            .checked_add_days(Days::new(1))?,
    };
    let end = end_of_month(start).min(yesterday);
    (start <= end).then_some(DateWindow { start, end })
}

/// Checks every account-level row and the balance chain between them.
///
/// Rows must be chronological. Returns the balance before the first row.
pub fn reconcile(rows: &[RawTransactionRow]) -> Result<Option<Decimal>, SyncError> {
    let mut opening = None;
    let mut previous_after: Option<Decimal> = None;

    for row in rows {
        let reason = match (row.debit, row.credit) {
            (None, None) => Some("neither debit nor credit"),
            (Some(_), Some(_)) => Some("both debit and credit"),
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(SyncError::InvalidRow {
                reference_id: row.reference_id.clone(),
                reason,
            });
        }

        let after = row.balance_after.ok_or_else(|| SyncError::MissingBalance {
            reference_id: row.reference_id.clone(),
        })?;
        let before = row.balance_before().ok_or_else(|| SyncError::MissingBalance {
            reference_id: row.reference_id.clone(),
        })?;

        match previous_after {
            Some(expected) if expected != before => {
                return Err(SyncError::Reconciliation {
                    reference_id: row.reference_id.clone(),
                    expected,
                    found: before,
                });
            }
            Some(_) => {}
            None => opening = Some(before),
        }
        previous_after = Some(after);
    }

    Ok(opening)
}

/// Opening-balance row for a tenant's first import.
///
/// A zero balance yields a row with neither side set, which submission rejects.
pub fn initialization_row(first: &RawTransactionRow, opening_balance: Decimal) -> RawTransactionRow {
    let amount = opening_balance.abs();
    let (debit, credit) = if opening_balance.is_sign_negative() && !opening_balance.is_zero() {
        (Some(amount), None)
    } else if opening_balance > Decimal::ZERO {
        (None, Some(amount))
    } else {
        (None, None)
    };
    RawTransactionRow {
        date: first
            .date
            .checked_sub_days(Days::new(INITIALIZATION_LEAD_DAYS))
            .unwrap_or(first.date),
        reference_id: INITIALIZATION_REFERENCE_ID.to_string(),
        description: "Initial balance".to_string(),
        debit,
        credit,
        balance_after: Some(opening_balance),
        compound: false,
    }
}

/// Stable date ordering plus zero-based sequence numbers.
pub fn build_batch(
    mut rows: Vec<RawTransactionRow>,
    account_id: &str,
) -> Result<Vec<OutboundTransaction>, SyncError> {
    rows.sort_by_key(|row| row.date);
    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| {
            let amount = row
                .amount()
                .filter(|amount| *amount > Decimal::ZERO)
                .ok_or_else(|| SyncError::MissingAmount {
                    reference_id: row.reference_id.clone(),
                })?;
            let is_debit = row.debit.is_some();
            Ok(OutboundTransaction {
                date: row.date,
                reference_id: row.reference_id,
                description: row.description,
                amount,
                sequence: idx as u32,
                source_account_id: is_debit.then(|| account_id.to_string()),
                target_account_id: (!is_debit).then(|| account_id.to_string()),
            })
        })
        .collect()
}

pub struct SyncEngine {
    tenant_id: String,
    scraper_id: Uuid,
    account_id: String,
    source: Box<dyn RowSource>,
    ledger: Arc<dyn LedgerApi>,
    watermarks: Arc<dyn WatermarkStore>,
    stage: SyncStage,
}

impl SyncEngine {
    pub fn new(
        tenant_id: impl Into<String>,
        scraper_id: Uuid,
        account_id: impl Into<String>,
        source: Box<dyn RowSource>,
        ledger: Arc<dyn LedgerApi>,
        watermarks: Arc<dyn WatermarkStore>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            scraper_id,
            account_id: account_id.into(),
            source,
            ledger,
            watermarks,
            stage: SyncStage::Idle,
        }
    }

    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    fn advance(&mut self, stage: SyncStage) {
        info!(from = %self.stage, to = %stage, "sync stage");
        self.stage = stage;
    }

    pub async fn run(&mut self, today: NaiveDate) -> Result<SyncOutcome, SyncError> {
        let span = info_span!("sync_run", tenant_id = %self.tenant_id, scraper_id = %self.scraper_id);
        self.run_inner(today).instrument(span).await
    }

    async fn run_inner(&mut self, today: NaiveDate) -> Result<SyncOutcome, SyncError> {
        let current = self
            .watermarks
            .last_scraped_date(&self.tenant_id, self.scraper_id)
            .await
            .map_err(SyncError::Watermark)?;

        let Some(window) = select_window(current, today) else {
            info!(watermark = ?current, "already caught up");
            return Ok(SyncOutcome {
                window: None,
                submitted: 0,
                bootstrapped: false,
                watermark: current,
            });
        };
        self.advance(SyncStage::RangeSelected);
        info!(start = %window.start, end = %window.end, "scraping window");

        self.source.authenticate().await?;
        self.source.set_range(window);
        let mut rows = self.source.list_rows().await?;
        rows.reverse();
        self.advance(SyncStage::RowsCollected);
        info!(rows = rows.len(), "rows collected");

        let opening = reconcile(&rows)?;
        let latest_row = rows.last().map(|row| row.date);
        self.advance(SyncStage::Reconciled);

        let mut batch = Vec::with_capacity(rows.len() + 1);
        let mut bootstrapped = false;
        if let (Some(first), Some(opening)) = (rows.first(), opening) {
            let stats = self
                .ledger
                .transaction_stats(&self.tenant_id)
                .await
                .map_err(SyncError::Ledger)?;
            if stats.count == 0 {
                info!(%opening, "first import, adding opening balance");
                batch.push(initialization_row(first, opening));
                bootstrapped = true;
            }
        }

        for row in rows {
            if !self.source.is_compound(&row) {
                batch.push(row);
                continue;
            }
            let children = self.source.expand(&row).await?;
            if children.is_empty() {
                return Err(SyncError::Navigation(format!(
                    "aggregate row {} has no sub-rows",
                    row.reference_id
                )));
            }
            for (idx, mut child) in children.into_iter().enumerate() {
                child.reference_id = format!("{}/{}", row.reference_id, idx + 1);
                batch.push(child);
            }
        }

        let transactions = build_batch(batch, &self.account_id)?;
        for transaction in &transactions {
            self.ledger
                .submit_transaction(&self.tenant_id, transaction)
                .await
                .map_err(|source| SyncError::Submission {
                    reference_id: transaction.reference_id.clone(),
                    sequence: transaction.sequence,
                    source,
                })?;
        }
        self.advance(SyncStage::Submitted);

        // Sub-rows can predate their aggregate; the aggregate's own date must
        // not be collected again.
        let next = transactions
            .last()
            .map(|t| t.date)
            .max(latest_row)
            .unwrap_or(window.end);
        if current.is_some_and(|c| next < c) {
            warn!(%next, "batch ends before current watermark, keeping it");
        } else {
            self.watermarks
                .set_last_scraped_date(&self.tenant_id, self.scraper_id, next)
                .await
                .map_err(SyncError::Watermark)?;
        }
        self.advance(SyncStage::WatermarkAdvanced);

        let watermark = Some(current.map_or(next, |c| c.max(next)));
        info!(submitted = transactions.len(), ?watermark, "sync complete");
        Ok(SyncOutcome {
            window: Some(window),
            submitted: transactions.len(),
            bootstrapped,
            watermark,
        })
    }
}

/// Configuration an execution unit receives through its environment.
#[derive(Debug, Clone)]
pub struct RunEnvironment {
    pub tenant_id: String,
    pub scraper_id: Uuid,
    pub scraper_type_id: String,
    pub ledger_api_url: String,
    pub ledger_api_token: Option<String>,
    pub deadline: Duration,
    pub params: HashMap<String, String>,
}

impl RunEnvironment {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let require = |name: &str| {
            vars.get(name)
                .cloned()
                .with_context(|| format!("missing environment variable {name}"))
        };

        let scraper_id = require(ENV_SCRAPER_ID)?;
        let deadline = match vars.get(ENV_RUN_DEADLINE_SECS) {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("parsing {ENV_RUN_DEADLINE_SECS}={raw}"))?,
            ),
            None => DEFAULT_RUN_DEADLINE,
        };
        let params = vars
            .iter()
            .filter(|(name, _)| name.starts_with(ENV_PARAM_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Self {
            tenant_id: require(ENV_TENANT_ID)?,
            scraper_id: Uuid::parse_str(&scraper_id)
                .with_context(|| format!("parsing {ENV_SCRAPER_ID}={scraper_id}"))?,
            scraper_type_id: require(ENV_SCRAPER_TYPE_ID)?,
            ledger_api_url: require(ENV_LEDGER_API_URL)?,
            ledger_api_token: vars.get("LEDGER_API_TOKEN").cloned(),
            deadline,
            params,
        })
    }
}

/// Entry point of an execution unit: one sync pass bounded by the run deadline.
pub async fn run_from_env() -> Result<SyncOutcome> {
    let env = RunEnvironment::from_env()?;
    let params = SourceParams::from_env_map(env.params.clone());
    let account_id = params
        .require(ACCOUNT_PARAMETER_ID)
        .context("scraper has no target account")?
        .to_string();
    let source = row_source_for_type(&env.scraper_type_id, &params)?;

    let client = Arc::new(HttpLedgerClient::new(LedgerClientConfig {
        token: env.ledger_api_token.clone(),
        ..LedgerClientConfig::new(env.ledger_api_url.clone())
    })?);
    let mut engine = SyncEngine::new(
        env.tenant_id.clone(),
        env.scraper_id,
        account_id,
        source,
        client.clone(),
        client,
    );

    let today = Utc::now().date_naive();
    Ok(run_with_deadline(&mut engine, today, env.deadline).await?)
}

/// One sync pass that is abandoned once `deadline` elapses; the watermark is
/// only written at the very end, so an abandoned pass leaves it unchanged.
pub async fn run_with_deadline(
    engine: &mut SyncEngine,
    today: NaiveDate,
    deadline: Duration,
) -> Result<SyncOutcome, SyncError> {
    let finished = tokio::time::timeout(deadline, engine.run(today)).await;
    match finished {
        Ok(result) => result,
        Err(_) => {
            warn!(stage = %engine.stage(), ?deadline, "run deadline exceeded");
            Err(SyncError::DeadlineExceeded(deadline))
        }
    }
}
