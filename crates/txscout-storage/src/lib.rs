//! Scraper definition persistence, watermarks and the tenant-domain API client.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use txscout_core::{OutboundTransaction, ParameterValue, ScraperDefinition, ScraperDraft, TransactionStats};
use uuid::Uuid;

pub const CRATE_NAME: &str = "txscout-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("scraper {scraper_id} not found for tenant {tenant_id}")]
    ScraperNotFound { tenant_id: String, scraper_id: Uuid },
    #[error("watermark for scraper {scraper_id} cannot move back from {current} to {requested}")]
    WatermarkRegression {
        scraper_id: Uuid,
        current: NaiveDate,
        requested: NaiveDate,
    },
    #[error("tenant {0} still owns scrapers")]
    TenantInUse(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Persistence for scraper definitions and the tenants that own them.
#[async_trait]
pub trait ScraperRepository: Send + Sync {
    /// Inserts when `draft.id` is empty, otherwise updates in place keyed on tenant + id.
    async fn upsert(&self, draft: &ScraperDraft) -> Result<ScraperDefinition, StorageError>;

    async fn get(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<ScraperDefinition>, StorageError>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<ScraperDefinition>, StorageError>;

    /// Returns `false` when no row matched.
    async fn delete(&self, tenant_id: &str, scraper_id: Uuid) -> Result<bool, StorageError>;

    /// Removes the tenant row; callers delete its scrapers first.
    async fn delete_tenant(&self, tenant_id: &str) -> Result<bool, StorageError>;
}

/// Last date through which a scraper's data has been durably imported.
///
/// Implementations refuse to move a watermark backwards.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn last_scraped_date(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<NaiveDate>, StorageError>;

    async fn set_last_scraped_date(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        date: NaiveDate,
    ) -> Result<(), StorageError>;
}

/// Tenant-domain API surface consumed by the sync engine.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    async fn transaction_stats(&self, tenant_id: &str) -> Result<TransactionStats, StorageError>;

    async fn submit_transaction(&self, tenant_id: &str, transaction: &OutboundTransaction) -> Result<(), StorageError>;
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running database migrations")
}

#[derive(sqlx::FromRow)]
struct ScraperRow {
    id: Uuid,
    tenant_id: String,
    display_name: String,
    scraper_type_id: String,
    parameters: Json<Vec<ParameterValue>>,
    last_successful_scraped_date: Option<NaiveDate>,
}

impl From<ScraperRow> for ScraperDefinition {
    fn from(row: ScraperRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            display_name: row.display_name,
            scraper_type_id: row.scraper_type_id,
            parameters: row.parameters.0,
            last_successful_scraped_date: row.last_successful_scraped_date,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgScraperRepository {
    pool: PgPool,
}

impl PgScraperRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScraperRepository for PgScraperRepository {
    async fn upsert(&self, draft: &ScraperDraft) -> Result<ScraperDefinition, StorageError> {
        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tenants (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(&draft.tenant_id)
            .execute(&mut *tx)
            .await?;

        let row: Option<ScraperRow> = sqlx::query_as(
            r#"
            INSERT INTO scrapers (id, tenant_id, display_name, scraper_type_id, parameters)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
               SET display_name = EXCLUDED.display_name,
                   scraper_type_id = EXCLUDED.scraper_type_id,
                   parameters = EXCLUDED.parameters,
                   updated_at = NOW()
             WHERE scrapers.tenant_id = EXCLUDED.tenant_id
            RETURNING id, tenant_id, display_name, scraper_type_id, parameters, last_successful_scraped_date
            "#,
        )
        .bind(id)
        .bind(&draft.tenant_id)
        .bind(&draft.display_name)
        .bind(&draft.scraper_type_id)
        .bind(Json(&draft.parameters))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // The id exists under another tenant.
            return Err(StorageError::ScraperNotFound {
                tenant_id: draft.tenant_id.clone(),
                scraper_id: id,
            });
        };
        tx.commit().await?;
        Ok(row.into())
    }

    async fn get(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<ScraperDefinition>, StorageError> {
        let row: Option<ScraperRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, display_name, scraper_type_id, parameters, last_successful_scraped_date
              FROM scrapers
             WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(scraper_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<ScraperDefinition>, StorageError> {
        let rows: Vec<ScraperRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, display_name, scraper_type_id, parameters, last_successful_scraped_date
              FROM scrapers
             WHERE tenant_id = $1
             ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete(&self, tenant_id: &str, scraper_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM scrapers WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id)
            .bind(scraper_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WatermarkStore for PgScraperRepository {
    async fn last_scraped_date(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<NaiveDate>, StorageError> {
        let row: Option<(Option<NaiveDate>,)> = sqlx::query_as(
            "SELECT last_successful_scraped_date FROM scrapers WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(scraper_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((date,)) => Ok(date),
            None => Err(StorageError::ScraperNotFound {
                tenant_id: tenant_id.to_string(),
                scraper_id,
            }),
        }
    }

    async fn set_last_scraped_date(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        date: NaiveDate,
    ) -> Result<(), StorageError> {
        let updated = sqlx::query(
            r#"
            UPDATE scrapers
               SET last_successful_scraped_date = $3,
                   updated_at = NOW()
             WHERE tenant_id = $1
               AND id = $2
               AND (last_successful_scraped_date IS NULL OR last_successful_scraped_date <= $3)
            "#,
        )
        .bind(tenant_id)
        .bind(scraper_id)
        .bind(date)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }
        match self.last_scraped_date(tenant_id, scraper_id).await? {
            Some(current) => Err(StorageError::WatermarkRegression {
                scraper_id,
                current,
                requested: date,
            }),
            None => Err(StorageError::ScraperNotFound {
                tenant_id: tenant_id.to_string(),
                scraper_id,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tenants: BTreeSet<String>,
    scrapers: BTreeMap<Uuid, ScraperDefinition>,
}

/// Process-local repository used by tests and single-node development.
#[derive(Debug, Default)]
pub struct InMemoryScraperRepository {
    state: Mutex<MemoryState>,
}

impl InMemoryScraperRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tenant_exists(&self, tenant_id: &str) -> bool {
        self.state.lock().await.tenants.contains(tenant_id)
    }
}

fn not_found(tenant_id: &str, scraper_id: Uuid) -> StorageError {
    StorageError::ScraperNotFound {
        tenant_id: tenant_id.to_string(),
        scraper_id,
    }
}

#[async_trait]
impl ScraperRepository for InMemoryScraperRepository {
    async fn upsert(&self, draft: &ScraperDraft) -> Result<ScraperDefinition, StorageError> {
        let mut state = self.state.lock().await;
        let id = draft.id.unwrap_or_else(Uuid::new_v4);
        let previous = state.scrapers.get(&id).cloned();
        if let Some(existing) = &previous {
            if existing.tenant_id != draft.tenant_id {
                return Err(not_found(&draft.tenant_id, id));
            }
        }

        let definition = ScraperDefinition {
            id,
            tenant_id: draft.tenant_id.clone(),
            display_name: draft.display_name.clone(),
            scraper_type_id: draft.scraper_type_id.clone(),
            parameters: draft.parameters.clone(),
            last_successful_scraped_date: previous.and_then(|p| p.last_successful_scraped_date),
        };
        state.tenants.insert(draft.tenant_id.clone());
        state.scrapers.insert(id, definition.clone());
        Ok(definition)
    }

    async fn get(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<ScraperDefinition>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .scrapers
            .get(&scraper_id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<ScraperDefinition>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .scrapers
            .values()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, tenant_id: &str, scraper_id: Uuid) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        let owned = state
            .scrapers
            .get(&scraper_id)
            .is_some_and(|d| d.tenant_id == tenant_id);
        if owned {
            state.scrapers.remove(&scraper_id);
        }
        Ok(owned)
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        if state.scrapers.values().any(|d| d.tenant_id == tenant_id) {
            return Err(StorageError::TenantInUse(tenant_id.to_string()));
        }
        Ok(state.tenants.remove(tenant_id))
    }
}

#[async_trait]
impl WatermarkStore for InMemoryScraperRepository {
    async fn last_scraped_date(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<NaiveDate>, StorageError> {
        let state = self.state.lock().await;
        state
            .scrapers
            .get(&scraper_id)
            .filter(|d| d.tenant_id == tenant_id)
            .map(|d| d.last_successful_scraped_date)
            .ok_or_else(|| not_found(tenant_id, scraper_id))
    }

    async fn set_last_scraped_date(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        date: NaiveDate,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let definition = state
            .scrapers
            .get_mut(&scraper_id)
            .filter(|d| d.tenant_id == tenant_id)
            .ok_or_else(|| not_found(tenant_id, scraper_id))?;
        if let Some(current) = definition.last_successful_scraped_date {
            if current > date {
                return Err(StorageError::WatermarkRegression {
                    scraper_id,
                    current,
                    requested: date,
                });
            }
        }
        definition.last_successful_scraped_date = Some(date);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LedgerClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl LedgerClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkBody {
    pub date: Option<NaiveDate>,
}

/// JSON client for the tenant-domain API.
///
/// Submissions are never retried: a transaction that may have been accepted
/// must not be posted twice.
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpLedgerClient {
    pub fn new(config: LedgerClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    pub fn transactions_url(&self, tenant_id: &str) -> String {
        format!("{}/tenants/{tenant_id}/transactions", self.base_url)
    }

    pub fn watermark_url(&self, tenant_id: &str, scraper_id: Uuid) -> String {
        format!(
            "{}/tenants/{tenant_id}/scrapers/{scraper_id}/last-scraped-date",
            self.base_url
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(StorageError::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
        })
    }
}

#[async_trait]
impl LedgerApi for HttpLedgerClient {
    async fn transaction_stats(&self, tenant_id: &str) -> Result<TransactionStats, StorageError> {
        let url = format!("{}/stats", self.transactions_url(tenant_id));
        let response = self.authorize(self.client.get(&url)).send().await?;
        Ok(Self::checked(response).await?.json().await?)
    }

    async fn submit_transaction(&self, tenant_id: &str, transaction: &OutboundTransaction) -> Result<(), StorageError> {
        let url = self.transactions_url(tenant_id);
        let span = info_span!("submit_transaction", tenant_id, reference_id = %transaction.reference_id, sequence = transaction.sequence);
        async {
            let response = self
                .authorize(self.client.post(&url))
                .json(transaction)
                .send()
                .await?;
            Self::checked(response).await?;
            debug!("transaction accepted");
            Ok::<(), StorageError>(())
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl WatermarkStore for HttpLedgerClient {
    async fn last_scraped_date(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<NaiveDate>, StorageError> {
        let url = self.watermark_url(tenant_id, scraper_id);
        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(not_found(tenant_id, scraper_id));
        }
        let body: WatermarkBody = Self::checked(response).await?.json().await?;
        Ok(body.date)
    }

    async fn set_last_scraped_date(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        date: NaiveDate,
    ) -> Result<(), StorageError> {
        let url = self.watermark_url(tenant_id, scraper_id);
        let response = self
            .authorize(self.client.put(&url))
            .json(&WatermarkBody { date: Some(date) })
            .send()
            .await?;
        Self::checked(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txscout_core::ParameterValue;

    fn draft(tenant_id: &str, id: Option<Uuid>) -> ScraperDraft {
        ScraperDraft {
            tenant_id: tenant_id.into(),
            id,
            scraper_type_id: "fixture-ledger".into(),
            display_name: "Checking".into(),
            parameters: vec![ParameterValue::new("account", "acc-1")],
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_in_place() {
        let repo = InMemoryScraperRepository::new();
        let created = repo.upsert(&draft("t1", None)).await.unwrap();
        assert!(repo.tenant_exists("t1").await);

        let mut update = draft("t1", Some(created.id));
        update.display_name = "Savings".into();
        let updated = repo.upsert(&update).await.unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(repo.list("t1").await.unwrap().len(), 1);
        assert_eq!(repo.get("t1", created.id).await.unwrap().unwrap().display_name, "Savings");
    }

    #[tokio::test]
    async fn upsert_refuses_other_tenants_scraper() {
        let repo = InMemoryScraperRepository::new();
        let created = repo.upsert(&draft("t1", None)).await.unwrap();
        let err = repo.upsert(&draft("t2", Some(created.id))).await.unwrap_err();
        assert!(matches!(err, StorageError::ScraperNotFound { .. }));
        assert!(repo.get("t2", created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watermark_moves_forward_only() {
        let repo = InMemoryScraperRepository::new();
        let created = repo.upsert(&draft("t1", None)).await.unwrap();
        assert_eq!(repo.last_scraped_date("t1", created.id).await.unwrap(), None);

        repo.set_last_scraped_date("t1", created.id, day(10)).await.unwrap();
        repo.set_last_scraped_date("t1", created.id, day(10)).await.unwrap();
        let err = repo
            .set_last_scraped_date("t1", created.id, day(9))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::WatermarkRegression { current, .. } if current == day(10)));
        assert_eq!(repo.last_scraped_date("t1", created.id).await.unwrap(), Some(day(10)));
    }

    #[tokio::test]
    async fn watermark_survives_definition_update() {
        let repo = InMemoryScraperRepository::new();
        let created = repo.upsert(&draft("t1", None)).await.unwrap();
        repo.set_last_scraped_date("t1", created.id, day(3)).await.unwrap();
        let updated = repo.upsert(&draft("t1", Some(created.id))).await.unwrap();
        assert_eq!(updated.last_successful_scraped_date, Some(day(3)));
    }

    #[tokio::test]
    async fn tenant_row_outlives_nothing_it_owns() {
        let repo = InMemoryScraperRepository::new();
        let created = repo.upsert(&draft("t1", None)).await.unwrap();
        assert!(matches!(repo.delete_tenant("t1").await, Err(StorageError::TenantInUse(_))));
        assert!(repo.delete("t1", created.id).await.unwrap());
        assert!(!repo.delete("t1", created.id).await.unwrap());
        assert!(repo.delete_tenant("t1").await.unwrap());
    }

    #[test]
    fn ledger_client_builds_tenant_scoped_urls() {
        let client = HttpLedgerClient::new(LedgerClientConfig::new("http://ledger.local/api/")).unwrap();
        let id = Uuid::nil();
        assert_eq!(client.transactions_url("t1"), "http://ledger.local/api/tenants/t1/transactions");
        assert_eq!(
            client.watermark_url("t1", id),
            format!("http://ledger.local/api/tenants/t1/scrapers/{id}/last-scraped-date")
        );
    }
}
