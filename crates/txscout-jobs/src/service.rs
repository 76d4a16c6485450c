use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use txscout_core::{ScraperDefinition, ScraperDraft, ScraperType, ScraperTypeCatalog, ValidationError};
use txscout_storage::{ScraperRepository, StorageError, WatermarkStore};
use uuid::Uuid;

use crate::cluster::{ClusterApi, ClusterError, CronJob};
use crate::logs::{LogAggregator, LogPage};
use crate::orchestrator::{scheduled_unit_name, JobOrchestrator, JobView, OrchestratorConfig};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("execution unit {unit} still present after {timeout:?}")]
    DeletionTimeout { unit: String, timeout: Duration },
    #[error("scraper {scraper_id} already has a running unit {unit}")]
    RunInProgress { scraper_id: Uuid, unit: String },
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ScraperNotFound { scraper_id, .. } => {
                ServiceError::NotFound(format!("scraper {scraper_id}"))
            }
            other => ServiceError::Storage(other),
        }
    }
}

/// A definition together with the state of its scheduled unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperView {
    #[serde(flatten)]
    pub definition: ScraperDefinition,
    pub unit_name: String,
    pub schedule_enabled: bool,
}

impl ScraperView {
    fn new(definition: ScraperDefinition, unit: Option<&CronJob>) -> Self {
        Self {
            unit_name: scheduled_unit_name(&definition.tenant_id, definition.id),
            schedule_enabled: unit.is_some_and(|cron_job| cron_job.spec.suspend == Some(false)),
            definition,
        }
    }
}

/// Operations exposed to callers: definitions, their units, and run observability.
pub struct ScraperService {
    catalog: Arc<ScraperTypeCatalog>,
    scrapers: Arc<dyn ScraperRepository>,
    watermarks: Arc<dyn WatermarkStore>,
    orchestrator: JobOrchestrator,
    logs: LogAggregator,
}

impl ScraperService {
    pub fn new(
        catalog: Arc<ScraperTypeCatalog>,
        scrapers: Arc<dyn ScraperRepository>,
        watermarks: Arc<dyn WatermarkStore>,
        cluster: Arc<dyn ClusterApi>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            catalog,
            scrapers,
            watermarks,
            orchestrator: JobOrchestrator::new(cluster.clone(), config),
            logs: LogAggregator::new(cluster),
        }
    }

    pub fn scraper_types(&self) -> &[ScraperType] {
        self.catalog.types()
    }

    async fn definition(&self, tenant_id: &str, scraper_id: Uuid) -> Result<ScraperDefinition, ServiceError> {
        self.scrapers
            .get(tenant_id, scraper_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("scraper {scraper_id}")))
    }

    /// Validates, persists, then reconciles the scheduled unit.
    pub async fn upsert(&self, draft: &ScraperDraft) -> Result<ScraperView, ServiceError> {
        self.catalog.validate(&draft.scraper_type_id, &draft.parameters)?;
        let definition = self.scrapers.upsert(draft).await?;
        info!(tenant_id = %definition.tenant_id, scraper_id = %definition.id, "scraper saved");
        let unit = self.orchestrator.reconcile(&definition).await?;
        Ok(ScraperView::new(definition, Some(&unit)))
    }

    pub async fn get(&self, tenant_id: &str, scraper_id: Uuid) -> Result<ScraperView, ServiceError> {
        let definition = self.definition(tenant_id, scraper_id).await?;
        let unit = self.orchestrator.scheduled_unit(tenant_id, scraper_id).await?;
        Ok(ScraperView::new(definition, unit.as_ref()))
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<ScraperView>, ServiceError> {
        let mut views = Vec::new();
        for definition in self.scrapers.list(tenant_id).await? {
            let unit = self.orchestrator.scheduled_unit(tenant_id, definition.id).await?;
            views.push(ScraperView::new(definition, unit.as_ref()));
        }
        Ok(views)
    }

    /// Units first, then the row. Succeeds when the row is already gone.
    pub async fn delete(&self, tenant_id: &str, scraper_id: Uuid) -> Result<(), ServiceError> {
        self.orchestrator.delete(tenant_id, scraper_id).await?;
        let removed = self.scrapers.delete(tenant_id, scraper_id).await?;
        info!(tenant_id, %scraper_id, removed, "scraper deleted");
        Ok(())
    }

    /// Deletes scrapers one at a time and stops at the first failure; the
    /// tenant row goes last.
    pub async fn delete_tenant(&self, tenant_id: &str) -> Result<usize, ServiceError> {
        let definitions = self.scrapers.list(tenant_id).await?;
        for definition in &definitions {
            self.delete(tenant_id, definition.id).await?;
        }
        self.scrapers.delete_tenant(tenant_id).await?;
        info!(tenant_id, scrapers = definitions.len(), "tenant deleted");
        Ok(definitions.len())
    }

    pub async fn trigger(&self, tenant_id: &str, scraper_id: Uuid) -> Result<JobView, ServiceError> {
        let definition = self.definition(tenant_id, scraper_id).await?;
        self.orchestrator.trigger(&definition).await
    }

    pub async fn set_schedule_enabled(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        enabled: bool,
    ) -> Result<ScraperView, ServiceError> {
        let definition = self.definition(tenant_id, scraper_id).await?;
        let unit = self
            .orchestrator
            .set_schedule_enabled(tenant_id, scraper_id, enabled)
            .await?;
        Ok(ScraperView::new(definition, Some(&unit)))
    }

    pub async fn jobs(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Vec<JobView>, ServiceError> {
        self.definition(tenant_id, scraper_id).await?;
        self.orchestrator.jobs(tenant_id, scraper_id, Utc::now()).await
    }

    pub async fn job(&self, tenant_id: &str, unit_name: &str) -> Result<JobView, ServiceError> {
        self.orchestrator.job(tenant_id, unit_name, Utc::now()).await
    }

    pub async fn logs(
        &self,
        tenant_id: &str,
        unit_name: &str,
        page: Option<LogPage>,
    ) -> Result<Vec<String>, ServiceError> {
        Ok(self.logs.logs(tenant_id, unit_name, page).await?)
    }

    pub async fn last_scraped_date(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<NaiveDate>, ServiceError> {
        Ok(self.watermarks.last_scraped_date(tenant_id, scraper_id).await?)
    }

    pub async fn set_last_scraped_date(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        date: NaiveDate,
    ) -> Result<(), ServiceError> {
        Ok(self
            .watermarks
            .set_last_scraped_date(tenant_id, scraper_id, date)
            .await?)
    }
}
