use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use txscout_core::{
    parameter_env_name, NormalizedStatus, ScraperDefinition, Trigger, ENV_LEDGER_API_URL,
    ENV_RUN_DEADLINE_SECS, ENV_SCRAPER_ID, ENV_SCRAPER_TYPE_ID, ENV_TENANT_ID,
};
use uuid::Uuid;

use crate::cluster::{
    ClusterApi, Container, CronJob, CronJobSpec, EnvVar, Job, JobSpec, JobTemplateSpec,
    LabelSelector, ObjectMeta, OwnerReference, PodSpec, PodTemplateSpec, PropagationPolicy,
    BATCH_API_VERSION,
};
use crate::service::ServiceError;
use crate::status::resolve_job;
use crate::{SCRAPER_LABEL, TENANT_LABEL, TRIGGER_LABEL};

pub const CONTAINER_NAME: &str = "scraper";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub namespace: String,
    pub image: String,
    pub schedule: String,
    pub ledger_api_url: String,
    pub run_deadline: Duration,
    pub manual_ttl: Duration,
    pub history_limit: i32,
    pub delete_timeout: Duration,
    pub delete_poll_interval: Duration,
    /// Owner of every scheduled unit, so the cluster reaps them with the service.
    pub owner: Option<OwnerReference>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            image: "txscout:latest".to_string(),
            schedule: "0 4 * * *".to_string(),
            ledger_api_url: "http://ledger-api".to_string(),
            run_deadline: Duration::from_secs(3600),
            manual_ttl: Duration::from_secs(86_400),
            history_limit: 3,
            delete_timeout: Duration::from_secs(120),
            delete_poll_interval: Duration::from_secs(1),
            owner: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };
        let owner = match (
            std::env::var("OWNER_API_VERSION"),
            std::env::var("OWNER_KIND"),
            std::env::var("OWNER_NAME"),
            std::env::var("OWNER_UID"),
        ) {
            (Ok(api_version), Ok(kind), Ok(name), Ok(uid)) => Some(OwnerReference {
                api_version,
                kind,
                name,
                uid,
                controller: None,
                block_owner_deletion: Some(true),
            }),
            _ => None,
        };
        Self {
            namespace: std::env::var("KUBE_NAMESPACE").unwrap_or(defaults.namespace),
            image: std::env::var("SCRAPER_IMAGE").unwrap_or(defaults.image),
            schedule: std::env::var("SCRAPER_SCHEDULE").unwrap_or(defaults.schedule),
            ledger_api_url: std::env::var(ENV_LEDGER_API_URL).unwrap_or(defaults.ledger_api_url),
            run_deadline: secs(ENV_RUN_DEADLINE_SECS, defaults.run_deadline),
            manual_ttl: secs("MANUAL_TTL_SECS", defaults.manual_ttl),
            history_limit: std::env::var("JOB_HISTORY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.history_limit),
            delete_timeout: defaults.delete_timeout,
            delete_poll_interval: defaults.delete_poll_interval,
            owner,
        }
    }
}

/// Deterministic scheduled-unit name for a scraper; short enough for cluster name limits.
pub fn scheduled_unit_name(tenant_id: &str, scraper_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{tenant_id}:{scraper_id}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("scraper-{}", &digest[..16])
}

/// `nonce` keeps two triggers within the same millisecond apart.
pub fn manual_unit_name(scheduled_name: &str, at: DateTime<Utc>, nonce: Uuid) -> String {
    let nonce = nonce.simple().to_string();
    format!("{scheduled_name}-m{}-{}", at.timestamp_millis(), &nonce[..6])
}

pub fn unit_labels(tenant_id: &str, scraper_id: Uuid, trigger: Trigger) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TENANT_LABEL.to_string(), tenant_id.to_string()),
        (SCRAPER_LABEL.to_string(), scraper_id.to_string()),
        (TRIGGER_LABEL.to_string(), trigger.as_str().to_string()),
    ])
}

fn scraper_selector(tenant_id: &str, scraper_id: Uuid) -> LabelSelector {
    LabelSelector::new()
        .with(TENANT_LABEL, tenant_id)
        .with(SCRAPER_LABEL, scraper_id.to_string())
}

/// The whole configuration a run receives.
pub fn unit_env(definition: &ScraperDefinition, config: &OrchestratorConfig) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: ENV_TENANT_ID.to_string(),
            value: definition.tenant_id.clone(),
        },
        EnvVar {
            name: ENV_SCRAPER_ID.to_string(),
            value: definition.id.to_string(),
        },
        EnvVar {
            name: ENV_SCRAPER_TYPE_ID.to_string(),
            value: definition.scraper_type_id.clone(),
        },
        EnvVar {
            name: ENV_LEDGER_API_URL.to_string(),
            value: config.ledger_api_url.clone(),
        },
        EnvVar {
            name: ENV_RUN_DEADLINE_SECS.to_string(),
            value: config.run_deadline.as_secs().to_string(),
        },
    ];
    env.extend(definition.parameters.iter().map(|p| EnvVar {
        name: parameter_env_name(&p.parameter_id),
        value: p.value.clone(),
    }));
    env
}

fn job_spec(definition: &ScraperDefinition, config: &OrchestratorConfig, trigger: Trigger) -> JobSpec {
    JobSpec {
        template: PodTemplateSpec {
            metadata: ObjectMeta {
                labels: unit_labels(&definition.tenant_id, definition.id, trigger),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: config.image.clone(),
                    args: vec!["run".to_string()],
                    env: unit_env(definition, config),
                }],
                restart_policy: Some("Never".to_string()),
            },
        },
        completions: Some(1),
        backoff_limit: Some(0),
        active_deadline_seconds: Some(config.run_deadline.as_secs() as i64),
        ttl_seconds_after_finished: None,
    }
}

/// Recurring unit for a definition; new units start suspended.
pub fn scheduled_unit(definition: &ScraperDefinition, config: &OrchestratorConfig) -> CronJob {
    let labels = unit_labels(&definition.tenant_id, definition.id, Trigger::Scheduled);
    CronJob {
        api_version: BATCH_API_VERSION.to_string(),
        kind: "CronJob".to_string(),
        metadata: ObjectMeta {
            name: Some(scheduled_unit_name(&definition.tenant_id, definition.id)),
            namespace: Some(config.namespace.clone()),
            labels: labels.clone(),
            owner_references: config.owner.iter().cloned().collect(),
            ..Default::default()
        },
        spec: CronJobSpec {
            schedule: config.schedule.clone(),
            suspend: Some(true),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(config.history_limit),
            failed_jobs_history_limit: Some(config.history_limit),
            job_template: JobTemplateSpec {
                metadata: ObjectMeta {
                    labels,
                    ..Default::default()
                },
                spec: job_spec(definition, config, Trigger::Scheduled),
            },
        },
    }
}

/// One-shot unit; expires `manual_ttl` after it finishes.
pub fn manual_unit(definition: &ScraperDefinition, config: &OrchestratorConfig, name: &str) -> Job {
    let mut spec = job_spec(definition, config, Trigger::Manual);
    spec.ttl_seconds_after_finished = Some(config.manual_ttl.as_secs() as i32);
    Job {
        api_version: BATCH_API_VERSION.to_string(),
        kind: "Job".to_string(),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(config.namespace.clone()),
            labels: unit_labels(&definition.tenant_id, definition.id, Trigger::Manual),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub name: String,
    pub scraper_id: Option<Uuid>,
    pub trigger: Trigger,
    pub status: NormalizedStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        let status = job.status.clone().unwrap_or_default();
        Self {
            name: job.metadata.name().to_string(),
            scraper_id: job
                .metadata
                .label(SCRAPER_LABEL)
                .and_then(|id| Uuid::parse_str(id).ok()),
            trigger: job
                .metadata
                .label(TRIGGER_LABEL)
                .and_then(|t| t.parse().ok())
                .unwrap_or(Trigger::Scheduled),
            status: resolve_job(job, now),
            created_at: job.metadata.creation_timestamp,
            start_time: status.start_time,
            completion_time: status.completion_time,
        }
    }
}

#[derive(Clone)]
pub struct JobOrchestrator {
    cluster: Arc<dyn ClusterApi>,
    config: Arc<OrchestratorConfig>,
}

impl JobOrchestrator {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: Arc<OrchestratorConfig>) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Creates or replaces the scheduled unit; a replaced unit keeps its suspend flag.
    pub async fn reconcile(&self, definition: &ScraperDefinition) -> Result<CronJob, ServiceError> {
        let mut desired = scheduled_unit(definition, &self.config);
        let name = desired.metadata.name().to_string();

        match self.cluster.get_cron_job(&name).await {
            Ok(existing) => {
                desired.spec.suspend = existing.spec.suspend;
                desired.metadata.resource_version = existing.metadata.resource_version;
                desired.metadata.owner_references = existing.metadata.owner_references;
                info!(unit = %name, tenant_id = %definition.tenant_id, "replacing scheduled unit");
                Ok(self.cluster.replace_cron_job(&desired).await?)
            }
            Err(err) if err.is_not_found() => {
                info!(unit = %name, tenant_id = %definition.tenant_id, "creating scheduled unit");
                Ok(self.cluster.create_cron_job(&desired).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn scheduled_unit(&self, tenant_id: &str, scraper_id: Uuid) -> Result<Option<CronJob>, ServiceError> {
        match self
            .cluster
            .get_cron_job(&scheduled_unit_name(tenant_id, scraper_id))
            .await
        {
            Ok(cron_job) => Ok(Some(cron_job)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the scheduled unit, waiting until the cluster confirms it is
    /// gone, then every manual unit of the scraper.
    pub async fn delete(&self, tenant_id: &str, scraper_id: Uuid) -> Result<(), ServiceError> {
        let name = scheduled_unit_name(tenant_id, scraper_id);
        let started = Instant::now();

        loop {
            match self.cluster.get_cron_job(&name).await {
                Err(err) if err.is_not_found() => break,
                Err(err) => return Err(err.into()),
                Ok(cron_job) if cron_job.metadata.deletion_timestamp.is_none() => {
                    info!(unit = %name, "deleting scheduled unit");
                    match self
                        .cluster
                        .delete_cron_job(&name, PropagationPolicy::Foreground)
                        .await
                    {
                        Err(err) if err.is_not_found() => break,
                        other => other?,
                    }
                }
                Ok(_) => debug!(unit = %name, "scheduled unit still terminating"),
            }

            if started.elapsed() >= self.config.delete_timeout {
                warn!(unit = %name, timeout = ?self.config.delete_timeout, "scheduled unit outlived deletion timeout");
                return Err(ServiceError::DeletionTimeout {
                    unit: name,
                    timeout: self.config.delete_timeout,
                });
            }
            tokio::time::sleep(self.config.delete_poll_interval).await;
        }

        let manual = scraper_selector(tenant_id, scraper_id).with(TRIGGER_LABEL, Trigger::Manual.as_str());
        for job in self.cluster.list_jobs(&manual).await? {
            let job_name = job.metadata.name();
            info!(unit = %job_name, "deleting manual unit");
            match self
                .cluster
                .delete_job(job_name, PropagationPolicy::Foreground)
                .await
            {
                Err(err) if err.is_not_found() => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// Starts a one-shot run unless one of the scraper's units is already running.
    pub async fn trigger(&self, definition: &ScraperDefinition) -> Result<JobView, ServiceError> {
        let now = Utc::now();
        if let Some(running) = self
            .jobs(&definition.tenant_id, definition.id, now)
            .await?
            .into_iter()
            .find(|job| job.status == NormalizedStatus::Running)
        {
            return Err(ServiceError::RunInProgress {
                scraper_id: definition.id,
                unit: running.name,
            });
        }

        let scheduled = scheduled_unit_name(&definition.tenant_id, definition.id);
        let name = manual_unit_name(&scheduled, now, Uuid::new_v4());
        let job = manual_unit(definition, &self.config, &name);
        let created = self.cluster.create_job(&job).await?;
        info!(unit = %name, tenant_id = %definition.tenant_id, scraper_id = %definition.id, "manual run triggered");
        Ok(JobView::from_job(&created, now))
    }

    pub async fn set_schedule_enabled(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        enabled: bool,
    ) -> Result<CronJob, ServiceError> {
        let name = scheduled_unit_name(tenant_id, scraper_id);
        let mut cron_job = self.cluster.get_cron_job(&name).await.map_err(|err| {
            if err.is_not_found() {
                ServiceError::NotFound(format!("scheduled unit {name}"))
            } else {
                err.into()
            }
        })?;
        cron_job.spec.suspend = Some(!enabled);
        info!(unit = %name, enabled, "updating schedule");
        Ok(self.cluster.replace_cron_job(&cron_job).await?)
    }

    /// Every unit of a scraper, newest first.
    pub async fn jobs(
        &self,
        tenant_id: &str,
        scraper_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobView>, ServiceError> {
        let jobs = self
            .cluster
            .list_jobs(&scraper_selector(tenant_id, scraper_id))
            .await?;
        let mut views: Vec<JobView> = jobs.iter().map(|job| JobView::from_job(job, now)).collect();
        views.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(views)
    }

    pub async fn job(&self, tenant_id: &str, unit_name: &str, now: DateTime<Utc>) -> Result<JobView, ServiceError> {
        let not_found = || ServiceError::NotFound(format!("execution unit {unit_name}"));
        let job = self.cluster.get_job(unit_name).await.map_err(|err| {
            if err.is_not_found() {
                not_found()
            } else {
                err.into()
            }
        })?;
        if job.metadata.label(TENANT_LABEL) != Some(tenant_id) {
            return Err(not_found());
        }
        Ok(JobView::from_job(&job, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, JobStatus};
    use txscout_core::ParameterValue;

    fn definition() -> ScraperDefinition {
        ScraperDefinition {
            id: Uuid::parse_str("6f9619ff-8b86-d011-b42d-00cf4fc964ff").unwrap(),
            tenant_id: "t1".into(),
            display_name: "Checking".into(),
            scraper_type_id: "fixture-ledger".into(),
            parameters: vec![
                ParameterValue::new("account", "acc-1"),
                ParameterValue::new("fixture-path", "/data/statement.json"),
            ],
            last_successful_scraped_date: None,
        }
    }

    fn config() -> Arc<OrchestratorConfig> {
        Arc::new(OrchestratorConfig {
            namespace: "scrapers".into(),
            image: "registry.local/txscout:1".into(),
            delete_timeout: Duration::from_millis(200),
            delete_poll_interval: Duration::from_millis(5),
            owner: Some(OwnerReference {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                name: "txscout".into(),
                uid: "owner-uid".into(),
                controller: None,
                block_owner_deletion: Some(true),
            }),
            ..Default::default()
        })
    }

    fn setup() -> (Arc<InMemoryCluster>, JobOrchestrator) {
        let cluster = Arc::new(InMemoryCluster::new());
        let orchestrator = JobOrchestrator::new(cluster.clone(), config());
        (cluster, orchestrator)
    }

    #[test]
    fn unit_names_are_deterministic_and_short() {
        let def = definition();
        let a = scheduled_unit_name(&def.tenant_id, def.id);
        assert_eq!(a, scheduled_unit_name("t1", def.id));
        assert_ne!(a, scheduled_unit_name("t2", def.id));
        assert_eq!(a.len(), "scraper-".len() + 16);

        let at = DateTime::<Utc>::from_timestamp_millis(1_709_280_000_123).unwrap();
        let nonce = Uuid::parse_str("0a1b2c3d-0000-4000-8000-000000000000").unwrap();
        let manual = manual_unit_name(&a, at, nonce);
        assert_eq!(manual, format!("{a}-m1709280000123-0a1b2c"));
        assert!(manual.len() <= 63);
        assert_ne!(manual, manual_unit_name(&a, at, Uuid::new_v4()));
    }

    #[test]
    fn scheduled_manifest_carries_execution_contract() {
        let cron_job = scheduled_unit(&definition(), &config());
        assert_eq!(cron_job.spec.suspend, Some(true));
        assert_eq!(cron_job.spec.concurrency_policy.as_deref(), Some("Forbid"));
        assert_eq!(cron_job.spec.schedule, "0 4 * * *");
        assert_eq!(cron_job.metadata.owner_references.len(), 1);

        let job = &cron_job.spec.job_template.spec;
        assert_eq!(job.backoff_limit, Some(0));
        assert_eq!(job.active_deadline_seconds, Some(3600));
        assert_eq!(job.template.spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(job.template.spec.containers.len(), 1);

        let env: BTreeMap<_, _> = job.template.spec.containers[0]
            .env
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_str()))
            .collect();
        assert_eq!(env["TENANT_ID"], "t1");
        assert_eq!(env["SCRAPER_ID"], "6f9619ff-8b86-d011-b42d-00cf4fc964ff");
        assert_eq!(env["SCRAPER_TYPE_ID"], "fixture-ledger");
        assert_eq!(env["PARAM_ACCOUNT"], "acc-1");
        assert_eq!(env["PARAM_FIXTURE_PATH"], "/data/statement.json");
        assert_eq!(job.template.metadata.label(TRIGGER_LABEL), Some("scheduled"));
    }

    #[test]
    fn manual_manifest_expires_after_finishing() {
        let job = manual_unit(&definition(), &config(), "scraper-x-m1");
        assert_eq!(job.spec.ttl_seconds_after_finished, Some(86_400));
        assert_eq!(job.spec.backoff_limit, Some(0));
        assert_eq!(job.metadata.label(TRIGGER_LABEL), Some("manual"));
    }

    #[tokio::test]
    async fn reconcile_creates_then_replaces_keeping_suspend() {
        let (cluster, orchestrator) = setup();
        let mut def = definition();
        let created = orchestrator.reconcile(&def).await.unwrap();
        assert_eq!(created.spec.suspend, Some(true));

        orchestrator
            .set_schedule_enabled(&def.tenant_id, def.id, true)
            .await
            .unwrap();

        def.parameters[0].value = "acc-2".into();
        let replaced = orchestrator.reconcile(&def).await.unwrap();
        assert_eq!(replaced.spec.suspend, Some(false));
        assert_eq!(replaced.metadata.uid, created.metadata.uid);
        let env = &replaced.spec.job_template.spec.template.spec.containers[0].env;
        assert!(env.iter().any(|e| e.name == "PARAM_ACCOUNT" && e.value == "acc-2"));

        let calls = cluster.calls().await;
        assert_eq!(calls.iter().filter(|c| c.starts_with("create_cron_job")).count(), 1);
    }

    #[tokio::test]
    async fn reconcile_aborts_on_errors_other_than_not_found() {
        let (cluster, orchestrator) = setup();
        cluster.fail_on("get_cron_job", 500).await;
        let err = orchestrator.reconcile(&definition()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Cluster(_)));
        assert!(!cluster.calls().await.iter().any(|c| c.starts_with("create_cron_job")));
    }

    #[tokio::test]
    async fn delete_waits_for_termination_without_reissuing() {
        let (cluster, orchestrator) = setup();
        let def = definition();
        orchestrator.reconcile(&def).await.unwrap();
        orchestrator.trigger(&def).await.unwrap();
        cluster.set_deletion_lag(2).await;

        orchestrator.delete(&def.tenant_id, def.id).await.unwrap();

        let calls = cluster.calls().await;
        assert_eq!(calls.iter().filter(|c| c.starts_with("delete_cron_job")).count(), 1);
        assert!(cluster.cron_job(&scheduled_unit_name("t1", def.id)).await.is_none());
        assert!(cluster.job_names().await.is_empty());
    }

    #[tokio::test]
    async fn delete_of_missing_unit_succeeds() {
        let (_cluster, orchestrator) = setup();
        orchestrator.delete("t1", Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn delete_times_out_when_unit_never_goes_away() {
        let (cluster, orchestrator) = setup();
        let def = definition();
        orchestrator.reconcile(&def).await.unwrap();
        orchestrator.trigger(&def).await.unwrap();
        cluster.hold_deletions().await;

        let err = orchestrator.delete(&def.tenant_id, def.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::DeletionTimeout { .. }));
        assert_eq!(cluster.job_names().await.len(), 1);
    }

    #[tokio::test]
    async fn trigger_refuses_while_a_unit_is_running() {
        let (cluster, orchestrator) = setup();
        let def = definition();
        let first = orchestrator.trigger(&def).await.unwrap();
        assert_eq!(first.trigger, Trigger::Manual);
        assert_eq!(first.status, NormalizedStatus::Pending);

        cluster
            .set_job_status(
                &first.name,
                JobStatus {
                    active: Some(1),
                    start_time: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await;
        let err = orchestrator.trigger(&def).await.unwrap_err();
        assert!(matches!(err, ServiceError::RunInProgress { ref unit, .. } if *unit == first.name));
    }

    #[tokio::test]
    async fn back_to_back_triggers_get_distinct_units() {
        let (cluster, orchestrator) = setup();
        let def = definition();
        let first = orchestrator.trigger(&def).await.unwrap();
        let second = orchestrator.trigger(&def).await.unwrap();
        assert_ne!(first.name, second.name);
        assert_eq!(cluster.job_names().await.len(), 2);
    }

    #[tokio::test]
    async fn job_views_are_tenant_scoped_and_newest_first() {
        let (cluster, orchestrator) = setup();
        let def = definition();
        let first = orchestrator.trigger(&def).await.unwrap();
        cluster
            .set_job_status(
                &first.name,
                JobStatus {
                    succeeded: Some(1),
                    ..Default::default()
                },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = orchestrator.trigger(&def).await.unwrap();

        let views = orchestrator.jobs("t1", def.id, Utc::now()).await.unwrap();
        let names: Vec<_> = views.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, [second.name.as_str(), first.name.as_str()]);
        assert_eq!(views[1].status, NormalizedStatus::Successful);

        assert!(orchestrator.jobs("t2", def.id, Utc::now()).await.unwrap().is_empty());
        let err = orchestrator.job("t2", &first.name, Utc::now()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
