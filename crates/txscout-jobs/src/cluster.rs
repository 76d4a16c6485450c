//! The slice of the Kubernetes object model the orchestrator touches, plus
//! the control-plane client seam.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const BATCH_API_VERSION: &str = "batch/v1";
pub const JOB_NAME_LABEL: &str = "job-name";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    /// The API omits empty values.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub template: PodTemplateSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub active: Option<i32>,
    #[serde(default)]
    pub succeeded: Option<i32>,
    #[serde(default)]
    pub failed: Option<i32>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
}

impl JobStatus {
    pub fn has_condition(&self, condition_type: &str) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == condition_type && c.status == "True")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJobSpec {
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful_jobs_history_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs_history_limit: Option<i32>,
    pub job_template: JobTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: CronJobSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    items: Vec<T>,
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn to_query(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PropagationPolicy {
    Background,
    Foreground,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("cluster API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("decoding cluster response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Control-plane operations, scoped to one namespace.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_cron_job(&self, name: &str) -> Result<CronJob, ClusterError>;
    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<CronJob, ClusterError>;
    /// Full replacement; `metadata.resource_version` guards against lost updates.
    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<CronJob, ClusterError>;
    async fn delete_cron_job(&self, name: &str, propagation: PropagationPolicy) -> Result<(), ClusterError>;

    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError>;
    async fn get_job(&self, name: &str) -> Result<Job, ClusterError>;
    async fn list_jobs(&self, selector: &LabelSelector) -> Result<Vec<Job>, ClusterError>;
    async fn delete_job(&self, name: &str, propagation: PropagationPolicy) -> Result<(), ClusterError>;

    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError>;
    async fn pod_logs(&self, name: &str, timestamps: bool) -> Result<String, ClusterError>;
}

#[derive(Debug, Clone)]
pub struct KubeConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub ca_pem: Option<Vec<u8>>,
    pub namespace: String,
    pub timeout: Duration,
}

impl KubeConfig {
    /// Service-account credentials mounted into every pod.
    pub fn in_cluster() -> anyhow::Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token")).context("reading service-account token")?;
        let ca_pem = std::fs::read(dir.join("ca.crt")).context("reading service-account CA bundle")?;
        let namespace = std::fs::read_to_string(dir.join("namespace")).context("reading service-account namespace")?;
        Ok(Self {
            api_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
            ca_pem: Some(ca_pem),
            namespace: namespace.trim().to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    /// `KUBE_API_URL` (plus optional `KUBE_TOKEN`, `KUBE_NAMESPACE`) for
    /// out-of-cluster development, otherwise the in-cluster mount.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("KUBE_API_URL") {
            Ok(api_url) => Ok(Self {
                api_url,
                token: std::env::var("KUBE_TOKEN").ok(),
                ca_pem: None,
                namespace: std::env::var("KUBE_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
                timeout: Duration::from_secs(30),
            }),
            Err(_) => Self::in_cluster(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

/// Kubernetes REST client over reqwest.
#[derive(Debug, Clone)]
pub struct KubeClient {
    client: reqwest::Client,
    api_url: String,
    namespace: String,
    token: Option<String>,
}

impl KubeClient {
    pub fn new(config: KubeConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).context("parsing cluster CA bundle")?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            namespace: config.namespace,
            token: config.token,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cron_jobs_url(&self) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/cronjobs", self.api_url, self.namespace)
    }

    pub fn jobs_url(&self) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.api_url, self.namespace)
    }

    pub fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.api_url, self.namespace)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> Result<reqwest::Response, ClusterError> {
        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StatusBody>(&text)
                .map(|body| body.message)
                .unwrap_or(text);
            return Err(ClusterError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> Result<T, ClusterError> {
        let bytes = self.send(request, kind, name).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn delete(
        &self,
        url: String,
        kind: &'static str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<(), ClusterError> {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "DeleteOptions",
            "propagationPolicy": propagation,
        });
        debug!(kind, name, ?propagation, "deleting cluster object");
        self.send(self.request(reqwest::Method::DELETE, &url).json(&body), kind, name)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn get_cron_job(&self, name: &str) -> Result<CronJob, ClusterError> {
        let url = format!("{}/{name}", self.cron_jobs_url());
        self.json(self.request(reqwest::Method::GET, &url), "cronjob", name).await
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<CronJob, ClusterError> {
        let url = self.cron_jobs_url();
        let request = self.request(reqwest::Method::POST, &url).json(cron_job);
        self.json(request, "cronjob", cron_job.metadata.name()).await
    }

    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<CronJob, ClusterError> {
        let name = cron_job.metadata.name();
        let url = format!("{}/{name}", self.cron_jobs_url());
        let request = self.request(reqwest::Method::PUT, &url).json(cron_job);
        self.json(request, "cronjob", name).await
    }

    async fn delete_cron_job(&self, name: &str, propagation: PropagationPolicy) -> Result<(), ClusterError> {
        let url = format!("{}/{name}", self.cron_jobs_url());
        self.delete(url, "cronjob", name, propagation).await
    }

    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError> {
        let url = self.jobs_url();
        let request = self.request(reqwest::Method::POST, &url).json(job);
        self.json(request, "job", job.metadata.name()).await
    }

    async fn get_job(&self, name: &str) -> Result<Job, ClusterError> {
        let url = format!("{}/{name}", self.jobs_url());
        self.json(self.request(reqwest::Method::GET, &url), "job", name).await
    }

    async fn list_jobs(&self, selector: &LabelSelector) -> Result<Vec<Job>, ClusterError> {
        let url = self.jobs_url();
        let request = self
            .request(reqwest::Method::GET, &url)
            .query(&[("labelSelector", selector.to_query())]);
        let list: ObjectList<Job> = self.json(request, "job", "").await?;
        Ok(list.items)
    }

    async fn delete_job(&self, name: &str, propagation: PropagationPolicy) -> Result<(), ClusterError> {
        let url = format!("{}/{name}", self.jobs_url());
        self.delete(url, "job", name, propagation).await
    }

    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError> {
        let url = self.pods_url();
        let request = self
            .request(reqwest::Method::GET, &url)
            .query(&[("labelSelector", selector.to_query())]);
        let list: ObjectList<Pod> = self.json(request, "pod", "").await?;
        Ok(list.items)
    }

    async fn pod_logs(&self, name: &str, timestamps: bool) -> Result<String, ClusterError> {
        let url = format!("{}/{name}/log", self.pods_url());
        let request = self
            .request(reqwest::Method::GET, &url)
            .query(&[("timestamps", timestamps)]);
        Ok(self.send(request, "pod", name).await?.text().await?)
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    cron_jobs: BTreeMap<String, CronJob>,
    jobs: BTreeMap<String, Job>,
    pods: BTreeMap<String, (Pod, String)>,
    /// Reads a terminating cron job survives before it disappears.
    deletion_lag: u32,
    hold_deletions: bool,
    terminating: BTreeMap<String, u32>,
    failures: BTreeMap<&'static str, u16>,
    pod_log_failures: BTreeMap<String, u16>,
    calls: Vec<String>,
    next_version: u64,
}

impl ClusterState {
    fn record(&mut self, op: &'static str, name: &str) -> Result<(), ClusterError> {
        self.calls.push(format!("{op} {name}"));
        match self.failures.get(op) {
            Some(status) => Err(ClusterError::Api {
                status: *status,
                message: format!("injected failure for {op}"),
            }),
            None => Ok(()),
        }
    }

    fn stamp(&mut self, metadata: &mut ObjectMeta) {
        self.next_version += 1;
        metadata.resource_version = Some(self.next_version.to_string());
        if metadata.uid.is_none() {
            metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if metadata.creation_timestamp.is_none() {
            metadata.creation_timestamp = Some(Utc::now());
        }
    }

    fn drop_pods_of(&mut self, job_name: &str) {
        self.pods
            .retain(|_, (pod, _)| pod.metadata.label(JOB_NAME_LABEL) != Some(job_name));
    }
}

/// Process-local control plane for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deleted cron jobs stay visible, marked terminating, for `polls` reads.
    pub async fn set_deletion_lag(&self, polls: u32) {
        self.state.lock().await.deletion_lag = polls;
    }

    /// Deleted cron jobs never finish terminating.
    pub async fn hold_deletions(&self) {
        self.state.lock().await.hold_deletions = true;
    }

    /// Every later call to `op` (e.g. `"create_job"`) fails with `status`.
    pub async fn fail_on(&self, op: &'static str, status: u16) {
        self.state.lock().await.failures.insert(op, status);
    }

    /// Log reads of this one pod fail with `status`; 404 reports the pod as gone.
    pub async fn fail_pod_logs(&self, pod_name: &str, status: u16) {
        self.state
            .lock()
            .await
            .pod_log_failures
            .insert(pod_name.to_string(), status);
    }

    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn cron_job(&self, name: &str) -> Option<CronJob> {
        self.state.lock().await.cron_jobs.get(name).cloned()
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.state.lock().await.jobs.keys().cloned().collect()
    }

    pub async fn set_job_status(&self, name: &str, status: JobStatus) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(name) {
            job.status = Some(status);
        }
    }

    pub async fn insert_job(&self, mut job: Job) {
        let mut state = self.state.lock().await;
        state.stamp(&mut job.metadata);
        state.jobs.insert(job.metadata.name().to_string(), job);
    }

    /// Adds a pod for `job_name`, inheriting the job's template labels.
    pub async fn insert_pod(&self, job_name: &str, pod_name: &str, created: DateTime<Utc>, logs: &str) {
        let mut state = self.state.lock().await;
        let mut labels = state
            .jobs
            .get(job_name)
            .map(|job| job.spec.template.metadata.labels.clone())
            .unwrap_or_default();
        labels.insert(JOB_NAME_LABEL.to_string(), job_name.to_string());
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                labels,
                creation_timestamp: Some(created),
                ..Default::default()
            },
        };
        state.pods.insert(pod_name.to_string(), (pod, logs.to_string()));
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_cron_job(&self, name: &str) -> Result<CronJob, ClusterError> {
        let mut state = self.state.lock().await;
        state.record("get_cron_job", name)?;
        let expired = match state.terminating.get_mut(name) {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if expired {
            state.terminating.remove(name);
            state.cron_jobs.remove(name);
        }
        state.cron_jobs.get(name).cloned().ok_or_else(|| ClusterError::NotFound {
            kind: "cronjob",
            name: name.to_string(),
        })
    }

    async fn create_cron_job(&self, cron_job: &CronJob) -> Result<CronJob, ClusterError> {
        let mut state = self.state.lock().await;
        let name = cron_job.metadata.name().to_string();
        state.record("create_cron_job", &name)?;
        if state.cron_jobs.contains_key(&name) {
            return Err(ClusterError::Api {
                status: 409,
                message: format!("cronjob {name} already exists"),
            });
        }
        let mut created = cron_job.clone();
        state.stamp(&mut created.metadata);
        state.cron_jobs.insert(name, created.clone());
        Ok(created)
    }

    async fn replace_cron_job(&self, cron_job: &CronJob) -> Result<CronJob, ClusterError> {
        let mut state = self.state.lock().await;
        let name = cron_job.metadata.name().to_string();
        state.record("replace_cron_job", &name)?;
        let existing = state.cron_jobs.get(&name).ok_or_else(|| ClusterError::NotFound {
            kind: "cronjob",
            name: name.clone(),
        })?;
        if cron_job.metadata.resource_version.is_some()
            && cron_job.metadata.resource_version != existing.metadata.resource_version
        {
            return Err(ClusterError::Api {
                status: 409,
                message: format!("cronjob {name} was modified concurrently"),
            });
        }
        let mut replaced = cron_job.clone();
        replaced.metadata.uid = existing.metadata.uid.clone();
        replaced.metadata.creation_timestamp = existing.metadata.creation_timestamp;
        state.stamp(&mut replaced.metadata);
        state.cron_jobs.insert(name, replaced.clone());
        Ok(replaced)
    }

    async fn delete_cron_job(&self, name: &str, _propagation: PropagationPolicy) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.record("delete_cron_job", name)?;
        if !state.cron_jobs.contains_key(name) {
            return Err(ClusterError::NotFound {
                kind: "cronjob",
                name: name.to_string(),
            });
        }
        let lag = if state.hold_deletions {
            u32::MAX
        } else {
            state.deletion_lag
        };
        if lag == 0 {
            state.cron_jobs.remove(name);
        } else {
            if let Some(cron_job) = state.cron_jobs.get_mut(name) {
                cron_job.metadata.deletion_timestamp = Some(Utc::now());
            }
            state.terminating.insert(name.to_string(), lag);
        }
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<Job, ClusterError> {
        let mut state = self.state.lock().await;
        let name = job.metadata.name().to_string();
        state.record("create_job", &name)?;
        if state.jobs.contains_key(&name) {
            return Err(ClusterError::Api {
                status: 409,
                message: format!("job {name} already exists"),
            });
        }
        let mut created = job.clone();
        state.stamp(&mut created.metadata);
        state.jobs.insert(name, created.clone());
        Ok(created)
    }

    async fn get_job(&self, name: &str) -> Result<Job, ClusterError> {
        let mut state = self.state.lock().await;
        state.record("get_job", name)?;
        state.jobs.get(name).cloned().ok_or_else(|| ClusterError::NotFound {
            kind: "job",
            name: name.to_string(),
        })
    }

    async fn list_jobs(&self, selector: &LabelSelector) -> Result<Vec<Job>, ClusterError> {
        let mut state = self.state.lock().await;
        state.record("list_jobs", &selector.to_query())?;
        Ok(state
            .jobs
            .values()
            .filter(|job| selector.matches(&job.metadata.labels))
            .cloned()
            .collect())
    }

    async fn delete_job(&self, name: &str, _propagation: PropagationPolicy) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        state.record("delete_job", name)?;
        if state.jobs.remove(name).is_none() {
            return Err(ClusterError::NotFound {
                kind: "job",
                name: name.to_string(),
            });
        }
        state.drop_pods_of(name);
        Ok(())
    }

    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>, ClusterError> {
        let mut state = self.state.lock().await;
        state.record("list_pods", &selector.to_query())?;
        Ok(state
            .pods
            .values()
            .filter(|(pod, _)| selector.matches(&pod.metadata.labels))
            .map(|(pod, _)| pod.clone())
            .collect())
    }

    async fn pod_logs(&self, name: &str, _timestamps: bool) -> Result<String, ClusterError> {
        let mut state = self.state.lock().await;
        state.record("pod_logs", name)?;
        match state.pod_log_failures.get(name) {
            Some(404) => {
                return Err(ClusterError::NotFound {
                    kind: "pod",
                    name: name.to_string(),
                })
            }
            Some(status) => {
                return Err(ClusterError::Api {
                    status: *status,
                    message: format!("container in pod {name} is waiting to start"),
                })
            }
            None => {}
        }
        state
            .pods
            .get(name)
            .map(|(_, logs)| logs.clone())
            .ok_or_else(|| ClusterError::NotFound {
                kind: "pod",
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_renders_sorted_query_and_matches_subsets() {
        let selector = LabelSelector::new()
            .with("trigger", "manual")
            .with("tenantID", "t1");
        assert_eq!(selector.to_query(), "tenantID=t1,trigger=manual");

        let mut labels = BTreeMap::new();
        labels.insert("tenantID".to_string(), "t1".to_string());
        labels.insert("trigger".to_string(), "manual".to_string());
        labels.insert("scraperID".to_string(), "s".to_string());
        assert!(selector.matches(&labels));
        labels.insert("trigger".to_string(), "scheduled".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn job_status_decodes_from_api_shape() {
        let json = r#"{
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "scraper-abc", "labels": {"trigger": "manual"}},
            "spec": {"template": {"spec": {"containers": [{"name": "scraper", "image": "img"}], "restartPolicy": "Never"}}, "backoffLimit": 0},
            "status": {"failed": 1, "startTime": "2024-03-01T10:00:00Z", "conditions": [{"type": "Failed", "status": "True"}]}
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        let status = job.status.unwrap();
        assert!(status.has_condition("Failed"));
        assert!(!status.has_condition("Complete"));
        assert_eq!(job.spec.backoff_limit, Some(0));
        assert_eq!(job.metadata.label("trigger"), Some("manual"));
    }

    #[test]
    fn cron_job_with_empty_env_value_decodes() {
        let json = r#"{
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": {"name": "scraper-abc", "resourceVersion": "7", "uid": "u-1"},
            "spec": {
                "schedule": "0 4 * * *",
                "suspend": true,
                "concurrencyPolicy": "Forbid",
                "jobTemplate": {"spec": {
                    "backoffLimit": 0,
                    "template": {"spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "scraper",
                            "image": "img",
                            "env": [{"name": "PARAM_ACCOUNT", "value": "acc-1"}, {"name": "PARAM_PASSWORD"}]
                        }]
                    }}
                }}
            }
        }"#;
        let cron_job: CronJob = serde_json::from_str(json).unwrap();
        let env = &cron_job.spec.job_template.spec.template.spec.containers[0].env;
        assert_eq!(env[1].name, "PARAM_PASSWORD");
        assert_eq!(env[1].value, "");

        let encoded = serde_json::to_value(&env[1]).unwrap();
        assert_eq!(encoded, serde_json::json!({"name": "PARAM_PASSWORD"}));
    }

    #[test]
    fn kube_client_builds_namespaced_urls() {
        let client = KubeClient::new(KubeConfig {
            api_url: "https://k8s.local:6443/".into(),
            token: None,
            ca_pem: None,
            namespace: "scrapers".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            client.cron_jobs_url(),
            "https://k8s.local:6443/apis/batch/v1/namespaces/scrapers/cronjobs"
        );
        assert_eq!(client.pods_url(), "https://k8s.local:6443/api/v1/namespaces/scrapers/pods");
    }

    #[tokio::test]
    async fn in_memory_delete_lingers_for_configured_polls() {
        let cluster = InMemoryCluster::new();
        cluster.set_deletion_lag(1).await;
        let cron_job = CronJob {
            metadata: ObjectMeta {
                name: Some("scraper-x".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        cluster.create_cron_job(&cron_job).await.unwrap();
        cluster
            .delete_cron_job("scraper-x", PropagationPolicy::Foreground)
            .await
            .unwrap();

        let lingering = cluster.get_cron_job("scraper-x").await.unwrap();
        assert!(lingering.metadata.deletion_timestamp.is_some());
        assert!(cluster.get_cron_job("scraper-x").await.unwrap_err().is_not_found());
    }
}
