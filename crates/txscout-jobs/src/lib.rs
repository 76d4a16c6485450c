//! Execution units on the cluster: manifests, lifecycle, status and logs, and
//! the scraper service that keeps definitions and units in step.

pub mod cluster;
pub mod logs;
pub mod orchestrator;
pub mod service;
pub mod status;

pub use cluster::{ClusterApi, ClusterError, InMemoryCluster, KubeClient, KubeConfig};
pub use logs::{LogAggregator, LogPage};
pub use orchestrator::{JobOrchestrator, JobView, OrchestratorConfig};
pub use service::{ScraperService, ScraperView, ServiceError};
pub use status::{resolve, JobObservation};

pub const CRATE_NAME: &str = "txscout-jobs";

pub const TENANT_LABEL: &str = "tenantID";
pub const SCRAPER_LABEL: &str = "scraperID";
pub const TRIGGER_LABEL: &str = "trigger";
