use std::sync::Arc;

use tracing::debug;

use crate::cluster::{ClusterApi, ClusterError, LabelSelector, JOB_NAME_LABEL};
use crate::TENANT_LABEL;

/// Zero-based page of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPage {
    pub page: usize,
    pub size: usize,
}

impl LogPage {
    fn start(&self) -> usize {
        self.page.saturating_mul(self.size)
    }

    fn end(&self) -> usize {
        self.start().saturating_add(self.size)
    }
}

/// Joins the logs of every attempt (pod) of a unit, oldest attempt first.
#[derive(Clone)]
pub struct LogAggregator {
    cluster: Arc<dyn ClusterApi>,
}

impl LogAggregator {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn logs(
        &self,
        tenant_id: &str,
        unit_name: &str,
        page: Option<LogPage>,
    ) -> Result<Vec<String>, ClusterError> {
        let selector = LabelSelector::new()
            .with(JOB_NAME_LABEL, unit_name)
            .with(TENANT_LABEL, tenant_id);
        let mut pods = self.cluster.list_pods(&selector).await?;
        pods.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name().cmp(b.metadata.name()))
        });

        let mut lines = Vec::new();
        for pod in &pods {
            if page.is_some_and(|p| lines.len() >= p.end()) {
                break;
            }
            let name = pod.metadata.name();
            let text = match self.cluster.pod_logs(name, true).await {
                Ok(text) => text,
                // Not started yet, or reaped since it was listed.
                Err(err) if err.is_not_found() || matches!(err, ClusterError::Api { status: 400, .. }) => {
                    debug!(pod = name, error = %err, "pod has no readable logs");
                    continue;
                }
                Err(err) => return Err(err),
            };
            lines.extend(text.lines().map(str::to_string));
        }
        debug!(unit = unit_name, pods = pods.len(), lines = lines.len(), "collected unit logs");

        Ok(match page {
            Some(p) => lines
                .into_iter()
                .skip(p.start())
                .take(p.size)
                .collect(),
            None => lines,
        })
    }
}
