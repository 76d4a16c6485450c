use chrono::{DateTime, Utc};
use txscout_core::NormalizedStatus;

use crate::cluster::Job;

pub const DEFAULT_COMPLETIONS: i32 = 1;
pub const DEFAULT_BACKOFF_LIMIT: i32 = 6;

/// The fields of an execution unit that status resolution looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobObservation {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub completions: Option<i32>,
    pub backoff_limit: Option<i32>,
    pub active_deadline_seconds: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub complete_condition: bool,
    pub failed_condition: bool,
}

impl JobObservation {
    pub fn from_job(job: &Job) -> Self {
        let status = job.status.clone().unwrap_or_default();
        Self {
            active: status.active.unwrap_or(0),
            succeeded: status.succeeded.unwrap_or(0),
            failed: status.failed.unwrap_or(0),
            completions: job.spec.completions,
            backoff_limit: job.spec.backoff_limit,
            active_deadline_seconds: job.spec.active_deadline_seconds,
            start_time: status.start_time,
            complete_condition: status.has_condition("Complete"),
            failed_condition: status.has_condition("Failed"),
        }
    }
}

/// Maps raw counters and conditions onto the four-value status.
///
/// Rules are checked in priority order. Anything unrecognized resolves to
/// `Pending`, never to a terminal status.
pub fn resolve(unit: &JobObservation, now: DateTime<Utc>) -> NormalizedStatus {
    if unit.failed_condition {
        return NormalizedStatus::Failed;
    }
    if unit.complete_condition {
        return NormalizedStatus::Successful;
    }

    let completions = unit.completions.unwrap_or(DEFAULT_COMPLETIONS);
    let backoff_limit = unit.backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT);

    if unit.succeeded >= completions {
        return NormalizedStatus::Successful;
    }
    if unit.failed > backoff_limit {
        return NormalizedStatus::Failed;
    }
    if unit.failed > 0 && unit.active == 0 {
        let overdue = match (unit.active_deadline_seconds, unit.start_time) {
            (Some(deadline), Some(start)) => (now - start).num_seconds() > deadline,
            _ => false,
        };
        return if overdue {
            NormalizedStatus::Failed
        } else {
            NormalizedStatus::Pending
        };
    }
    if unit.active > 0 {
        return NormalizedStatus::Running;
    }
    NormalizedStatus::Pending
}

pub fn resolve_job(job: &Job, now: DateTime<Utc>) -> NormalizedStatus {
    resolve(&JobObservation::from_job(job), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn succeeded_reaching_completions_is_successful() {
        let unit = JobObservation {
            completions: Some(1),
            succeeded: 1,
            ..Default::default()
        };
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Successful);
    }

    #[test]
    fn failure_past_zero_backoff_is_failed() {
        let unit = JobObservation {
            failed: 1,
            backoff_limit: Some(0),
            ..Default::default()
        };
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Failed);
    }

    #[test]
    fn active_pod_is_running() {
        let unit = JobObservation {
            active: 1,
            start_time: Some(now()),
            ..Default::default()
        };
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Running);
    }

    #[test]
    fn unstarted_unit_is_pending() {
        assert_eq!(resolve(&JobObservation::default(), now()), NormalizedStatus::Pending);
    }

    #[test]
    fn conditions_outrank_counters() {
        let unit = JobObservation {
            active: 1,
            succeeded: 1,
            failed_condition: true,
            ..Default::default()
        };
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Failed);

        let unit = JobObservation {
            complete_condition: true,
            ..Default::default()
        };
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Successful);
    }

    #[test]
    fn failed_attempt_between_retries_waits_for_deadline() {
        let mut unit = JobObservation {
            failed: 1,
            backoff_limit: Some(3),
            active_deadline_seconds: Some(600),
            start_time: Some(now() - Duration::seconds(300)),
            ..Default::default()
        };
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Pending);

        unit.start_time = Some(now() - Duration::seconds(601));
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Failed);
    }

    #[test]
    fn default_backoff_limit_tolerates_early_failures() {
        let unit = JobObservation {
            failed: 6,
            active: 1,
            ..Default::default()
        };
        assert_eq!(resolve(&unit, now()), NormalizedStatus::Running);
    }
}
