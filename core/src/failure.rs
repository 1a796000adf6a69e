//! Failure detection and the policy that decides what a failed record means.
//!
//! Two kinds of failure reach root. A rank that stops answering is caught by
//! the deadline on root's receives and surfaces as a fatal
//! [`BackendError::Timeout`]. A user function that fails on a record is
//! reported by the rank that ran it as a [`RecordFailure`]; the
//! [`FailurePolicy`] of the `map` call decides whether that aborts the call
//! or taints the resulting dataset.

use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::partition::ShardLayout;
use crate::protocol::TaskReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// How a `map` call treats records whose function call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FailurePolicy {
    /// Stop at the first failing record of each shard and fail the call.
    #[default]
    Abort,
    /// Call the function up to `max_attempts` times per record; records that
    /// still fail abort the call.
    Retry { max_attempts: u32 },
    /// Keep going; failed records taint the resulting dataset.
    SkipAndContinue,
}

impl FailurePolicy {
    /// Number of times a record is attempted before it counts as failed.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Retry { max_attempts } => (*max_attempts).max(1),
            _ => 1,
        }
    }

    /// Whether a shard stops at its first failed record.
    pub fn stops_on_failure(&self) -> bool {
        !matches!(self, Self::SkipAndContinue)
    }

    pub fn validate(&self) -> BackendResult<()> {
        match self {
            Self::Retry { max_attempts: 0 } => Err(BackendError::Configuration(
                "retry policy needs at least one attempt".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// A record whose function call failed on a rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Global index of the record in the parallelized sequence.
    pub index: usize,
    pub rank: usize,
    pub attempts: u32,
    pub message: String,
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "index {} on rank {} after {} attempt(s): {}",
            self.index, self.rank, self.attempts, self.message
        )
    }
}

/// All record failures of one `map` call, ordered by global index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AggregateFailure {
    pub function: String,
    pub failures: Vec<RecordFailure>,
}

impl AggregateFailure {
    const DISPLAY_LIMIT: usize = 5;

    pub fn new(function: impl Into<String>, mut failures: Vec<RecordFailure>) -> Self {
        failures.sort_by_key(|f| f.index);
        Self {
            function: function.into(),
            failures,
        }
    }

    pub fn indices(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Look up the failure recorded for a global index.
    pub fn get(&self, index: usize) -> Option<&RecordFailure> {
        self.failures
            .binary_search_by_key(&index, |f| f.index)
            .ok()
            .map(|pos| &self.failures[pos])
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} record(s) failed in '{}'",
            self.failures.len(),
            self.function
        )?;
        for (i, failure) in self.failures.iter().take(Self::DISPLAY_LIMIT).enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        if self.failures.len() > Self::DISPLAY_LIMIT {
            write!(f, "; and {} more", self.failures.len() - Self::DISPLAY_LIMIT)?;
        }
        Ok(())
    }
}

/// Result of a `map` call that did not abort.
#[derive(Debug, Clone, PartialEq)]
pub enum MapOutcome {
    Complete,
    /// Some records failed under [`FailurePolicy::SkipAndContinue`].
    Tainted(AggregateFailure),
}

/// Counters kept by the monitor for the lifetime of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub failed_records_per_rank: Vec<u64>,
}

/// Root-side monitor: owns the deadlines and turns task reports into an
/// outcome according to the active policy.
#[derive(Debug)]
pub struct FailureMonitor {
    collective_timeout: Duration,
    task_timeout: Option<Duration>,
    default_policy: FailurePolicy,
    stats: FailureStats,
}

impl FailureMonitor {
    pub fn new(config: &BackendConfig, world_size: usize) -> Self {
        Self {
            collective_timeout: Duration::from_millis(config.collective_timeout_ms),
            task_timeout: config.task_timeout_ms.map(Duration::from_millis),
            default_policy: config.failure_policy,
            stats: FailureStats {
                failed_records_per_rank: vec![0; world_size],
                ..FailureStats::default()
            },
        }
    }

    /// Deadline for receives that do not wait on user code.
    pub fn collective_deadline(&self) -> Option<Duration> {
        Some(self.collective_timeout)
    }

    /// Deadline for task reports; `None` waits for as long as the tasks run.
    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_timeout
    }

    pub fn policy_for(&self, requested: Option<FailurePolicy>) -> FailurePolicy {
        requested.unwrap_or(self.default_policy)
    }

    pub fn stats(&self) -> &FailureStats {
        &self.stats
    }

    /// Decide the outcome of a `map` call from the reports of every rank.
    ///
    /// Reports must be in rank order. An error a rank could not attribute to
    /// a single record fails the call as-is.
    pub fn evaluate(
        &mut self,
        function: &str,
        policy: FailurePolicy,
        layout: &ShardLayout,
        reports: Vec<TaskReport>,
    ) -> BackendResult<MapOutcome> {
        let mut failures = Vec::new();
        for (rank, report) in reports.into_iter().enumerate() {
            if report.rank != rank {
                return Err(BackendError::protocol_mismatch(
                    rank,
                    format!("task report from rank {}", rank),
                    format!("report from rank {}", report.rank),
                ));
            }
            debug!(
                "Rank {} ran '{}' on {} record(s) in {}ms",
                rank, function, report.records, report.metrics.run_time_ms
            );
            if let Some(error) = report.error {
                self.stats.tasks_failed += 1;
                warn!("Rank {} could not run '{}': {}", rank, function, error);
                return Err(error);
            }
            if report.failures.is_empty() && report.records != layout.len(rank) {
                self.stats.tasks_failed += 1;
                return Err(BackendError::size_mismatch(
                    format!("result shard {} of '{}'", rank, function),
                    layout.len(rank),
                    report.records,
                ));
            }
            if let Some(count) = self.stats.failed_records_per_rank.get_mut(rank) {
                *count += report.failures.len() as u64;
            }
            failures.extend(report.failures);
        }

        if failures.is_empty() {
            self.stats.tasks_completed += 1;
            return Ok(MapOutcome::Complete);
        }

        let aggregate = AggregateFailure::new(function, failures);
        warn!("{}", aggregate);
        match policy {
            FailurePolicy::SkipAndContinue => {
                self.stats.tasks_completed += 1;
                Ok(MapOutcome::Tainted(aggregate))
            }
            FailurePolicy::Abort | FailurePolicy::Retry { .. } => {
                self.stats.tasks_failed += 1;
                Err(BackendError::WorkerExecution(aggregate))
            }
        }
    }
}

/// Run `call` for one record under `policy`, passing the 1-based attempt
/// number. Returns the value, or the attempts made and the last error.
pub(crate) fn attempt_record<T>(
    policy: FailurePolicy,
    mut call: impl FnMut(u32) -> anyhow::Result<T>,
) -> Result<T, (u32, String)> {
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match call(attempt) {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err((attempt, format!("{:#}", e))),
            Err(e) => {
                debug!("Attempt {} failed, retrying: {:#}", attempt, e);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskMetrics;

    fn report(rank: usize, records: usize, failures: Vec<RecordFailure>) -> TaskReport {
        TaskReport {
            rank,
            records,
            failures,
            error: None,
            metrics: TaskMetrics::default(),
        }
    }

    fn failure(index: usize, rank: usize) -> RecordFailure {
        RecordFailure {
            index,
            rank,
            attempts: 1,
            message: "boom".to_string(),
        }
    }

    fn monitor() -> FailureMonitor {
        FailureMonitor::new(&BackendConfig::default(), 2)
    }

    #[test]
    fn test_policy_attempts() {
        assert_eq!(FailurePolicy::Abort.max_attempts(), 1);
        assert_eq!(FailurePolicy::SkipAndContinue.max_attempts(), 1);
        assert_eq!(FailurePolicy::Retry { max_attempts: 3 }.max_attempts(), 3);
        assert!(FailurePolicy::Retry { max_attempts: 0 }.validate().is_err());
        assert!(FailurePolicy::SkipAndContinue.validate().is_ok());
    }

    #[test]
    fn test_clean_reports_complete() {
        let layout = ShardLayout::even(5, 2);
        let outcome = monitor()
            .evaluate(
                "double",
                FailurePolicy::Abort,
                &layout,
                vec![report(0, 3, vec![]), report(1, 2, vec![])],
            )
            .unwrap();
        assert_eq!(outcome, MapOutcome::Complete);
    }

    #[test]
    fn test_abort_aggregates_in_index_order() {
        let layout = ShardLayout::even(10, 2);
        let mut monitor = monitor();
        let err = monitor
            .evaluate(
                "fail",
                FailurePolicy::Abort,
                &layout,
                vec![
                    report(0, 2, vec![failure(2, 0)]),
                    report(1, 5, vec![failure(7, 1), failure(5, 1)]),
                ],
            )
            .unwrap_err();

        match err {
            BackendError::WorkerExecution(aggregate) => {
                assert_eq!(aggregate.indices(), vec![2, 5, 7]);
                assert!(aggregate.to_string().contains("index 5 on rank 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(monitor.stats().failed_records_per_rank, vec![1, 2]);
        assert_eq!(monitor.stats().tasks_failed, 1);
    }

    #[test]
    fn test_skip_taints() {
        let layout = ShardLayout::even(4, 2);
        let outcome = monitor()
            .evaluate(
                "fail",
                FailurePolicy::SkipAndContinue,
                &layout,
                vec![report(0, 2, vec![]), report(1, 2, vec![failure(3, 1)])],
            )
            .unwrap();
        match outcome {
            MapOutcome::Tainted(aggregate) => {
                assert_eq!(aggregate.get(3).map(|f| f.rank), Some(1));
                assert!(aggregate.get(2).is_none());
            }
            MapOutcome::Complete => panic!("expected tainted outcome"),
        }
    }

    #[test]
    fn test_short_shard_is_size_mismatch() {
        let layout = ShardLayout::even(4, 2);
        let err = monitor()
            .evaluate(
                "double",
                FailurePolicy::Abort,
                &layout,
                vec![report(0, 2, vec![]), report(1, 1, vec![])],
            )
            .unwrap_err();
        assert!(matches!(err, BackendError::SizeMismatch { expected: 2, found: 1, .. }));
    }

    #[test]
    fn test_attempt_record_retries() {
        let mut calls = 0;
        let value = attempt_record(FailurePolicy::Retry { max_attempts: 3 }, |attempt| {
            calls += 1;
            if attempt < 3 {
                anyhow::bail!("flaky")
            }
            Ok(attempt)
        });
        assert_eq!(value, Ok(3));
        assert_eq!(calls, 3);

        let err = attempt_record::<()>(FailurePolicy::Retry { max_attempts: 2 }, |_| {
            anyhow::bail!("always")
        })
        .unwrap_err();
        assert_eq!(err, (2, "always".to_string()));
    }

    #[test]
    fn test_display_truncates() {
        let failures = (0..8).map(|i| failure(i, 0)).collect();
        let text = AggregateFailure::new("f", failures).to_string();
        assert!(text.starts_with("8 record(s) failed in 'f'"));
        assert!(text.ends_with("and 3 more"));
    }
}
