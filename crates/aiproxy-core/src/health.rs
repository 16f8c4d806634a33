//! Dynamic-weight health metrics sink (spec §3 `DynamicWeightMetric`,
//! §9's `HealthMetricsSink` capability).
//!
//! Per subject (`group`, `sub_group` edge, or `model_redirect` rule) this
//! tracks a decayed rolling success/failure sample over five windows
//! (7/14/30/90/180d) plus a consecutive-failure counter, used upstream by
//! channel/upstream selection to down-weight unhealthy subjects — that
//! selection logic itself is out of this core's scope (spec §1), which
//! only owns the counters and their lifecycle (record, read, soft-delete,
//! periodic physical cleanup).
//!
//! The spec leaves the exact decay function open (§9: "the specification
//! requires the behavior, not the constants"); this implementation applies
//! exponential decay with each window's length as its half-life before
//! folding in the new sample, so a subject that has been quiet for a full
//! window length counts its past samples at half weight.

use crate::db::RelationalStore;
use crate::error::Result;
use crate::model::{DecayedCounters, DynamicWeightMetric, MetricType};
use chrono::Utc;
use std::sync::Arc;

/// Half-life, in days, for each of the five decay windows (spec §3).
const WINDOW_DAYS: [f64; 5] = [7.0, 14.0, 30.0, 90.0, 180.0];

fn decay_factor(elapsed_days: f64, half_life_days: f64) -> f64 {
    if elapsed_days <= 0.0 {
        return 1.0;
    }
    0.5_f64.powf(elapsed_days / half_life_days)
}

fn decay_and_sample(counters: &mut DecayedCounters, elapsed_days: f64, half_life_days: f64, success: bool) {
    let factor = decay_factor(elapsed_days, half_life_days);
    counters.success *= factor;
    counters.failure *= factor;
    if success {
        counters.success += 1.0;
    } else {
        counters.failure += 1.0;
    }
}

/// Composite subject keys for the three [`MetricType`]s (spec §3: "composite
/// key per type").
pub fn group_subject_key(group_id: i64) -> String {
    format!("group:{group_id}")
}

pub fn sub_group_subject_key(aggregate_id: i64, sub_group_id: i64) -> String {
    format!("sub_group:{aggregate_id}:{sub_group_id}")
}

pub fn model_redirect_subject_key(group_id: i64, source_model: &str) -> String {
    format!("model_redirect:{group_id}:{source_model}")
}

/// The health-metrics capability this core depends on (spec §9's
/// `HealthMetricsSink` re-architecture note), injected at
/// `GroupService::new` so the Group Service never talks to the relational
/// store directly for this concern.
#[async_trait::async_trait]
pub trait HealthMetricsSink: Send + Sync {
    async fn record(&self, metric_type: MetricType, subject_key: &str, success: bool) -> Result<()>;
    async fn get(&self, subject_key: &str) -> Result<Option<DynamicWeightMetric>>;
    /// Soft-deletes every metric whose subject key references `group_id`
    /// (spec §3 "Ownership": aggregate-member and model-redirect metrics
    /// are soft-deleted on group deletion so they can be restored).
    async fn soft_delete_for_group(&self, group_id: i64) -> Result<()>;
    /// Physically removes soft-deleted rows older than `retention` (spec
    /// §3's periodic cleanup).
    async fn cleanup(&self, retention: chrono::Duration) -> Result<u64>;
}

/// Default [`RelationalStore`]-backed [`HealthMetricsSink`].
pub struct DbHealthMetricsSink {
    store: Arc<RelationalStore>,
}

impl DbHealthMetricsSink {
    pub fn new(store: Arc<RelationalStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait::async_trait]
impl HealthMetricsSink for DbHealthMetricsSink {
    async fn record(&self, metric_type: MetricType, subject_key: &str, success: bool) -> Result<()> {
        let now = Utc::now();
        let mut metric = match self.store.get_metric(subject_key).await? {
            Some(m) => m,
            None => DynamicWeightMetric {
                metric_type,
                subject_key: subject_key.to_string(),
                window_7d: DecayedCounters::default(),
                window_14d: DecayedCounters::default(),
                window_30d: DecayedCounters::default(),
                window_90d: DecayedCounters::default(),
                window_180d: DecayedCounters::default(),
                consecutive_failures: 0,
                deleted_at: None,
                updated_at: now,
            },
        };
        let elapsed_days = (now - metric.updated_at).num_milliseconds() as f64
            / (1000.0 * 60.0 * 60.0 * 24.0);

        decay_and_sample(&mut metric.window_7d, elapsed_days, WINDOW_DAYS[0], success);
        decay_and_sample(&mut metric.window_14d, elapsed_days, WINDOW_DAYS[1], success);
        decay_and_sample(&mut metric.window_30d, elapsed_days, WINDOW_DAYS[2], success);
        decay_and_sample(&mut metric.window_90d, elapsed_days, WINDOW_DAYS[3], success);
        decay_and_sample(&mut metric.window_180d, elapsed_days, WINDOW_DAYS[4], success);

        metric.consecutive_failures = if success { 0 } else { metric.consecutive_failures + 1 };
        metric.deleted_at = None;
        metric.updated_at = now;

        self.store.upsert_metric(&metric).await
    }

    async fn get(&self, subject_key: &str) -> Result<Option<DynamicWeightMetric>> {
        self.store.get_metric(subject_key).await
    }

    async fn soft_delete_for_group(&self, group_id: i64) -> Result<()> {
        self.store.soft_delete_health_metrics(group_id).await
    }

    async fn cleanup(&self, retention: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        self.store.cleanup_health_metrics(cutoff).await
    }
}

/// A no-op sink for deployments/tests that don't care about health
/// metrics; keeps `GroupService` from needing an `Option<Arc<dyn ...>>`.
#[derive(Default)]
pub struct NullHealthMetricsSink;

#[async_trait::async_trait]
impl HealthMetricsSink for NullHealthMetricsSink {
    async fn record(&self, _metric_type: MetricType, _subject_key: &str, _success: bool) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _subject_key: &str) -> Result<Option<DynamicWeightMetric>> {
        Ok(None)
    }

    async fn soft_delete_for_group(&self, _group_id: i64) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _retention: chrono::Duration) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_factor_halves_at_half_life() {
        let factor = decay_factor(7.0, 7.0);
        assert!((factor - 0.5).abs() < 1e-9);
        assert_eq!(decay_factor(0.0, 7.0), 1.0);
    }

    #[test]
    fn decay_and_sample_adds_new_sample_on_top_of_decayed_history() {
        let mut counters = DecayedCounters {
            success: 10.0,
            failure: 2.0,
        };
        decay_and_sample(&mut counters, 7.0, 7.0, true);
        assert!((counters.success - 6.0).abs() < 1e-9);
        assert!((counters.failure - 1.0).abs() < 1e-9);
    }

    #[test]
    fn subject_key_formats_match_spec_composite_shape() {
        assert_eq!(group_subject_key(7), "group:7");
        assert_eq!(sub_group_subject_key(1, 2), "sub_group:1:2");
        assert_eq!(model_redirect_subject_key(3, "gpt-4"), "model_redirect:3:gpt-4");
    }

    #[tokio::test]
    async fn null_sink_is_a_safe_default() {
        let sink = NullHealthMetricsSink;
        sink.record(MetricType::Group, "group:1", true).await.unwrap();
        assert!(sink.get("group:1").await.unwrap().is_none());
    }
}
