//! Operator wide counters.
//!
//! A single [`MetricsRegistry`] is created at startup and handed to every
//! component that has something to count.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    Event,
    Inspection,
    InspectionError,
    StatusWrite,
    UpdateConflict,
    FailedResource,
    VolumeCreated,
    VolumeReclaimed,
    PlacementFailure,
    FinalizerRemoved,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    events: AtomicU64,
    inspections: AtomicU64,
    inspection_errors: AtomicU64,
    status_writes: AtomicU64,
    update_conflicts: AtomicU64,
    failed_resources: AtomicU64,
    volumes_created: AtomicU64,
    volumes_reclaimed: AtomicU64,
    placement_failures: AtomicU64,
    finalizers_removed: AtomicU64,
}

/// Point in time copy of all counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events: u64,
    pub inspections: u64,
    pub inspection_errors: u64,
    pub status_writes: u64,
    pub update_conflicts: u64,
    pub failed_resources: u64,
    pub volumes_created: u64,
    pub volumes_reclaimed: u64,
    pub placement_failures: u64,
    pub finalizers_removed: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: Metric) {
        self.add(metric, 1)
    }

    pub fn add(&self, metric: Metric, n: u64) {
        self.counter(metric).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, metric: Metric) -> u64 {
        self.counter(metric).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events: self.get(Metric::Event),
            inspections: self.get(Metric::Inspection),
            inspection_errors: self.get(Metric::InspectionError),
            status_writes: self.get(Metric::StatusWrite),
            update_conflicts: self.get(Metric::UpdateConflict),
            failed_resources: self.get(Metric::FailedResource),
            volumes_created: self.get(Metric::VolumeCreated),
            volumes_reclaimed: self.get(Metric::VolumeReclaimed),
            placement_failures: self.get(Metric::PlacementFailure),
            finalizers_removed: self.get(Metric::FinalizerRemoved),
        }
    }

    fn counter(&self, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::Event => &self.events,
            Metric::Inspection => &self.inspections,
            Metric::InspectionError => &self.inspection_errors,
            Metric::StatusWrite => &self.status_writes,
            Metric::UpdateConflict => &self.update_conflicts,
            Metric::FailedResource => &self.failed_resources,
            Metric::VolumeCreated => &self.volumes_created,
            Metric::VolumeReclaimed => &self.volumes_reclaimed,
            Metric::PlacementFailure => &self.placement_failures,
            Metric::FinalizerRemoved => &self.finalizers_removed,
        }
    }
}

/// `GET /metrics` with a JSON snapshot and `GET /health`.
pub fn router(metrics: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/health", get(|| async { "ok" }))
        .with_state(metrics)
}

async fn serve_metrics(State(metrics): State<Arc<MetricsRegistry>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}
