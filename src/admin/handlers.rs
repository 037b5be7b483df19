//! Admin API handlers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::queue::{ConsumerInfo, Direction, Envelope, Status, StreamInfo};

use super::server::AdminState;

/// Hard cap on `/messages` results.
const MESSAGE_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct DirectionStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub orders: DirectionStats,
    pub reports: DirectionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_order_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report_time: Option<String>,
}

/// GET /api/stats
pub async fn stats(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let stats = state.queues().stats();

    let direction_stats = |direction: Direction| {
        let plural = direction.plural();
        DirectionStats {
            total: stats.counter(&format!("total_{plural}")),
            successful: stats.counter(&format!("successful_{plural}")),
            failed: stats.counter(&format!("failed_{plural}")),
        }
    };

    let orders = direction_stats(Direction::Order);
    let reports = direction_stats(Direction::Report);

    Json(StatsResponse {
        total: orders.total + reports.total,
        successful: orders.successful + reports.successful,
        failed: orders.failed + reports.failed,
        last_order_time: stats.timestamp("last_order_time"),
        last_report_time: stats.timestamp("last_report_time"),
        orders,
        reports,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MessagesQuery {
    pub status: Option<String>,
    pub direction: Option<String>,
    #[serde(rename = "patientId")]
    pub patient_id: Option<String>,
    #[serde(rename = "messageType")]
    pub message_type: Option<String>,
}

/// GET /api/messages
///
/// Scans history and DLQ, filters, deduplicates by `(id, received_at)`,
/// sorts newest first, and caps the result at 100 entries.
pub async fn messages(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<MessagesQuery>,
) -> impl IntoResponse {
    let queues = state.queues();

    let mut result: Vec<Envelope> = Vec::new();
    let mut seen: HashSet<(String, DateTime<Utc>)> = HashSet::new();

    let candidates = queues
        .history()
        .entries()
        .into_iter()
        .chain(queues.dlq().entries().into_iter().map(|(_, env)| env));

    for envelope in candidates {
        if !matches_filters(&envelope, &query) {
            continue;
        }
        if seen.insert((envelope.id.clone(), envelope.received_at)) {
            result.push(envelope);
        }
    }

    result.sort_by(|a, b| b.received_at.cmp(&a.received_at));
    result.truncate(MESSAGE_LIMIT);

    Json(result)
}

fn matches_filters(envelope: &Envelope, query: &MessagesQuery) -> bool {
    if let Some(ref status) = query.status {
        if envelope.status.as_str() != status {
            return false;
        }
    }
    if let Some(ref direction) = query.direction {
        if envelope.direction.as_str() != direction {
            return false;
        }
    }
    if let Some(ref patient_id) = query.patient_id {
        if !contains_ci(&envelope.patient_id, patient_id) {
            return false;
        }
    }
    if let Some(ref message_type) = query.message_type {
        if !contains_ci(&envelope.message_type, message_type) {
            return false;
        }
    }
    true
}

/// Case-insensitive substring match; an empty needle never matches.
fn contains_ci(haystack: &str, needle: &str) -> bool {
    !haystack.is_empty()
        && !needle.is_empty()
        && haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// POST /api/messages/{id}/retry
///
/// Re-queues a dead-lettered message. The DLQ entry is deleted only after
/// the envelope is durably back in its direction queue.
pub async fn retry_message(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let queues = state.queues();

    let Some((key, mut envelope)) = queues.dlq().find_by_id(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "message not found" })),
        );
    };

    envelope.retry_count = 0;
    envelope.status = Status::Pending;
    envelope.last_error.clear();
    envelope.processed_at = None;

    let queue = queues.queue(envelope.direction);
    if let Err(e) = queue.publish(&envelope) {
        error!(id = %id, error = %e, "dlq replay publish failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("re-enqueue failed: {e}") })),
        );
    }

    if let Err(e) = queues.dlq().remove(&key) {
        error!(id = %id, key = %key, error = %e, "dlq entry delete failed");
    }

    info!(
        id = %id,
        direction = %envelope.direction,
        "dead-lettered message re-queued"
    );

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "success",
            "message": "message re-queued for delivery",
            "stream": envelope.direction.plural(),
        })),
    )
}

/// GET /api/streams
pub async fn streams(State(state): State<Arc<AdminState>>) -> Json<Vec<StreamInfo>> {
    let queues = state.queues();
    Json(vec![
        queues.orders().stream_info(),
        queues.reports().stream_info(),
    ])
}

/// GET /api/consumers
pub async fn consumers(State(state): State<Arc<AdminState>>) -> Json<Vec<ConsumerInfo>> {
    let queues = state.queues();
    Json(vec![
        queues.orders().consumer_info(),
        queues.reports().consumer_info(),
    ])
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub components: BTreeMap<String, String>,
}

/// GET /api/health
///
/// Storage problems make the process unhealthy (503); unreachable egress
/// peers only degrade it, the queue keeps absorbing messages meanwhile.
pub async fn health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let queues = state.queues();
    let mut components = BTreeMap::new();
    let mut overall = "healthy";

    if queues.is_available() {
        components.insert("storage".to_string(), "healthy".to_string());
    } else {
        components.insert("storage".to_string(), "unhealthy".to_string());
        overall = "unhealthy";
    }

    components.insert(
        "orders_queue".to_string(),
        format!("healthy (messages: {})", queues.orders().depth()),
    );
    components.insert(
        "reports_queue".to_string(),
        format!("healthy (messages: {})", queues.reports().depth()),
    );
    components.insert(
        "dlq_store".to_string(),
        format!("healthy (dead letters: {})", queues.dlq().len()),
    );
    components.insert(
        "history_store".to_string(),
        format!("healthy (messages: {})", queues.history().len()),
    );
    components.insert(
        "stats_store".to_string(),
        format!("healthy (values: {})", queues.stats().len()),
    );

    let (order_probe, report_probe) = tokio::join!(
        state.order_egress().test_connection(),
        state.report_egress().test_connection(),
    );
    for (name, probe) in [
        ("order_egress", order_probe),
        ("report_egress", report_probe),
    ] {
        match probe {
            Ok(()) => {
                components.insert(name.to_string(), "reachable".to_string());
            }
            Err(e) => {
                components.insert(name.to_string(), format!("unreachable: {e}"));
                if overall == "healthy" {
                    overall = "degraded";
                }
            }
        }
    }

    let code = if overall == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(HealthResponse {
            status: overall.to_string(),
            timestamp: Utc::now(),
            uptime_seconds: state.uptime_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            components,
        }),
    )
}
