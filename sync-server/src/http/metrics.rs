//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use crate::storage::SyncStorage;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format: gauges for current state,
/// counters monotonic since startup.
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    let m = server.metrics();
    let hub = server.hub();

    let sessions = hub.session_count();
    let families = hub.family_count();

    let pushes = m.pushes_total.load(Ordering::Relaxed);
    let pulls = m.pulls_total.load(Ordering::Relaxed);
    let commits = m.commits_total.load(Ordering::Relaxed);
    let duplicates = m.duplicates_total.load(Ordering::Relaxed);
    let conflicts = m.conflicts_total.load(Ordering::Relaxed);
    let rejections = m.rejections_total.load(Ordering::Relaxed);
    let retries = m.retries_total.load(Ordering::Relaxed);
    let served = m.entries_served.load(Ordering::Relaxed);
    let opened = m.sessions_opened.load(Ordering::Relaxed);
    let sent = m.notifications_sent.load(Ordering::Relaxed);
    let dropped = m.notifications_dropped.load(Ordering::Relaxed);

    // Storage stats (best effort)
    let stats = server.storage().stats().await.unwrap_or_default();

    let body = format!(
        r#"# HELP carelog_sync_sessions_active Live streaming sessions
# TYPE carelog_sync_sessions_active gauge
carelog_sync_sessions_active {sessions}

# HELP carelog_sync_families_active Families with a live session
# TYPE carelog_sync_families_active gauge
carelog_sync_families_active {families}

# HELP carelog_sync_info Server information
# TYPE carelog_sync_info gauge
carelog_sync_info{{version="{version}"}} 1

# HELP carelog_sync_pushes_total Push requests handled
# TYPE carelog_sync_pushes_total counter
carelog_sync_pushes_total {pushes}

# HELP carelog_sync_pulls_total Pull requests handled
# TYPE carelog_sync_pulls_total counter
carelog_sync_pulls_total {pulls}

# HELP carelog_sync_commits_total Events committed
# TYPE carelog_sync_commits_total counter
carelog_sync_commits_total {commits}

# HELP carelog_sync_duplicates_total Replayed events acknowledged from the idempotency log
# TYPE carelog_sync_duplicates_total counter
carelog_sync_duplicates_total {duplicates}

# HELP carelog_sync_conflicts_total Events answered with a version conflict
# TYPE carelog_sync_conflicts_total counter
carelog_sync_conflicts_total {conflicts}

# HELP carelog_sync_rejections_total Events rejected by validation
# TYPE carelog_sync_rejections_total counter
carelog_sync_rejections_total {rejections}

# HELP carelog_sync_retries_total Events answered with a transient failure
# TYPE carelog_sync_retries_total counter
carelog_sync_retries_total {retries}

# HELP carelog_sync_entries_served_total Change log entries served by pulls
# TYPE carelog_sync_entries_served_total counter
carelog_sync_entries_served_total {served}

# HELP carelog_sync_sessions_opened_total Streaming sessions opened
# TYPE carelog_sync_sessions_opened_total counter
carelog_sync_sessions_opened_total {opened}

# HELP carelog_sync_notifications_sent_total Change hints queued on sessions
# TYPE carelog_sync_notifications_sent_total counter
carelog_sync_notifications_sent_total {sent}

# HELP carelog_sync_notifications_dropped_total Change hints dropped on full session buffers
# TYPE carelog_sync_notifications_dropped_total counter
carelog_sync_notifications_dropped_total {dropped}

# HELP carelog_sync_storage_families Families with committed changes
# TYPE carelog_sync_storage_families gauge
carelog_sync_storage_families {storage_families}

# HELP carelog_sync_storage_records Records in the database, tombstones included
# TYPE carelog_sync_storage_records gauge
carelog_sync_storage_records {storage_records}

# HELP carelog_sync_storage_changes Change log entries in the database
# TYPE carelog_sync_storage_changes gauge
carelog_sync_storage_changes {storage_changes}
"#,
        version = env!("CARGO_PKG_VERSION"),
        storage_families = stats.families,
        storage_records = stats.records,
        storage_changes = stats.changes,
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
