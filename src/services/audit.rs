use std::sync::Arc;

use chrono::Utc;

use crate::{
    db::{fields, schema::AUDIT_LOG, TableStore},
    models::format_timestamp,
};

/// An audit log entry to record.
pub struct AuditEntry {
    pub action: &'static str,
    pub site_slug: String,
    pub detail: String,
}

/// Fire-and-forget audit log entry.
/// Spawns a background task, never blocks the request handler,
/// never propagates errors (logs a warning on failure).
pub fn log(store: Arc<dyn TableStore>, entry: AuditEntry) {
    tokio::spawn(async move {
        let row = fields([
            ("at", format_timestamp(Utc::now())),
            ("action", entry.action.to_string()),
            ("site_slug", entry.site_slug),
            ("detail", entry.detail),
        ]);

        if let Err(e) = store.append(AUDIT_LOG.name, &row).await {
            tracing::warn!("audit log append failed for {}: {e}", entry.action);
        }
    });
}
