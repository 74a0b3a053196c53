pub mod access;
pub mod audit;
pub mod billing;
pub mod credentials;
pub mod email;
pub mod events;
pub mod grace_scheduler;
pub mod metrics;
pub mod tenants;
pub mod validation;

use crate::{
    db::{Fields, Key, Precondition, Row, StoreError, TableStore},
    error::ApiError,
};

use self::metrics::CAS_CONFLICTS_COUNTER;

/// Attempts per read-modify-write before giving up on a contended row.
pub const MAX_CAS_ATTEMPTS: usize = 3;

/// Read the row at `key`, let `apply` derive a patch from it, and write the
/// patch only if nobody touched the row in between. On conflict the row is
/// re-read and `apply` runs again, so checks inside `apply` always see the
/// state the write lands on. An empty patch skips the write.
pub async fn update_with_retry<F>(
    store: &dyn TableStore,
    table: &str,
    key: &Key,
    missing: ApiError,
    mut apply: F,
) -> Result<Row, ApiError>
where
    F: FnMut(&Row) -> Result<Fields, ApiError> + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let Some(current) = store.get(table, key).await? else {
            return Err(missing);
        };

        let patch = apply(&current)?;
        if patch.is_empty() {
            return Ok(current);
        }

        match store
            .upsert(table, key, &patch, Precondition::Version(current.version))
            .await
        {
            Ok(row) => return Ok(row),
            Err(StoreError::Conflict { .. }) => {
                CAS_CONFLICTS_COUNTER.with_label_values(&[table]).inc();
                tracing::debug!(
                    "write conflict on {table} '{}' (attempt {attempt})",
                    key.normalized()
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ApiError::Internal(format!(
        "concurrent updates kept conflicting on {table}"
    )))
}
