use super::{StoreResult, TableStore};

/// Declared header of one logical table. Columns are only ever appended;
/// bump `version` whenever the list changes.
#[derive(Debug, Clone, Copy)]
pub struct TableSchema {
    pub name: &'static str,
    pub version: u32,
    pub columns: &'static [&'static str],
}

pub const SIGNUPS: TableSchema = TableSchema {
    name: "signups",
    version: 3,
    columns: &[
        "site_slug",
        "email",
        "name",
        "phone",
        "plan",
        "cpf",
        "preapproval_id",
        "status",
        "manual_block",
        "created_at",
        "updated_at",
        // v2
        "onboarding_email",
        "onboarding_done_at",
        // v3
        "status_at",
    ],
};

pub const USERS: TableSchema = TableSchema {
    name: "users",
    version: 1,
    columns: &[
        "email",
        "site_slug",
        "role",
        "password_hash",
        "salt",
        "last_login",
        "reset_token",
        "reset_expiry",
        "plan",
        "billing_status",
        "billing_next",
        "billing_amount",
        "billing_currency",
        "billing_provider",
        "created_at",
        "updated_at",
    ],
};

pub const PAYMENT_EVENTS: TableSchema = TableSchema {
    name: "payment_events",
    version: 1,
    columns: &[
        "timestamp",
        "action",
        "payment_id",
        "preapproval_id",
        "status",
        "payer_email",
        "amount",
    ],
};

pub const AUDIT_LOG: TableSchema = TableSchema {
    name: "audit_log",
    version: 1,
    columns: &["at", "action", "site_slug", "detail"],
};

pub const ALL_TABLES: &[TableSchema] = &[SIGNUPS, USERS, PAYMENT_EVENTS, AUDIT_LOG];

/// Bring every declared table header up to date. Idempotent; safe to call
/// on every startup.
pub async fn ensure_schema(store: &dyn TableStore) -> StoreResult<()> {
    for table in ALL_TABLES {
        for column in table.columns {
            store.ensure_column(table.name, column).await?;
        }
        tracing::info!("Table '{}' at schema v{}", table.name, table.version);
    }
    Ok(())
}
