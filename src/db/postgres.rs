use async_trait::async_trait;
use serde_json::Value;
use sqlx::{types::Json, PgConnection, PgPool};

use super::{Fields, Key, KeyKind, Precondition, Row, StoreError, StoreResult, TableStore};

type JsonMap = serde_json::Map<String, Value>;

const ADD_COLUMN: &str = "INSERT INTO store_tables (name, columns) VALUES ($1, ARRAY[$2]::TEXT[])
     ON CONFLICT (name) DO UPDATE
     SET columns = CASE
         WHEN $2 = ANY(store_tables.columns) THEN store_tables.columns
         ELSE array_append(store_tables.columns, $2)
     END";

/// SQL expression for the normalized key cell. `$2` is the key column name.
fn key_expr(kind: KeyKind) -> &'static str {
    match kind {
        KeyKind::Email => "lower(btrim(r.fields->>$2))",
        KeyKind::Slug => "upper(btrim(r.fields->>$2))",
        KeyKind::Plain => "btrim(r.fields->>$2)",
    }
}

/// Cells written by other tools may hold JSON numbers or booleans.
fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn materialize(columns: &[String], body: &JsonMap, version: i64) -> Row {
    let fields = columns
        .iter()
        .map(|c| (c.clone(), body.get(c).map(cell).unwrap_or_default()))
        .collect();
    Row { version, fields }
}

fn to_json(fields: &Fields) -> JsonMap {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect()
}

/// Postgres-backed store. Rows live in `store_rows` as JSONB bodies; writes
/// to one key are serialized with a transaction-scoped advisory lock.
#[derive(Clone)]
pub struct PgTableStore {
    pool: PgPool,
    schema_on_write: bool,
}

impl PgTableStore {
    pub fn new(pool: PgPool, schema_on_write: bool) -> Self {
        Self {
            pool,
            schema_on_write,
        }
    }

    /// Serialize writers of one (table, key) until the transaction ends.
    async fn lock_key(conn: &mut PgConnection, table: &str, key: &Key) -> StoreResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{table}/{}/{}", key.column, key.normalized()))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// `(id, version)` of the first row matching `key`, locked for update.
    async fn find_for_update(
        conn: &mut PgConnection,
        table: &str,
        key: &Key,
    ) -> StoreResult<Option<(i64, i64)>> {
        let found = sqlx::query_as(&format!(
            "SELECT r.id, r.version FROM store_rows r
             WHERE r.table_name = $1 AND {} = $3
             ORDER BY r.id LIMIT 1
             FOR UPDATE",
            key_expr(key.kind)
        ))
        .bind(table)
        .bind(&key.column)
        .bind(key.normalized())
        .fetch_optional(&mut *conn)
        .await?;
        Ok(found)
    }

    async fn header(conn: &mut PgConnection, table: &str) -> StoreResult<Option<Vec<String>>> {
        let columns: Option<Vec<String>> =
            sqlx::query_scalar("SELECT columns FROM store_tables WHERE name = $1")
                .bind(table)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(columns)
    }

    /// Header for a write touching `names`; missing columns are added only in
    /// schema-on-write mode.
    async fn writable_columns(
        &self,
        conn: &mut PgConnection,
        table: &str,
        names: &[&str],
    ) -> StoreResult<Vec<String>> {
        let mut columns = match Self::header(&mut *conn, table).await? {
            Some(c) => c,
            None if self.schema_on_write => Vec::new(),
            None => return Err(StoreError::UnknownTable(table.to_string())),
        };

        for name in names {
            if columns.iter().any(|c| c == name) {
                continue;
            }
            if !self.schema_on_write {
                return Err(StoreError::UnknownColumn {
                    table: table.to_string(),
                    column: name.to_string(),
                });
            }
            sqlx::query(ADD_COLUMN)
                .bind(table)
                .bind(*name)
                .execute(&mut *conn)
                .await?;
            columns.push(name.to_string());
        }
        Ok(columns)
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn ensure_column(&self, table: &str, column: &str) -> StoreResult<()> {
        sqlx::query(ADD_COLUMN)
            .bind(table)
            .bind(column)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn columns(&self, table: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        Ok(Self::header(&mut conn, table).await?.unwrap_or_default())
    }

    async fn get(&self, table: &str, key: &Key) -> StoreResult<Option<Row>> {
        let columns = self.columns(table).await?;
        let row: Option<(Json<JsonMap>, i64)> = sqlx::query_as(&format!(
            "SELECT r.fields, r.version FROM store_rows r
             WHERE r.table_name = $1 AND {} = $3
             ORDER BY r.id LIMIT 1",
            key_expr(key.kind)
        ))
        .bind(table)
        .bind(&key.column)
        .bind(key.normalized())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(body), version)| materialize(&columns, &body, version)))
    }

    async fn upsert(
        &self,
        table: &str,
        key: &Key,
        fields: &Fields,
        precondition: Precondition,
    ) -> StoreResult<Row> {
        let normalized = key.normalized();
        let mut tx = self.pool.begin().await?;

        Self::lock_key(&mut tx, table, key).await?;

        let names: Vec<&str> = fields
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(key.column.as_str()))
            .collect();
        let columns = self.writable_columns(&mut tx, table, &names).await?;

        let existing = Self::find_for_update(&mut tx, table, key).await?;

        let conflict = || StoreError::Conflict {
            table: table.to_string(),
            key: normalized.clone(),
        };

        let (Json(body), version): (Json<JsonMap>, i64) = match (existing, precondition) {
            (Some(_), Precondition::Absent) => return Err(conflict()),
            (None, Precondition::Version(_)) => return Err(conflict()),
            (Some((_, current)), Precondition::Version(expected)) if current != expected => {
                return Err(conflict())
            }
            (Some((id, _)), _) => {
                sqlx::query_as(
                    "UPDATE store_rows
                     SET fields = fields || $2, version = version + 1, updated_at = NOW()
                     WHERE id = $1
                     RETURNING fields, version",
                )
                .bind(id)
                .bind(Json(to_json(fields)))
                .fetch_one(&mut *tx)
                .await?
            }
            (None, _) => {
                let mut body = to_json(fields);
                body.entry(key.column.clone())
                    .or_insert_with(|| Value::String(normalized.clone()));
                sqlx::query_as(
                    "INSERT INTO store_rows (table_name, fields)
                     VALUES ($1, $2)
                     RETURNING fields, version",
                )
                .bind(table)
                .bind(Json(body))
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(materialize(&columns, &body, version))
    }

    async fn rekey(
        &self,
        table: &str,
        key: &Key,
        new_value: &str,
        fields: &Fields,
        version: i64,
    ) -> StoreResult<Row> {
        let target = key.with_value(new_value);
        let conflict = |k: &Key| StoreError::Conflict {
            table: table.to_string(),
            key: k.normalized(),
        };
        let mut tx = self.pool.begin().await?;

        // Fixed lock order so two moves between the same keys cannot deadlock.
        let mut keys = [key, &target];
        keys.sort_by_key(|k| k.normalized());
        for k in keys {
            Self::lock_key(&mut tx, table, k).await?;
        }

        let names: Vec<&str> = fields
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(key.column.as_str()))
            .collect();
        let columns = self.writable_columns(&mut tx, table, &names).await?;

        let id = match Self::find_for_update(&mut tx, table, key).await? {
            Some((id, current)) if current == version => id,
            _ => return Err(conflict(key)),
        };
        if let Some((other, _)) = Self::find_for_update(&mut tx, table, &target).await? {
            if other != id {
                return Err(conflict(&target));
            }
        }

        let mut body = to_json(fields);
        body.insert(key.column.clone(), Value::String(target.normalized()));
        let (Json(body), version): (Json<JsonMap>, i64) = sqlx::query_as(
            "UPDATE store_rows
             SET fields = fields || $2, version = version + 1, updated_at = NOW()
             WHERE id = $1
             RETURNING fields, version",
        )
        .bind(id)
        .bind(Json(body))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(materialize(&columns, &body, version))
    }

    async fn append(&self, table: &str, fields: &Fields) -> StoreResult<Row> {
        let mut tx = self.pool.begin().await?;
        let names: Vec<&str> = fields.keys().map(String::as_str).collect();
        let columns = self.writable_columns(&mut tx, table, &names).await?;

        let (Json(body), version): (Json<JsonMap>, i64) = sqlx::query_as(
            "INSERT INTO store_rows (table_name, fields)
             VALUES ($1, $2)
             RETURNING fields, version",
        )
        .bind(table)
        .bind(Json(to_json(fields)))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(materialize(&columns, &body, version))
    }

    async fn scan_all(&self, table: &str) -> StoreResult<Vec<Row>> {
        let columns = self.columns(table).await?;
        let rows: Vec<(Json<JsonMap>, i64)> = sqlx::query_as(
            "SELECT fields, version FROM store_rows WHERE table_name = $1 ORDER BY id",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|(Json(body), version)| materialize(&columns, body, *version))
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
