use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Fields, Key, Precondition, Row, StoreError, StoreResult, TableStore};

#[derive(Debug, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<StoredRow>,
}

/// Cells are indexed by header position; rows written before a column was
/// added are simply shorter than the header.
#[derive(Debug, Clone)]
struct StoredRow {
    version: i64,
    cells: Vec<String>,
}

impl Table {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    fn add_column(&mut self, column: &str) {
        if self.position(column).is_none() {
            self.columns.push(column.to_string());
        }
    }

    fn cell<'a>(&self, row: &'a StoredRow, column: &str) -> &'a str {
        self.position(column)
            .and_then(|i| row.cells.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn find(&self, key: &Key) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| key.matches(self.cell(row, &key.column)))
    }

    fn materialize(&self, row: &StoredRow) -> Row {
        let fields = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), row.cells.get(i).cloned().unwrap_or_default()))
            .collect();
        Row {
            version: row.version,
            fields,
        }
    }

    fn write_cells(&self, row: &mut StoredRow, fields: &Fields) {
        row.cells.resize(self.columns.len(), String::new());
        for (column, value) in fields {
            if let Some(i) = self.position(column) {
                row.cells[i] = value.clone();
            }
        }
    }
}

/// In-process store. A single write lock serializes every mutation, so
/// preconditions are checked and applied atomically.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: RwLock<HashMap<String, Table>>,
    schema_on_write: bool,
}

impl MemoryTableStore {
    pub fn new(schema_on_write: bool) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            schema_on_write,
        }
    }

    /// Resolve the target table for a write, adding missing columns only in
    /// schema-on-write mode.
    fn writable<'a, 't>(
        &self,
        tables: &'t mut HashMap<String, Table>,
        name: &str,
        columns: impl Iterator<Item = &'a str>,
    ) -> StoreResult<&'t mut Table> {
        if !tables.contains_key(name) {
            if !self.schema_on_write {
                return Err(StoreError::UnknownTable(name.to_string()));
            }
            tables.insert(name.to_string(), Table::default());
        }
        let table = tables
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))?;

        for column in columns {
            if table.position(column).is_none() {
                if !self.schema_on_write {
                    return Err(StoreError::UnknownColumn {
                        table: name.to_string(),
                        column: column.to_string(),
                    });
                }
                table.add_column(column);
            }
        }
        Ok(table)
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn ensure_column(&self, table: &str, column: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_string()).or_default().add_column(column);
        Ok(())
    }

    async fn columns(&self, table: &str) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).map(|t| t.columns.clone()).unwrap_or_default())
    }

    async fn get(&self, table: &str, key: &Key) -> StoreResult<Option<Row>> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).and_then(|t| {
            t.find(key).map(|i| t.materialize(&t.rows[i]))
        }))
    }

    async fn upsert(
        &self,
        table: &str,
        key: &Key,
        fields: &Fields,
        precondition: Precondition,
    ) -> StoreResult<Row> {
        let mut tables = self.tables.write().await;
        let names = fields
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(key.column.as_str()));
        let t = self.writable(&mut tables, table, names)?;

        let conflict = || StoreError::Conflict {
            table: table.to_string(),
            key: key.normalized(),
        };

        match (t.find(key), precondition) {
            (Some(_), Precondition::Absent) => Err(conflict()),
            (None, Precondition::Version(_)) => Err(conflict()),
            (Some(i), Precondition::Version(expected)) if t.rows[i].version != expected => {
                Err(conflict())
            }
            (Some(i), _) => {
                let mut row = t.rows[i].clone();
                t.write_cells(&mut row, fields);
                row.version += 1;
                let out = t.materialize(&row);
                t.rows[i] = row;
                Ok(out)
            }
            (None, _) => {
                let mut row = StoredRow {
                    version: 1,
                    cells: Vec::new(),
                };
                let mut initial = fields.clone();
                initial
                    .entry(key.column.clone())
                    .or_insert_with(|| key.normalized());
                t.write_cells(&mut row, &initial);
                let out = t.materialize(&row);
                t.rows.push(row);
                Ok(out)
            }
        }
    }

    async fn rekey(
        &self,
        table: &str,
        key: &Key,
        new_value: &str,
        fields: &Fields,
        version: i64,
    ) -> StoreResult<Row> {
        let mut tables = self.tables.write().await;
        let names = fields
            .keys()
            .map(String::as_str)
            .chain(std::iter::once(key.column.as_str()));
        let t = self.writable(&mut tables, table, names)?;

        let target = key.with_value(new_value);
        let conflict = |k: &Key| StoreError::Conflict {
            table: table.to_string(),
            key: k.normalized(),
        };

        let i = match t.find(key) {
            Some(i) if t.rows[i].version == version => i,
            _ => return Err(conflict(key)),
        };
        if t.find(&target).is_some_and(|j| j != i) {
            return Err(conflict(&target));
        }

        let mut cells = fields.clone();
        cells.insert(key.column.clone(), target.normalized());
        let mut row = t.rows[i].clone();
        t.write_cells(&mut row, &cells);
        row.version += 1;
        let out = t.materialize(&row);
        t.rows[i] = row;
        Ok(out)
    }

    async fn append(&self, table: &str, fields: &Fields) -> StoreResult<Row> {
        let mut tables = self.tables.write().await;
        let t = self.writable(&mut tables, table, fields.keys().map(String::as_str))?;
        let mut row = StoredRow {
            version: 1,
            cells: Vec::new(),
        };
        t.write_cells(&mut row, fields);
        let out = t.materialize(&row);
        t.rows.push(row);
        Ok(out)
    }

    async fn scan_all(&self, table: &str) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|t| t.rows.iter().map(|r| t.materialize(r)).collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
