//! Tables, rows and constraint checks behind the in-memory engine.
//!
//! A [`Database`] is a plain value: the engine keeps one behind a mutex, and
//! a swap boundary works on a clone that replaces the original on commit.
//! Column types, NOT NULL, primary keys, unique indexes and foreign keys are
//! enforced on every insert, update and DDL call, so constraint violations
//! surface as [`StorageError::Constraint`] just as they would from a SQL
//! database.

use rekey_core::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// A stored row, keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Name under which a unique index on `table.column` is registered.
pub fn index_name(table: &str, column: &str) -> String {
    format!("{}_{}_key", table, column)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ForeignKey {
    column: String,
    ref_table: String,
    ref_column: String,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<ColumnDef>,
    rows: Vec<Row>,
    primary_key: Option<String>,
    /// Index name to indexed column.
    unique_indexes: BTreeMap<String, String>,
    foreign_keys: Vec<ForeignKey>,
}

impl Table {
    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn is_unique(&self, column: &str) -> bool {
        self.primary_key.as_deref() == Some(column)
            || self.unique_indexes.values().any(|c| c == column)
    }

    fn values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows
            .iter()
            .filter_map(move |row| row.get(column))
            .filter(|v| !v.is_null())
    }

    fn cell<'a>(row: &'a Row, column: &str) -> &'a Value {
        row.get(column).unwrap_or(&Value::Null)
    }
}

/// The whole in-memory database. Every method applies completely or not at
/// all.
#[derive(Debug, Clone, Default)]
pub(crate) struct Database {
    tables: BTreeMap<String, Table>,
}

impl Database {
    fn table(&self, name: &str) -> Result<&Table, StorageError> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, StorageError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::UnknownTable(name.to_string()))
    }

    fn require_column(&self, table: &str, column: &str) -> Result<&ColumnDef, StorageError> {
        self.table(table)?
            .column(column)
            .ok_or_else(|| StorageError::unknown_column(table, column))
    }

    pub(crate) fn create_table(
        &mut self,
        name: &str,
        columns: Vec<ColumnDef>,
    ) -> Result<(), StorageError> {
        if self.tables.contains_key(name) {
            return Err(StorageError::Constraint(format!(
                "table {} already exists",
                name
            )));
        }
        let mut table = Table {
            columns,
            ..Default::default()
        };
        let unique: Vec<String> = table
            .columns
            .iter()
            .filter(|c| c.unique)
            .map(|c| c.name.clone())
            .collect();
        for column in unique {
            table
                .unique_indexes
                .insert(index_name(name, &column), column);
        }
        self.tables.insert(name.to_string(), table);
        Ok(())
    }

    pub(crate) fn insert(&mut self, table_name: &str, values: Row) -> Result<(), StorageError> {
        let table = self.table(table_name)?;
        for column in values.keys() {
            if table.column(column).is_none() {
                return Err(StorageError::unknown_column(table_name, column));
            }
        }
        let row: Row = table
            .columns
            .iter()
            .map(|c| {
                let value = values
                    .get(&c.name)
                    .cloned()
                    .or_else(|| c.default.clone())
                    .unwrap_or(Value::Null);
                (c.name.clone(), value)
            })
            .collect();
        self.check_row(table_name, &row, None)?;
        self.table_mut(table_name)?.rows.push(row);
        Ok(())
    }

    pub(crate) fn update(
        &mut self,
        table_name: &str,
        key_column: &str,
        key: &Value,
        column: &str,
        value: Value,
    ) -> Result<u64, StorageError> {
        self.require_column(table_name, column)?;
        let table = self.table(table_name)?;
        let positions: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| Table::cell(row, key_column) == key)
            .map(|(i, _)| i)
            .collect();

        let mut staged = Vec::with_capacity(positions.len());
        for &i in &positions {
            let mut row = table.rows[i].clone();
            row.insert(column.to_string(), value.clone());
            self.check_row(table_name, &row, Some(i))?;
            staged.push((i, row));
        }
        self.check_not_referenced(table_name, column, &positions)?;

        let table = self.table_mut(table_name)?;
        for (i, row) in staged {
            table.rows[i] = row;
        }
        Ok(positions.len() as u64)
    }

    pub(crate) fn delete(
        &mut self,
        table_name: &str,
        key_column: &str,
        key: &Value,
    ) -> Result<u64, StorageError> {
        let table = self.table(table_name)?;
        let positions: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| Table::cell(row, key_column) == key)
            .map(|(i, _)| i)
            .collect();
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        for column in &columns {
            self.check_not_referenced(table_name, column, &positions)?;
        }

        let table = self.table_mut(table_name)?;
        let before = table.rows.len();
        let mut index = 0;
        table.rows.retain(|_| {
            let keep = !positions.contains(&index);
            index += 1;
            keep
        });
        Ok((before - table.rows.len()) as u64)
    }

    pub(crate) fn rows(&self, table: &str) -> Result<Vec<Row>, StorageError> {
        Ok(self.table(table)?.rows.clone())
    }

    /// Rejects changes that would leave another row's foreign key pointing
    /// at a value held only by the rows at `positions`.
    fn check_not_referenced(
        &self,
        table_name: &str,
        column: &str,
        positions: &[usize],
    ) -> Result<(), StorageError> {
        let table = self.table(table_name)?;
        for (name, other) in &self.tables {
            for fk in &other.foreign_keys {
                if fk.ref_table != table_name || fk.ref_column != column {
                    continue;
                }
                for &i in positions {
                    let value = Table::cell(&table.rows[i], column);
                    if !value.is_null() && other.values(&fk.column).any(|v| v == value) {
                        return Err(StorageError::Constraint(format!(
                            "{}.{} = {} is still referenced from {}.{}",
                            table_name, column, value, name, fk.column
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks types, NOT NULL, uniqueness and foreign keys of `row`, as if
    /// it replaced the row at `replacing`.
    fn check_row(
        &self,
        table_name: &str,
        row: &Row,
        replacing: Option<usize>,
    ) -> Result<(), StorageError> {
        let table = self.table(table_name)?;
        for column in &table.columns {
            let value = Table::cell(row, &column.name);
            if !column.column_type.accepts(value) {
                return Err(StorageError::Constraint(format!(
                    "{} is not a valid {} for {}.{}",
                    value, column.column_type, table_name, column.name
                )));
            }
            let required = !column.nullable || table.primary_key.as_ref() == Some(&column.name);
            if required && value.is_null() {
                return Err(StorageError::Constraint(format!(
                    "{}.{} cannot be NULL",
                    table_name, column.name
                )));
            }
            if !value.is_null() && table.is_unique(&column.name) {
                let duplicate = table
                    .rows
                    .iter()
                    .enumerate()
                    .any(|(i, other)| {
                        Some(i) != replacing && Table::cell(other, &column.name) == value
                    });
                if duplicate {
                    return Err(StorageError::Constraint(format!(
                        "duplicate value {} in {}.{}",
                        value, table_name, column.name
                    )));
                }
            }
        }
        for fk in &table.foreign_keys {
            let value = Table::cell(row, &fk.column);
            if value.is_null() {
                continue;
            }
            let found = self.table(&fk.ref_table)?.values(&fk.ref_column).any(|v| v == value);
            if !found {
                return Err(StorageError::Constraint(format!(
                    "{}.{} = {} has no match in {}.{}",
                    table_name, fk.column, value, fk.ref_table, fk.ref_column
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn describe_table(&self, name: &str) -> Result<TargetTable, StorageError> {
        let table = self.table(name)?;
        let columns = table
            .columns
            .iter()
            .map(|c| {
                let mut column = c.clone();
                column.unique = table.is_unique(&c.name);
                if table.primary_key.as_ref() == Some(&c.name) {
                    column.nullable = false;
                }
                column
            })
            .collect();
        Ok(TargetTable {
            name: name.to_string(),
            columns,
            identity_column: table.primary_key.clone(),
        })
    }

    pub(crate) fn add_column(
        &mut self,
        table_name: &str,
        column: &ColumnDef,
    ) -> Result<(), StorageError> {
        let table = self.table_mut(table_name)?;
        if table.column(&column.name).is_some() {
            return Err(StorageError::conflict(
                table_name,
                &column.name,
                "column already exists",
            ));
        }
        let fill = column.default.clone().unwrap_or(Value::Null);
        if fill.is_null() && !column.nullable && !table.rows.is_empty() {
            return Err(StorageError::Constraint(format!(
                "{}.{} is NOT NULL without a default",
                table_name, column.name
            )));
        }
        if column.unique && !fill.is_null() && table.rows.len() > 1 {
            return Err(StorageError::Constraint(format!(
                "default of unique column {}.{} would be duplicated",
                table_name, column.name
            )));
        }
        table.columns.push(ColumnDef {
            unique: false,
            ..column.clone()
        });
        for row in &mut table.rows {
            row.insert(column.name.clone(), fill.clone());
        }
        if column.unique {
            table
                .unique_indexes
                .insert(index_name(table_name, &column.name), column.name.clone());
        }
        Ok(())
    }

    pub(crate) fn drop_column(
        &mut self,
        table_name: &str,
        column: &str,
    ) -> Result<(), StorageError> {
        let table = self.table(table_name)?;
        if table.column(column).is_none() {
            return Err(StorageError::conflict(table_name, column, "column does not exist"));
        }
        for (name, other) in &self.tables {
            if let Some(fk) = other
                .foreign_keys
                .iter()
                .find(|fk| {
                    fk.ref_table == table_name
                        && fk.ref_column == column
                        && (name != table_name || fk.column != column)
                })
            {
                return Err(StorageError::Constraint(format!(
                    "cannot drop {}.{}: foreign key {}.{} depends on it",
                    table_name, column, name, fk.column
                )));
            }
        }

        let table = self.table_mut(table_name)?;
        table.columns.retain(|c| c.name != column);
        for row in &mut table.rows {
            row.remove(column);
        }
        if table.primary_key.as_deref() == Some(column) {
            table.primary_key = None;
        }
        table.unique_indexes.retain(|_, c| c != column);
        table.foreign_keys.retain(|fk| fk.column != column);
        Ok(())
    }

    pub(crate) fn rename_column(
        &mut self,
        table_name: &str,
        from: &str,
        to: &str,
    ) -> Result<(), StorageError> {
        let table = self.table_mut(table_name)?;
        if table.column(from).is_none() {
            return Err(StorageError::conflict(table_name, from, "column does not exist"));
        }
        if table.column(to).is_some() {
            return Err(StorageError::conflict(table_name, to, "column already exists"));
        }
        for column in &mut table.columns {
            if column.name == from {
                column.name = to.to_string();
            }
        }
        for row in &mut table.rows {
            if let Some(value) = row.remove(from) {
                row.insert(to.to_string(), value);
            }
        }
        if table.primary_key.as_deref() == Some(from) {
            table.primary_key = Some(to.to_string());
        }
        for column in table.unique_indexes.values_mut() {
            if column == from {
                *column = to.to_string();
            }
        }
        for fk in &mut table.foreign_keys {
            if fk.column == from {
                fk.column = to.to_string();
            }
        }
        for other in self.tables.values_mut() {
            for fk in &mut other.foreign_keys {
                if fk.ref_table == table_name && fk.ref_column == from {
                    fk.ref_column = to.to_string();
                }
            }
        }
        Ok(())
    }

    pub(crate) fn add_unique_index(
        &mut self,
        table_name: &str,
        column: &str,
    ) -> Result<(), StorageError> {
        self.require_column(table_name, column)?;
        let name = index_name(table_name, column);
        let table = self.table_mut(table_name)?;
        if table.unique_indexes.contains_key(&name) {
            let detail = format!("index {} already exists", name);
            return Err(StorageError::conflict(table_name, column, detail));
        }
        let mut seen = BTreeSet::new();
        if !table.values(column).all(|v| seen.insert(v)) {
            return Err(StorageError::Constraint(format!(
                "{}.{} contains duplicates",
                table_name, column
            )));
        }
        table.unique_indexes.insert(name, column.to_string());
        Ok(())
    }

    pub(crate) fn drop_index(
        &mut self,
        table_name: &str,
        column: &str,
    ) -> Result<(), StorageError> {
        let name = index_name(table_name, column);
        let table = self.table_mut(table_name)?;
        if table.unique_indexes.remove(&name).is_none() {
            let detail = format!("index {} does not exist", name);
            return Err(StorageError::conflict(table_name, column, detail));
        }
        Ok(())
    }

    pub(crate) fn add_primary_key(
        &mut self,
        table_name: &str,
        column: &str,
    ) -> Result<(), StorageError> {
        self.require_column(table_name, column)?;
        let table = self.table_mut(table_name)?;
        if let Some(existing) = &table.primary_key {
            return Err(StorageError::conflict(
                table_name,
                column,
                format!("primary key already on {}", existing),
            ));
        }
        if table.rows.iter().any(|row| Table::cell(row, column).is_null()) {
            return Err(StorageError::Constraint(format!(
                "{}.{} contains NULL",
                table_name, column
            )));
        }
        let mut seen = BTreeSet::new();
        if !table.values(column).all(|v| seen.insert(v)) {
            return Err(StorageError::Constraint(format!(
                "{}.{} contains duplicates",
                table_name, column
            )));
        }
        table.primary_key = Some(column.to_string());
        Ok(())
    }

    pub(crate) fn add_foreign_key(
        &mut self,
        table_name: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<(), StorageError> {
        self.require_column(table_name, column)?;
        self.require_column(ref_table, ref_column)?;
        if !self.table(ref_table)?.is_unique(ref_column) {
            return Err(StorageError::Constraint(format!(
                "{}.{} is not unique",
                ref_table, ref_column
            )));
        }
        let fk = ForeignKey {
            column: column.to_string(),
            ref_table: ref_table.to_string(),
            ref_column: ref_column.to_string(),
        };
        if self.table(table_name)?.foreign_keys.contains(&fk) {
            return Err(StorageError::conflict(table_name, column, "foreign key already exists"));
        }
        let orphans = self.orphans(table_name, column, ref_table, ref_column)?;
        if orphans > 0 {
            return Err(StorageError::Constraint(format!(
                "{} values in {}.{} have no match in {}.{}",
                orphans, table_name, column, ref_table, ref_column
            )));
        }
        self.table_mut(table_name)?.foreign_keys.push(fk);
        Ok(())
    }

    pub(crate) fn set_not_null(
        &mut self,
        table_name: &str,
        column: &str,
    ) -> Result<(), StorageError> {
        self.require_column(table_name, column)?;
        let table = self.table_mut(table_name)?;
        if table.rows.iter().any(|row| Table::cell(row, column).is_null()) {
            return Err(StorageError::Constraint(format!(
                "{}.{} contains NULL",
                table_name, column
            )));
        }
        for def in &mut table.columns {
            if def.name == column {
                def.nullable = false;
            }
        }
        Ok(())
    }

    pub(crate) fn fetch_pending(
        &self,
        query: &PendingQuery<'_>,
    ) -> Result<Vec<PendingRow>, StorageError> {
        self.require_column(query.table, query.key_column)?;
        self.require_column(query.table, query.shadow_column)?;
        if let Some(source) = query.source_column {
            self.require_column(query.table, source)?;
        }
        let table = self.table(query.table)?;
        let mut rows: Vec<PendingRow> = table
            .rows
            .iter()
            .filter(|row| Table::cell(row, query.shadow_column).is_null())
            .map(|row| PendingRow {
                key: Table::cell(row, query.key_column).clone(),
                source: query
                    .source_column
                    .map(|c| Table::cell(row, c).clone())
                    .unwrap_or(Value::Null),
            })
            .filter(|row| !query.require_source || !row.source.is_null())
            .filter(|row| query.after.is_none_or(|after| &row.key > after))
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows.truncate(query.limit);
        Ok(rows)
    }

    pub(crate) fn lookup_shadow(
        &self,
        table_name: &str,
        key_column: &str,
        shadow_column: &str,
        keys: &[Value],
    ) -> Result<HashMap<Value, Uuid>, StorageError> {
        self.require_column(table_name, key_column)?;
        self.require_column(table_name, shadow_column)?;
        let wanted: BTreeSet<&Value> = keys.iter().collect();
        Ok(self
            .table(table_name)?
            .rows
            .iter()
            .filter(|row| wanted.contains(Table::cell(row, key_column)))
            .filter_map(|row| {
                Table::cell(row, shadow_column)
                    .as_uuid()
                    .map(|id| (Table::cell(row, key_column).clone(), id))
            })
            .collect())
    }

    pub(crate) fn write_shadow(
        &mut self,
        table_name: &str,
        key_column: &str,
        shadow_column: &str,
        updates: &[(Value, Uuid)],
    ) -> Result<u64, StorageError> {
        self.require_column(table_name, key_column)?;
        let column = self.require_column(table_name, shadow_column)?;
        if column.column_type != ColumnType::Uuid {
            return Err(StorageError::Constraint(format!(
                "{}.{} is {}, not uuid",
                table_name, shadow_column, column.column_type
            )));
        }

        let table = self.table(table_name)?;
        let wanted: HashMap<&Value, Uuid> = updates.iter().map(|(k, id)| (k, *id)).collect();
        let staged: Vec<(usize, Uuid)> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| Table::cell(row, shadow_column).is_null())
            .filter_map(|(i, row)| wanted.get(Table::cell(row, key_column)).map(|id| (i, *id)))
            .collect();

        if table.is_unique(shadow_column) {
            let mut seen: BTreeSet<Value> = table.values(shadow_column).cloned().collect();
            for (_, id) in &staged {
                if !seen.insert(Value::Uuid(*id)) {
                    return Err(StorageError::Constraint(format!(
                        "duplicate value {} in {}.{}",
                        id, table_name, shadow_column
                    )));
                }
            }
        }

        let table = self.table_mut(table_name)?;
        for (i, id) in &staged {
            table.rows[*i].insert(shadow_column.to_string(), Value::Uuid(*id));
        }
        Ok(staged.len() as u64)
    }

    pub(crate) fn count_missing(
        &self,
        table_name: &str,
        shadow_column: &str,
        source_column: Option<&str>,
    ) -> Result<u64, StorageError> {
        self.require_column(table_name, shadow_column)?;
        if let Some(source) = source_column {
            self.require_column(table_name, source)?;
        }
        Ok(self
            .table(table_name)?
            .rows
            .iter()
            .filter(|row| Table::cell(row, shadow_column).is_null())
            .filter(|row| source_column.is_none_or(|c| !Table::cell(row, c).is_null()))
            .count() as u64)
    }

    pub(crate) fn orphans(
        &self,
        table_name: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<u64, StorageError> {
        self.require_column(table_name, column)?;
        self.require_column(ref_table, ref_column)?;
        let targets: BTreeSet<&Value> = self.table(ref_table)?.values(ref_column).collect();
        Ok(self
            .table(table_name)?
            .values(column)
            .filter(|v| !targets.contains(v))
            .count() as u64)
    }

    pub(crate) fn count_mistranslated(
        &self,
        reference: &ReferenceTranslation<'_>,
    ) -> Result<u64, StorageError> {
        self.require_column(reference.table, reference.column)?;
        self.require_column(reference.table, reference.shadow_column)?;
        let translations = self.lookup_shadow(
            reference.referenced_table,
            reference.referenced_key,
            reference.referenced_shadow,
            &self
                .table(reference.table)?
                .values(reference.column)
                .cloned()
                .collect::<Vec<_>>(),
        )?;
        Ok(self
            .table(reference.table)?
            .rows
            .iter()
            .filter(|row| {
                let Some(shadow) = Table::cell(row, reference.shadow_column).as_uuid() else {
                    return false;
                };
                translations.get(Table::cell(row, reference.column)) != Some(&shadow)
            })
            .count() as u64)
    }
}
