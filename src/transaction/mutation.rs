// ============================================================================
// Mutation Buffer
// ============================================================================
//
// Row-level write intents collected by a transaction and shipped with the
// commit. Order of the buffer is the order the server applies them in.
//
// ============================================================================

use crate::core::{Catalog, DbError, Key, Result, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

/// A contiguous range of primary keys.
///
/// Bounds compare against key prefixes; an empty bound is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Key,
    pub start_closed: bool,
    pub end: Key,
    pub end_closed: bool,
}

impl KeyRange {
    pub fn closed_open(start: Key, end: Key) -> Self {
        Self {
            start,
            start_closed: true,
            end,
            end_closed: false,
        }
    }

    pub fn closed_closed(start: Key, end: Key) -> Self {
        Self {
            start,
            start_closed: true,
            end,
            end_closed: true,
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: Key) -> Self {
        Self::closed_closed(prefix.clone(), prefix)
    }

    pub fn contains(&self, key: &Key) -> bool {
        if !self.start.is_empty() {
            let len = self.start.len().min(key.len());
            match key[..len].cmp(&self.start[..len]) {
                Ordering::Less => return false,
                Ordering::Equal if !self.start_closed && len == self.start.len() => return false,
                _ => {}
            }
        }
        if !self.end.is_empty() {
            let len = self.end.len().min(key.len());
            match key[..len].cmp(&self.end[..len]) {
                Ordering::Greater => return false,
                Ordering::Equal if !self.end_closed && len == self.end.len() => return false,
                _ => {}
            }
        }
        true
    }
}

/// A set of rows addressed by key: explicit keys, ranges, or everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    pub keys: Vec<Key>,
    pub ranges: Vec<KeyRange>,
    pub all: bool,
}

impl KeySet {
    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn key(key: Key) -> Self {
        Self {
            keys: vec![key],
            ..Self::default()
        }
    }

    pub fn keys(keys: impl IntoIterator<Item = Key>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn range(range: KeyRange) -> Self {
        Self {
            ranges: vec![range],
            ..Self::default()
        }
    }

    pub fn with_key(mut self, key: Key) -> Self {
        self.keys.push(key);
        self
    }

    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.ranges.push(range);
        self
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.all || self.keys.contains(key) || self.ranges.iter().any(|r| r.contains(key))
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.keys.is_empty() && self.ranges.is_empty()
    }
}

/// Rows written to a subset of a table's columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Write {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Insert(Write),
    Update(Write),
    InsertOrUpdate(Write),
    Replace(Write),
    Delete { table: String, key_set: KeySet },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert(w) | Self::Update(w) | Self::InsertOrUpdate(w) | Self::Replace(w) => {
                &w.table
            }
            Self::Delete { table, .. } => table,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "insert",
            Self::Update(_) => "update",
            Self::InsertOrUpdate(_) => "insert_or_update",
            Self::Replace(_) => "replace",
            Self::Delete { .. } => "delete",
        }
    }

    pub fn write(&self) -> Option<&Write> {
        match self {
            Self::Insert(w) | Self::Update(w) | Self::InsertOrUpdate(w) | Self::Replace(w) => {
                Some(w)
            }
            Self::Delete { .. } => None,
        }
    }

    /// Rows or keys this mutation names, as counted by commit stats.
    pub fn row_count(&self) -> usize {
        match self {
            Self::Delete { key_set, .. } => key_set.keys.len() + key_set.ranges.len(),
            _ => self.write().map_or(0, |w| w.values.len()),
        }
    }
}

/// Ordered write intents for one transaction.
///
/// With a catalog attached, every append is checked against the table's
/// columns and types, so bad writes fail here rather than at commit.
#[derive(Debug, Clone, Default)]
pub struct MutationBuffer {
    mutations: Vec<Mutation>,
    catalog: Option<Arc<Catalog>>,
}

impl MutationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: Arc<Catalog>) -> Self {
        Self {
            mutations: Vec::new(),
            catalog: Some(catalog),
        }
    }

    pub fn insert(&mut self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        let write = self.checked_write(table, columns, rows)?;
        self.mutations.push(Mutation::Insert(write));
        Ok(())
    }

    pub fn update(&mut self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        let write = self.checked_write(table, columns, rows)?;
        self.mutations.push(Mutation::Update(write));
        Ok(())
    }

    pub fn insert_or_update(&mut self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        let write = self.checked_write(table, columns, rows)?;
        self.mutations.push(Mutation::InsertOrUpdate(write));
        Ok(())
    }

    pub fn replace(&mut self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<()> {
        let write = self.checked_write(table, columns, rows)?;
        self.mutations.push(Mutation::Replace(write));
        Ok(())
    }

    pub fn delete(&mut self, table: &str, key_set: KeySet) -> Result<()> {
        if let Some(catalog) = &self.catalog {
            let schema = catalog.get_table(table)?;
            let key_len = schema.primary_key().len();
            if let Some(bad) = key_set.keys.iter().find(|k| k.len() != key_len) {
                return Err(DbError::ConstraintViolation(format!(
                    "Table '{}': key has {} part(s), expected {}",
                    table,
                    bad.len(),
                    key_len
                )));
            }
        }
        self.mutations.push(Mutation::Delete {
            table: table.to_string(),
            key_set,
        });
        Ok(())
    }

    /// Appends an already-built mutation, validating it like the typed helpers.
    pub fn push(&mut self, mutation: Mutation) -> Result<()> {
        if let Some(write) = mutation.write() {
            self.validate_write(write)?;
        } else if let Mutation::Delete { table, .. } = &mutation
            && let Some(catalog) = &self.catalog
        {
            catalog.get_table(table)?;
        }
        self.mutations.push(mutation);
        Ok(())
    }

    pub fn extend(&mut self, other: MutationBuffer) {
        self.mutations.extend(other.mutations);
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn clear(&mut self) {
        self.mutations.clear();
    }

    /// Drains the buffer in append order.
    pub fn take(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.mutations)
    }

    fn checked_write(&self, table: &str, columns: &[&str], rows: Vec<Row>) -> Result<Write> {
        let write = Write {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values: rows,
        };
        self.validate_write(&write)?;
        Ok(write)
    }

    fn validate_write(&self, write: &Write) -> Result<()> {
        if let Some(row) = write.values.iter().find(|r| r.len() != write.columns.len()) {
            return Err(DbError::ConstraintViolation(format!(
                "Table '{}': {} column(s) but {} value(s)",
                write.table,
                write.columns.len(),
                row.len()
            )));
        }
        if let Some(catalog) = &self.catalog {
            let schema = catalog.get_table(&write.table)?;
            schema.resolve_columns(&write.columns)?;
            for row in &write.values {
                schema.validate_row(&write.columns, row)?;
            }
        }
        Ok(())
    }
}

impl From<MutationBuffer> for Vec<Mutation> {
    fn from(mut buffer: MutationBuffer) -> Self {
        buffer.take()
    }
}
