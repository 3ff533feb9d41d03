use super::{DataType, DbError, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Row = Vec<Value>;

/// Primary key values, in key-column order.
pub type Key = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(DbError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

/// Column layout of one table, with its primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>, primary_key: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: primary_key.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn find_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|col| col.name == name)
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.find_column_index(name).map(|idx| &self.columns[idx])
    }

    /// Resolves column names to their positions, failing on unknown names.
    pub fn resolve_columns(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.find_column_index(name)
                    .ok_or_else(|| DbError::ColumnNotFound(name.clone(), self.name.clone()))
            })
            .collect()
    }

    /// Checks a row written to `names` against the column types and the key.
    pub fn validate_row(&self, names: &[String], row: &[Value]) -> Result<()> {
        if names.len() != row.len() {
            return Err(DbError::ConstraintViolation(format!(
                "Table '{}': {} column(s) but {} value(s)",
                self.name,
                names.len(),
                row.len()
            )));
        }
        let positions = self.resolve_columns(names)?;
        for (pos, value) in positions.iter().zip(row) {
            self.columns[*pos].validate(value)?;
        }
        for key_col in &self.primary_key {
            if !names.iter().any(|n| n == key_col) {
                return Err(DbError::ConstraintViolation(format!(
                    "Table '{}': primary key column '{}' missing from write",
                    self.name, key_col
                )));
            }
        }
        Ok(())
    }

    /// Extracts the primary key from a row written to `names`.
    pub fn key_of(&self, names: &[String], row: &[Value]) -> Result<Key> {
        self.primary_key
            .iter()
            .map(|key_col| {
                names
                    .iter()
                    .position(|n| n == key_col)
                    .and_then(|idx| row.get(idx).cloned())
                    .ok_or_else(|| DbError::ColumnNotFound(key_col.clone(), self.name.clone()))
            })
            .collect()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Known table layouts, keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, TableSchema>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, schema: TableSchema) -> Self {
        self.add_table(schema);
        self
    }

    pub fn add_table(&mut self, schema: TableSchema) {
        self.tables.insert(schema.name().to_string(), schema);
    }

    pub fn get_table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .get(name)
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn singers() -> TableSchema {
        TableSchema::new(
            "Singers",
            vec![
                Column::new("SingerId", DataType::Integer).not_null(),
                Column::new("Name", DataType::Text),
            ],
            vec!["SingerId"],
        )
    }

    #[test]
    fn test_resolve_unknown_column() {
        let schema = singers();
        let err = schema
            .resolve_columns(&["SingerId".into(), "Age".into()])
            .unwrap_err();
        assert!(matches!(err, DbError::ColumnNotFound(col, table) if col == "Age" && table == "Singers"));
    }

    #[test]
    fn test_validate_row_types() {
        let schema = singers();
        let names = vec!["SingerId".to_string(), "Name".to_string()];
        assert!(schema
            .validate_row(&names, &[Value::Integer(1), Value::Text("Marc".into())])
            .is_ok());
        assert!(schema
            .validate_row(&names, &[Value::Text("1".into()), Value::Null])
            .is_err());
        assert!(schema
            .validate_row(&names, &[Value::Null, Value::Null])
            .is_err());
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = Catalog::new().with_table(singers());
        assert!(catalog.get_table("Singers").is_ok());
        assert!(matches!(
            catalog.get_table("Albums"),
            Err(DbError::TableNotFound(name)) if name == "Albums"
        ));
    }

    #[test]
    fn test_key_of() {
        let schema = singers();
        let names = vec!["Name".to_string(), "SingerId".to_string()];
        let key = schema
            .key_of(&names, &[Value::Text("Marc".into()), Value::Integer(7)])
            .unwrap();
        assert_eq!(key, vec![Value::Integer(7)]);
    }
}
