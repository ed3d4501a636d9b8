//! Validates a target database's schema against the framework's column
//! contract without owning or migrating it.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::SchemaError;
use crate::store::StoreAdapter;

pub const BLOCKS_TABLE: &str = "blocks";

#[derive(Debug, Deserialize)]
struct ColumnRow {
    table: String,
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

/// `(table, column, type)` view used to validate the schema contract.
async fn columns(store: &StoreAdapter, database: &str) -> Result<BTreeMap<String, Vec<(String, String)>>, SchemaError> {
    let sql = format!(
        "SELECT table, name, type FROM system.columns WHERE database = '{database}'"
    );
    let rows = store.query::<ColumnRow>(database, &sql).await?.data;

    let mut by_table: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    for row in rows {
        by_table.entry(row.table).or_default().push((row.name, row.column_type));
    }
    Ok(by_table)
}

fn is_block_number(ty: &str) -> bool {
    matches!(ty, "UInt32" | "UInt64")
}

fn is_hash(ty: &str) -> bool {
    ty == "String" || (ty.starts_with("FixedString(") && ty.ends_with(')'))
}

fn is_datetime(ty: &str) -> bool {
    ty == "DateTime"
}

fn find<'a>(cols: &'a [(String, String)], name: &str) -> Option<&'a str> {
    cols.iter().find(|(n, _)| n == name).map(|(_, t)| t.as_str())
}

fn require(
    table: &str,
    cols: &[(String, String)],
    column: &str,
    predicate: fn(&str) -> bool,
    expected: &'static str,
) -> Result<(), SchemaError> {
    match find(cols, column) {
        None => Err(SchemaError::MissingColumn { table: table.to_owned(), column: column.to_owned() }),
        Some(ty) if !predicate(ty) => Err(SchemaError::WrongColumnType {
            table: table.to_owned(),
            column: column.to_owned(),
            found: ty.to_owned(),
            expected,
        }),
        Some(_) => Ok(()),
    }
}

fn optional(cols: &[(String, String)], column: &str, predicate: fn(&str) -> bool, expected: &'static str, table: &str) -> Result<(), SchemaError> {
    match find(cols, column) {
        None => Ok(()),
        Some(ty) if !predicate(ty) => Err(SchemaError::WrongColumnType {
            table: table.to_owned(),
            column: column.to_owned(),
            found: ty.to_owned(),
            expected,
        }),
        Some(_) => Ok(()),
    }
}

/// Whether an optional column is present on a given item table, used by the
/// writer to decide whether to populate it on a flushed row.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionalColumns {
    pub block_hash: bool,
    pub block_timestamp: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaInfo {
    pub item_tables: Vec<String>,
    pub optional_columns: BTreeMap<String, OptionalColumns>,
}

/// Enumerate tables in `database`, validate the framework's column contract,
/// and return the item tables (every table except `blocks`).
pub async fn inspect(store: &StoreAdapter, database: &str) -> Result<SchemaInfo, SchemaError> {
    let by_table = columns(store, database).await?;

    let blocks_cols = by_table
        .get(BLOCKS_TABLE)
        .ok_or_else(|| SchemaError::MissingBlocksTable { database: database.to_owned() })?;

    require(BLOCKS_TABLE, blocks_cols, "number", is_block_number, "UInt32 | UInt64")?;
    require(BLOCKS_TABLE, blocks_cols, "hash", is_hash, "String | FixedString(N)")?;
    require(BLOCKS_TABLE, blocks_cols, "parent_hash", is_hash, "String | FixedString(N)")?;
    optional(blocks_cols, "parent_number", is_block_number, "UInt32 | UInt64", BLOCKS_TABLE)?;
    optional(blocks_cols, "timestamp", is_datetime, "DateTime", BLOCKS_TABLE)?;

    let mut item_tables = Vec::new();
    let mut optional_columns = BTreeMap::new();

    for (table, cols) in &by_table {
        if table == BLOCKS_TABLE {
            continue;
        }
        require(table, cols, "block_number", is_block_number, "UInt32 | UInt64")?;
        require(table, cols, "block_hash", is_hash, "String | FixedString(N)")?;
        optional(cols, "block_timestamp", is_datetime, "DateTime", table)?;

        optional_columns.insert(
            table.clone(),
            OptionalColumns {
                block_hash: find(cols, "block_hash").is_some(),
                block_timestamp: find(cols, "block_timestamp").is_some(),
            },
        );
        item_tables.push(table.clone());
    }

    Ok(SchemaInfo { item_tables, optional_columns })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(n, t)| (n.to_string(), t.to_string())).collect()
    }

    #[test]
    fn is_block_number_accepts_unsigned_integer_types() {
        assert!(is_block_number("UInt32"));
        assert!(is_block_number("UInt64"));
        assert!(!is_block_number("Int32"));
        assert!(!is_block_number("String"));
    }

    #[test]
    fn is_hash_accepts_string_and_fixed_string() {
        assert!(is_hash("String"));
        assert!(is_hash("FixedString(32)"));
        assert!(!is_hash("FixedString(32"));
        assert!(!is_hash("UInt64"));
    }

    #[test]
    fn require_reports_missing_column() {
        let columns = cols(&[("number", "UInt64")]);
        let err = require("blocks", &columns, "hash", is_hash, "String").unwrap_err();
        assert!(matches!(err, SchemaError::MissingColumn { table, column } if table == "blocks" && column == "hash"));
    }

    #[test]
    fn require_reports_wrong_type() {
        let columns = cols(&[("hash", "UInt64")]);
        let err = require("blocks", &columns, "hash", is_hash, "String | FixedString(N)").unwrap_err();
        assert!(matches!(err, SchemaError::WrongColumnType { found, .. } if found == "UInt64"));
    }

    #[test]
    fn optional_column_absent_is_fine() {
        let columns = cols(&[("number", "UInt64")]);
        assert!(optional(&columns, "timestamp", is_datetime, "DateTime", "blocks").is_ok());
    }

    #[test]
    fn optional_column_present_with_wrong_type_is_rejected() {
        let columns = cols(&[("timestamp", "String")]);
        let err = optional(&columns, "timestamp", is_datetime, "DateTime", "blocks").unwrap_err();
        assert!(matches!(err, SchemaError::WrongColumnType { .. }));
    }
}
