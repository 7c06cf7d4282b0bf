//! Database schema introspection.
//!
//! Catalog-driven description of the database, exposed as the
//! `list_tables` and `describe_table` tools. Introspection deliberately
//! bypasses the query pipeline: no protection checking, hooks,
//! sanitization, or error prompts apply here, and each operation carries
//! its own timeout.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row as SqlxRow;
use tracing::debug;

use crate::connection::Connection;
use crate::{GatewayError, Result};

/// Relation kinds surfaced by the gateway, mapped from `pg_class.relkind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Table,
    View,
    MaterializedView,
    ForeignTable,
    PartitionedTable,
}

impl TableKind {
    fn from_relkind(relkind: &str) -> Option<Self> {
        match relkind {
            "r" => Some(TableKind::Table),
            "v" => Some(TableKind::View),
            "m" => Some(TableKind::MaterializedView),
            "f" => Some(TableKind::ForeignTable),
            "p" => Some(TableKind::PartitionedTable),
            _ => None,
        }
    }
}

/// One row of the `list_tables` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub schema: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TableKind,
    pub owner: String,
    /// True when the current role lacks USAGE on the containing schema.
    pub schema_access_limited: bool,
}

/// Represents a column in a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub is_primary_key: bool,
}

/// Represents a table index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub is_unique: bool,
    pub is_primary: bool,
}

/// Represents a table constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub constraint_type: String,
    pub definition: String,
}

/// Represents a foreign key constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    pub on_update: String,
    pub on_delete: String,
}

/// Partitioning metadata: set for partitioned tables (strategy, key,
/// children) and for child partitions (parent only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub partitions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_table: Option<String>,
}

/// Full description of one relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescription {
    pub schema: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TableKind,
    /// View definition; only present for views and materialized views.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub constraints: Vec<ConstraintInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionInfo>,
}

/// Quote an identifier for interpolation into a catalog cast, doubling any
/// embedded double quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

const LIST_TABLES_SQL: &str = r#"
SELECT n.nspname,
       c.relname,
       c.relkind::text,
       pg_get_userbyid(c.relowner),
       NOT has_schema_privilege(current_user, n.oid, 'USAGE')
FROM pg_catalog.pg_class c
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE c.relkind IN ('r', 'v', 'm', 'f', 'p')
  AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'pg_toast')
  AND has_table_privilege(current_user, c.oid, 'SELECT')
ORDER BY n.nspname, c.relname
"#;

const RESOLVE_RELKIND_SQL: &str = r#"
SELECT c.relkind::text
FROM pg_catalog.pg_class c
WHERE c.oid = to_regclass($1::text)
"#;

const INFO_SCHEMA_COLUMNS_SQL: &str = r#"
SELECT c.column_name,
       c.data_type,
       c.is_nullable = 'YES',
       c.column_default,
       COALESCE(pk.is_pk, false)
FROM information_schema.columns c
LEFT JOIN (
    SELECT a.attname AS column_name, true AS is_pk
    FROM pg_catalog.pg_index i
    JOIN pg_catalog.pg_attribute a
      ON a.attrelid = i.indrelid AND a.attnum = ANY (i.indkey)
    WHERE i.indrelid = to_regclass($1::text) AND i.indisprimary
) pk USING (column_name)
WHERE c.table_schema = $2 AND c.table_name = $3
ORDER BY c.ordinal_position
"#;

// Materialized views do not appear in information_schema.columns.
const MATVIEW_COLUMNS_SQL: &str = r#"
SELECT a.attname,
       pg_catalog.format_type(a.atttypid, a.atttypmod),
       NOT a.attnotnull,
       pg_get_expr(d.adbin, d.adrelid),
       false
FROM pg_catalog.pg_attribute a
LEFT JOIN pg_catalog.pg_attrdef d
  ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE a.attrelid = to_regclass($1::text)
  AND a.attnum > 0
  AND NOT a.attisdropped
ORDER BY a.attnum
"#;

const VIEW_DEFINITION_SQL: &str = "SELECT pg_get_viewdef(to_regclass($1::text), true)";

const INDEXES_SQL: &str = r#"
SELECT ic.relname,
       pg_get_indexdef(x.indexrelid),
       x.indisunique,
       x.indisprimary
FROM pg_catalog.pg_index x
JOIN pg_catalog.pg_class ic ON ic.oid = x.indexrelid
WHERE x.indrelid = to_regclass($1::text)
ORDER BY ic.relname
"#;

const CONSTRAINTS_SQL: &str = r#"
SELECT conname,
       contype::text,
       pg_get_constraintdef(oid)
FROM pg_catalog.pg_constraint
WHERE conrelid = to_regclass($1::text)
ORDER BY conname
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT con.conname,
       ARRAY(
           SELECT a.attname::text
           FROM unnest(con.conkey) WITH ORDINALITY k(attnum, ord)
           JOIN pg_catalog.pg_attribute a
             ON a.attrelid = con.conrelid AND a.attnum = k.attnum
           ORDER BY k.ord
       ),
       nf.nspname || '.' || cf.relname,
       ARRAY(
           SELECT a.attname::text
           FROM unnest(con.confkey) WITH ORDINALITY k(attnum, ord)
           JOIN pg_catalog.pg_attribute a
             ON a.attrelid = con.confrelid AND a.attnum = k.attnum
           ORDER BY k.ord
       ),
       con.confupdtype::text,
       con.confdeltype::text
FROM pg_catalog.pg_constraint con
JOIN pg_catalog.pg_class cf ON cf.oid = con.confrelid
JOIN pg_catalog.pg_namespace nf ON nf.oid = cf.relnamespace
WHERE con.conrelid = to_regclass($1::text) AND con.contype = 'f'
ORDER BY con.conname
"#;

const PARTITION_STRATEGY_SQL: &str = r#"
SELECT p.partstrat::text, pg_get_partkeydef(p.partrelid)
FROM pg_catalog.pg_partitioned_table p
WHERE p.partrelid = to_regclass($1::text)
"#;

const PARTITION_CHILDREN_SQL: &str = r#"
SELECT n.nspname || '.' || c.relname
FROM pg_catalog.pg_inherits i
JOIN pg_catalog.pg_class c ON c.oid = i.inhrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE i.inhparent = to_regclass($1::text)
ORDER BY 1
"#;

const PARTITION_PARENT_SQL: &str = r#"
SELECT pn.nspname || '.' || pc.relname
FROM pg_catalog.pg_inherits i
JOIN pg_catalog.pg_class pc ON pc.oid = i.inhparent
JOIN pg_catalog.pg_namespace pn ON pn.oid = pc.relnamespace
WHERE i.inhrelid = to_regclass($1::text) AND pc.relkind = 'p'
"#;

/// Schema introspection over one connection pool.
pub struct SchemaInspector {
    conn: Connection,
}

impl SchemaInspector {
    /// Creates a new schema inspector.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Lists every table-like object visible to the current role.
    ///
    /// Covers ordinary tables, views, materialized views, foreign tables,
    /// and partitioned tables outside the system schemas, restricted to
    /// objects the role may SELECT from.
    pub async fn list_tables(&self) -> Result<Vec<TableEntry>> {
        let rows = sqlx::query(LIST_TABLES_SQL)
            .fetch_all(self.conn.pool())
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let relkind: String = row.try_get(2)?;
            let Some(kind) = TableKind::from_relkind(&relkind) else {
                continue;
            };
            entries.push(TableEntry {
                schema: row.try_get(0)?,
                name: row.try_get(1)?,
                kind,
                owner: row.try_get(3)?,
                schema_access_limited: row.try_get(4)?,
            });
        }

        debug!(count = entries.len(), "listed tables");
        Ok(entries)
    }

    /// Describes one relation: columns, indexes, constraints, foreign
    /// keys, view definition, and partition metadata, as applicable to its
    /// kind.
    ///
    /// All catalog queries run inside a read-only transaction that is
    /// always rolled back.
    pub async fn describe_table(&self, schema: &str, name: &str) -> Result<TableDescription> {
        let qualified = format!("{}.{}", quote_ident(schema), quote_ident(name));

        let mut tx = self.conn.pool().begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let relkind: Option<String> = sqlx::query(RESOLVE_RELKIND_SQL)
            .bind(&qualified)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.try_get(0))
            .transpose()?;

        let kind = relkind
            .as_deref()
            .and_then(TableKind::from_relkind)
            .ok_or_else(|| {
                GatewayError::Query(format!("table not found: {}.{}", schema, name))
            })?;

        let columns = match kind {
            TableKind::MaterializedView => {
                collect_columns(
                    sqlx::query(MATVIEW_COLUMNS_SQL)
                        .bind(&qualified)
                        .fetch_all(&mut *tx)
                        .await?,
                )?
            }
            _ => collect_columns(
                sqlx::query(INFO_SCHEMA_COLUMNS_SQL)
                    .bind(&qualified)
                    .bind(schema)
                    .bind(name)
                    .fetch_all(&mut *tx)
                    .await?,
            )?,
        };

        let definition = match kind {
            TableKind::View | TableKind::MaterializedView => sqlx::query(VIEW_DEFINITION_SQL)
                .bind(&qualified)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get(0))
                .transpose()?,
            _ => None,
        };

        let indexes = match kind {
            TableKind::Table | TableKind::PartitionedTable | TableKind::MaterializedView => {
                let rows = sqlx::query(INDEXES_SQL)
                    .bind(&qualified)
                    .fetch_all(&mut *tx)
                    .await?;
                let mut indexes = Vec::with_capacity(rows.len());
                for row in rows {
                    indexes.push(IndexInfo {
                        name: row.try_get(0)?,
                        definition: row.try_get(1)?,
                        is_unique: row.try_get(2)?,
                        is_primary: row.try_get(3)?,
                    });
                }
                indexes
            }
            _ => Vec::new(),
        };

        let (constraints, foreign_keys) = match kind {
            TableKind::Table | TableKind::PartitionedTable => {
                let rows = sqlx::query(CONSTRAINTS_SQL)
                    .bind(&qualified)
                    .fetch_all(&mut *tx)
                    .await?;
                let mut constraints = Vec::with_capacity(rows.len());
                for row in rows {
                    let contype: String = row.try_get(1)?;
                    constraints.push(ConstraintInfo {
                        name: row.try_get(0)?,
                        constraint_type: constraint_type_name(&contype).to_string(),
                        definition: row.try_get(2)?,
                    });
                }

                let rows = sqlx::query(FOREIGN_KEYS_SQL)
                    .bind(&qualified)
                    .fetch_all(&mut *tx)
                    .await?;
                let mut foreign_keys = Vec::with_capacity(rows.len());
                for row in rows {
                    let on_update: String = row.try_get(4)?;
                    let on_delete: String = row.try_get(5)?;
                    foreign_keys.push(ForeignKeyInfo {
                        name: row.try_get(0)?,
                        columns: row.try_get(1)?,
                        referenced_table: row.try_get(2)?,
                        referenced_columns: row.try_get(3)?,
                        on_update: referential_action_name(&on_update).to_string(),
                        on_delete: referential_action_name(&on_delete).to_string(),
                    });
                }

                (constraints, foreign_keys)
            }
            _ => (Vec::new(), Vec::new()),
        };

        let partition = match kind {
            TableKind::PartitionedTable => {
                let strategy_row = sqlx::query(PARTITION_STRATEGY_SQL)
                    .bind(&qualified)
                    .fetch_optional(&mut *tx)
                    .await?;
                let (strategy, partition_key) = match strategy_row {
                    Some(row) => {
                        let strat: String = row.try_get(0)?;
                        (
                            Some(partition_strategy_name(&strat).to_string()),
                            Some(row.try_get(1)?),
                        )
                    }
                    None => (None, None),
                };

                let rows = sqlx::query(PARTITION_CHILDREN_SQL)
                    .bind(&qualified)
                    .fetch_all(&mut *tx)
                    .await?;
                let partitions = rows
                    .into_iter()
                    .map(|row| row.try_get(0))
                    .collect::<std::result::Result<Vec<String>, _>>()?;

                Some(PartitionInfo {
                    strategy,
                    partition_key,
                    partitions,
                    parent_table: None,
                })
            }
            TableKind::Table => {
                // An ordinary table may itself be a partition of a
                // partitioned parent.
                sqlx::query(PARTITION_PARENT_SQL)
                    .bind(&qualified)
                    .fetch_optional(&mut *tx)
                    .await?
                    .map(|row| {
                        Ok::<_, GatewayError>(PartitionInfo {
                            parent_table: Some(row.try_get::<String, _>(0)?),
                            ..Default::default()
                        })
                    })
                    .transpose()?
            }
            _ => None,
        };

        tx.rollback().await?;

        Ok(TableDescription {
            schema: schema.to_string(),
            name: name.to_string(),
            kind,
            definition,
            columns,
            indexes,
            constraints,
            foreign_keys,
            partition,
        })
    }
}

fn collect_columns(rows: Vec<PgRow>) -> Result<Vec<ColumnInfo>> {
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        columns.push(ColumnInfo {
            name: row.try_get(0)?,
            data_type: row.try_get(1)?,
            nullable: row.try_get(2)?,
            default: row.try_get(3)?,
            is_primary_key: row.try_get(4)?,
        });
    }
    Ok(columns)
}

fn constraint_type_name(contype: &str) -> &'static str {
    match contype {
        "p" => "PRIMARY KEY",
        "f" => "FOREIGN KEY",
        "u" => "UNIQUE",
        "c" => "CHECK",
        "x" => "EXCLUSION",
        _ => "UNKNOWN",
    }
}

fn referential_action_name(action: &str) -> &'static str {
    match action {
        "a" => "NO ACTION",
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => "UNKNOWN",
    }
}

fn partition_strategy_name(strategy: &str) -> &'static str {
    match strategy {
        "h" => "hash",
        "l" => "list",
        "r" => "range",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_plain() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("public"), "\"public\"");
    }

    #[test]
    fn test_quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident("\""), "\"\"\"\"");
    }

    #[test]
    fn test_relkind_mapping() {
        assert_eq!(TableKind::from_relkind("r"), Some(TableKind::Table));
        assert_eq!(TableKind::from_relkind("v"), Some(TableKind::View));
        assert_eq!(
            TableKind::from_relkind("m"),
            Some(TableKind::MaterializedView)
        );
        assert_eq!(TableKind::from_relkind("f"), Some(TableKind::ForeignTable));
        assert_eq!(
            TableKind::from_relkind("p"),
            Some(TableKind::PartitionedTable)
        );
        assert_eq!(TableKind::from_relkind("i"), None);
        assert_eq!(TableKind::from_relkind("S"), None);
    }

    #[test]
    fn test_table_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TableKind::MaterializedView).unwrap(),
            "\"materialized_view\""
        );
        assert_eq!(
            serde_json::to_string(&TableKind::PartitionedTable).unwrap(),
            "\"partitioned_table\""
        );
    }

    #[test]
    fn test_constraint_type_translation() {
        assert_eq!(constraint_type_name("p"), "PRIMARY KEY");
        assert_eq!(constraint_type_name("f"), "FOREIGN KEY");
        assert_eq!(constraint_type_name("u"), "UNIQUE");
        assert_eq!(constraint_type_name("c"), "CHECK");
        assert_eq!(constraint_type_name("x"), "EXCLUSION");
    }

    #[test]
    fn test_referential_action_translation() {
        assert_eq!(referential_action_name("a"), "NO ACTION");
        assert_eq!(referential_action_name("r"), "RESTRICT");
        assert_eq!(referential_action_name("c"), "CASCADE");
        assert_eq!(referential_action_name("n"), "SET NULL");
        assert_eq!(referential_action_name("d"), "SET DEFAULT");
    }

    #[test]
    fn test_partition_strategy_translation() {
        assert_eq!(partition_strategy_name("h"), "hash");
        assert_eq!(partition_strategy_name("l"), "list");
        assert_eq!(partition_strategy_name("r"), "range");
    }

    #[test]
    fn test_table_entry_serialization_uses_type_key() {
        let entry = TableEntry {
            schema: "public".to_string(),
            name: "users".to_string(),
            kind: TableKind::Table,
            owner: "app".to_string(),
            schema_access_limited: false,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "table");
        assert_eq!(json["schema_access_limited"], false);
    }
}
