//! SQL parsing through the PostgreSQL grammar.
//!
//! Thin wrapper around `pg_query`, which embeds the real PostgreSQL parser.
//! The gateway never emulates the grammar: anything the server would reject
//! as a syntax error is rejected here with the parser's own message.

use pg_query::protobuf::{self, a_const};
use pg_query::NodeEnum;

use crate::{GatewayError, Result};

/// Parse a SQL string into its top-level statement nodes.
///
/// Returns one `NodeEnum` per statement. Empty or whitespace-only input
/// yields an empty vector; the caller decides how to treat that.
pub fn parse_statements(sql: &str) -> Result<Vec<NodeEnum>> {
    let parsed = pg_query::parse(sql).map_err(|e| GatewayError::Parse(e.to_string()))?;

    Ok(parsed
        .protobuf
        .stmts
        .into_iter()
        .filter_map(|raw| raw.stmt.and_then(|node| node.node))
        .collect())
}

/// Iterate the CTE bodies of a WITH clause.
///
/// Each yielded node is the inner query of one `CommonTableExpr`, in
/// declaration order. Non-CTE entries (which the grammar does not produce)
/// are skipped.
pub fn cte_bodies(with: &protobuf::WithClause) -> impl Iterator<Item = &NodeEnum> {
    with.ctes.iter().filter_map(|cte| match &cte.node {
        Some(NodeEnum::CommonTableExpr(cte)) => {
            cte.ctequery.as_ref().and_then(|query| query.node.as_ref())
        }
        _ => None,
    })
}

/// True when a transaction statement carries an explicit `READ WRITE` option
/// (`BEGIN READ WRITE`, `START TRANSACTION READ WRITE`).
pub fn has_read_write_option(stmt: &protobuf::TransactionStmt) -> bool {
    stmt.options.iter().any(|opt| {
        let Some(NodeEnum::DefElem(def)) = &opt.node else {
            return false;
        };
        if def.defname != "transaction_read_only" {
            return false;
        }
        match def.arg.as_ref().and_then(|arg| arg.node.as_ref()) {
            Some(NodeEnum::AConst(c)) => {
                matches!(&c.val, Some(a_const::Val::Ival(i)) if i.ival == 0)
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_select() {
        let stmts = parse_statements("SELECT 1").unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], NodeEnum::SelectStmt(_)));
    }

    #[test]
    fn test_parse_multi_statement() {
        let stmts = parse_statements("SELECT 1; SELECT 2").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn test_parse_empty_input() {
        assert!(parse_statements("").unwrap().is_empty());
        assert!(parse_statements("   \n\t ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_syntax_error() {
        let err = parse_statements("SELEC 1").unwrap_err();
        assert!(matches!(err, GatewayError::Parse(_)));
        assert!(err.to_string().starts_with("SQL parse error:"));
    }

    #[test]
    fn test_cte_bodies_yields_inner_queries() {
        let stmts =
            parse_statements("WITH a AS (SELECT 1), b AS (DELETE FROM t RETURNING *) SELECT 1")
                .unwrap();
        let NodeEnum::SelectStmt(select) = &stmts[0] else {
            panic!("expected SELECT");
        };
        let with = select.with_clause.as_ref().unwrap();
        let bodies: Vec<_> = cte_bodies(with).collect();
        assert_eq!(bodies.len(), 2);
        assert!(matches!(bodies[0], NodeEnum::SelectStmt(_)));
        assert!(matches!(bodies[1], NodeEnum::DeleteStmt(_)));
    }

    #[test]
    fn test_read_write_option_detection() {
        let stmts = parse_statements("BEGIN READ WRITE").unwrap();
        let NodeEnum::TransactionStmt(txn) = &stmts[0] else {
            panic!("expected transaction statement");
        };
        assert!(has_read_write_option(txn));

        let stmts = parse_statements("BEGIN").unwrap();
        let NodeEnum::TransactionStmt(txn) = &stmts[0] else {
            panic!("expected transaction statement");
        };
        assert!(!has_read_write_option(txn));

        let stmts = parse_statements("BEGIN READ ONLY").unwrap();
        let NodeEnum::TransactionStmt(txn) = &stmts[0] else {
            panic!("expected transaction statement");
        };
        assert!(!has_read_write_option(txn));
    }
}
