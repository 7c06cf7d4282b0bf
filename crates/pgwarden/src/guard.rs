//! Statement protection policy and the AST-walking checker.
//!
//! Every query accepted by the gateway passes through [`Guard::check`]
//! first. The checker parses the SQL with the PostgreSQL grammar and walks
//! the resulting tree, applying one rule per statement kind. Two rules can
//! never be disabled: multi-statement strings and transaction control are
//! always rejected, so the pipeline keeps sole ownership of the managed
//! transaction.
//!
//! DML hidden inside WITH-clause CTEs is checked with the same rules as
//! top-level DML, including through `EXPLAIN` / `EXPLAIN ANALYZE`.

use pg_query::protobuf::{ObjectType, RoleStmtType, TransactionStmtKind, VariableSetKind};
use pg_query::NodeEnum;

use crate::ast::{cte_bodies, has_read_write_option, parse_statements};
use crate::{GatewayError, Result};

/// Allow-flags controlling which statement classes the gateway executes.
///
/// Every flag defaults to blocked. Transaction control and multi-statement
/// strings are rejected unconditionally and have no flag.
#[derive(Debug, Clone, Default)]
pub struct GuardPolicy {
    /// CREATE/ALTER TABLE, CREATE INDEX, CREATE SCHEMA, CREATE VIEW,
    /// CREATE/ALTER SEQUENCE, CREATE TABLE AS / CREATE MATERIALIZED VIEW,
    /// ALTER ... RENAME
    pub allow_ddl: bool,
    /// DROP (any object class) and DROP DATABASE
    pub allow_drop: bool,
    pub allow_truncate: bool,
    pub allow_delete_without_where: bool,
    pub allow_update_without_where: bool,
    pub allow_merge: bool,
    pub allow_copy_from: bool,
    pub allow_copy_to: bool,
    /// CREATE FUNCTION and CREATE PROCEDURE
    pub allow_create_function: bool,
    /// CREATE TRIGGER and CREATE CONSTRAINT TRIGGER
    pub allow_create_trigger: bool,
    pub allow_create_rule: bool,
    /// CREATE EXTENSION and ALTER EXTENSION
    pub allow_create_extension: bool,
    /// SET and RESET, subject to the read-only refinements
    pub allow_set: bool,
    /// PREPARE, EXECUTE, DEALLOCATE
    pub allow_prepare: bool,
    pub allow_discard: bool,
    /// GRANT/REVOKE on objects and on roles
    pub allow_grant_revoke: bool,
    /// CREATE/ALTER/DROP ROLE and the USER spellings
    pub allow_manage_roles: bool,
    pub allow_alter_system: bool,
    /// VACUUM, ANALYZE, CLUSTER, REINDEX, REFRESH MATERIALIZED VIEW
    pub allow_maintenance: bool,
    pub allow_do: bool,
    /// LISTEN, NOTIFY, UNLISTEN
    pub allow_listen_notify: bool,
    pub allow_lock_table: bool,
    pub allow_comment: bool,

    /// Session-wide read-only mode. Connections run with
    /// `default_transaction_read_only = on` and the checker blocks anything
    /// that could lift that restriction.
    pub read_only: bool,
    /// Session timezone applied on connect; empty leaves the server default.
    pub timezone: String,
}

impl GuardPolicy {
    /// Policy with every allow-flag raised. Transaction control and
    /// multi-statement strings remain blocked.
    pub fn allow_all() -> Self {
        Self {
            allow_ddl: true,
            allow_drop: true,
            allow_truncate: true,
            allow_delete_without_where: true,
            allow_update_without_where: true,
            allow_merge: true,
            allow_copy_from: true,
            allow_copy_to: true,
            allow_create_function: true,
            allow_create_trigger: true,
            allow_create_rule: true,
            allow_create_extension: true,
            allow_set: true,
            allow_prepare: true,
            allow_discard: true,
            allow_grant_revoke: true,
            allow_manage_roles: true,
            allow_alter_system: true,
            allow_maintenance: true,
            allow_do: true,
            allow_listen_notify: true,
            allow_lock_table: true,
            allow_comment: true,
            read_only: false,
            timezone: String::new(),
        }
    }
}

/// AST-walking statement checker for one immutable [`GuardPolicy`].
#[derive(Debug, Clone)]
pub struct Guard {
    policy: GuardPolicy,
}

impl Guard {
    pub fn new(policy: GuardPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Accept or reject a SQL string under the policy.
    ///
    /// Returns `Ok(())` when the statement may proceed to execution.
    /// Rejections carry the reason shown to the caller; nothing downstream
    /// of the checker runs for a rejected statement.
    pub fn check(&self, sql: &str) -> Result<()> {
        let stmts = parse_statements(sql)?;

        if stmts.is_empty() {
            return Err(GatewayError::Parse("empty query".to_string()));
        }
        if stmts.len() != 1 {
            return Err(GatewayError::Rejected(format!(
                "multi-statement queries are not allowed: found {} statements",
                stmts.len()
            )));
        }

        if let NodeEnum::TransactionStmt(txn) = &stmts[0] {
            let kind = transaction_kind_name(txn.kind());
            let opens_read_write = matches!(
                txn.kind(),
                TransactionStmtKind::TransStmtBegin | TransactionStmtKind::TransStmtStart
            ) && has_read_write_option(txn);

            if self.policy.read_only && opens_read_write {
                return Err(GatewayError::Rejected(format!(
                    "BEGIN READ WRITE is blocked in read-only mode: {}",
                    kind
                )));
            }
            return Err(GatewayError::Rejected(format!(
                "transaction control statements are not allowed: {}",
                kind
            )));
        }

        self.visit(&stmts[0])
    }

    /// Apply the per-kind rule to one statement node, recursing into
    /// EXPLAIN's inner statement and WITH-clause CTE bodies.
    fn visit(&self, node: &NodeEnum) -> Result<()> {
        match node {
            NodeEnum::SelectStmt(stmt) => {
                if let Some(with) = &stmt.with_clause {
                    self.visit_ctes(with)?;
                }
                Ok(())
            }
            NodeEnum::InsertStmt(stmt) => {
                if let Some(with) = &stmt.with_clause {
                    self.visit_ctes(with)?;
                }
                Ok(())
            }
            NodeEnum::UpdateStmt(stmt) => {
                if let Some(with) = &stmt.with_clause {
                    self.visit_ctes(with)?;
                }
                if stmt.where_clause.is_none() && !self.policy.allow_update_without_where {
                    return Err(reject("UPDATE without WHERE clause is not allowed"));
                }
                Ok(())
            }
            NodeEnum::DeleteStmt(stmt) => {
                if let Some(with) = &stmt.with_clause {
                    self.visit_ctes(with)?;
                }
                if stmt.where_clause.is_none() && !self.policy.allow_delete_without_where {
                    return Err(reject("DELETE without WHERE clause is not allowed"));
                }
                Ok(())
            }
            NodeEnum::MergeStmt(stmt) => {
                if let Some(with) = &stmt.with_clause {
                    self.visit_ctes(with)?;
                }
                self.require(self.policy.allow_merge, "MERGE statements are not allowed")
            }
            NodeEnum::ExplainStmt(stmt) => match stmt.query.as_ref().and_then(|q| q.node.as_ref())
            {
                Some(inner) => self.visit(inner),
                None => Ok(()),
            },

            NodeEnum::VariableSetStmt(stmt) => {
                if self.policy.read_only {
                    match stmt.kind() {
                        VariableSetKind::VarResetAll => {
                            return Err(reject("RESET ALL is blocked in read-only mode"));
                        }
                        VariableSetKind::VarReset => {
                            if is_read_only_guc(&stmt.name) {
                                return Err(GatewayError::Rejected(format!(
                                    "RESET {} is blocked in read-only mode",
                                    stmt.name
                                )));
                            }
                        }
                        _ => {
                            if is_read_only_guc(&stmt.name) {
                                return Err(GatewayError::Rejected(format!(
                                    "SET {} is blocked in read-only mode",
                                    stmt.name
                                )));
                            }
                        }
                    }
                }
                self.require(self.policy.allow_set, "SET statements are not allowed")
            }
            NodeEnum::VariableShowStmt(_) => Ok(()),

            NodeEnum::CopyStmt(stmt) => {
                if stmt.is_from {
                    self.require(
                        self.policy.allow_copy_from,
                        "COPY FROM statements are not allowed",
                    )
                } else {
                    self.require(
                        self.policy.allow_copy_to,
                        "COPY TO statements are not allowed",
                    )
                }
            }

            NodeEnum::DropStmt(_) => {
                self.require(self.policy.allow_drop, "DROP statements are not allowed")
            }
            NodeEnum::DropdbStmt(_) => self.require(
                self.policy.allow_drop,
                "DROP DATABASE statements are not allowed",
            ),
            NodeEnum::TruncateStmt(_) => self.require(
                self.policy.allow_truncate,
                "TRUNCATE statements are not allowed",
            ),

            NodeEnum::CreateFunctionStmt(stmt) => {
                let what = if stmt.is_procedure {
                    "CREATE PROCEDURE statements are not allowed"
                } else {
                    "CREATE FUNCTION statements are not allowed"
                };
                self.require(self.policy.allow_create_function, what)
            }
            NodeEnum::CreateTrigStmt(_) => self.require(
                self.policy.allow_create_trigger,
                "CREATE TRIGGER statements are not allowed",
            ),
            NodeEnum::RuleStmt(_) => self.require(
                self.policy.allow_create_rule,
                "CREATE RULE statements are not allowed",
            ),
            NodeEnum::CreateExtensionStmt(_) => self.require(
                self.policy.allow_create_extension,
                "CREATE EXTENSION statements are not allowed",
            ),
            NodeEnum::AlterExtensionStmt(_) => self.require(
                self.policy.allow_create_extension,
                "ALTER EXTENSION statements are not allowed",
            ),

            NodeEnum::AlterSystemStmt(_) => self.require(
                self.policy.allow_alter_system,
                "ALTER SYSTEM statements are not allowed",
            ),
            NodeEnum::LockStmt(_) => self.require(
                self.policy.allow_lock_table,
                "LOCK statements are not allowed",
            ),

            NodeEnum::ListenStmt(_) => self.require(
                self.policy.allow_listen_notify,
                "LISTEN statements are not allowed",
            ),
            NodeEnum::NotifyStmt(_) => self.require(
                self.policy.allow_listen_notify,
                "NOTIFY statements are not allowed",
            ),
            NodeEnum::UnlistenStmt(_) => self.require(
                self.policy.allow_listen_notify,
                "UNLISTEN statements are not allowed",
            ),

            NodeEnum::VacuumStmt(stmt) => {
                let what = if stmt.is_vacuumcmd {
                    "VACUUM statements are not allowed"
                } else {
                    "ANALYZE statements are not allowed"
                };
                self.require(self.policy.allow_maintenance, what)
            }
            NodeEnum::ClusterStmt(_) => self.require(
                self.policy.allow_maintenance,
                "CLUSTER statements are not allowed",
            ),
            NodeEnum::ReindexStmt(_) => self.require(
                self.policy.allow_maintenance,
                "REINDEX statements are not allowed",
            ),
            NodeEnum::RefreshMatViewStmt(_) => self.require(
                self.policy.allow_maintenance,
                "REFRESH MATERIALIZED VIEW statements are not allowed",
            ),

            NodeEnum::GrantStmt(stmt) => {
                let what = if stmt.is_grant {
                    "GRANT statements are not allowed"
                } else {
                    "REVOKE statements are not allowed"
                };
                self.require(self.policy.allow_grant_revoke, what)
            }
            NodeEnum::GrantRoleStmt(stmt) => {
                let what = if stmt.is_grant {
                    "GRANT role statements are not allowed"
                } else {
                    "REVOKE role statements are not allowed"
                };
                self.require(self.policy.allow_grant_revoke, what)
            }

            NodeEnum::CreateRoleStmt(stmt) => {
                let what = if stmt.stmt_type() == RoleStmtType::RolestmtUser {
                    "CREATE USER statements are not allowed"
                } else {
                    "CREATE ROLE statements are not allowed"
                };
                self.require(self.policy.allow_manage_roles, what)
            }
            NodeEnum::AlterRoleStmt(_) => self.require(
                self.policy.allow_manage_roles,
                "ALTER ROLE statements are not allowed",
            ),
            NodeEnum::DropRoleStmt(_) => self.require(
                self.policy.allow_manage_roles,
                "DROP ROLE statements are not allowed",
            ),

            NodeEnum::DiscardStmt(_) => self.require(
                self.policy.allow_discard,
                "DISCARD statements are not allowed",
            ),
            NodeEnum::CommentStmt(_) => self.require(
                self.policy.allow_comment,
                "COMMENT statements are not allowed",
            ),
            NodeEnum::DoStmt(_) => {
                self.require(self.policy.allow_do, "DO statements are not allowed")
            }

            NodeEnum::PrepareStmt(_) => self.require(
                self.policy.allow_prepare,
                "PREPARE statements are not allowed",
            ),
            NodeEnum::ExecuteStmt(_) => self.require(
                self.policy.allow_prepare,
                "EXECUTE statements are not allowed",
            ),
            NodeEnum::DeallocateStmt(_) => self.require(
                self.policy.allow_prepare,
                "DEALLOCATE statements are not allowed",
            ),

            NodeEnum::CreateStmt(_) => self.require(
                self.policy.allow_ddl,
                "CREATE TABLE statements are not allowed",
            ),
            NodeEnum::AlterTableStmt(_) => self.require(
                self.policy.allow_ddl,
                "ALTER TABLE statements are not allowed",
            ),
            NodeEnum::IndexStmt(_) => self.require(
                self.policy.allow_ddl,
                "CREATE INDEX statements are not allowed",
            ),
            NodeEnum::CreateSchemaStmt(_) => self.require(
                self.policy.allow_ddl,
                "CREATE SCHEMA statements are not allowed",
            ),
            NodeEnum::ViewStmt(_) => self.require(
                self.policy.allow_ddl,
                "CREATE VIEW statements are not allowed",
            ),
            NodeEnum::CreateSeqStmt(_) => self.require(
                self.policy.allow_ddl,
                "CREATE SEQUENCE statements are not allowed",
            ),
            NodeEnum::AlterSeqStmt(_) => self.require(
                self.policy.allow_ddl,
                "ALTER SEQUENCE statements are not allowed",
            ),
            NodeEnum::CreateTableAsStmt(stmt) => {
                let what = if stmt.objtype() == ObjectType::ObjectMatview {
                    "CREATE MATERIALIZED VIEW statements are not allowed"
                } else {
                    "CREATE TABLE AS statements are not allowed"
                };
                self.require(self.policy.allow_ddl, what)
            }
            NodeEnum::RenameStmt(_) => self.require(
                self.policy.allow_ddl,
                "RENAME statements are not allowed",
            ),

            // Statement kinds without a policy flag pass through; the
            // server's own privilege system is the authority for them.
            _ => Ok(()),
        }
    }

    fn visit_ctes(&self, with: &pg_query::protobuf::WithClause) -> Result<()> {
        for body in cte_bodies(with) {
            self.visit(body)?;
        }
        Ok(())
    }

    fn require(&self, allowed: bool, reason: &str) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(reject(reason))
        }
    }
}

/// True for statements that leave the database unchanged: SELECT, EXPLAIN,
/// SET, and SHOW. The pipeline rolls these back immediately after
/// collecting rows; everything else commits only after the after-hooks
/// approve.
pub fn is_read_only_statement(sql: &str) -> bool {
    match parse_statements(sql) {
        Ok(stmts) => stmts.iter().all(|stmt| {
            matches!(
                stmt,
                NodeEnum::SelectStmt(_)
                    | NodeEnum::ExplainStmt(_)
                    | NodeEnum::VariableSetStmt(_)
                    | NodeEnum::VariableShowStmt(_)
            )
        }),
        Err(_) => false,
    }
}

fn reject(reason: &str) -> GatewayError {
    GatewayError::Rejected(reason.to_string())
}

fn is_read_only_guc(name: &str) -> bool {
    name.eq_ignore_ascii_case("default_transaction_read_only")
        || name.eq_ignore_ascii_case("transaction_read_only")
}

fn transaction_kind_name(kind: TransactionStmtKind) -> &'static str {
    match kind {
        TransactionStmtKind::TransStmtBegin => "BEGIN",
        TransactionStmtKind::TransStmtStart => "START TRANSACTION",
        TransactionStmtKind::TransStmtCommit => "COMMIT",
        TransactionStmtKind::TransStmtRollback => "ROLLBACK",
        TransactionStmtKind::TransStmtSavepoint => "SAVEPOINT",
        TransactionStmtKind::TransStmtRelease => "RELEASE SAVEPOINT",
        TransactionStmtKind::TransStmtRollbackTo => "ROLLBACK TO SAVEPOINT",
        TransactionStmtKind::TransStmtPrepare => "PREPARE TRANSACTION",
        TransactionStmtKind::TransStmtCommitPrepared => "COMMIT PREPARED",
        TransactionStmtKind::TransStmtRollbackPrepared => "ROLLBACK PREPARED",
        TransactionStmtKind::Undefined => "transaction statement",
    }
}
