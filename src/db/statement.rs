//! Statement identity and command classification.
//!
//! Every statement carries a [`StatementName`] derived from its text, so the
//! same SQL always maps to the same name, and a [`CommandKind`] that decides
//! whether the execution path fetches rows or reports an affected-row count.

use std::fmt;

use md5::{Digest, Md5};
use sqlparser::ast::Statement as SqlStatement;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::models::{DatabaseType, QueryParam};

/// Content-hash name of a statement: lowercase hex MD5 of the SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementName(String);

impl StatementName {
    pub fn for_sql(sql: &str) -> Self {
        Self(hex::encode(Md5::digest(sql.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatementName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a statement produces when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Queries, EXPLAIN, SHOW, PRAGMA: zero or more rows.
    Read,
    /// DML and DDL: one affected-row count.
    Write,
    /// DML with a RETURNING clause: the returned rows, then the count.
    WriteReturning,
}

impl CommandKind {
    /// Classify SQL text for the given backend.
    ///
    /// A script is a read only if every statement in it is a read. Text the
    /// parser rejects is classified by its leading keyword.
    pub fn classify(sql: &str, db_type: DatabaseType) -> Self {
        let dialect = get_dialect(db_type);
        match Parser::parse_sql(dialect.as_ref(), sql) {
            Ok(statements) if !statements.is_empty() => {
                if statements.iter().all(is_read_statement) {
                    Self::Read
                } else if let [statement] = statements.as_slice()
                    && is_dml_statement(statement)
                    && has_returning(sql, dialect.as_ref())
                {
                    Self::WriteReturning
                } else {
                    Self::Write
                }
            }
            _ => classify_by_keyword(sql),
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read)
    }
}

fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

fn is_read_statement(statement: &SqlStatement) -> bool {
    matches!(
        statement,
        SqlStatement::Query(_)
            | SqlStatement::ShowTables { .. }
            | SqlStatement::ShowColumns { .. }
            | SqlStatement::ShowDatabases { .. }
            | SqlStatement::ShowSchemas { .. }
            | SqlStatement::ShowCreate { .. }
            | SqlStatement::ShowFunctions { .. }
            | SqlStatement::ShowVariable { .. }
            | SqlStatement::ShowVariables { .. }
            | SqlStatement::ShowStatus { .. }
            | SqlStatement::ShowCollation { .. }
            | SqlStatement::ExplainTable { .. }
            | SqlStatement::Explain { .. }
            | SqlStatement::Pragma { .. }
    )
}

fn is_dml_statement(statement: &SqlStatement) -> bool {
    matches!(
        statement,
        SqlStatement::Insert(_) | SqlStatement::Update { .. } | SqlStatement::Delete(_)
    )
}

fn has_returning(sql: &str, dialect: &dyn Dialect) -> bool {
    Tokenizer::new(dialect, sql)
        .tokenize()
        .map(|tokens| {
            tokens
                .iter()
                .any(|t| matches!(t, Token::Word(w) if w.keyword == Keyword::RETURNING))
        })
        .unwrap_or(false)
}

fn classify_by_keyword(sql: &str) -> CommandKind {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match first.as_str() {
        "SELECT" | "WITH" | "VALUES" | "TABLE" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC"
        | "PRAGMA" => CommandKind::Read,
        _ => CommandKind::Write,
    }
}

/// A statement ready to run on a connection.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: String,
    params: Vec<QueryParam>,
    name: StatementName,
    kind: CommandKind,
    prepared: bool,
}

impl Statement {
    /// A named statement executed with bound parameters.
    pub fn prepared(sql: impl Into<String>, params: Vec<QueryParam>, db_type: DatabaseType) -> Self {
        Self::build(sql.into(), params, db_type, true)
    }

    /// An unparameterized statement sent as a simple query.
    pub fn raw(sql: impl Into<String>, db_type: DatabaseType) -> Self {
        Self::build(sql.into(), Vec::new(), db_type, false)
    }

    fn build(sql: String, params: Vec<QueryParam>, db_type: DatabaseType, prepared: bool) -> Self {
        Self {
            name: StatementName::for_sql(&sql),
            kind: CommandKind::classify(&sql, db_type),
            sql,
            params,
            prepared,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[QueryParam] {
        &self.params
    }

    pub fn name(&self) -> &StatementName {
        &self.name
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// True when the statement goes through the extended (prepare/bind) protocol.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }
}
