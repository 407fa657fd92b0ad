//! Scripted in-memory pool for exercising the transaction state machine.
//!
//! Every acquire, release, command and statement is recorded so tests can
//! assert on ordering and on release accounting.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use db_context::db::{CommandKind, ConnectionPool, PooledConnection, QueryExecutor, Statement, TransactionCommand};
use db_context::error::{DbError, DbResult};
use db_context::models::{DatabaseType, QueryOutcome, Row};
use serde_json::json;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Acquire,
    /// Display form of the error the connection was released with.
    Release { error: Option<String> },
    Command(TransactionCommand),
    Run { sql: String, name: String },
}

#[derive(Debug, Clone, Default)]
struct Script {
    fail_acquire: bool,
    failing_commands: Vec<TransactionCommand>,
    failing_sql: Option<String>,
    run_delay: Option<Duration>,
    begin_delay: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct MockPool {
    script: Script,
    events: Arc<Mutex<Vec<Event>>>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_acquire(mut self) -> Self {
        self.script.fail_acquire = true;
        self
    }

    pub fn fail_command(mut self, command: TransactionCommand) -> Self {
        self.script.failing_commands.push(command);
        self
    }

    /// Statements whose text contains `fragment` fail.
    pub fn fail_sql(mut self, fragment: &str) -> Self {
        self.script.failing_sql = Some(fragment.to_string());
        self
    }

    pub fn run_delay(mut self, delay: Duration) -> Self {
        self.script.run_delay = Some(delay);
        self
    }

    pub fn begin_delay(mut self, delay: Duration) -> Self {
        self.script.begin_delay = Some(delay);
        self
    }

    pub fn acquires(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, Event::Acquire))
            .count()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn releases(&self) -> Vec<Option<String>> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Release { error } => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<TransactionCommand> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Command(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn statement_names(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Run { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Wait for background cleanup to release `count` connections.
    pub async fn wait_for_releases(&self, count: usize) {
        for _ in 0..400 {
            if self.releases().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} releases, saw {:?}", count, self.events());
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn command_error(command: TransactionCommand) -> DbError {
    let code = match command {
        TransactionCommand::Begin => "08006",
        TransactionCommand::Commit => "40001",
        TransactionCommand::Rollback => "25P01",
    };
    DbError::database(code, format!("{} failed", command))
}

pub fn value_row(v: i64) -> Row {
    let mut row = Row::new();
    row.insert("v".to_string(), json!(v));
    row
}

pub struct MockConnection {
    pool: MockPool,
}

impl ConnectionPool for MockPool {
    type Connection = MockConnection;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    async fn acquire(&self) -> DbResult<MockConnection> {
        if self.script.fail_acquire {
            return Err(DbError::connection("08001", "connection refused"));
        }
        self.record(Event::Acquire);
        Ok(MockConnection { pool: self.clone() })
    }

    async fn release(&self, _connection: MockConnection, error: Option<&DbError>) {
        self.record(Event::Release {
            error: error.map(ToString::to_string),
        });
    }
}

impl PooledConnection for MockConnection {
    async fn run(&mut self, statement: &Statement, _executor: &QueryExecutor) -> DbResult<QueryOutcome> {
        if let Some(delay) = self.pool.script.run_delay {
            tokio::time::sleep(delay).await;
        }
        self.pool.record(Event::Run {
            sql: statement.sql().to_string(),
            name: statement.name().to_string(),
        });

        if let Some(fragment) = &self.pool.script.failing_sql
            && statement.sql().contains(fragment.as_str())
        {
            return Err(DbError::database("42P01", "relation does not exist"));
        }

        Ok(match statement.kind() {
            CommandKind::Read => QueryOutcome::Rows(vec![value_row(1), value_row(2)]),
            CommandKind::WriteReturning => QueryOutcome::Returned(vec![value_row(7)]),
            CommandKind::Write => QueryOutcome::Affected(1),
        })
    }

    async fn command(&mut self, command: TransactionCommand) -> DbResult<()> {
        if command == TransactionCommand::Begin
            && let Some(delay) = self.pool.script.begin_delay
        {
            tokio::time::sleep(delay).await;
        }
        self.pool.record(Event::Command(command));
        if self.pool.script.failing_commands.contains(&command) {
            return Err(command_error(command));
        }
        Ok(())
    }
}
