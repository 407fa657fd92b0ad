//! db-context - run SQL statements through a pooled context.
//!
//! Each emitted record is printed to stdout as one JSON line. Logs go to
//! stderr.

use clap::Parser;
use db_context::config::Config;
use db_context::db::PooledContext;
use db_context::error::DbResult;
use db_context::models::Record;
use futures_util::stream::{self, BoxStream, StreamExt};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn print_record(record: &Record) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string(record)?);
    Ok(())
}

async fn drain(
    mut records: BoxStream<'static, DbResult<Record>>,
) -> Result<(), Box<dyn std::error::Error>> {
    while let Some(record) = records.next().await {
        print_record(&record?)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let db_config = config.parse_database()?.into_connection_config()?;
    info!(
        id = %db_config.id,
        db_type = %db_config.db_type,
        statements = config.statements.len(),
        transaction = config.transaction,
        "Starting db-context v{}",
        env!("CARGO_PKG_VERSION")
    );

    let context = PooledContext::connect(&db_config)
        .await?
        .with_executor(config.executor());

    let params = config.params.clone();
    let prepared = !params.is_empty();

    let result = if config.transaction {
        let statements = config.statements.clone();
        let records = context.transaction(move |tx| {
            Ok(stream::iter(statements)
                .map(move |sql| {
                    if prepared {
                        tx.prepare(sql, params.clone())
                    } else {
                        tx.exec(sql)
                    }
                })
                .flatten())
        });
        drain(records).await
    } else {
        let mut result = Ok(());
        for sql in &config.statements {
            let records = if prepared {
                context.prepare(sql.as_str(), params.clone())
            } else {
                context.exec(sql.as_str())
            };
            result = drain(records).await;
            if result.is_err() {
                break;
            }
        }
        result
    };

    context.close().await;

    if let Err(e) = result {
        error!(error = %e, "Execution failed");
        return Err(e);
    }
    Ok(())
}
