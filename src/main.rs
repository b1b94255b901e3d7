//! normsql - command-line entry point.
//!
//! Runs single statements, reports the schema version and manages backups for one
//! database.

use normsql::config::{Command, Config};
use normsql::{DatabaseHandle, EphemeralCodec, StatementDescriptor, Value};
use std::sync::Arc;
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

/// Interpret a CLI parameter: integers, then floats, then `null`, else text.
fn parse_param(raw: &str) -> Value {
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Integer(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Float(v);
    }
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    Value::Text(raw.to_string())
}

async fn run(config: &Config, db: &DatabaseHandle) -> Result<(), Box<dyn std::error::Error>> {
    match &config.command {
        Command::Ping => {
            if db.is_alive().await {
                println!("ok");
            } else {
                return Err(format!("{} is not reachable", db.params().masked()).into());
            }
        }
        Command::Version => println!("{}", db.current_version().await?),
        Command::Query { sql, params } => {
            let stmt = StatementDescriptor::raw_with_params(sql, params.iter().map(|p| parse_param(p)));
            let rows: Vec<_> = db.query(stmt).await?.collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Execute { sql, params } => {
            let stmt = StatementDescriptor::raw_with_params(sql, params.iter().map(|p| parse_param(p)));
            let affected = db.execute(stmt).await?;
            println!("{}", serde_json::json!({ "rows_affected": affected }));
        }
        Command::Backup => println!("{}", db.backup().await?.display()),
        Command::Backups => {
            for path in db.list_backups().await? {
                println!("{}", path.display());
            }
        }
        Command::Restore { nth } => {
            let source = db.restore(*nth).await?;
            info!(backup = %source.display(), "Restored");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    // The password only needs to survive this process
    let codec = Arc::new(EphemeralCodec::new());
    let db_config = config.database_config(codec.as_ref())?;
    let db = DatabaseHandle::open(db_config.params, db_config.options, codec)?;

    let result = run(&config, &db).await;
    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        if let Some(db_err) = e.downcast_ref::<normsql::DbError>() {
            if let Some(suggestion) = db_err.suggestion() {
                eprintln!("hint: {suggestion}");
            }
        }
        return Err(e);
    }
    Ok(())
}
