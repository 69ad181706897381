//! Store administration - Binary Entry Point
//!
//! Usage: `store-admin <command> [args]`, configured from `STORE_*`
//! environment variables (see [`StoreConfig::from_env`]).
//!
//! Commands:
//! - `migrate`: open the store, running pending migrations, then print the ledger
//! - `ledger`: print the version ledger
//! - `info <user>`: print a user's storage figures
//! - `remove-user <user>`: delete everything a user owns

use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use userdata_store::migration::VersionEntry;
use userdata_store::utils::format_timestamp;
use userdata_store::{DataStore, StoreConfig, StoreError, StoreResult};

const USAGE: &str = "usage: store-admin <migrate | ledger | info <user> | remove-user <user>>";

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries command output
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> StoreResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn describe_entry(entry: &VersionEntry) -> String {
    let at = |ts: Option<f64>| ts.map(format_timestamp).unwrap_or_else(|| "-".to_string());
    if entry.initial_install.is_some() {
        return format!("{:<8} installed {}", entry.version, at(entry.initial_install));
    }
    format!(
        "{:<8} started {} completed {}",
        entry.version,
        at(entry.migration_started),
        at(entry.migration_completed)
    )
}

async fn run(args: &[String]) -> StoreResult<()> {
    let config = StoreConfig::from_env()?;
    let user = || {
        args.get(1)
            .map(String::as_str)
            .ok_or_else(|| StoreError::InvalidOperation(USAGE.to_string()))
    };

    match args.first().map(String::as_str) {
        Some("migrate") => {
            let store = DataStore::open(&config).await?;
            let report = store.migration_report();
            if report.fresh_install {
                println!("fresh install");
            } else {
                let applied: Vec<String> = report.applied.iter().map(|v| v.to_string()).collect();
                println!(
                    "from {} applied [{}]",
                    report.from.map(|v| v.to_string()).unwrap_or_default(),
                    applied.join(", ")
                );
            }
            for entry in store.ledger().entries().await? {
                println!("{}", describe_entry(&entry));
            }
            Ok(())
        }
        Some("ledger") => {
            let store = DataStore::open(&config).await?;
            for entry in store.ledger().entries().await? {
                println!("{}", describe_entry(&entry));
            }
            Ok(())
        }
        Some("info") => {
            let user_id = user()?;
            let store = DataStore::open(&config).await?;
            print_json(&store.storage_info(user_id).await?)
        }
        Some("remove-user") => {
            let user_id = user()?;
            let store = DataStore::open(&config).await?;
            store.remove_user(user_id).await
        }
        _ => Err(StoreError::InvalidOperation(USAGE.to_string())),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, kind = e.id(), "command failed");
            ExitCode::FAILURE
        }
    }
}
