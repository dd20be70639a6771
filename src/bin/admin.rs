use std::collections::VecDeque;
use std::sync::Arc;

use stateset_inventory::infra::sqlite::connect;
use stateset_inventory::infra::{
    FailedAlertStore, InventoryStore, SqliteCursorStore, SqliteFailedAlertStore,
    SqliteInventoryStore,
};
use stateset_inventory::ingest::csv::parse_inventory_csv;
use stateset_inventory::ingest::{ApplierConfig, MutationApplier};
use stateset_inventory::StoreId;

fn print_help() {
    eprintln!(
        "\
inventory-admin

USAGE:
  inventory-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  load                            Apply a Store,Item,Count CSV file
  list                            List inventory records
  cursor                          Show detector cursor positions
  failed-alerts                   Show alerts that could not be delivered

COMMON OPTIONS:
  --database-url <sqlite_url>     (defaults to env DATABASE_URL)

load OPTIONS:
  --file <path>                   (required) CSV file with a Store,Item,Count header

list OPTIONS:
  --store <name>                  (optional) Only records of this store

cursor OPTIONS:
  --consumer <id>                 (optional) Only this consumer

failed-alerts OPTIONS:
  --limit <n>                     (default: 50)
"
    );
}

fn require_database_url(database_url: Option<String>) -> anyhow::Result<String> {
    database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

fn require_value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let mut database_url: Option<String> = None;
    let mut file: Option<String> = None;
    let mut store: Option<String> = None;
    let mut consumer: Option<String> = None;
    let mut limit: usize = 50;

    while let Some(arg) = args.pop_front() {
        match (command.as_str(), arg.as_str()) {
            (_, "--database-url") => database_url = Some(require_value(&mut args, &arg)?),
            ("load", "--file") => file = Some(require_value(&mut args, &arg)?),
            ("list", "--store") => store = Some(require_value(&mut args, &arg)?),
            ("cursor", "--consumer") => consumer = Some(require_value(&mut args, &arg)?),
            ("failed-alerts", "--limit") => limit = require_value(&mut args, &arg)?.parse()?,
            (_, "-h" | "--help") => {
                print_help();
                return Ok(());
            }
            (_, other) => anyhow::bail!("unexpected argument: {other}"),
        }
    }

    let database_url = require_database_url(database_url)?;
    // connect() applies pending migrations
    let pool = connect(&database_url, 2).await?;

    match command.as_str() {
        "migrate" => {
            println!("ok: migrations applied");
        }
        "load" => {
            let path = file.ok_or_else(|| anyhow::anyhow!("--file is required"))?;
            let contents = tokio::fs::read_to_string(&path).await?;
            let rows = parse_inventory_csv(&contents)?;

            let store = Arc::new(SqliteInventoryStore::new(pool.clone()).await?);
            let applier = MutationApplier::new(ApplierConfig::default(), store);
            let report = applier.apply_batch(rows).await;

            println!("{}", serde_json::to_string_pretty(&report.summary())?);
            if !report.failed_rows.is_empty() {
                anyhow::bail!("{} rows failed to apply", report.failed());
            }
        }
        "list" => {
            let inventory = SqliteInventoryStore::new(pool.clone()).await?;
            let filter = store.map(StoreId);
            let records = inventory.list(filter.as_ref()).await?;

            println!("{:<24} {:<24} {:>10} {:>8}", "STORE", "ITEM", "COUNT", "VERSION");
            for r in &records {
                println!(
                    "{:<24} {:<24} {:>10} {:>8}",
                    r.store.as_str(),
                    r.item.as_str(),
                    r.quantity,
                    r.version
                );
            }
            println!("{} records", records.len());
        }
        "cursor" => {
            let inventory = SqliteInventoryStore::new(pool.clone()).await?;
            let head = inventory.head().await?;
            let cursors = SqliteCursorStore::new(pool.clone()).list().await?;

            println!("stream head: {head}");
            for c in cursors
                .iter()
                .filter(|c| consumer.as_deref().map_or(true, |id| id == c.consumer_id))
            {
                println!(
                    "{}: acknowledged={} lag={} updated_at={}",
                    c.consumer_id,
                    c.last_acknowledged_sequence,
                    head.saturating_sub(c.last_acknowledged_sequence),
                    c.updated_at.to_rfc3339()
                );
            }
        }
        "failed-alerts" => {
            let failed = SqliteFailedAlertStore::new(pool.clone());
            let total = failed.count().await?;
            for alert in failed.list(limit).await? {
                println!("{}", serde_json::to_string(&alert)?);
            }
            eprintln!("{total} failed alerts in total");
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}");
        }
    }

    pool.close().await;
    Ok(())
}
