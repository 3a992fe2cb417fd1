use chrono::DateTime;
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;

use callstore::cli::{Cli, Command};
use callstore::{Store, default_store_path};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let store_path = cli.store.unwrap_or_else(default_store_path);

    info!("callstore opening {}", store_path.display());
    let store = Store::open_read_only(&store_path)?;

    match cli.command {
        Command::List { collection } => {
            let ids = store.list_ids(&collection)?;
            if ids.is_empty() {
                println!("No records in {}", collection);
            } else {
                for (id, updated_at) in ids {
                    let when = DateTime::from_timestamp_millis(updated_at)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| updated_at.to_string());
                    println!("{}  {}", id.cyan(), when.dimmed());
                }
            }
        }
        Command::Show { collection, id } => match store.get_raw(&collection, &id)? {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => println!("Record not found: {} in {}", id, collection),
        },
        Command::Stats => {
            let stats = store.collections()?;
            if stats.is_empty() {
                println!("Store is empty");
            } else {
                println!("{}", store_path.display().to_string().dimmed());
                for entry in stats {
                    println!("{}  {}", entry.collection.cyan(), entry.records);
                }
            }
        }
    }

    Ok(())
}
