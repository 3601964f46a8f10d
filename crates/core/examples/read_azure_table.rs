//! Read a Delta table stored in Azure Data Lake Storage Gen2.
//!
//! ```text
//! cargo run --example read_azure_table -- <auth> <table-uri>
//! ```
//!
//! `<table-uri>` may be any of
//! - `abfss://<container>@<account>.dfs.core.windows.net/<path>`
//! - `abfs://<container>@<account>.dfs.core.windows.net/<path>`
//! - `az://<container>/<path>` and `adl://<container>/<path>`, with `AZURE_STORAGE_ACCOUNT_NAME` set
//!
//! `<auth>` selects the credential options taken from the environment: `key`
//! (`AZURE_STORAGE_ACCOUNT_KEY`), `sas` (`AZURE_STORAGE_SAS_TOKEN`), `sp` (`AZURE_CLIENT_ID`,
//! `AZURE_CLIENT_SECRET`, `AZURE_TENANT_ID`) or `cli`. Anything else leaves the choice to the
//! environment.
use std::collections::HashMap;

use deltaread_core::{DeltaTableBuilder, DeltaTableError};
use tracing_subscriber::EnvFilter;

fn env_options(names: &[&str]) -> Result<HashMap<String, String>, DeltaTableError> {
    names
        .iter()
        .map(|name| {
            std::env::var(name)
                .map(|value| (name.to_lowercase(), value))
                .map_err(|_| DeltaTableError::InvalidConfiguration(format!("{name} is not set")))
        })
        .collect()
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<(), DeltaTableError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(auth), Some(table_uri)) = (args.next(), args.next()) else {
        eprintln!("usage: read_azure_table <key|sas|sp|cli|env> <table-uri>");
        return Ok(());
    };

    let mut options = match auth.as_str() {
        "key" => env_options(&["AZURE_STORAGE_ACCOUNT_KEY"])?,
        "sas" => env_options(&["AZURE_STORAGE_SAS_TOKEN"])?,
        "sp" => env_options(&["AZURE_CLIENT_ID", "AZURE_CLIENT_SECRET", "AZURE_TENANT_ID"])?,
        "cli" => HashMap::from([("azure_use_azure_cli".to_string(), "true".to_string())]),
        _ => HashMap::new(),
    };
    if let Ok(account) = std::env::var("AZURE_STORAGE_ACCOUNT_NAME") {
        options.insert("azure_storage_account_name".to_string(), account);
    }

    let table = DeltaTableBuilder::from_uri(&table_uri)?
        .with_storage_options(options)
        .load()
        .await?;

    let metadata = table.metadata()?;
    println!("Table version: {}", table.version()?);
    println!("Table id: {}", metadata.id);
    println!("Partition columns: {:?}", metadata.partition_columns);
    println!("Schema:");
    for field in table.schema()?.fields() {
        println!("  {}: {}", field.name, field.data_type());
    }
    println!("Files: {}", table.get_files_count());
    Ok(())
}
