//! Read-through lookup handlers

use anyhow::{bail, Result};

use ferry_core::{Ferry, Table};

use crate::output::Output;

/// Find a record by natural key, asking the server while online
pub async fn lookup(ferry: &Ferry, table: Table, key: &str, output: &Output) -> Result<()> {
    match ferry.cache().lookup_by_natural_key(table, key).await? {
        Some(record) => {
            output.print_record(&record);
            Ok(())
        }
        None => bail!("No {} record with key '{}'", table, key),
    }
}

/// List children of a parent, then wait for the server refresh
pub async fn related(ferry: &Ferry, table: Table, parent_id: &str, output: &Output) -> Result<()> {
    let related = ferry.cache().list_related(table, parent_id)?;

    let Some(refresh) = related.refresh else {
        output.print_records(&related.records);
        return Ok(());
    };

    match refresh.await {
        Ok(Ok(0)) | Err(_) => output.print_records(&related.records),
        Ok(Ok(merged)) => {
            // Show the merged view
            let records = ferry
                .store()
                .query(table, ferry_core::Filter::Parent(parent_id))?;
            output.print_records(&records);
            if !output.is_json() {
                output.message(&format!("{} new record(s) from the server", merged));
            }
        }
        Ok(Err(e)) => {
            output.print_records(&related.records);
            if !output.is_quiet() {
                eprintln!("⚠ Could not refresh from the server: {}", e);
            }
        }
    }

    Ok(())
}
