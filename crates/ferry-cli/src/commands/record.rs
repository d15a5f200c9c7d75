//! Record command handlers

use anyhow::{bail, Context, Result};

use ferry_core::{Ferry, Filter, Record, Table};

use crate::output::Output;

/// Selection for `record list`
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub parent: Option<String>,
    pub key: Option<String>,
    pub unsynced: bool,
}

/// Create or update a record from a JSON object
pub fn put(ferry: &Ferry, table: Table, json: &str, output: &Output) -> Result<()> {
    let record = parse_record(json)?;
    let item = ferry.engine().save(table, record)?;

    if output.is_json() {
        output.json(&item);
    } else if output.is_quiet() {
        println!("{}", item.record_id);
    } else {
        output.success(&format!(
            "{} {}/{} (queue #{})",
            match item.action {
                ferry_core::QueueAction::Create => "Created",
                _ => "Updated",
            },
            table,
            item.record_id,
            item.id
        ));
    }

    Ok(())
}

/// Show a single record
pub fn get(ferry: &Ferry, table: Table, id: &str, output: &Output) -> Result<()> {
    let Some(record) = ferry.store().get(table, id)? else {
        bail!("Record not found: {}/{}", table, id);
    };
    output.print_record(&record);
    Ok(())
}

/// List records, newest first
pub fn list(ferry: &Ferry, table: Table, filter: &ListFilter, output: &Output) -> Result<()> {
    let filter = to_store_filter(table, filter)?;
    let records = ferry.store().query(table, filter)?;
    output.print_records(&records);
    Ok(())
}

/// Delete a record (queued as a tombstone)
pub fn delete(ferry: &Ferry, table: Table, id: &str, output: &Output) -> Result<()> {
    match ferry.engine().delete(table, id)? {
        Some(item) => {
            if output.is_json() {
                output.json(&item);
            } else {
                output.success(&format!("Deleted {}/{}", table, id));
            }
            Ok(())
        }
        None => bail!("Record not found: {}/{}", table, id),
    }
}

fn parse_record(json: &str) -> Result<Record> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("Record must be valid JSON")?;
    Record::from_json(value).context("Record must be a JSON object")
}

fn to_store_filter(table: Table, filter: &ListFilter) -> Result<Filter<'_>> {
    let selected = [filter.parent.is_some(), filter.key.is_some(), filter.unsynced]
        .iter()
        .filter(|set| **set)
        .count();
    if selected > 1 {
        bail!("Use only one of --parent, --key or --unsynced");
    }

    if let Some(ref parent) = filter.parent {
        if table.parent_field().is_none() {
            bail!("Table '{}' has no parent field", table);
        }
        return Ok(Filter::Parent(parent));
    }
    if let Some(ref key) = filter.key {
        if table.natural_key_field().is_none() {
            bail!("Table '{}' has no natural key", table);
        }
        return Ok(Filter::NaturalKey(key));
    }
    if filter.unsynced {
        return Ok(Filter::Unsynced);
    }
    Ok(Filter::All)
}
