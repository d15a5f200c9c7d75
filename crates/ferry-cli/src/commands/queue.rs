//! Queue command handlers

use anyhow::{bail, Result};

use ferry_core::{Ferry, QueueStatus};

use crate::output::Output;

/// List queue items, optionally by status
pub fn list(ferry: &Ferry, status: Option<&str>, output: &Output) -> Result<()> {
    let status = match status {
        Some(s) => match QueueStatus::parse(s) {
            Some(status) => Some(status),
            None => bail!("Unknown status '{}'. Use pending, synced or failed.", s),
        },
        None => None,
    };
    let items = ferry.engine().queue_items(status)?;
    output.print_queue_items(&items);
    Ok(())
}

/// Return failed items to pending
pub fn retry(ferry: &Ferry, id: Option<i64>, output: &Output) -> Result<()> {
    let count = ferry.engine().retry_failed(id)?;

    if output.is_json() {
        println!("{}", serde_json::json!({ "retried": count }));
    } else if count == 0 {
        match id {
            Some(id) => bail!("Queue item #{} is not failed", id),
            None => output.message("No failed items."),
        }
    } else {
        output.success(&format!("Requeued {} item(s)", count));
    }

    Ok(())
}
