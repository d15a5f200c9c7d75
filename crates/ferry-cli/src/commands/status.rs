//! Status command handler

use anyhow::Result;

use ferry_core::Ferry;

use crate::output::{Output, OutputFormat};

/// Show sync state, queue depth, cursors and storage counts
pub fn show(ferry: &Ferry, output: &Output) -> Result<()> {
    let config = ferry.config();
    let engine = ferry.engine();
    let status = engine.status();
    let stats = ferry.store().stats()?;
    let cursors = ferry.store().cursors()?;

    match output.format {
        OutputFormat::Json => {
            let tables: serde_json::Map<String, serde_json::Value> = stats
                .rows
                .iter()
                .map(|(table, count)| (table.to_string(), serde_json::json!(count)))
                .collect();
            let cursors: serde_json::Map<String, serde_json::Value> = cursors
                .iter()
                .map(|c| (c.table.to_string(), serde_json::json!(c.last_pull_timestamp)))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "device_id": ferry.device_id(),
                    "state": status.state,
                    "detail": status.detail,
                    "sync_enabled": config.sync_enabled,
                    "sync_url": config.sync_url,
                    "queue": {
                        "pending": stats.pending,
                        "failed": stats.failed
                    },
                    "cursors": cursors,
                    "storage": {
                        "database_size": stats.database_size,
                        "tables": tables,
                        "total_rows": stats.total_rows()
                    }
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", status.state);
        }
        OutputFormat::Human => {
            println!("Ferry Status");
            println!("============");
            println!();
            println!("Device: {}", ferry.device_id());
            println!();
            println!("Sync:");
            println!("  State:   {}", status.state);
            if let Some(ref detail) = status.detail {
                println!("  Detail:  {}", detail);
            }
            match config.sync_url {
                Some(ref url) if config.sync_enabled => println!("  Server:  {}", url),
                _ => println!("  Server:  (disabled)"),
            }
            println!();
            println!("Queue:");
            println!("  Pending: {}", stats.pending);
            println!("  Failed:  {}", stats.failed);
            println!();
            println!("Last pull:");
            if cursors.is_empty() {
                println!("  (never)");
            }
            for cursor in &cursors {
                let when = chrono::DateTime::from_timestamp_millis(cursor.last_pull_timestamp)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| cursor.last_pull_timestamp.to_string());
                println!("  {:<15} {}", cursor.table.as_str(), when);
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.sqlite_path().display());
            println!("  Size:     {}", human_size(stats.database_size));
            for (table, count) in &stats.rows {
                println!("  {:<15} {}", table.as_str(), count);
            }
        }
    }

    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }
}
