//! Watch command handler

use anyhow::Result;

use ferry_core::sync::SyncCommand;
use ferry_core::{Ferry, Filter, Table, Topic};

use crate::output::Output;

/// Run the background sync and print a table whenever it changes
///
/// Stops on Ctrl-C.
pub async fn watch(ferry: &Ferry, table: Table, output: &Output) -> Result<()> {
    let handle = ferry.spawn_sync();
    let mut status_rx = handle.status_rx.clone();
    let mut live = ferry.observe([Topic::Table(table), Topic::Queue], move |store| {
        Ok((store.query(table, Filter::All)?, store.pending_count()?))
    });

    // Catch up with the server before the first render settles
    if ferry.engine().is_online() {
        handle.send(SyncCommand::FlushNow).await;
    }

    output.message(&format!("Watching {} (Ctrl-C to stop)", table));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = live.changed() => {
                if !changed {
                    break;
                }
                let snapshot = live.current();
                if snapshot.loading {
                    continue;
                }
                if let Some(ref error) = snapshot.error {
                    eprintln!("⚠ Query failed: {}", error);
                }
                if let Some((records, pending)) = snapshot.value {
                    output.print_records(&records);
                    output.message(&format!("{} change(s) waiting to sync\n", pending));
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                match status.detail {
                    Some(detail) => output.message(&format!("[sync] {}: {}", status.state, detail)),
                    None => output.message(&format!("[sync] {}", status.state)),
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
