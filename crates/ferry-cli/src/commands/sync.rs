//! Sync command handlers

use anyhow::{bail, Result};

use ferry_core::sync::{FlushReport, PullReport};
use ferry_core::{Ferry, SyncState};

use crate::output::Output;

/// Push pending changes, then pull
pub async fn sync(ferry: &Ferry, output: &Output) -> Result<()> {
    ensure_configured(ferry)?;

    output.message("Syncing...");
    let report = ferry.engine().sync().await?;

    if output.is_json() {
        println!(
            "{}",
            serde_json::json!({
                "flush": flush_json(&report.flush),
                "pull": pull_json(&report.pull),
                "state": ferry.engine().state()
            })
        );
        return Ok(());
    }

    describe_flush(&report.flush, output);
    describe_pull(&report.pull, output);
    finish(
        ferry,
        report.flush.went_offline || report.pull.went_offline,
        output,
    )
}

/// Reset every cursor and pull all tables from the beginning
pub async fn bootstrap(ferry: &Ferry, output: &Output) -> Result<()> {
    ensure_configured(ferry)?;

    output.message("Pulling all tables from the server...");
    let report = ferry.engine().bootstrap().await?;

    if output.is_json() {
        println!("{}", pull_json(&report));
        return Ok(());
    }

    describe_pull(&report, output);
    finish(ferry, report.went_offline, output)
}

/// Push pending changes quietly; used after write commands
pub async fn flush_quiet(ferry: &Ferry, output: &Output) {
    if !ferry.engine().is_online() {
        return;
    }
    match ferry.engine().flush().await {
        Ok(report) if report.went_offline && !output.is_quiet() => {
            eprintln!("⚠ Server unreachable; change queued for the next sync");
        }
        Ok(report) => {
            if let Some(error) = report.error.filter(|_| !output.is_quiet()) {
                eprintln!("⚠ Server rejected the change: {}", error);
            }
        }
        Err(e) => {
            if !output.is_quiet() {
                eprintln!("⚠ Auto-sync failed: {}", e);
            }
        }
    }
}

/// Pull quietly; used before read commands
pub async fn pull_quiet(ferry: &Ferry, output: &Output) {
    if !ferry.engine().is_online() {
        return;
    }
    if let Err(e) = ferry.engine().pull().await {
        if !output.is_quiet() {
            eprintln!("⚠ Auto-sync failed: {}", e);
        }
    }
}

fn ensure_configured(ferry: &Ferry) -> Result<()> {
    let config = ferry.config();

    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             ferry config set sync_enabled true\n  \
             ferry config set sync_url http://your-server:8080"
        );
    }

    if config.sync_url.is_none() {
        bail!(
            "Sync URL not configured. Set it with:\n  \
             ferry config set sync_url http://your-server:8080"
        );
    }

    Ok(())
}

fn describe_flush(report: &FlushReport, output: &Output) {
    if report.pushed > 0 {
        output.message(&format!(
            "  Pushed {} change(s) in {} batch(es)",
            report.pushed, report.batches
        ));
    }
    if let Some(ref error) = report.error {
        output.message(&format!("  Push halted: {}", error));
    }
    if !report.newly_failed.is_empty() {
        output.message(&format!(
            "  {} change(s) gave up after repeated rejections (see `ferry queue list --status failed`)",
            report.newly_failed.len()
        ));
    }
}

fn describe_pull(report: &PullReport, output: &Output) {
    output.message(&format!(
        "  Pulled {} page(s), applied {} record(s)",
        report.pages, report.applied
    ));
    if report.skipped > 0 {
        output.message(&format!("  Kept {} local record(s)", report.skipped));
    }
    for error in &report.errors {
        output.message(&format!("  Pull error: {}", error));
    }
}

fn finish(ferry: &Ferry, went_offline: bool, output: &Output) -> Result<()> {
    if went_offline {
        bail!("Server unreachable; local changes stay queued");
    }
    let status = ferry.engine().status();
    if status.state == SyncState::Error {
        bail!("Sync failed: {}", status.detail.unwrap_or_default());
    }
    output.success("Sync complete");
    Ok(())
}

fn flush_json(report: &FlushReport) -> serde_json::Value {
    serde_json::json!({
        "pushed": report.pushed,
        "batches": report.batches,
        "newly_failed": report.newly_failed,
        "error": report.error,
        "went_offline": report.went_offline
    })
}

fn pull_json(report: &PullReport) -> serde_json::Value {
    serde_json::json!({
        "pages": report.pages,
        "applied": report.applied,
        "skipped": report.skipped,
        "errors": report.errors,
        "went_offline": report.went_offline
    })
}
