//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use ferry_core::{Config, ConflictPolicy};

use crate::output::{Output, OutputFormat};

/// Keys accepted by `config set`
const KEYS: &str = "data_dir, sync_url, sync_enabled, log_file, batch_size, max_attempts, \
                    flush_debounce_ms, pull_interval_secs, request_timeout_secs, \
                    backoff_base_ms, backoff_max_secs, conflict_policy";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:             {}", config.data_dir.display());
            println!(
                "  sync_url:             {}",
                config.sync_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:         {}", config.sync_enabled);
            println!(
                "  log_file:             {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  batch_size:           {}", config.batch_size);
            println!("  max_attempts:         {}", config.max_attempts);
            println!("  flush_debounce_ms:    {}", config.flush_debounce_ms);
            println!("  pull_interval_secs:   {}", config.pull_interval_secs);
            println!("  request_timeout_secs: {}", config.request_timeout_secs);
            println!("  backoff_base_ms:      {}", config.backoff_base_ms);
            println!("  backoff_max_secs:     {}", config.backoff_max_secs);
            println!("  conflict_policy:      {}", config.conflict_policy.as_str());
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

/// Apply one `key = value` assignment
fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "sync_url" => {
            config.sync_url = optional(value).map(str::to_string);
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "log_file" => {
            config.log_file = optional(value).map(Into::into);
        }
        "batch_size" => {
            let size: usize = parse_number(key, value)?;
            if size == 0 {
                bail!("batch_size must be at least 1");
            }
            config.batch_size = size;
        }
        "max_attempts" => config.max_attempts = parse_number(key, value)?,
        "flush_debounce_ms" => config.flush_debounce_ms = parse_number(key, value)?,
        "pull_interval_secs" => config.pull_interval_secs = parse_number(key, value)?,
        "request_timeout_secs" => config.request_timeout_secs = parse_number(key, value)?,
        "backoff_base_ms" => config.backoff_base_ms = parse_number(key, value)?,
        "backoff_max_secs" => config.backoff_max_secs = parse_number(key, value)?,
        "conflict_policy" => {
            config.conflict_policy = ConflictPolicy::parse(value).with_context(|| {
                format!(
                    "Invalid conflict_policy '{}'. Use 'arrival_order' or 'prefer_newer_pending'.",
                    value
                )
            })?;
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                KEYS
            );
        }
    }
    Ok(())
}

/// Empty or "none" clears an optional value
fn optional(value: &str) -> Option<&str> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: '{}' is not a number", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_sync_settings() {
        let mut config = Config::default();
        apply(&mut config, "sync_url", "http://localhost:8080").unwrap();
        apply(&mut config, "sync_enabled", "true").unwrap();

        assert_eq!(config.sync_url.as_deref(), Some("http://localhost:8080"));
        assert!(config.sync_enabled);

        apply(&mut config, "sync_url", "none").unwrap();
        assert!(config.sync_url.is_none());
    }

    #[test]
    fn test_apply_numbers_and_policy() {
        let mut config = Config::default();
        apply(&mut config, "batch_size", "10").unwrap();
        apply(&mut config, "max_attempts", "3").unwrap();
        apply(&mut config, "conflict_policy", "prefer_newer_pending").unwrap();

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.conflict_policy, ConflictPolicy::PreferNewerPending);
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply(&mut config, "batch_size", "0").is_err());
        assert!(apply(&mut config, "batch_size", "many").is_err());
        assert!(apply(&mut config, "sync_enabled", "yes").is_err());
        assert!(apply(&mut config, "conflict_policy", "newest").is_err());
        assert!(apply(&mut config, "favorite_tag", "x").is_err());
    }
}
