//! Device identity handlers

use anyhow::{bail, Result};

use ferry_core::{Config, DeviceIdentity};

use crate::output::{Output, OutputFormat};

/// Create the device identity and local store
pub fn init(config: &Config, output: &Output) -> Result<()> {
    let result = DeviceIdentity::initialize(config)?;
    // Opening the store creates the schema
    ferry_core::LocalStore::open(config)?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "device_id": result.identity.device_id(),
                    "is_new": result.is_new
                })
            );
        }
        OutputFormat::Quiet => println!("{}", result.identity.device_id()),
        OutputFormat::Human if result.is_new => {
            println!();
            println!("Created device identity.");
            println!();
            println!("Device ID: {}", result.identity.device_id());
            println!("Stored in: {}", result.identity.path().display());
            println!();
            if config.sync_url.is_none() {
                println!("Sync server not configured. Changes stay local until you set one:");
                println!("  ferry config set sync_url http://your-server:8080");
                println!("  ferry config set sync_enabled true");
            }
        }
        OutputFormat::Human => {
            println!();
            println!("Already initialized.");
            println!("Device ID: {}", result.identity.device_id());
            println!();
            println!("To start fresh, remove:");
            println!("  {}", config.data_dir.display());
        }
    }

    Ok(())
}

/// Show the device identity
pub fn show(config: &Config, output: &Output) -> Result<()> {
    let Some(identity) = DeviceIdentity::load(config)? else {
        bail!("Not initialized. Run `ferry init` first.");
    };

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "device_id": identity.device_id(),
                    "path": identity.path()
                })
            );
        }
        OutputFormat::Quiet => println!("{}", identity.device_id()),
        OutputFormat::Human => {
            println!();
            println!("Device ID: {}", identity.device_id());
            println!("Stored in: {}", identity.path().display());
        }
    }

    Ok(())
}
