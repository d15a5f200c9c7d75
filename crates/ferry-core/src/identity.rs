//! Device identity
//!
//! Every installation gets a device ID on first run. It stamps queue items
//! and locally written records, and is never reassigned: the ID file lives
//! beside the database, so resetting the store keeps it.
//!
//! IDs are 16 random bytes, bs58check encoded.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;

/// The identity of this installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    device_id: String,
    path: PathBuf,
}

/// Result of initialization
#[derive(Debug)]
pub struct InitResult {
    pub identity: DeviceIdentity,
    /// Whether the ID was generated by this call
    pub is_new: bool,
}

impl DeviceIdentity {
    /// Load the stored identity, if any
    pub fn load(config: &Config) -> Result<Option<Self>> {
        let path = config.device_id_path();

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read device ID from {:?}", path))?;
        let device_id = content.trim().to_string();

        if !is_valid_device_id(&device_id) {
            anyhow::bail!("Invalid device ID in {:?}", path);
        }

        Ok(Some(Self { device_id, path }))
    }

    /// Load the stored identity or create one
    pub fn load_or_create(config: &Config) -> Result<Self> {
        Ok(Self::initialize(config)?.identity)
    }

    /// Ensure an identity exists, reporting whether it was just created
    pub fn initialize(config: &Config) -> Result<InitResult> {
        if let Some(identity) = Self::load(config)? {
            return Ok(InitResult {
                identity,
                is_new: false,
            });
        }

        let path = config.device_id_path();
        let device_id = generate_device_id();
        atomic_write(&path, device_id.as_bytes())
            .with_context(|| format!("Failed to save device ID to {:?}", path))?;
        info!("Created device identity {}", device_id);

        Ok(InitResult {
            identity: Self { device_id, path },
            is_new: true,
        })
    }

    /// Whether an identity has been created
    pub fn is_initialized(config: &Config) -> bool {
        config.device_id_path().exists()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Location of the ID file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn generate_device_id() -> String {
    bs58::encode(Uuid::new_v4().as_bytes())
        .with_check()
        .into_string()
}

fn is_valid_device_id(s: &str) -> bool {
    bs58::decode(s)
        .with_check(None)
        .into_vec()
        .map(|bytes| bytes.len() == 16)
        .unwrap_or(false)
}

/// Write a file atomically (temp file in the same directory, then rename)
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write to temp file {:?}", temp_path))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync temp file {:?}", temp_path))?;

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}
