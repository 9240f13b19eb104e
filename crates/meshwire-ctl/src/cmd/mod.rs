//! CLI command modules.

pub mod channels;
pub mod envelope;
pub mod transfer;

use anyhow::{Context, Result};
use std::sync::Arc;

use meshwire_core::config::MeshwireConfig;
use meshwire_services::{ChannelRegistry, FileStore};

/// Open the channel registry backed by the configured store directory.
pub fn open_registry(config: &MeshwireConfig) -> Result<ChannelRegistry> {
    let store = FileStore::new(&config.channels.store_dir).with_context(|| {
        format!(
            "failed to open channel store at {}",
            config.channels.store_dir.display()
        )
    })?;
    Ok(ChannelRegistry::new(
        Arc::new(store),
        config.channels.epoch_length_secs,
    ))
}
