//! Channel management commands.

use anyhow::{bail, Result};

use meshwire_core::config::MeshwireConfig;
use meshwire_core::{normalize_channel_name, ChannelKey};

use super::open_registry;

pub fn cmd_channel_id(name: &str, password: &str) -> Result<()> {
    let key = ChannelKey::derive(name, password);
    println!("{}  #{}", hex::encode(key.channel_id()), normalize_channel_name(name));
    Ok(())
}

pub fn cmd_join(config: &MeshwireConfig, name: &str, password: &str) -> Result<()> {
    let registry = open_registry(config)?;
    let channel_id = registry.join(name, password)?;
    let name = normalize_channel_name(name);

    println!("✓ Joined #{} ({})", name, hex::encode(&channel_id[..8]));
    if registry.active().as_deref() == Some(name.as_str()) {
        println!("  Active channel is now #{}", name);
    }
    Ok(())
}

pub fn cmd_leave(config: &MeshwireConfig, name: &str) -> Result<()> {
    let registry = open_registry(config)?;
    if !registry.leave(name) {
        bail!("not joined to #{}", normalize_channel_name(name));
    }

    println!("✗ Left #{}", normalize_channel_name(name));
    match registry.active() {
        Some(active) => println!("  Active channel is now #{}", active),
        None => println!("  No channels joined."),
    }
    Ok(())
}

pub fn cmd_select(config: &MeshwireConfig, name: &str) -> Result<()> {
    let registry = open_registry(config)?;
    let name = normalize_channel_name(name);
    if !registry.list().contains(&name) {
        bail!("not joined to #{}", name);
    }

    registry.select(&name);
    println!("Active channel is #{}", name);
    Ok(())
}

pub fn cmd_channels(config: &MeshwireConfig) -> Result<()> {
    let registry = open_registry(config)?;
    let channels = registry.list();

    if channels.is_empty() {
        println!("No channels joined. Use 'meshwire-ctl join <name> <password>'.");
        return Ok(());
    }

    let active = registry.active();
    println!("═══════════════════════════════════════");
    println!("  Channels ({})", channels.len());
    println!("═══════════════════════════════════════");

    for name in &channels {
        let marker = if active.as_deref() == Some(name.as_str()) { "*" } else { " " };
        let (id, epoch) = registry
            .key_for(name)
            .map(|k| (hex::encode(&k.channel_id()[..8]), k.epoch_length_secs()))
            .unwrap_or_default();
        if epoch == 0 {
            println!("  {} #{:<20} {}", marker, name, id);
        } else {
            println!("  {} #{:<20} {}  (rotates every {}s)", marker, name, id, epoch);
        }
    }

    Ok(())
}
