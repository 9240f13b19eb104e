//! Seal and open channel envelopes.

use anyhow::{bail, Context, Result};

use meshwire_core::config::MeshwireConfig;
use meshwire_core::ChannelEncryptedPacket;

use super::open_registry;

pub fn cmd_seal(config: &MeshwireConfig, text: &str) -> Result<()> {
    let registry = open_registry(config)?;
    let Some(active) = registry.active() else {
        bail!("no active channel; join one first");
    };

    let packet = registry
        .seal_active(text.as_bytes(), &[])?
        .context("active channel disappeared")?;
    let bytes = packet.encode()?;

    tracing::debug!(channel = %active, bytes = bytes.len(), epoch = packet.epoch, "sealed envelope");
    println!("{}", hex::encode(bytes));
    Ok(())
}

pub fn cmd_open(config: &MeshwireConfig, encoded: &str) -> Result<()> {
    let bytes = hex::decode(encoded.trim()).context("envelope must be hex")?;
    let packet = ChannelEncryptedPacket::decode(&bytes).context("not a channel envelope")?;

    let registry = open_registry(config)?;
    match registry.open_with_known(&packet, &[]) {
        Some((channel, plaintext)) => {
            println!("#{}: {}", channel, String::from_utf8_lossy(&plaintext));
            Ok(())
        }
        None => bail!(
            "no joined channel opens this envelope (channel id {})",
            hex::encode(packet.channel_id)
        ),
    }
}
