//! meshwire-ctl: offline command-line tool for meshwire channels and transfers.

mod cmd;

use anyhow::{Context, Result};
use std::path::PathBuf;

use meshwire_core::config::MeshwireConfig;

use cmd::transfer::SendOptions;

fn print_usage() {
    println!("Usage: meshwire-ctl [--store <dir>] <command>");
    println!();
    println!("Commands:");
    println!("  channel-id <name> <password>   Print the channel id a password derives");
    println!("  join <name> <password>         Join a channel (first join becomes active)");
    println!("  leave <name>                   Leave a channel");
    println!("  select <name>                  Make a joined channel active");
    println!("  channels                       List joined channels");
    println!("  seal <text>                    Seal text with the active channel, print hex");
    println!("  open <hex>                     Open an envelope with any joined channel");
    println!("  send <path> [--loss <percent>] [--seed <n>]");
    println!("                                 Loopback transfer over a lossy link");
    println!("  init                           Write a default config file");
    println!();
    println!("Options:");
    println!("  --store <dir>   Channel store directory (overrides config)");
    println!();
    println!("Config: {}", MeshwireConfig::file_path().display());
}

fn take_value<'a>(args: &[&'a str], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .copied()
        .with_context(|| format!("{flag} requires a value"))
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    // Parse options
    let mut store_dir: Option<PathBuf> = None;
    let mut loss_percent = 0u8;
    let mut seed = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "--store" => store_dir = Some(PathBuf::from(take_value(&args, &mut i, "--store")?)),
            "--loss" => {
                loss_percent = take_value(&args, &mut i, "--loss")?
                    .parse()
                    .context("--loss must be a number from 0 to 99")?;
            }
            "--seed" => {
                seed = Some(
                    take_value(&args, &mut i, "--seed")?
                        .parse()
                        .context("--seed must be a number")?,
                );
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    if remaining.as_slice() == ["init"] {
        let path = MeshwireConfig::write_default_if_missing()?;
        println!("Config at {}", path.display());
        return Ok(());
    }

    let mut config = MeshwireConfig::load()?;
    if let Some(dir) = store_dir {
        config.channels.store_dir = dir;
    }

    match remaining.as_slice() {
        ["channel-id", name, password] => cmd::channels::cmd_channel_id(name, password),
        ["join", name, password]       => cmd::channels::cmd_join(&config, name, password),
        ["leave", name]                => cmd::channels::cmd_leave(&config, name),
        ["select", name]               => cmd::channels::cmd_select(&config, name),
        ["channels"] | []              => cmd::channels::cmd_channels(&config),
        ["seal", text]                 => cmd::envelope::cmd_seal(&config, text),
        ["open", hex]                  => cmd::envelope::cmd_open(&config, hex),
        ["send", path]                 => {
            let opts = SendOptions { loss_percent, seed };
            cmd::transfer::cmd_send(&config, std::path::Path::new(path), &opts)
        }
        ["help"] | ["--help"] | ["-h"] => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
