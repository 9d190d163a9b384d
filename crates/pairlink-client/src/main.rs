//! pairlink - peer sessions for local file and text sharing

use anyhow::Result;
use clap::{Parser, Subcommand};
use pairlink_client::config::{expand_path, Config};
use pairlink_client::events::PeerEvent;
use pairlink_client::loopback::Loopback;
use pairlink_client::registry::Command;
use pairlink_core::{FileContent, OutgoingFile, PeerId};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pairlink")]
#[command(about = "Peer-to-peer file and text sharing sessions", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.pairlink/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Init,

    /// Send files and text between two in-process peers
    Loopback {
        /// Use the relayed transport instead of a direct connection
        #[arg(long)]
        relay: bool,

        /// Text message to send before the files
        #[arg(short, long)]
        text: Option<String>,

        /// Files to send
        files: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Init => init_config(&cli.config)?,
        Commands::Loopback { relay, text, files } => {
            let config = Config::load_or_default(&expand_path(&cli.config))?;
            run_loopback(&config, relay, text, &files).await?;
        }
    }

    Ok(())
}

fn init_config(path: &str) -> Result<()> {
    let config_path = expand_path(path);
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let config = Config::default();
    std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;

    std::fs::create_dir_all(config.data_dir())?;
    if let Some(downloads) = config.download_dir() {
        std::fs::create_dir_all(downloads)?;
    }

    println!("Initialized pairlink at: {}", config_path.display());
    Ok(())
}

async fn run_loopback(config: &Config, relay: bool, text: Option<String>, files: &[String]) -> Result<()> {
    let download_dir = config.download_dir();
    if let Some(dir) = &download_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut lb = Loopback::new(true);
    let sender = lb.add_node(config.rtc_supported && !relay, config.transfer.clone(), None)?;
    let receiver = lb.add_node(config.rtc_supported, config.transfer.clone(), download_dir)?;

    lb.run_until(|lb| is_connected(lb, &sender, &receiver) && is_connected(lb, &receiver, &sender))
        .await?;
    let direct = lb
        .node(&sender)
        .and_then(|n| n.registry().peer(&receiver))
        .map(|s| s.is_direct())
        .unwrap_or(false);
    println!(
        "Connected {} -> {} ({})",
        sender,
        receiver,
        if direct { "direct" } else { "relay" }
    );

    if let Some(name) = &config.display_name {
        lb.command(&sender, Command::SetDisplayName(Some(name.clone())))?;
        lb.settle().await?;
        println!("Sender announced as {}", name);
    }

    if let Some(text) = text {
        lb.command(&sender, Command::SendText { to: receiver.clone(), text })?;
        lb.run_until(|lb| has_event(lb, &receiver, |e| matches!(e, PeerEvent::TextReceived { .. })))
            .await?;
        lb.settle().await?;
        println!("Text delivered");
    }

    if files.is_empty() {
        return Ok(());
    }

    let outgoing = files
        .iter()
        .map(|f| {
            let path = expand_path(f);
            OutgoingFile::from_path(&path, guess_mime(&path))
        })
        .collect::<pairlink_core::Result<Vec<_>>>()?;
    let total: u64 = outgoing.iter().map(|f| f.size).sum();
    println!("Sending {} file(s), {} bytes", outgoing.len(), total);

    lb.command(
        &sender,
        Command::FilesSelected {
            to: receiver.clone(),
            files: outgoing,
            thumbnail_data_url: None,
        },
    )?;
    lb.run_until(|lb| has_event(lb, &receiver, |e| matches!(e, PeerEvent::FilesTransferRequest { .. })))
        .await?;
    lb.command(
        &receiver,
        Command::RespondToTransferRequest {
            to: sender.clone(),
            accepted: true,
        },
    )?;
    lb.run_until(|lb| has_event(lb, &sender, |e| matches!(e, PeerEvent::FilesSent { .. })))
        .await?;
    lb.settle().await?;

    let received = lb
        .node(&receiver)
        .and_then(|n| {
            n.events().iter().find_map(|e| match e {
                PeerEvent::FilesReceived { files, .. } => Some(files.clone()),
                _ => None,
            })
        })
        .unwrap_or_default();
    for file in &received {
        match &file.content {
            FileContent::Disk(path) => println!("  {} ({} bytes) -> {}", file.name, file.size, path.display()),
            FileContent::Memory(_) => println!("  {} ({} bytes) in memory", file.name, file.size),
        }
    }
    println!("Transferred in {} rounds", lb.rounds());

    Ok(())
}

fn is_connected(lb: &Loopback, from: &PeerId, to: &PeerId) -> bool {
    lb.node(from)
        .and_then(|n| n.registry().peer(to))
        .map(|s| s.is_stable())
        .unwrap_or(false)
}

fn has_event(lb: &Loopback, node: &PeerId, pred: impl Fn(&PeerEvent) -> bool) -> bool {
    lb.node(node)
        .map(|n| n.events().iter().any(pred))
        .unwrap_or(false)
}

fn guess_mime(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" | "md" => "text/plain",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
    .to_string()
}
