//! Quire CLI
//!
//! Thin wrapper around quire-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! quire info
//!
//! # Create a group and write to it
//! quire group create "Field notes"
//! quire entry append "Field notes" '{"text": "first light at 5:40"}'
//!
//! # Share it
//! quire group invite "Field notes"
//!
//! # On another machine
//! quire group join quire-join:...
//!
//! # Replicate until Ctrl+C, appending stdin lines to a group
//! quire serve --write "Field notes"
//! ```

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use quire_core::{
    ContentDigest, DiscoveryKey, EntryBody, LogEntry, Node, SwarmConfig, SyncEvent, WriterKey,
};
use tokio::io::AsyncBufReadExt;

/// Quire - signed append-only logs, replicated peer to peer
#[derive(Parser)]
#[command(name = "quire")]
#[command(version = "0.1.0")]
#[command(about = "Quire - signed append-only logs, replicated peer to peer")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.quire)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Swarm configuration file (default: <data-dir>/config.json if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Group management
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Read and write log entries
    Entry {
        #[command(subcommand)]
        action: EntryAction,
    },

    /// Replicate all groups until interrupted
    Serve {
        /// Append each line read from stdin to this group
        #[arg(short, long)]
        write: Option<String>,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Create a new group
    Create {
        /// Title of the group
        title: String,
        /// Keep the log in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// List joined groups
    List,
    /// Show group details
    Show {
        /// Group title or discovery key prefix
        group: String,
    },
    /// Print a join link for a group
    Invite {
        /// Group title or discovery key prefix
        group: String,
    },
    /// Join a group from a join link
    Join {
        /// Join link (quire-join:...)
        link: String,
        /// Keep the log in memory only
        #[arg(long)]
        ephemeral: bool,
    },
    /// Leave a group and delete its local log
    Leave {
        /// Group title or discovery key prefix
        group: String,
    },
}

#[derive(Subcommand)]
enum EntryAction {
    /// Append a JSON object to this node's log in a group
    Append {
        /// Group title or discovery key prefix
        group: String,
        /// Entry body, a JSON object
        body: String,
    },
    /// List entries in a group
    List {
        /// Group title or discovery key prefix
        group: String,
        /// Only this writer's log (base58)
        #[arg(short, long)]
        writer: Option<String>,
    },
    /// Look up an entry by content digest
    Get {
        /// Group title or discovery key prefix
        group: String,
        /// Content digest (base58)
        digest: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.quire)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quire")
}

fn load_config(path: Option<&PathBuf>, data_dir: &Path) -> Result<SwarmConfig> {
    match path {
        Some(path) => Ok(SwarmConfig::load(path)?),
        None => Ok(SwarmConfig::load_or_default(data_dir)?),
    }
}

fn resolve_group(node: &Node, query: &str) -> Result<DiscoveryKey> {
    node.registry()
        .resolve(query)
        .map_err(|e| anyhow::anyhow!("Unknown group '{}': {}", query, e))
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

fn print_entry(entry: &LogEntry) {
    println!(
        "  {}#{} {} {}",
        entry.writer.to_base58(),
        entry.index,
        entry.digest.to_base58(),
        entry.body.value()
    );
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Joined { discovery_key } => println!("[swarm] joined {}", discovery_key),
        SyncEvent::Left { discovery_key } => println!("[swarm] left {}", discovery_key),
        SyncEvent::PeerConnected {
            discovery_key,
            peer,
        } => println!("[peer] {} connected in {}", peer, discovery_key),
        SyncEvent::PeerDisconnected {
            discovery_key,
            peer,
            reason,
        } => match reason {
            Some(reason) => println!(
                "[peer] {} disconnected from {}: {}",
                peer, discovery_key, reason
            ),
            None => println!("[peer] {} disconnected from {}", peer, discovery_key),
        },
        SyncEvent::EntryStored { writer, index, .. } => {
            println!("[entry] received {}#{}", writer, index)
        }
        SyncEvent::InvalidEntry {
            peer,
            writer,
            index,
            reason,
            ..
        } => println!(
            "[invalid] {}#{} from {}: {}",
            writer, index, peer, reason
        ),
        SyncEvent::PeerReportedInvalid {
            peer,
            writer,
            index,
            reason,
            ..
        } => println!(
            "[invalid] {} rejected {}#{}: {}",
            peer, writer, index, reason
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = load_config(cli.config.as_ref(), &data_dir)?;
    let mut node: Node = Node::open(&data_dir, config)?;

    match cli.command {
        Commands::Info => {
            let info = node.info()?;

            println!("Quire v0.1.0");
            println!();
            println!("Node:");
            match info.endpoint_id {
                Some(id) => println!("  Endpoint ID: {}", id),
                None => println!("  Endpoint ID: (networking never started)"),
            }
            println!();
            println!("Data directory: {}", info.data_dir.display());
            println!("Groups: {}", info.group_count);
        }

        Commands::Group { action } => match action {
            GroupAction::Create { title, ephemeral } => {
                let group = node.create_group(&title, !ephemeral).await?;
                println!("Created group: {}", title);
                println!("  ID: {}", group.discovery_key().to_base58());
                if ephemeral {
                    println!("  Log kept in memory only");
                }
            }

            GroupAction::List => {
                let groups = node.registry().list()?;
                if groups.is_empty() {
                    println!("No groups found.");
                } else {
                    println!("Groups ({}):", groups.len());
                    println!();
                    for record in groups {
                        let ephemeral = if record.persistent { "" } else { " [ephemeral]" };
                        println!(
                            "  {} {}{}",
                            record.discovery_key.to_base58(),
                            record.display_title(),
                            ephemeral
                        );
                    }
                }
            }

            GroupAction::Show { group } => {
                let dk = resolve_group(&node, &group)?;
                let Some(record) = node.registry().record(&dk)? else {
                    anyhow::bail!("Group not found: {}", group);
                };
                let opened = node.registry().group(&dk)?;
                let store = opened.store();

                println!("Group: {}", record.display_title());
                println!("  ID: {}", dk.to_base58());
                println!("  Created: {}", format_timestamp(record.created_at));
                println!("  Persistent: {}", if record.persistent { "Yes" } else { "No" });
                println!("  Writer: {}", opened.writer_key().to_base58());
                println!("  Writer fingerprint: {}", opened.writer().fingerprint());
                println!("  Entries: {}", store.len()?);
                let heads = store.heads()?;
                if !heads.is_empty() {
                    println!("  Logs:");
                    for (writer, head) in heads {
                        println!("    {} head {}", writer.to_base58(), head);
                    }
                }
            }

            GroupAction::Invite { group } => {
                let dk = resolve_group(&node, &group)?;
                let link = node.invite(&dk)?;
                println!("Join link for {}:", group);
                println!();
                println!("{}", link);
                println!();
                println!("Anyone holding this link can read and write the group.");
            }

            GroupAction::Join { link, ephemeral } => {
                let group = node.join_group(link.trim(), !ephemeral).await?;
                let dk = group.discovery_key();
                let title = node
                    .registry()
                    .record(&dk)?
                    .map(|r| r.display_title())
                    .unwrap_or_else(|| dk.to_string());
                println!("Joined group: {}", title);
                println!("  ID: {}", dk.to_base58());
            }

            GroupAction::Leave { group } => {
                let dk = resolve_group(&node, &group)?;
                if node.leave_group(&dk).await? {
                    println!("Left group: {}", group);
                } else {
                    println!("Not a member of: {}", group);
                }
            }
        },

        Commands::Entry { action } => match action {
            EntryAction::Append { group, body } => {
                let dk = resolve_group(&node, &group)?;
                let body = EntryBody::from_json_str(&body)?;
                let entry = node.append(&dk, &body)?;
                println!("Appended entry #{}", entry.index);
                println!("  Writer: {}", entry.writer.to_base58());
                println!("  Digest: {}", entry.digest.to_base58());
            }

            EntryAction::List { group, writer } => {
                let dk = resolve_group(&node, &group)?;
                let store = node.registry().group(&dk)?.store().clone();
                let writers: Vec<WriterKey> = match writer {
                    Some(w) => vec![WriterKey::from_base58(&w)?],
                    None => store.list_writers()?.into_iter().collect(),
                };

                let mut total = 0;
                for writer in writers {
                    for entry in store.entries(&writer)? {
                        print_entry(&entry);
                        total += 1;
                    }
                }
                if total == 0 {
                    println!("No entries.");
                }
            }

            EntryAction::Get { group, digest } => {
                let dk = resolve_group(&node, &group)?;
                let digest = ContentDigest::from_base58(&digest)?;
                match node.registry().group(&dk)?.store().get_by_digest(&digest)? {
                    Some(entry) => {
                        println!("Entry {}#{}", entry.writer.to_base58(), entry.index);
                        println!("{}", serde_json::to_string_pretty(entry.body.value())?);
                    }
                    None => {
                        println!("No entry with digest {}", digest.to_base58());
                    }
                }
            }
        },

        Commands::Serve { write } => {
            let write_to = write.as_deref().map(|g| resolve_group(&node, g)).transpose()?;

            println!("Starting Quire...");
            println!();
            node.start_network().await?;
            let info = node.info()?;

            println!("Node:");
            if let Some(id) = &info.endpoint_id {
                println!("  Endpoint ID: {}", id);
            }
            println!("  Groups: {}", info.group_count);
            println!();
            println!("Data directory: {}", info.data_dir.display());
            println!();
            if let Some(dk) = &write_to {
                println!("Appending stdin lines to {}", dk);
            }
            println!("Node is running. Press Ctrl+C to stop.");
            println!();

            let Some(mut events) = node.subscribe() else {
                anyhow::bail!("Networking did not start");
            };
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            let mut stdin_open = write_to.is_some();

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        println!();
                        println!("Received shutdown signal...");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            println!("[events] skipped {} events", n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    line = lines.next_line(), if stdin_open => match line? {
                        Some(line) if line.trim().is_empty() => {}
                        Some(line) => {
                            if let Some(dk) = &write_to {
                                let body = EntryBody::new(serde_json::json!({ "text": line }))?;
                                let entry = node.append(dk, &body)?;
                                println!("[entry] appended #{}", entry.index);
                            }
                        }
                        None => stdin_open = false,
                    },
                }
            }

            println!("Shutting down...");
            node.shutdown().await;
            println!("Goodbye.");
        }
    }

    Ok(())
}
