//! Command-line participant
//!
//! Creates or joins a room, sends the given files once the direct channel
//! opens, and saves whatever the peer sends into the download directory.

use clap::{Parser, Subcommand};
use roomdrop_core::config::ClientConfig;
use roomdrop_core::session::generate_room_id;
use roomdrop_core::{AppEvent, SessionCommand, run_session};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// roomdrop - pair with one peer through a room code and exchange files
#[derive(Parser)]
#[command(name = "roomdrop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Rendezvous service URL (ws://, wss://, http:// or https://)
    #[arg(short, long)]
    server: Option<String>,

    /// Directory for received files
    #[arg(short, long)]
    download_dir: Option<PathBuf>,

    /// Host to advertise to the peer for the direct channel
    #[arg(long)]
    advertise_host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a room and wait for a peer
    Create {
        /// Room code (random 4 digits if omitted)
        #[arg(short, long)]
        room: Option<String>,

        /// Files to send once connected
        files: Vec<PathBuf>,
    },

    /// Join an existing room
    Join {
        /// Room code
        room: String,

        /// Files to send once connected
        files: Vec<PathBuf>,
    },

    /// Write the effective settings to the config file
    SaveConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .with_target(false)
        .init();

    let mut config = ClientConfig::load();
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(dir) = cli.download_dir {
        config.download_path = dir;
    }
    if cli.advertise_host.is_some() {
        config.advertise_host = cli.advertise_host;
    }
    config.signaling_url()?;

    let (join, files) = match cli.command {
        Commands::Create { room, files } => {
            let room = room.unwrap_or_else(generate_room_id);
            (SessionCommand::CreateRoom(room), files)
        }
        Commands::Join { room, files } => (SessionCommand::JoinRoom(room), files),
        Commands::SaveConfig => {
            config.save()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            return Ok(());
        }
    };

    for file in &files {
        if !file.is_file() {
            anyhow::bail!("Not a file: {}", file.display());
        }
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let session = tokio::spawn(run_session(config, cmd_rx, event_tx));

    cmd_tx.send(join).await?;

    let mut pending_files = Some(files).filter(|f| !f.is_empty());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = cmd_tx.send(SessionCommand::Leave).await;
                break;
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                if matches!(event, AppEvent::ChannelOpen) {
                    if let Some(files) = pending_files.take() {
                        cmd_tx.send(SessionCommand::SendFiles(files)).await?;
                    }
                }
                let terminal = matches!(
                    event,
                    AppEvent::ConnectionFailed(_) | AppEvent::ReconnectionFailed(_)
                );
                print_event(&event);
                if terminal {
                    break;
                }
            }
        }
    }

    drop(cmd_tx);
    match session.await? {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Session error: {:#}", e);
            Err(e)
        }
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::Status(msg) => println!("{}", msg),
        AppEvent::RoomCreated(room) => println!("Room {} created. Share this code with your peer.", room),
        AppEvent::RoomJoined(room) => println!("Joined room {}. Connecting...", room),
        AppEvent::RoomFull(room) => println!("Room {} is full.", room),
        AppEvent::RoomNotFound(room) => println!("Room {} not found.", room),
        AppEvent::PeerJoined(_) => println!("Another user joined! Establishing connection..."),
        AppEvent::PeerReconnected(_) => println!("Other user reconnected! Re-establishing connection..."),
        AppEvent::PeerDisconnected(_) => println!("Other user disconnected. Waiting for reconnection..."),
        AppEvent::Reconnecting {
            attempt,
            max_attempts,
        } => println!("Connection lost. Reconnecting... ({}/{})", attempt, max_attempts),
        AppEvent::ReconnectedToRoom(_) => println!("Reconnected! Re-establishing peer connection..."),
        AppEvent::ReconnectionFailed(room) => println!("Reconnection to room {} failed.", room),
        AppEvent::ConnectionFailed(reason) => println!("Connection failed: {}", reason),
        AppEvent::ChannelOpen => println!("Connected! Ready to transfer files."),
        AppEvent::ChannelLost => println!("Direct connection lost."),
        AppEvent::TransferStarted {
            file_name,
            total_bytes,
            is_sending,
        } => {
            let verb = if *is_sending { "Sending" } else { "Receiving" };
            println!("{} {} ({} bytes)", verb, file_name, total_bytes);
        }
        AppEvent::TransferProgress {
            file_name,
            progress,
            speed,
            ..
        } => println!("  {} {:.2}% ({})", file_name, progress, speed),
        AppEvent::BatchStarted {
            total_files,
            total_bytes,
            ..
        } => println!("Batch of {} files ({} bytes)", total_files, total_bytes),
        AppEvent::BatchProgress {
            files_done,
            total_files,
            ..
        } => println!("  {}/{} files", files_done, total_files),
        AppEvent::BatchCompleted { .. } => println!("Batch complete."),
        AppEvent::TransferCompleted(name) => println!("Completed: {}", name),
        AppEvent::FileSaved {
            file_name,
            saved_path,
        } => println!("Saved {} to {}", file_name, saved_path.display()),
        AppEvent::TransferAborted { file_name } => println!("Transfer of {} aborted.", file_name),
        AppEvent::Error(msg) => eprintln!("Error: {}", msg),
    }
}
