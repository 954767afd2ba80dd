//! Participant session.
//!
//! `run_session` is a single actor task that owns the signaling connection,
//! the room state, the direct channel and the receiver state machine. User
//! commands, signaling messages and channel activity are all funnelled into
//! its select loop, so none of that state needs a lock.

pub mod backoff;
pub mod connector;
pub mod signaling;

pub use backoff::Backoff;
pub use connector::{PendingOffer, SetupPayload, connect_to_offer};
pub use signaling::{SignalingClient, SignalingEvents};

use crate::AppEvent;
use crate::config::ClientConfig;
use crate::error::{ProtocolViolation, TransferError};
use crate::rendezvous::{ClientMessage, ServerMessage};
use crate::transfer::utils::{format_speed, save_artifact};
use crate::transfer::{
    ChannelReceiver, ChannelSender, FileSender, Frame, ReceiverEvent, TransferReceiver, open_channel,
};
use anyhow::Result;
use rand::Rng;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use url::Url;

/// Minimum spacing of receive-side progress events
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Frames read ahead of the session before the socket read stalls
const CHANNEL_QUEUE_DEPTH: usize = 32;

//Struct command from the presentation layer to the session
#[derive(Debug, Clone)]
pub enum SessionCommand {
    CreateRoom(String),
    JoinRoom(String),
    SendFiles(Vec<PathBuf>),
    Leave,
}

/// Generate a 4-digit room identifier
pub fn generate_room_id() -> String {
    format!("{:04}", rand::rng().random_range(0..10_000))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Created the room; listens and offers
    Initiator,
    /// Joined the room; connects to offers
    Joiner,
}

/// Results of tasks spawned by the session, tagged with the channel
/// generation they belong to so stale results can be dropped.
enum Internal {
    ChannelReady { generation: u64, stream: TcpStream },
    ChannelSetupFailed { generation: u64, reason: String },
    SendFinished { result: Result<usize, TransferError> },
    RetryOffer { generation: u64 },
}

/// What the reader task of a direct channel hands to the session. Frames and
/// the final close share one bounded queue, so a slow session stalls the
/// socket read and the close never overtakes a frame.
#[derive(Debug, PartialEq)]
enum ChannelActivity {
    Frame(Frame),
    Closed,
}

type ActivityTx = mpsc::Sender<(u64, ChannelActivity)>;

struct ActiveChannel {
    sender: ChannelSender,
    generation: u64,
}

struct Session {
    config: ClientConfig,
    events: mpsc::Sender<AppEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    activity_tx: ActivityTx,
    room: Option<String>,
    role: Role,
    peer_present: bool,
    generation: u64,
    channel: Option<ActiveChannel>,
    receiver: TransferReceiver,
    sending: bool,
    channel_backoff: Backoff,
    last_progress: Option<Instant>,
}

/// Run a participant session until `Leave`, until the command channel
/// closes, or until signaling cannot be re-established.
pub async fn run_session(
    config: ClientConfig,
    mut commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<AppEvent>,
) -> Result<()> {
    let url = config.signaling_url()?;
    let (mut signaling, mut incoming) = SignalingClient::connect(&url).await?;
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
    let (activity_tx, mut activity_rx) = mpsc::channel(CHANNEL_QUEUE_DEPTH);

    let mut signaling_backoff = Backoff::from_config(&config);
    let mut session = Session::new(config, events.clone(), internal_tx, activity_tx);

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(SessionCommand::Leave) | None => {
                    session.teardown_channel().await;
                    signaling.close().await;
                    tracing::info!("Session ended");
                    return Ok(());
                }
                Some(cmd) => session.handle_command(cmd, &mut signaling).await,
            },
            msg = incoming.recv() => match msg {
                Some(msg) => session.handle_server_message(msg, &mut signaling).await,
                None => {
                    session.on_signaling_lost().await;
                    match reconnect_signaling(&url, &mut signaling_backoff, &events).await {
                        Some((client, stream)) => {
                            signaling = client;
                            incoming = stream;
                            session.rejoin(&mut signaling).await;
                        }
                        None => {
                            let _ = events
                                .send(AppEvent::ConnectionFailed(
                                    "Could not reach the rendezvous service".to_string(),
                                ))
                                .await;
                            return Ok(());
                        }
                    }
                }
            },
            Some(internal) = internal_rx.recv() => {
                session.handle_internal(internal, &mut signaling).await;
            }
            Some((generation, activity)) = activity_rx.recv() => {
                session.handle_activity(generation, activity).await;
            }
        }
    }
}

async fn reconnect_signaling(
    url: &Url,
    backoff: &mut Backoff,
    events: &mpsc::Sender<AppEvent>,
) -> Option<(SignalingClient, SignalingEvents)> {
    while let Some(delay) = backoff.next_delay() {
        let _ = events
            .send(AppEvent::Reconnecting {
                attempt: backoff.attempt(),
                max_attempts: backoff.max_attempts(),
            })
            .await;
        tokio::time::sleep(delay).await;

        match SignalingClient::connect(url).await {
            Ok(conn) => {
                backoff.reset();
                return Some(conn);
            }
            Err(e) => tracing::warn!("Reconnect attempt {} failed: {:#}", backoff.attempt(), e),
        }
    }
    None
}

/// Forward frames from the direct channel until it ends, then report the
/// close. Waits for queue space before reading on.
async fn read_channel(
    mut receiver: ChannelReceiver,
    sender: ChannelSender,
    generation: u64,
    activity_tx: ActivityTx,
) {
    loop {
        let frame = tokio::select! {
            next = receiver.recv() => match next {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Direct channel read failed: {}", e);
                    break;
                }
            },
            _ = sender.closed() => break,
        };
        if activity_tx
            .send((generation, ChannelActivity::Frame(frame)))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = activity_tx.send((generation, ChannelActivity::Closed)).await;
}

impl Session {
    fn new(
        config: ClientConfig,
        events: mpsc::Sender<AppEvent>,
        internal_tx: mpsc::UnboundedSender<Internal>,
        activity_tx: ActivityTx,
    ) -> Self {
        Self {
            receiver: TransferReceiver::new(config.max_file_size),
            channel_backoff: Backoff::from_config(&config),
            config,
            events,
            internal_tx,
            activity_tx,
            room: None,
            role: Role::Joiner,
            peer_present: false,
            generation: 0,
            channel: None,
            sending: false,
            last_progress: None,
        }
    }

    async fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event).await;
    }

    async fn signal(&self, signaling: &mut SignalingClient, msg: ClientMessage) {
        if let Err(e) = signaling.send(&msg).await {
            tracing::warn!("{:#}", e);
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand, signaling: &mut SignalingClient) {
        match cmd {
            SessionCommand::CreateRoom(room_id) => {
                self.leave_room_state().await;
                self.signal(signaling, ClientMessage::CreateRoom { room_id })
                    .await;
            }
            SessionCommand::JoinRoom(room_id) => {
                self.leave_room_state().await;
                self.signal(signaling, ClientMessage::JoinRoom { room_id })
                    .await;
            }
            SessionCommand::SendFiles(paths) => self.start_sending(paths).await,
            SessionCommand::Leave => {}
        }
    }

    async fn leave_room_state(&mut self) {
        self.teardown_channel().await;
        self.room = None;
        self.peer_present = false;
        self.channel_backoff.reset();
    }

    async fn start_sending(&mut self, paths: Vec<PathBuf>) {
        let Some(channel) = &self.channel else {
            self.emit(AppEvent::Error(TransferError::NotConnected.to_string()))
                .await;
            return;
        };
        if self.sending {
            self.emit(AppEvent::Error(TransferError::Busy.to_string()))
                .await;
            return;
        }
        if paths.is_empty() {
            return;
        }

        self.sending = true;
        let mut sender = FileSender::new(channel.sender.clone(), Some(self.events.clone()));
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = sender.send_batch(&paths).await.map(|sent| sent.len());
            let _ = internal_tx.send(Internal::SendFinished { result });
        });
    }

    async fn handle_server_message(&mut self, msg: ServerMessage, signaling: &mut SignalingClient) {
        match msg {
            ServerMessage::RoomCreated { room_id } => {
                tracing::info!("Created room {}", room_id);
                self.room = Some(room_id.clone());
                self.role = Role::Initiator;
                self.emit(AppEvent::RoomCreated(room_id)).await;
            }
            ServerMessage::RoomJoined { room_id } => {
                tracing::info!("Joined room {}", room_id);
                self.room = Some(room_id.clone());
                self.role = Role::Joiner;
                self.peer_present = true;
                self.emit(AppEvent::RoomJoined(room_id)).await;
            }
            ServerMessage::RoomFull { room_id } => self.emit(AppEvent::RoomFull(room_id)).await,
            ServerMessage::RoomNotFound { room_id } => {
                self.emit(AppEvent::RoomNotFound(room_id)).await
            }
            ServerMessage::OtherUserJoined { peer_id } => {
                self.peer_present = true;
                self.emit(AppEvent::PeerJoined(peer_id)).await;
                if self.role == Role::Initiator {
                    self.channel_backoff.reset();
                    self.start_offer(signaling).await;
                }
            }
            ServerMessage::UserReconnected { peer_id } => {
                self.peer_present = true;
                self.emit(AppEvent::PeerReconnected(peer_id)).await;
                // The peer's side of any old channel is gone
                self.teardown_channel().await;
                if self.role == Role::Initiator {
                    self.channel_backoff.reset();
                    self.start_offer(signaling).await;
                }
            }
            ServerMessage::UserDisconnected { peer_id } => {
                self.peer_present = false;
                self.emit(AppEvent::PeerDisconnected(peer_id)).await;
                self.teardown_channel().await;
            }
            ServerMessage::ReconnectedToRoom { room_id } => {
                tracing::info!("Reconnected to room {}", room_id);
                self.emit(AppEvent::ReconnectedToRoom(room_id)).await;
                if self.role == Role::Initiator && self.peer_present {
                    self.channel_backoff.reset();
                    self.start_offer(signaling).await;
                }
            }
            ServerMessage::ReconnectionFailed { room_id } => {
                if self.role == Role::Initiator && !self.peer_present {
                    // Nobody else was in the room, so it was dropped with us
                    tracing::info!("Recreating room {}", room_id);
                    self.signal(signaling, ClientMessage::CreateRoom { room_id })
                        .await;
                } else {
                    self.room = None;
                    self.emit(AppEvent::ReconnectionFailed(room_id)).await;
                }
            }
            ServerMessage::Relay { from, payload, .. } => {
                match SetupPayload::from_value(payload) {
                    Ok(setup) => self.handle_setup(setup).await,
                    Err(e) => tracing::warn!("Ignoring relay from {}: {:#}", from, e),
                }
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Rendezvous error: {}", message);
                self.emit(AppEvent::Error(message)).await;
            }
        }
    }

    async fn handle_setup(&mut self, setup: SetupPayload) {
        match setup {
            SetupPayload::Offer { addr, token } => {
                if self.role != Role::Joiner {
                    tracing::warn!("Ignoring offer: this side created the room");
                    return;
                }
                self.teardown_channel().await;
                self.generation += 1;
                let generation = self.generation;
                let timeout = self.config.channel_setup_timeout();
                let internal_tx = self.internal_tx.clone();
                self.emit(AppEvent::Status(format!("Connecting to peer at {}", addr)))
                    .await;

                tokio::spawn(async move {
                    let msg = match connect_to_offer(&addr, token, timeout).await {
                        Ok(stream) => Internal::ChannelReady { generation, stream },
                        Err(e) => Internal::ChannelSetupFailed {
                            generation,
                            reason: format!("{:#}", e),
                        },
                    };
                    let _ = internal_tx.send(msg);
                });
            }
            SetupPayload::Answer => tracing::debug!("Peer answered the offer"),
        }
    }

    /// Listen for the peer and relay an offer through the room
    async fn start_offer(&mut self, signaling: &mut SignalingClient) {
        let Some(room_id) = self.room.clone() else {
            return;
        };
        self.teardown_channel().await;
        self.generation += 1;
        let generation = self.generation;

        let pending = match PendingOffer::bind(&self.config).await {
            Ok(pending) => pending,
            Err(e) => {
                self.emit(AppEvent::Error(format!("{:#}", e))).await;
                self.schedule_retry(generation).await;
                return;
            }
        };

        let payload = pending.payload().to_value();
        self.signal(signaling, ClientMessage::Relay { room_id, payload })
            .await;
        self.emit(AppEvent::Status("Waiting for peer to connect...".to_string()))
            .await;

        let timeout = self.config.channel_setup_timeout();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let msg = match pending.accept(timeout).await {
                Ok(stream) => Internal::ChannelReady { generation, stream },
                Err(e) => Internal::ChannelSetupFailed {
                    generation,
                    reason: format!("{:#}", e),
                },
            };
            let _ = internal_tx.send(msg);
        });
    }

    /// Re-offer after a backoff delay, or give up at the ceiling
    async fn schedule_retry(&mut self, generation: u64) {
        if self.role != Role::Initiator || !self.peer_present {
            return;
        }
        match self.channel_backoff.next_delay() {
            Some(delay) => {
                tracing::info!(
                    "Re-establishing direct channel in {:?} (attempt {}/{})",
                    delay,
                    self.channel_backoff.attempt(),
                    self.channel_backoff.max_attempts()
                );
                self.emit(AppEvent::Reconnecting {
                    attempt: self.channel_backoff.attempt(),
                    max_attempts: self.channel_backoff.max_attempts(),
                })
                .await;
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = internal_tx.send(Internal::RetryOffer { generation });
                });
            }
            None => {
                self.emit(AppEvent::ConnectionFailed(
                    "Direct channel could not be re-established".to_string(),
                ))
                .await;
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal, signaling: &mut SignalingClient) {
        match internal {
            Internal::ChannelReady { generation, stream } => {
                if generation != self.generation || self.channel.is_some() {
                    tracing::debug!("Dropping stale direct connection");
                    return;
                }
                self.attach_channel(stream, generation);
                self.channel_backoff.reset();
                if self.role == Role::Joiner {
                    if let Some(room_id) = self.room.clone() {
                        let payload = SetupPayload::Answer.to_value();
                        self.signal(signaling, ClientMessage::Relay { room_id, payload })
                            .await;
                    }
                }
                self.emit(AppEvent::ChannelOpen).await;
            }
            Internal::ChannelSetupFailed { generation, reason } => {
                if generation != self.generation {
                    return;
                }
                tracing::warn!("Direct channel setup failed: {}", reason);
                self.emit(AppEvent::Status(format!("Connection attempt failed: {}", reason)))
                    .await;
                self.schedule_retry(generation).await;
            }
            Internal::RetryOffer { generation } => {
                if generation == self.generation && self.channel.is_none() && self.peer_present {
                    self.start_offer(signaling).await;
                }
            }
            Internal::SendFinished { result } => {
                self.sending = false;
                match result {
                    Ok(count) => tracing::info!("Sent {} file(s)", count),
                    Err(e) => {
                        tracing::error!("Send failed: {}", e);
                        self.emit(AppEvent::Error(format!("Send failed: {}", e)))
                            .await;
                        // Without a fileEnd the peer would wait on this file forever
                        if matches!(e, TransferError::SourceTruncated { .. }) {
                            if let Some(channel) = &self.channel {
                                channel.sender.close();
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_activity(&mut self, generation: u64, activity: ChannelActivity) {
        if !self.channel.as_ref().is_some_and(|c| c.generation == generation) {
            return;
        }
        match activity {
            ChannelActivity::Frame(frame) => self.handle_frame(frame).await,
            ChannelActivity::Closed => {
                tracing::info!("Direct channel closed");
                self.teardown_channel().await;
                self.generation += 1;
                let generation = self.generation;
                self.schedule_retry(generation).await;
            }
        }
    }

    fn attach_channel(&mut self, stream: TcpStream, generation: u64) {
        let (sender, receiver) = open_channel(stream);
        tokio::spawn(read_channel(
            receiver,
            sender.clone(),
            generation,
            self.activity_tx.clone(),
        ));

        self.receiver = TransferReceiver::new(self.config.max_file_size);
        self.channel = Some(ActiveChannel { sender, generation });
    }

    /// Close the direct channel and discard any partial incoming file
    async fn teardown_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.sender.close();
            self.emit(AppEvent::ChannelLost).await;
        }
        if let Some(aborted) = self.receiver.abort() {
            self.emit(AppEvent::TransferAborted {
                file_name: aborted.name,
            })
            .await;
        }
    }

    async fn on_signaling_lost(&mut self) {
        tracing::warn!("Lost connection to the rendezvous service");
        self.emit(AppEvent::Status("Connection lost. Attempting to reconnect...".to_string()))
            .await;
        self.teardown_channel().await;
    }

    /// Re-enter the current room after signaling came back
    async fn rejoin(&mut self, signaling: &mut SignalingClient) {
        if let Some(room_id) = self.room.clone() {
            self.signal(signaling, ClientMessage::ReconnectToRoom { room_id })
                .await;
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        for event in self.receiver.handle_frame(frame) {
            match event {
                ReceiverEvent::FileStarted(meta) => {
                    self.last_progress = None;
                    self.emit(AppEvent::TransferStarted {
                        file_name: meta.name,
                        total_bytes: meta.size,
                        is_sending: false,
                    })
                    .await;
                }
                ReceiverEvent::Progress(progress) => {
                    let due = self
                        .last_progress
                        .is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL);
                    if due || progress.percent >= 100.0 {
                        self.last_progress = Some(Instant::now());
                        self.emit(AppEvent::TransferProgress {
                            file_name: progress.file_name,
                            progress: progress.percent,
                            speed: format_speed(progress.bytes_per_sec),
                            speed_bps: progress.bytes_per_sec,
                            is_sending: false,
                        })
                        .await;
                    }
                }
                ReceiverEvent::FileCompleted(file) => {
                    match save_artifact(&self.config.download_path, &file.name, &file.data).await {
                        Ok(saved_path) => {
                            tracing::info!("Saved {} to {}", file.name, saved_path.display());
                            self.emit(AppEvent::FileSaved {
                                file_name: file.name.clone(),
                                saved_path,
                            })
                            .await;
                        }
                        Err(e) => {
                            tracing::error!("Failed to save {}: {}", file.name, e);
                            self.emit(AppEvent::Error(format!(
                                "Failed to save {}: {}",
                                file.name, e
                            )))
                            .await;
                        }
                    }
                    self.emit(AppEvent::TransferCompleted(file.name)).await;
                }
                ReceiverEvent::BatchStarted {
                    total_files,
                    total_bytes,
                    ..
                } => {
                    self.emit(AppEvent::BatchStarted {
                        total_files,
                        total_bytes,
                        is_sending: false,
                    })
                    .await
                }
                ReceiverEvent::BatchProgress {
                    files_done,
                    total_files,
                    ..
                } => {
                    self.emit(AppEvent::BatchProgress {
                        files_done,
                        total_files,
                        is_sending: false,
                    })
                    .await
                }
                ReceiverEvent::BatchCompleted { .. } => {
                    self.emit(AppEvent::BatchCompleted { is_sending: false })
                        .await
                }
                ReceiverEvent::Ignored(ProtocolViolation::FileRejected(reason)) => {
                    self.emit(AppEvent::Error(format!("File rejected: {}", reason)))
                        .await
                }
                ReceiverEvent::Ignored(_) => {}
            }
        }
    }
}
