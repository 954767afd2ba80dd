use std::path::PathBuf;

pub mod config;
pub mod error;
pub mod rendezvous;
pub mod session;
pub mod transfer;

pub use session::{SessionCommand, run_session};

//Struct report from Core to the presentation layer
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),

    /// Room confirmations from the rendezvous service
    RoomCreated(String),
    RoomJoined(String),
    RoomFull(String),
    RoomNotFound(String),

    /// The other member of the room
    PeerJoined(String),
    PeerReconnected(String),
    PeerDisconnected(String),

    /// Signaling connection lost, retrying
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
    },
    ReconnectedToRoom(String),
    ReconnectionFailed(String),
    /// Retry ceiling reached; the session is over
    ConnectionFailed(String),

    /// Direct channel to the peer is open / was lost
    ChannelOpen,
    ChannelLost,

    TransferStarted {
        file_name: String,
        total_bytes: u64,
        is_sending: bool,
    },
    TransferProgress {
        file_name: String,
        progress: f32,
        speed: String,
        speed_bps: f64,
        is_sending: bool,
    },
    BatchStarted {
        total_files: u64,
        total_bytes: u64,
        is_sending: bool,
    },
    BatchProgress {
        files_done: u64,
        total_files: u64,
        is_sending: bool,
    },
    BatchCompleted {
        is_sending: bool,
    },
    TransferCompleted(String),

    /// Receiver: artifact written to disk
    FileSaved {
        file_name: String,
        saved_path: PathBuf,
    },

    /// In-flight file abandoned because the channel closed
    TransferAborted {
        file_name: String,
    },

    Error(String),
}
