//! Chunked file transfer over a framed direct channel.
//!
//! This module provides:
//! - Length-prefixed framing that separates control messages from data
//! - Sender with buffered-amount flow control
//! - Receiver state machine with reassembly and batch accounting
//! - Helpers for naming and persisting received files

pub mod channel;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod utils;

// Re-export public API
pub use channel::{ChannelReceiver, ChannelSender, Frame, open_channel};
pub use protocol::{BUFFERED_AMOUNT_THRESHOLD, CHUNK_SIZE, ControlMessage, FileMetadata};
pub use receiver::{ReceivedFile, ReceiverEvent, TransferProgress, TransferReceiver};
pub use sender::{FileSender, OutgoingFile};
pub use utils::{format_transfer_speed, sanitize_file_name, save_artifact};
