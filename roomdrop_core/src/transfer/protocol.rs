//! Transfer wire protocol: control messages and fixed sizes

use serde::{Deserialize, Serialize};

/// Size of one data frame (16KB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Outstanding unsent bytes above which the sender pauses (1MB)
pub const BUFFERED_AMOUNT_THRESHOLD: usize = 1024 * 1024;

/// Control messages exchanged over the direct channel. Data frames carry
/// no envelope and belong to the file announced by the last `fileMetadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Advisory totals for a group of files that follow
    BatchMetadata {
        id: String,
        total_files: u64,
        total_bytes: u64,
    },
    FileMetadata {
        id: String,
        name: String,
        size: u64,
        file_type: String,
    },
    FileEnd { id: String },
}

impl ControlMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Declared attributes of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub file_type: String,
}

impl From<FileMetadata> for ControlMessage {
    fn from(meta: FileMetadata) -> Self {
        ControlMessage::FileMetadata {
            id: meta.id,
            name: meta.name,
            size: meta.size,
            file_type: meta.file_type,
        }
    }
}

/// Generate a file identifier unique per file
pub fn new_file_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
