//! Receiver state machine
//!
//! Frames arrive in send order. A `fileMetadata` opens a chunk buffer, data
//! frames append to it, and the matching `fileEnd` concatenates the buffer
//! into the finished artifact. Anything out of place is reported as
//! [`ReceiverEvent::Ignored`] and leaves the state untouched.

use super::channel::Frame;
use super::protocol::{ControlMessage, FileMetadata};
use super::utils::{average_speed, progress_percent, validate_transfer_info};
use crate::error::ProtocolViolation;
use bytes::{Bytes, BytesMut};
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

/// How many completed identifiers are remembered for duplicate `fileEnd`
/// detection. Older ones are forgotten and report as unknown.
pub const FINALIZED_HISTORY: usize = 256;

/// Progress of the file currently being received
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub file_id: String,
    pub file_name: String,
    pub bytes_done: u64,
    pub total_bytes: u64,
    /// received / declared, clamped to 100
    pub percent: f32,
    /// Running average since the first data frame of the file, not an
    /// instantaneous rate
    pub bytes_per_sec: f64,
}

/// A fully reassembled file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub id: String,
    pub name: String,
    pub file_type: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    FileStarted(FileMetadata),
    Progress(TransferProgress),
    FileCompleted(ReceivedFile),
    BatchStarted {
        id: String,
        total_files: u64,
        total_bytes: u64,
    },
    BatchProgress {
        id: String,
        files_done: u64,
        total_files: u64,
        bytes_done: u64,
        total_bytes: u64,
    },
    BatchCompleted {
        id: String,
    },
    Ignored(ProtocolViolation),
}

struct ActiveFile {
    meta: FileMetadata,
    chunks: Vec<Bytes>,
    received: u64,
    /// Set by the first data frame
    started: Option<Instant>,
}

struct BatchState {
    id: String,
    total_files: u64,
    total_bytes: u64,
    files_done: u64,
    bytes_done: u64,
}

pub struct TransferReceiver {
    max_file_size: u64,
    active: Option<ActiveFile>,
    finalized: HashSet<String>,
    finalized_order: VecDeque<String>,
    batch: Option<BatchState>,
}

impl TransferReceiver {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            max_file_size,
            active: None,
            finalized: HashSet::new(),
            finalized_order: VecDeque::new(),
            batch: None,
        }
    }

    /// Identifier of the file currently being received, if any
    pub fn receiving(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.meta.id.as_str())
    }

    /// Bytes buffered for the file currently being received
    pub fn bytes_received(&self) -> u64 {
        self.active.as_ref().map_or(0, |a| a.received)
    }

    pub fn is_finalized(&self, id: &str) -> bool {
        self.finalized.contains(id)
    }

    pub fn handle_frame(&mut self, frame: Frame) -> Vec<ReceiverEvent> {
        let events = match frame {
            Frame::Data(chunk) => self.on_data(chunk),
            Frame::Control(text) => match ControlMessage::decode(&text) {
                Ok(msg) => self.on_control(msg),
                Err(e) => vec![ReceiverEvent::Ignored(ProtocolViolation::MalformedControl(
                    e.to_string(),
                ))],
            },
        };

        for event in &events {
            if let ReceiverEvent::Ignored(violation) = event {
                tracing::warn!("Ignoring frame: {}", violation);
            }
        }
        events
    }

    fn on_control(&mut self, msg: ControlMessage) -> Vec<ReceiverEvent> {
        match msg {
            ControlMessage::BatchMetadata {
                id,
                total_files,
                total_bytes,
            } => {
                tracing::info!(
                    "Batch {} announced: {} files, {} bytes",
                    id,
                    total_files,
                    total_bytes
                );
                self.batch = Some(BatchState {
                    id: id.clone(),
                    total_files,
                    total_bytes,
                    files_done: 0,
                    bytes_done: 0,
                });
                vec![ReceiverEvent::BatchStarted {
                    id,
                    total_files,
                    total_bytes,
                }]
            }
            ControlMessage::FileMetadata {
                id,
                name,
                size,
                file_type,
            } => self.on_metadata(FileMetadata {
                id,
                name,
                size,
                file_type,
            }),
            ControlMessage::FileEnd { id } => self.on_file_end(id),
        }
    }

    fn on_metadata(&mut self, meta: FileMetadata) -> Vec<ReceiverEvent> {
        if let Err(violation) = validate_transfer_info(&meta.name, meta.size, self.max_file_size) {
            return vec![ReceiverEvent::Ignored(violation)];
        }

        if let Some(active) = &self.active {
            if active.meta.id != meta.id {
                return vec![ReceiverEvent::Ignored(
                    ProtocolViolation::ConcurrentMetadata {
                        active: active.meta.id.clone(),
                        incoming: meta.id,
                    },
                )];
            }
            tracing::info!(
                "Restarting {} from zero after {} bytes",
                meta.id,
                active.received
            );
        }

        // A re-announced identifier is a new transfer, not a duplicate
        self.forget_finalized(&meta.id);

        tracing::info!("Receiving {} ({} bytes)", meta.name, meta.size);
        self.active = Some(ActiveFile {
            meta: meta.clone(),
            chunks: Vec::new(),
            received: 0,
            started: None,
        });
        vec![ReceiverEvent::FileStarted(meta)]
    }

    fn on_data(&mut self, chunk: Bytes) -> Vec<ReceiverEvent> {
        let max_file_size = self.max_file_size;
        let Some(active) = self.active.as_mut() else {
            return vec![ReceiverEvent::Ignored(
                ProtocolViolation::DataWithoutActiveFile { len: chunk.len() },
            )];
        };

        let received = active.received + chunk.len() as u64;
        if received > max_file_size {
            let name = active.meta.name.clone();
            self.active = None;
            return vec![ReceiverEvent::Ignored(ProtocolViolation::FileRejected(
                format!("{} exceeded {} bytes while receiving", name, max_file_size),
            ))];
        }

        let started = *active.started.get_or_insert_with(Instant::now);
        active.received = received;
        active.chunks.push(chunk);
        tracing::debug!(
            "{}: {}/{} bytes",
            active.meta.id,
            active.received,
            active.meta.size
        );

        vec![ReceiverEvent::Progress(TransferProgress {
            file_id: active.meta.id.clone(),
            file_name: active.meta.name.clone(),
            bytes_done: active.received,
            total_bytes: active.meta.size,
            percent: progress_percent(active.received, active.meta.size),
            bytes_per_sec: average_speed(active.received, started),
        })]
    }

    fn on_file_end(&mut self, id: String) -> Vec<ReceiverEvent> {
        let matches_active = self.active.as_ref().is_some_and(|a| a.meta.id == id);
        if !matches_active {
            let violation = if self.finalized.contains(&id) {
                ProtocolViolation::DuplicateFileEnd(id)
            } else if let Some(active) = &self.active {
                ProtocolViolation::MismatchedFileEnd {
                    active: active.meta.id.clone(),
                    got: id,
                }
            } else {
                ProtocolViolation::UnknownFileEnd(id)
            };
            return vec![ReceiverEvent::Ignored(violation)];
        }

        let Some(active) = self.active.take() else {
            return Vec::new();
        };

        if active.received != active.meta.size {
            tracing::warn!(
                "{} declared {} bytes but {} arrived",
                active.meta.name,
                active.meta.size,
                active.received
            );
        }

        let mut data = BytesMut::with_capacity(active.received as usize);
        for chunk in &active.chunks {
            data.extend_from_slice(chunk);
        }
        tracing::info!("Received {} ({} bytes)", active.meta.name, data.len());

        self.remember_finalized(active.meta.id.clone());
        let mut events = vec![ReceiverEvent::FileCompleted(ReceivedFile {
            id: active.meta.id,
            name: active.meta.name,
            file_type: active.meta.file_type,
            data: data.freeze(),
        })];

        if let Some(batch) = self.batch.as_mut() {
            batch.files_done += 1;
            batch.bytes_done += active.received;
            events.push(ReceiverEvent::BatchProgress {
                id: batch.id.clone(),
                files_done: batch.files_done,
                total_files: batch.total_files,
                bytes_done: batch.bytes_done,
                total_bytes: batch.total_bytes,
            });
            if batch.files_done >= batch.total_files {
                events.push(ReceiverEvent::BatchCompleted {
                    id: batch.id.clone(),
                });
                self.batch = None;
            }
        }
        events
    }

    fn remember_finalized(&mut self, id: String) {
        if !self.finalized.insert(id.clone()) {
            return;
        }
        self.finalized_order.push_back(id);
        if self.finalized_order.len() > FINALIZED_HISTORY {
            if let Some(oldest) = self.finalized_order.pop_front() {
                self.finalized.remove(&oldest);
            }
        }
    }

    fn forget_finalized(&mut self, id: &str) {
        if self.finalized.remove(id) {
            self.finalized_order.retain(|known| known != id);
        }
    }

    /// Drop the partial buffer after the channel is lost. Returns the file
    /// that was in flight; no artifact is produced for it.
    pub fn abort(&mut self) -> Option<FileMetadata> {
        self.batch = None;
        let active = self.active.take()?;
        tracing::info!(
            "Discarding {} after {} of {} bytes",
            active.meta.name,
            active.received,
            active.meta.size
        );
        Some(active.meta)
    }
}
