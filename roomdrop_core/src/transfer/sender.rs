use crate::AppEvent;
use crate::error::TransferError;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use super::channel::ChannelSender;
use super::protocol::{
    BUFFERED_AMOUNT_THRESHOLD, CHUNK_SIZE, ControlMessage, FileMetadata, new_file_id,
};
use super::utils::report_progress;

/// Progress is reported every this many chunks (and on the last one)
const PROGRESS_EVERY_CHUNKS: u64 = 16;

/// Attributes of a file about to be sent
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    pub file_type: String,
}

/// Sender side of the transfer protocol. Methods take `&mut self`, so one
/// `FileSender` never has two files in flight.
pub struct FileSender {
    channel: ChannelSender,
    event_tx: Option<mpsc::Sender<AppEvent>>,
}

impl FileSender {
    pub fn new(channel: ChannelSender, event_tx: Option<mpsc::Sender<AppEvent>>) -> Self {
        Self { channel, event_tx }
    }

    async fn emit(&self, event: AppEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    /// Wait until the channel has drained to the threshold. Called before
    /// every frame so the buffered amount never exceeds threshold + one chunk.
    async fn wait_for_drain(&self) -> Result<(), TransferError> {
        let buffered = self.channel.buffered_amount();
        if buffered > BUFFERED_AMOUNT_THRESHOLD {
            tracing::debug!("Flow control: {} bytes buffered, pausing", buffered);
            self.channel
                .buffered_amount_low(BUFFERED_AMOUNT_THRESHOLD)
                .await?;
        }
        Ok(())
    }

    /// Announce, stream and close one file. Exactly `file.size` bytes are
    /// read from `reader`; a shorter source fails with `SourceTruncated`
    /// and no `fileEnd` is sent.
    pub async fn send_file<R>(
        &mut self,
        mut reader: R,
        file: OutgoingFile,
    ) -> Result<FileMetadata, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let meta = FileMetadata {
            id: new_file_id(),
            name: file.name,
            size: file.size,
            file_type: file.file_type,
        };

        self.wait_for_drain().await?;
        self.channel.send_control(&meta.clone().into())?;
        tracing::info!("Sending {} ({} bytes) as {}", meta.name, meta.size, meta.id);
        self.emit(AppEvent::TransferStarted {
            file_name: meta.name.clone(),
            total_bytes: meta.size,
            is_sending: true,
        })
        .await;

        let mut sent: u64 = 0;
        let mut chunks: u64 = 0;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let start_time = Instant::now();

        while sent < meta.size {
            let len = (meta.size - sent).min(CHUNK_SIZE as u64) as usize;
            match reader.read_exact(&mut buffer[..len]).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::error!("{} ended after {} bytes", meta.name, sent);
                    return Err(TransferError::SourceTruncated {
                        expected: meta.size,
                        actual: sent,
                    });
                }
                Err(e) => return Err(e.into()),
            }

            self.wait_for_drain().await?;
            self.channel
                .send_data(Bytes::copy_from_slice(&buffer[..len]))?;
            sent += len as u64;
            chunks += 1;

            if sent == meta.size || chunks % PROGRESS_EVERY_CHUNKS == 0 {
                if let Some(tx) = &self.event_tx {
                    report_progress(tx, &meta.name, sent, meta.size, start_time, true).await;
                }
            }
        }

        if meta.size == 0 {
            if let Some(tx) = &self.event_tx {
                report_progress(tx, &meta.name, 0, 0, start_time, true).await;
            }
        }

        self.wait_for_drain().await?;
        self.channel.send_control(&ControlMessage::FileEnd {
            id: meta.id.clone(),
        })?;
        tracing::info!("Sent {} ({} bytes)", meta.name, sent);
        self.emit(AppEvent::TransferCompleted(meta.name.clone())).await;

        Ok(meta)
    }

    /// Send a file from disk
    pub async fn send_path(&mut self, path: &Path) -> Result<FileMetadata, TransferError> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let outgoing = OutgoingFile {
            file_type: guess_file_type(path).to_string(),
            name,
            size,
        };
        self.send_file(file, outgoing).await
    }

    /// Send files one after another. A `batchMetadata` announcement precedes
    /// them when there is more than one.
    pub async fn send_batch(&mut self, paths: &[PathBuf]) -> Result<Vec<FileMetadata>, TransferError> {
        let total_files = paths.len() as u64;
        let is_batch = total_files > 1;

        if is_batch {
            let mut total_bytes = 0;
            for path in paths {
                total_bytes += tokio::fs::metadata(path).await?.len();
            }
            self.wait_for_drain().await?;
            self.channel.send_control(&ControlMessage::BatchMetadata {
                id: new_file_id(),
                total_files,
                total_bytes,
            })?;
            self.emit(AppEvent::BatchStarted {
                total_files,
                total_bytes,
                is_sending: true,
            })
            .await;
        }

        let mut sent = Vec::with_capacity(paths.len());
        for path in paths {
            sent.push(self.send_path(path).await?);
            if is_batch {
                self.emit(AppEvent::BatchProgress {
                    files_done: sent.len() as u64,
                    total_files,
                    is_sending: true,
                })
                .await;
            }
        }

        if is_batch {
            self.emit(AppEvent::BatchCompleted { is_sending: true }).await;
        }
        Ok(sent)
    }
}

/// Content type announced in `fileMetadata`, from the file extension
pub fn guess_file_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}
