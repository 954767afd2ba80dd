//! Direct channel framing
//!
//! A byte stream cannot tell control messages from binary data on its own,
//! so every frame carries a 5-byte header: a type tag followed by the
//! payload length (u32, big-endian).
//!
//! Outgoing frames go through an unbounded queue drained by a writer task.
//! `buffered_amount` is the number of payload bytes queued but not yet
//! written; senders use it for flow control.

use super::protocol::ControlMessage;
use crate::error::ChannelError;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Frame tag for structured control messages (UTF-8 JSON)
pub const FRAME_CONTROL: u8 = 0x01;
/// Frame tag for raw file data
pub const FRAME_DATA: u8 = 0x02;
/// Largest accepted frame payload (1MB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 5;

/// One frame read from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(String),
    Data(Bytes),
}

struct Outgoing {
    tag: u8,
    payload: Bytes,
}

/// Sending half of a direct channel. Clones share the same queue.
#[derive(Clone)]
pub struct ChannelSender {
    queue: mpsc::UnboundedSender<Outgoing>,
    buffered: Arc<watch::Sender<usize>>,
    high_water: Arc<AtomicUsize>,
    closed: CancellationToken,
}

/// Receiving half of a direct channel
pub struct ChannelReceiver {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

/// Split `stream` into a framed sender and receiver. The writer task runs
/// until the channel is closed, the stream fails, or every sender is dropped.
pub fn open_channel<S>(stream: S) -> (ChannelSender, ChannelReceiver)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let (buffered, _) = watch::channel(0usize);
    let buffered = Arc::new(buffered);
    let closed = CancellationToken::new();

    tokio::spawn(write_loop(
        write_half,
        queue_rx,
        buffered.clone(),
        closed.clone(),
    ));

    let sender = ChannelSender {
        queue: queue_tx,
        buffered,
        high_water: Arc::new(AtomicUsize::new(0)),
        closed,
    };
    let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
    let receiver = ChannelReceiver {
        reader: BufReader::new(reader),
    };
    (sender, receiver)
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    buffered: Arc<watch::Sender<usize>>,
    closed: CancellationToken,
) {
    loop {
        let out = tokio::select! {
            _ = closed.cancelled() => break,
            next = queue.recv() => match next {
                Some(out) => out,
                None => break,
            },
        };

        let len = out.payload.len();
        let result = tokio::select! {
            _ = closed.cancelled() => break,
            result = write_frame(&mut writer, out.tag, &out.payload) => result,
        };
        buffered.send_modify(|amount| *amount = amount.saturating_sub(len));

        if let Err(e) = result {
            tracing::warn!("Direct channel write failed: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
    closed.cancel();
    buffered.send_replace(0);
    tracing::debug!("Direct channel writer stopped");
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, tag: u8, payload: &[u8]) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0] = tag;
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

impl ChannelSender {
    /// Queue a control message
    pub fn send_control(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        let text = msg
            .encode()
            .map_err(|e| ChannelError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.enqueue(FRAME_CONTROL, Bytes::from(text))
    }

    /// Queue a binary data frame
    pub fn send_data(&self, chunk: Bytes) -> Result<(), ChannelError> {
        self.enqueue(FRAME_DATA, chunk)
    }

    fn enqueue(&self, tag: u8, payload: Bytes) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let len = payload.len();
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }

        let mut total = 0;
        self.buffered.send_modify(|amount| {
            *amount += len;
            total = *amount;
        });
        self.high_water.fetch_max(total, Ordering::SeqCst);

        self.queue.send(Outgoing { tag, payload }).map_err(|_| {
            self.buffered
                .send_modify(|amount| *amount = amount.saturating_sub(len));
            ChannelError::Closed
        })
    }

    /// Payload bytes queued but not yet written to the stream
    pub fn buffered_amount(&self) -> usize {
        *self.buffered.borrow()
    }

    /// Largest `buffered_amount` observed since the channel opened
    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    /// Resolve once `buffered_amount` is at or below `threshold`. Woken by
    /// the writer task; fails if the channel closes first.
    pub async fn buffered_amount_low(&self, threshold: usize) -> Result<(), ChannelError> {
        let mut rx = self.buffered.subscribe();
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChannelError::Closed),
            drained = rx.wait_for(|amount| *amount <= threshold) => {
                // The writer zeroes the count on shutdown, after cancelling
                if drained.is_err() || self.closed.is_cancelled() {
                    return Err(ChannelError::Closed);
                }
                Ok(())
            }
        }
    }

    /// Stop writing and shut the stream down. Unsent frames are dropped.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolve when the sending side has closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl ChannelReceiver {
    /// Read the next frame. `Ok(None)` means the peer closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ChannelError> {
        let mut header = [0u8; HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ChannelError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;

        match header[0] {
            FRAME_CONTROL => String::from_utf8(payload)
                .map(|text| Some(Frame::Control(text)))
                .map_err(|_| ChannelError::InvalidUtf8),
            FRAME_DATA => Ok(Some(Frame::Data(Bytes::from(payload)))),
            other => Err(ChannelError::UnknownFrameType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frames_keep_type_and_order() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (tx, _left_rx) = open_channel(left);
        let (_right_tx, mut rx) = open_channel(right);

        tx.send_control(&ControlMessage::FileEnd { id: "a".to_string() })
            .unwrap();
        tx.send_data(Bytes::from_static(b"\x00\x01binary")).unwrap();
        tx.send_data(Bytes::new()).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Some(Frame::Control(r#"{"type":"fileEnd","id":"a"}"#.to_string()))
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Some(Frame::Data(Bytes::from_static(b"\x00\x01binary")))
        );
        assert_eq!(rx.recv().await.unwrap(), Some(Frame::Data(Bytes::new())));
    }

    #[tokio::test]
    async fn test_close_is_seen_as_end_of_stream() {
        let (left, right) = tokio::io::duplex(1024);
        let (tx, _left_rx) = open_channel(left);
        let (_right_tx, mut rx) = open_channel(right);

        tx.close();
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("peer should observe the close");
        assert_eq!(next.unwrap(), None);
        assert!(matches!(
            tx.send_data(Bytes::from_static(b"late")),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut raw, right) = tokio::io::duplex(1024);
        let (_right_tx, mut rx) = open_channel(right);

        let mut header = vec![FRAME_DATA];
        header.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        raw.write_all(&header).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Err(ChannelError::FrameTooLarge(len)) if len == MAX_FRAME_LEN + 1
        ));
    }

    #[tokio::test]
    async fn test_unknown_frame_type_rejected() {
        let (mut raw, right) = tokio::io::duplex(1024);
        let (_right_tx, mut rx) = open_channel(right);

        raw.write_all(&[0x7f, 0, 0, 0, 1, 0xaa]).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(ChannelError::UnknownFrameType(0x7f))
        ));
    }

    #[tokio::test]
    async fn test_buffered_amount_drains_when_peer_reads() {
        // Small pipe so the writer task stalls until the reader catches up
        let (left, right) = tokio::io::duplex(1024);
        let (tx, _left_rx) = open_channel(left);
        let (_right_tx, mut rx) = open_channel(right);

        for _ in 0..8 {
            tx.send_data(Bytes::from(vec![7u8; 4096])).unwrap();
        }
        assert!(tx.buffered_amount() > 4096);

        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.buffered_amount_low(0).await })
        };

        for _ in 0..8 {
            let frame = rx.recv().await.unwrap().unwrap();
            assert_eq!(frame, Frame::Data(Bytes::from(vec![7u8; 4096])));
        }

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap()
            .unwrap();
        assert_eq!(tx.buffered_amount(), 0);
        assert!(tx.high_water_mark() >= 8 * 4096 - 1024);
    }

    #[tokio::test]
    async fn test_buffered_amount_low_fails_on_close() {
        let (left, _right) = tokio::io::duplex(16);
        let (tx, _rx) = open_channel(left);
        tx.send_data(Bytes::from(vec![0u8; 4096])).unwrap();

        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.buffered_amount_low(0).await })
        };
        tx.close();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ChannelError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_never_reads_as_drained() {
        // Shutdown zeroes the buffered count; waiters must still see the close
        for _ in 0..50 {
            let (left, _right) = tokio::io::duplex(16);
            let (tx, _rx) = open_channel(left);
            tx.send_data(Bytes::from(vec![0u8; 4096])).unwrap();

            let waiters: Vec<_> = (0..4)
                .map(|_| {
                    let tx = tx.clone();
                    tokio::spawn(async move { tx.buffered_amount_low(0).await })
                })
                .collect();
            tokio::task::yield_now().await;
            tx.close();

            for waiter in waiters {
                let result = tokio::time::timeout(Duration::from_secs(2), waiter)
                    .await
                    .unwrap()
                    .unwrap();
                assert!(matches!(result, Err(ChannelError::Closed)));
            }
            // Once closed, even a satisfied threshold reports the close
            assert!(matches!(
                tx.buffered_amount_low(usize::MAX).await,
                Err(ChannelError::Closed)
            ));
        }
    }
}
