use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use duet_proto::FileControl;
use duet_proto::chunk;
use tokio::sync::mpsc;

use super::{ProgressCadence, TransferError, wait_for_capacity};
use crate::transport::DataChannel;

/// One accepted outgoing transfer, ready to stream.
#[derive(Debug, Clone)]
pub struct StreamJob {
    pub id: String,
    pub wire_id: u128,
    pub payload: Bytes,
    pub chunk_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamReport {
    Progress { id: String, progress: u8 },
    Finished { id: String },
    Failed { id: String, reason: String },
}

/// Streams `job` over the file channel, pausing whenever the channel's
/// send buffer would pass `high_water`. Progress frames go out on the same
/// channel so the receiver sees send-side progress.
pub async fn stream_file(
    channel: Arc<dyn DataChannel>,
    job: StreamJob,
    high_water: usize,
    capacity_wait: Duration,
    reports: mpsc::UnboundedSender<StreamReport>,
) {
    let id = job.id.clone();
    let report = match run(channel.as_ref(), &job, high_water, capacity_wait, &reports).await {
        Ok(()) => {
            tracing::info!(target = "duet::transfer", %id, bytes = job.payload.len(), "file sent");
            StreamReport::Finished { id }
        }
        Err(err) => {
            tracing::warn!(target = "duet::transfer", %id, error = %err, "file transfer failed");
            StreamReport::Failed {
                id,
                reason: err.to_string(),
            }
        }
    };
    let _ = reports.send(report);
}

async fn run(
    channel: &dyn DataChannel,
    job: &StreamJob,
    high_water: usize,
    capacity_wait: Duration,
    reports: &mpsc::UnboundedSender<StreamReport>,
) -> Result<(), TransferError> {
    let frames = chunk::split(job.wire_id, &job.payload, job.chunk_bytes)?;
    let total = chunk::chunk_count(job.payload.len() as u64, job.chunk_bytes)?;
    let mut cadence = ProgressCadence::default();
    let mut sent = 0u32;

    for frame in frames {
        let encoded = frame.encode();
        wait_for_capacity(channel, encoded.len(), high_water, capacity_wait).await?;
        channel.send_binary(encoded).await?;
        sent += 1;
        if let Some(progress) = cadence.observe(sent, total) {
            announce(channel, job, progress, reports).await?;
        }
    }
    if total == 0 {
        if let Some(progress) = cadence.observe(0, 0) {
            announce(channel, job, progress, reports).await?;
        }
    }
    Ok(())
}

async fn announce(
    channel: &dyn DataChannel,
    job: &StreamJob,
    progress: u8,
    reports: &mpsc::UnboundedSender<StreamReport>,
) -> Result<(), TransferError> {
    let frame = FileControl::FileProgress {
        id: job.id.clone(),
        progress,
    };
    let text = serde_json::to_string(&frame)?;
    channel.send_text(&text).await?;
    let _ = reports.send(StreamReport::Progress {
        id: job.id.clone(),
        progress,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duet_proto::ChunkFrame;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::transport::{ChannelInstance, ChannelPayload, TransportError};

    #[derive(Default)]
    struct Sink {
        frames: Mutex<Vec<ChannelPayload>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl DataChannel for Sink {
        fn label(&self) -> &str {
            "file"
        }
        fn instance(&self) -> ChannelInstance {
            0
        }
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            self.frames.lock().push(ChannelPayload::Text(text.into()));
            Ok(())
        }
        async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::ChannelClosed);
            }
            self.frames.lock().push(ChannelPayload::Binary(data));
            Ok(())
        }
        async fn buffered_amount(&self) -> usize {
            0
        }
        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(len: usize) -> StreamJob {
        StreamJob {
            id: uuid::Uuid::new_v4().to_string(),
            wire_id: 42,
            payload: Bytes::from(vec![7u8; len]),
            chunk_bytes: 100,
        }
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn streams_every_chunk_then_finishes() {
        let sink = Arc::new(Sink::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream_file(sink.clone(), job(1_000), 1_000, Duration::from_secs(1), tx).await;

        let frames = sink.frames.lock().clone();
        let chunks: Vec<ChunkFrame> = frames
            .iter()
            .filter_map(|p| match p {
                ChannelPayload::Binary(b) => Some(ChunkFrame::decode(b, 100).expect("frame")),
                ChannelPayload::Text(_) => None,
            })
            .collect();
        assert_eq!(chunks.len(), 10);
        assert!(chunks.iter().enumerate().all(|(i, c)| c.seq == i as u32));
        assert!(matches!(frames.last(), Some(ChannelPayload::Text(t)) if t.contains("\"progress\":100")));

        let mut last = None;
        while let Ok(report) = rx.try_recv() {
            last = Some(report);
        }
        assert!(matches!(last, Some(StreamReport::Finished { .. })));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn empty_payload_reports_full_progress() {
        let sink = Arc::new(Sink::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream_file(sink.clone(), job(0), 1_000, Duration::from_secs(1), tx).await;
        assert_eq!(sink.frames.lock().len(), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(StreamReport::Progress { progress: 100, .. })
        ));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn closed_channel_fails_transfer() {
        let sink = Arc::new(Sink::default());
        sink.closed.store(true, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream_file(sink, job(500), 1_000, Duration::from_secs(1), tx).await;
        assert!(matches!(rx.try_recv(), Ok(StreamReport::Failed { .. })));
    }
}
