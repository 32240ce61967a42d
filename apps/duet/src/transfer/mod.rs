//! File transfer bookkeeping.
//!
//! The sender offers, the receiver accepts or rejects, the sender streams
//! sequence-tagged chunks over the unordered file channel and re-emits
//! coarse progress so the receiver shows what was actually sent. A receiver
//! completes only once it holds every distinct chunk.

mod capacity;
mod stream;

use std::collections::HashMap;

use bytes::Bytes;
use duet_proto::chunk::{self, ChunkAssembler, ChunkError, ChunkFrame, Ingest};
use duet_proto::FileMetadata;
use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportError;

pub use capacity::wait_for_capacity;
pub use stream::{StreamJob, StreamReport, stream_file};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unknown transfer {0}")]
    Unknown(String),
    #[error("transfer {id} is {status:?}")]
    InvalidState { id: String, status: TransferStatus },
    #[error("transfer id {0} is not a uuid")]
    InvalidId(String),
    #[error("offer for {0} announces an impossible chunk count")]
    InconsistentOffer(String),
    #[error("file channel closed")]
    ChannelClosed,
    #[error("file channel send buffer did not drain")]
    Stalled,
    #[error("failed to encode file frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub metadata: FileMetadata,
    pub direction: Direction,
    pub status: TransferStatus,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    Progress { id: String, progress: u8 },
    Duplicate,
    Completed(ReceivedFile),
    /// Chunk for a transfer that is not being received.
    Ignored,
}

/// Decides when the sender re-emits progress: every 10% below 90%, every
/// percent after that, and always at 100%.
#[derive(Debug, Default)]
pub struct ProgressCadence {
    last: u8,
}

impl ProgressCadence {
    pub fn observe(&mut self, sent: u32, total: u32) -> Option<u8> {
        let percent = percent(sent, total);
        let step = if percent < 90 { 10 } else { 1 };
        let bucket = percent - percent % step;
        if bucket > self.last {
            self.last = bucket;
            Some(bucket)
        } else {
            None
        }
    }
}

fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    (u64::from(done.min(total)) * 100 / u64::from(total)) as u8
}

fn wire_id(id: &str) -> Result<u128, TransferError> {
    Uuid::parse_str(id)
        .map(|uuid| uuid.as_u128())
        .map_err(|_| TransferError::InvalidId(id.to_string()))
}

struct Outgoing {
    metadata: FileMetadata,
    payload: Bytes,
    status: TransferStatus,
    progress: u8,
}

struct Incoming {
    metadata: FileMetadata,
    wire_id: u128,
    assembler: ChunkAssembler,
    status: TransferStatus,
    progress: u8,
}

impl Incoming {
    fn new(metadata: FileMetadata, wire_id: u128) -> Self {
        Self {
            assembler: ChunkAssembler::new(wire_id, metadata.total_chunks),
            metadata,
            wire_id,
            status: TransferStatus::Pending,
            progress: 0,
        }
    }
}

pub struct TransferBook {
    chunk_bytes: usize,
    outgoing: HashMap<String, Outgoing>,
    incoming: HashMap<String, Incoming>,
}

impl TransferBook {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes: chunk_bytes.max(1),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Registers a file to send and returns the offer to put on the wire.
    pub fn offer(
        &mut self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        payload: Bytes,
    ) -> Result<FileMetadata, TransferError> {
        let metadata = FileMetadata {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            size: payload.len() as u64,
            mime_type: mime_type.into(),
            total_chunks: chunk::chunk_count(payload.len() as u64, self.chunk_bytes)?,
        };
        tracing::info!(
            target = "duet::transfer",
            id = %metadata.id,
            name = %metadata.name,
            size = metadata.size,
            chunks = metadata.total_chunks,
            "offering file"
        );
        self.outgoing.insert(
            metadata.id.clone(),
            Outgoing {
                metadata: metadata.clone(),
                payload,
                status: TransferStatus::Pending,
                progress: 0,
            },
        );
        Ok(metadata)
    }

    /// The receiver accepted; hands out the work for the streaming task.
    pub fn on_accept(&mut self, id: &str) -> Result<StreamJob, TransferError> {
        let transfer = self
            .outgoing
            .get_mut(id)
            .ok_or_else(|| TransferError::Unknown(id.to_string()))?;
        if transfer.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                status: transfer.status,
            });
        }
        transfer.status = TransferStatus::Transferring;
        Ok(StreamJob {
            id: id.to_string(),
            wire_id: wire_id(id)?,
            payload: transfer.payload.clone(),
            chunk_bytes: self.chunk_bytes,
        })
    }

    pub fn on_reject(&mut self, id: &str) -> Result<TransferSnapshot, TransferError> {
        let transfer = self
            .outgoing
            .get_mut(id)
            .ok_or_else(|| TransferError::Unknown(id.to_string()))?;
        if transfer.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                status: transfer.status,
            });
        }
        transfer.status = TransferStatus::Rejected;
        Ok(self.snapshot_outgoing(id))
    }

    pub fn on_sent_progress(&mut self, id: &str, progress: u8) -> Option<TransferSnapshot> {
        let transfer = self.outgoing.get_mut(id)?;
        if transfer.status != TransferStatus::Transferring {
            return None;
        }
        transfer.progress = progress.min(100);
        Some(self.snapshot_outgoing(id))
    }

    pub fn on_sent(&mut self, id: &str) -> Option<TransferSnapshot> {
        let transfer = self.outgoing.get_mut(id)?;
        transfer.status = TransferStatus::Completed;
        transfer.progress = 100;
        Some(self.snapshot_outgoing(id))
    }

    pub fn on_send_failed(&mut self, id: &str) -> Option<TransferSnapshot> {
        let transfer = self.outgoing.get_mut(id)?;
        if transfer.status.is_terminal() {
            return None;
        }
        transfer.status = TransferStatus::Failed;
        Some(self.snapshot_outgoing(id))
    }

    /// Re-offers a failed or rejected outgoing transfer under the same id.
    pub fn retry(&mut self, id: &str) -> Result<FileMetadata, TransferError> {
        let transfer = self
            .outgoing
            .get_mut(id)
            .ok_or_else(|| TransferError::Unknown(id.to_string()))?;
        if !matches!(
            transfer.status,
            TransferStatus::Failed | TransferStatus::Rejected
        ) {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                status: transfer.status,
            });
        }
        transfer.status = TransferStatus::Pending;
        transfer.progress = 0;
        Ok(transfer.metadata.clone())
    }

    /// Registers an offer from the remote. A repeated offer for a known id
    /// (a retry) starts that transfer over.
    pub fn incoming_offer(&mut self, metadata: FileMetadata) -> Result<(), TransferError> {
        let wire_id = wire_id(&metadata.id)?;
        let empty = metadata.size == 0;
        let consistent = (metadata.total_chunks == 0) == empty
            && u64::from(metadata.total_chunks) <= metadata.size.max(1);
        if !consistent {
            return Err(TransferError::InconsistentOffer(metadata.id));
        }
        tracing::info!(
            target = "duet::transfer",
            id = %metadata.id,
            name = %metadata.name,
            size = metadata.size,
            "file offered"
        );
        self.incoming
            .insert(metadata.id.clone(), Incoming::new(metadata, wire_id));
        Ok(())
    }

    /// Accepts a pending offer. An empty file completes on the spot.
    pub fn accept(&mut self, id: &str) -> Result<Option<ReceivedFile>, TransferError> {
        let transfer = self
            .incoming
            .get_mut(id)
            .ok_or_else(|| TransferError::Unknown(id.to_string()))?;
        if transfer.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                status: transfer.status,
            });
        }
        if transfer.metadata.total_chunks == 0 {
            transfer.status = TransferStatus::Completed;
            transfer.progress = 100;
            return Ok(Some(ReceivedFile {
                metadata: transfer.metadata.clone(),
                data: Bytes::new(),
            }));
        }
        transfer.status = TransferStatus::Transferring;
        Ok(None)
    }

    pub fn reject(&mut self, id: &str) -> Result<TransferSnapshot, TransferError> {
        let transfer = self
            .incoming
            .get_mut(id)
            .ok_or_else(|| TransferError::Unknown(id.to_string()))?;
        if transfer.status != TransferStatus::Pending {
            return Err(TransferError::InvalidState {
                id: id.to_string(),
                status: transfer.status,
            });
        }
        transfer.status = TransferStatus::Rejected;
        Ok(self.snapshot_incoming(id))
    }

    pub fn on_chunk(&mut self, frame: ChunkFrame) -> Result<ChunkOutcome, TransferError> {
        let Some((id, transfer)) = self
            .incoming
            .iter_mut()
            .find(|(_, t)| t.wire_id == frame.transfer)
        else {
            return Ok(ChunkOutcome::Ignored);
        };
        if transfer.status != TransferStatus::Transferring {
            return Ok(ChunkOutcome::Ignored);
        }
        match transfer.assembler.ingest(frame)? {
            Ingest::Duplicate => Ok(ChunkOutcome::Duplicate),
            Ingest::Stored => {
                let local = percent(transfer.assembler.distinct(), transfer.assembler.total());
                transfer.progress = transfer.progress.max(local.min(99));
                Ok(ChunkOutcome::Progress {
                    id: id.clone(),
                    progress: transfer.progress,
                })
            }
            Ingest::Complete => {
                let data = transfer.assembler.assemble()?;
                transfer.status = TransferStatus::Completed;
                transfer.progress = 100;
                // Chunks are no longer needed once assembled.
                transfer.assembler = ChunkAssembler::new(transfer.wire_id, 0);
                tracing::info!(target = "duet::transfer", id = %id, bytes = data.len(), "file received");
                Ok(ChunkOutcome::Completed(ReceivedFile {
                    metadata: transfer.metadata.clone(),
                    data,
                }))
            }
        }
    }

    /// Progress reported by the sender. Capped below 100 until the last
    /// distinct chunk is actually here.
    pub fn on_remote_progress(&mut self, id: &str, progress: u8) -> Option<TransferSnapshot> {
        let transfer = self.incoming.get_mut(id)?;
        if transfer.status != TransferStatus::Transferring {
            return None;
        }
        transfer.progress = transfer.progress.max(progress.min(99));
        Some(self.snapshot_incoming(id))
    }

    /// Fails everything in flight, e.g. when the connection is torn down.
    pub fn fail_active(&mut self) -> Vec<TransferSnapshot> {
        let outgoing: Vec<String> = self
            .outgoing
            .iter()
            .filter(|(_, t)| t.status == TransferStatus::Transferring)
            .map(|(id, _)| id.clone())
            .collect();
        let incoming: Vec<String> = self
            .incoming
            .iter()
            .filter(|(_, t)| t.status == TransferStatus::Transferring)
            .map(|(id, _)| id.clone())
            .collect();
        let mut failed = Vec::new();
        for id in outgoing {
            if let Some(t) = self.outgoing.get_mut(&id) {
                t.status = TransferStatus::Failed;
            }
            failed.push(self.snapshot_outgoing(&id));
        }
        for id in incoming {
            if let Some(t) = self.incoming.get_mut(&id) {
                t.status = TransferStatus::Failed;
            }
            failed.push(self.snapshot_incoming(&id));
        }
        failed
    }

    pub fn get(&self, id: &str) -> Option<TransferSnapshot> {
        if self.outgoing.contains_key(id) {
            Some(self.snapshot_outgoing(id))
        } else if self.incoming.contains_key(id) {
            Some(self.snapshot_incoming(id))
        } else {
            None
        }
    }

    pub fn list(&self) -> Vec<TransferSnapshot> {
        self.outgoing
            .keys()
            .map(|id| self.snapshot_outgoing(id))
            .chain(self.incoming.keys().map(|id| self.snapshot_incoming(id)))
            .collect()
    }

    fn snapshot_outgoing(&self, id: &str) -> TransferSnapshot {
        let t = &self.outgoing[id];
        TransferSnapshot {
            metadata: t.metadata.clone(),
            direction: Direction::Outgoing,
            status: t.status,
            progress: t.progress,
        }
    }

    fn snapshot_incoming(&self, id: &str) -> TransferSnapshot {
        let t = &self.incoming[id];
        TransferSnapshot {
            metadata: t.metadata.clone(),
            direction: Direction::Incoming,
            status: t.status,
            progress: t.progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>())
    }

    /// Sender and receiver books wired through their offer.
    fn offered(len: usize, chunk_bytes: usize) -> (TransferBook, TransferBook, FileMetadata) {
        let mut sender = TransferBook::new(chunk_bytes);
        let mut receiver = TransferBook::new(chunk_bytes);
        let metadata = sender
            .offer("notes.txt", "text/plain", payload(len))
            .expect("offer");
        receiver.incoming_offer(metadata.clone()).expect("incoming");
        (sender, receiver, metadata)
    }

    #[test_timeout::timeout]
    fn cadence_is_coarse_then_fine() {
        let mut cadence = ProgressCadence::default();
        let emitted: Vec<u8> = (1..=200).filter_map(|sent| cadence.observe(sent, 200)).collect();
        let mut expected: Vec<u8> = (1..9).map(|step| step * 10).collect();
        expected.extend(90..=100);
        assert_eq!(emitted, expected);
    }

    #[test_timeout::timeout]
    fn cadence_always_reaches_hundred() {
        let mut cadence = ProgressCadence::default();
        assert_eq!(cadence.observe(1, 1), Some(100));
        let mut empty = ProgressCadence::default();
        assert_eq!(empty.observe(0, 0), Some(100));
    }

    #[test_timeout::timeout]
    fn out_of_order_chunks_reassemble_identically() {
        let (mut sender, mut receiver, metadata) = offered(10_000, 1024);
        receiver.accept(&metadata.id).expect("accept");
        let job = sender.on_accept(&metadata.id).expect("job");
        let mut frames: Vec<ChunkFrame> = chunk::split(job.wire_id, &job.payload, job.chunk_bytes)
            .expect("split")
            .collect();
        frames.reverse();
        let last = frames.pop().expect("frame");

        for frame in frames {
            assert!(matches!(
                receiver.on_chunk(frame).expect("chunk"),
                ChunkOutcome::Progress { .. }
            ));
        }
        let snapshot = receiver.get(&metadata.id).expect("known");
        assert!(snapshot.progress <= 99);

        match receiver.on_chunk(last).expect("chunk") {
            ChunkOutcome::Completed(file) => assert_eq!(file.data, payload(10_000)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            receiver.get(&metadata.id).map(|s| s.status),
            Some(TransferStatus::Completed)
        );
    }

    #[test_timeout::timeout]
    fn duplicate_chunk_does_not_complete_transfer() {
        let (mut sender, mut receiver, metadata) = offered(3000, 1024);
        receiver.accept(&metadata.id).expect("accept");
        let job = sender.on_accept(&metadata.id).expect("job");
        let frames: Vec<ChunkFrame> = chunk::split(job.wire_id, &job.payload, job.chunk_bytes)
            .expect("split")
            .collect();
        receiver.on_chunk(frames[0].clone()).expect("first");
        receiver.on_chunk(frames[1].clone()).expect("second");
        assert_eq!(
            receiver.on_chunk(frames[1].clone()).expect("dup"),
            ChunkOutcome::Duplicate
        );
        assert_eq!(
            receiver.get(&metadata.id).map(|s| s.status),
            Some(TransferStatus::Transferring)
        );
    }

    #[test_timeout::timeout]
    fn empty_file_completes_on_accept() {
        let (mut sender, mut receiver, metadata) = offered(0, 1024);
        assert_eq!(metadata.total_chunks, 0);
        let received = receiver.accept(&metadata.id).expect("accept").expect("complete");
        assert!(received.data.is_empty());
        let job = sender.on_accept(&metadata.id).expect("job");
        assert!(job.payload.is_empty());
    }

    #[test_timeout::timeout]
    fn reject_marks_both_sides_rejected() {
        let (mut sender, mut receiver, metadata) = offered(10, 1024);
        assert_eq!(
            receiver.reject(&metadata.id).expect("reject").status,
            TransferStatus::Rejected
        );
        assert_eq!(
            sender.on_reject(&metadata.id).expect("rejected").status,
            TransferStatus::Rejected
        );
        assert!(sender.on_accept(&metadata.id).is_err());
    }

    #[test_timeout::timeout]
    fn retry_reoffers_under_same_id() {
        let (mut sender, mut receiver, metadata) = offered(2048, 1024);
        receiver.accept(&metadata.id).expect("accept");
        sender.on_accept(&metadata.id).expect("job");
        assert!(sender.retry(&metadata.id).is_err());

        sender.on_send_failed(&metadata.id);
        let again = sender.retry(&metadata.id).expect("retry");
        assert_eq!(again, metadata);
        receiver.incoming_offer(again).expect("re-offer");
        assert_eq!(
            receiver.get(&metadata.id).map(|s| s.status),
            Some(TransferStatus::Pending)
        );
    }

    #[test_timeout::timeout]
    fn remote_progress_never_claims_completion() {
        let (_sender, mut receiver, metadata) = offered(4096, 1024);
        receiver.accept(&metadata.id).expect("accept");
        let snapshot = receiver.on_remote_progress(&metadata.id, 100).expect("progress");
        assert_eq!(snapshot.progress, 99);
        assert_eq!(snapshot.status, TransferStatus::Transferring);
    }

    #[test_timeout::timeout]
    fn chunks_before_accept_are_ignored() {
        let (_sender, mut receiver, metadata) = offered(10, 1024);
        let wire = wire_id(&metadata.id).expect("uuid");
        let frame = ChunkFrame {
            transfer: wire,
            seq: 0,
            total: 1,
            payload: Bytes::from_static(b"0123456789"),
        };
        assert_eq!(receiver.on_chunk(frame).expect("chunk"), ChunkOutcome::Ignored);
    }

    #[test_timeout::timeout]
    fn inconsistent_offer_is_refused() {
        let mut receiver = TransferBook::new(1024);
        let metadata = FileMetadata {
            id: Uuid::new_v4().to_string(),
            name: "x".into(),
            size: 10,
            mime_type: "application/octet-stream".into(),
            total_chunks: 0,
        };
        assert!(matches!(
            receiver.incoming_offer(metadata),
            Err(TransferError::InconsistentOffer(_))
        ));
    }

    #[test_timeout::timeout]
    fn teardown_fails_transfers_in_flight() {
        let (mut sender, mut receiver, metadata) = offered(4096, 1024);
        receiver.accept(&metadata.id).expect("accept");
        sender.on_accept(&metadata.id).expect("job");
        assert_eq!(sender.fail_active().len(), 1);
        assert_eq!(receiver.fail_active()[0].status, TransferStatus::Failed);
    }
}
