//! Per-operation transfer bookkeeping: chunk planning, progress and the
//! request/ack/chunk state machine shared by every operation kind

use crate::codec::OperationKind;
use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::MAX_FILE_CHUNK;

/// Split of a payload into full chunks plus an optional final partial one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: usize,
    pub full_chunks: u64,
    /// Zero when `total_size` is a multiple of `chunk_size`
    pub last_chunk: usize,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: usize) -> Self {
        let c = chunk_size.max(1) as u64;
        Self {
            total_size,
            chunk_size: c as usize,
            full_chunks: total_size / c,
            last_chunk: (total_size % c) as usize,
        }
    }

    pub fn for_file(total_size: u64) -> Self {
        Self::new(total_size, MAX_FILE_CHUNK)
    }

    pub fn frame_count(&self) -> u64 {
        self.full_chunks + u64::from(self.last_chunk != 0)
    }

    /// Chunk lengths in send order.
    pub fn chunk_sizes(&self) -> impl Iterator<Item = usize> {
        let full = self.chunk_size;
        let last = self.last_chunk;
        (0..self.full_chunks)
            .map(move |_| full)
            .chain(std::iter::once(last).filter(|&n| n != 0))
    }
}

/// Monotonic byte counter for one chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub total_size: u64,
    pub chunk_size: usize,
    pub bytes_transferred: u64,
}

impl TransferProgress {
    pub fn new(total_size: u64, chunk_size: usize) -> Self {
        Self {
            total_size,
            chunk_size,
            bytes_transferred: 0,
        }
    }

    pub fn record(&mut self, n: usize) -> ProtocolResult<()> {
        let next = self.bytes_transferred + n as u64;
        if next > self.total_size {
            return Err(ProtocolError::malformed(format!(
                "transfer overran declared size {} by {} bytes",
                self.total_size,
                next - self.total_size
            )));
        }
        self.bytes_transferred = next;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.total_size
    }
}

/// Observer for chunked transfers (progress bars, logs).
pub trait ProgressObserver {
    fn started(&mut self, _kind: OperationKind, _name: &str, _total: u64) {}
    fn advanced(&mut self, _progress: &TransferProgress) {}
    fn finished(&mut self, _progress: &TransferProgress) {}
}

pub struct NoopProgress;
impl ProgressObserver for NoopProgress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    SentRequest,
    Accepted,
    Rejected,
    SendingChunks,
    ReceivingChunks,
    AwaitingFinalAck,
    Done,
    Failed,
}

/// State machine for one operation. Illegal transitions are programming
/// errors on our side and surface as `SessionBroken`.
#[derive(Debug, Clone)]
pub struct Transfer {
    kind: OperationKind,
    state: TransferState,
}

impl Transfer {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            state: TransferState::Idle,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    fn allowed(&self, to: TransferState) -> bool {
        use OperationKind::*;
        use TransferState::*;
        match (self.state, to) {
            (_, Failed) => !matches!(self.state, Done | Rejected | Failed),
            (Idle, SentRequest) => true,
            (SentRequest, Accepted | Rejected) => !matches!(self.kind, Logout),
            // logout has no ack
            (SentRequest, Done) => matches!(self.kind, Logout),
            (Accepted, SendingChunks) => matches!(self.kind, Upload),
            (Accepted, ReceivingChunks) => matches!(self.kind, Download | List),
            (Accepted, Done) => matches!(self.kind, Rename | Delete),
            (SendingChunks, AwaitingFinalAck) => true,
            (AwaitingFinalAck, Done) => true,
            (ReceivingChunks, Done) => true,
            _ => false,
        }
    }

    pub fn advance(&mut self, to: TransferState) -> ProtocolResult<()> {
        if !self.allowed(to) {
            return Err(ProtocolError::SessionBroken(format!(
                "{} cannot move from {:?} to {:?}",
                self.kind, self.state, to
            )));
        }
        self.state = to;
        Ok(())
    }

    pub fn fail(&mut self) {
        if self.allowed(TransferState::Failed) {
            self.state = TransferState::Failed;
        }
    }
}
