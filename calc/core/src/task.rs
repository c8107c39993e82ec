//! Server-side task records and the chunk completion messages workers send
//! back to the dispatcher.

use photon::request::{Point, Request, RequestKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type TaskId = u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TaskState {
    Running,
    Cancelling,
    Finished,
}

/// Output of one chunk, typed by what the reduction expects.
#[derive(Debug)]
pub enum ChunkOutput {
    Numbers(Vec<i32>),
    Points(Vec<Point>),
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Done(ChunkOutput),
    /// The worker observed the cancel flag and never ran the kernel.
    Skipped,
    /// The kernel panicked; carries the panic text.
    Failed(String),
}

/// Sent by a worker when its chunk settles, successfully or not.
#[derive(Debug)]
pub struct ChunkReport {
    pub task: TaskId,
    pub owner: SocketAddr,
    pub index: usize,
    pub outcome: ChunkOutcome,
}

/// One active compute per owner. Created on submission, destroyed on the
/// terminal frame (or silently on owner disconnect). The generation id
/// keeps late chunk completions from leaking into a successor task.
pub struct Task {
    pub id: TaskId,
    pub owner: SocketAddr,
    pub kind: RequestKind,
    pub fingerprint: u64,
    pub state: TaskState,
    pub cancel: Arc<AtomicBool>,
    /// Owner disconnected: finish silently, no ack frame.
    pub suppress_ack: bool,
    pub total_chunks: usize,
    /// Chunks that reported back, whatever the outcome.
    pub settled_chunks: usize,
    /// Chunks that produced output; drives progress frames.
    pub completed_chunks: usize,
    /// Outputs by chunk index, so reductions keep planner order.
    pub slots: Vec<Option<ChunkOutput>>,
    pub failure: Option<String>,
    /// The decoded submission; outputs are folded into it on completion.
    pub request: Request,
}

impl Task {
    pub fn new(
        id: TaskId,
        owner: SocketAddr,
        fingerprint: u64,
        request: Request,
        total_chunks: usize,
    ) -> Task {
        Task {
            id,
            owner,
            kind: request.kind(),
            fingerprint,
            state: TaskState::Running,
            cancel: Arc::new(AtomicBool::new(false)),
            suppress_ack: false,
            total_chunks,
            settled_chunks: 0,
            completed_chunks: 0,
            slots: (0..total_chunks).map(|_| None).collect(),
            failure: None,
            request,
        }
    }

    /// Flags the workers to stop at their next chunk boundary. Idempotent;
    /// a disconnect-driven cancel suppresses the ack even if a wire cancel
    /// arrived first.
    pub fn begin_cancel(&mut self, suppress_ack: bool) {
        if self.state == TaskState::Running {
            self.state = TaskState::Cancelling;
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.suppress_ack = self.suppress_ack || suppress_ack;
    }

    #[inline]
    pub fn is_settled(&self) -> bool {
        self.settled_chunks == self.total_chunks
    }
}
