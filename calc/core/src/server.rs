//! The request dispatcher.
//!
//! One thread owns the task map, the result cache and the endpoint handle.
//! Network events and chunk completions arrive on channels and are handled
//! strictly in arrival order, so no shared state leaks to other threads;
//! workers only ever touch their own chunk closure and the report channel.

use crate::cache::ResultCache;
use crate::chunk;
use crate::config::ServerConfig;
use crate::ops;
use crate::pool::WorkerPool;
use crate::task::{ChunkOutcome, ChunkOutput, ChunkReport, Task, TaskId, TaskState};
use conduit::{NetResult, ServerEvent, TcpServer};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use hashbrown::HashMap;
use photon::codec::{self, DecodeError};
use photon::fingerprint;
use photon::logging::{self, Logger};
use photon::request::{ErrorCode, Request, RequestKind};
use photon::settings::ConnectionSettings;
use std::net::SocketAddr;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Remote stop switch for a dispatcher running on another thread.
#[derive(Clone)]
pub struct Stopper(Sender<()>);

impl Stopper {
    pub fn stop(&self) {
        let _ = self.0.send(());
    }
}

/// How a task's input dimension was cut into chunks.
enum TaskPlan {
    /// Index ranges into the submitted sequence.
    Slices(Vec<Range<usize>>),
    /// Inclusive numeric sub-ranges.
    Spans(Vec<(i32, i32)>),
}

impl TaskPlan {
    fn len(&self) -> usize {
        match self {
            TaskPlan::Slices(ranges) => ranges.len(),
            TaskPlan::Spans(spans) => spans.len(),
        }
    }
}

pub struct ComputeServer {
    endpoint: TcpServer,
    net_events: Receiver<ServerEvent>,
    chunk_tx: Sender<ChunkReport>,
    chunk_rx: Receiver<ChunkReport>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,

    pool: WorkerPool,
    cache: ResultCache,
    tasks: HashMap<SocketAddr, Task>,
    next_task_id: TaskId,

    max_chunk_count: i32,
    min_chunk_size: i32,
    log: Logger,
}

impl ComputeServer {
    pub fn new(config: &ServerConfig, log: Logger) -> ComputeServer {
        let (endpoint, net_events) =
            TcpServer::new(config.server_options(), log.new(logging::o!("unit" => "net")));
        let (chunk_tx, chunk_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let pool = if config.tasks.workers == 0 {
            WorkerPool::with_host_size(&log)
        } else {
            WorkerPool::new(config.tasks.workers, &log)
        };

        ComputeServer {
            endpoint,
            net_events,
            chunk_tx,
            chunk_rx,
            stop_tx,
            stop_rx,
            pool,
            cache: ResultCache::new(config.cache.max_cost_bytes),
            tasks: HashMap::new(),
            next_task_id: 0,
            max_chunk_count: config.tasks.max_chunk_count,
            min_chunk_size: config.tasks.min_chunk_size,
            log,
        }
    }

    /// Binds and starts listening; fails synchronously like the endpoint.
    pub fn open(&mut self, settings: &ConnectionSettings) -> NetResult<()> {
        self.endpoint.open(settings)
    }

    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Handle that makes `run()` return; usable from any thread.
    pub fn stopper(&self) -> Stopper {
        Stopper(self.stop_tx.clone())
    }

    /// Shared executed-jobs counter of the worker pool, for test probes.
    pub fn worker_probe(&self) -> Arc<AtomicUsize> {
        self.pool.executed_probe()
    }

    /// Processes network events and chunk completions until stopped.
    pub fn run(&mut self) {
        let net_events = self.net_events.clone();
        let chunk_rx = self.chunk_rx.clone();
        let stop_rx = self.stop_rx.clone();

        loop {
            select! {
                recv(net_events) -> event => match event {
                    Ok(event) => self.handle_net_event(event),
                    Err(_) => break,
                },
                recv(chunk_rx) -> report => {
                    if let Ok(report) = report {
                        self.handle_chunk_report(report);
                    }
                }
                recv(stop_rx) -> _ => break,
            }
        }

        self.endpoint.close();
    }

    fn handle_net_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Message { peer, payload } => self.handle_frame(peer, payload),
            ServerEvent::ClientDisconnected(peer) => self.handle_disconnect(peer),
            // The endpoint already logs connects and authorizations.
            _ => {}
        }
    }

    /// A client went away: cancel its task as if a cancel frame arrived,
    /// but send no ack into the void.
    fn handle_disconnect(&mut self, peer: SocketAddr) {
        if let Some(task) = self.tasks.get_mut(&peer) {
            logging::info!(self.log, "owner disconnected, cancelling task";
                           "kind" => %task.kind, "peer" => %peer);
            task.begin_cancel(true);
        }
    }

    fn handle_frame(&mut self, peer: SocketAddr, payload: Vec<u8>) {
        let kind = match codec::peek_kind(&payload) {
            Ok(kind) => kind,
            Err(DecodeError::UnknownKind(raw)) => {
                logging::error!(self.log, "received message with invalid request type";
                                "peer" => %peer, "type" => raw);
                self.send_error(peer, ErrorCode::InvalidRequestType);
                return;
            }
            Err(_) => {
                self.on_corrupted(peer, &payload);
                return;
            }
        };

        if kind == RequestKind::CancelTask {
            if codec::decode(&payload).is_err() {
                self.on_corrupted(peer, &payload);
                return;
            }
            if self.tasks.contains_key(&peer) {
                self.cancel_task(peer);
            } else {
                logging::error!(self.log, "cancel with no running task";
                                "peer" => %peer,
                                "detail" => ErrorCode::NotRunningAnyTask.description());
                // The client awaits an answer either way.
                self.send_request(peer, &Request::CancelTask);
            }
            return;
        }

        if !kind.is_task() {
            // Progress and invalid frames are server-to-client only.
            logging::error!(self.log, "received message with invalid request type";
                            "peer" => %peer, "kind" => %kind);
            self.send_error(peer, ErrorCode::InvalidRequestType);
            return;
        }

        // Byte-identical submissions are answered from the cache without
        // touching the worker pool.
        let fingerprint = fingerprint::fnv1a64(&payload);
        let cached = self.cache.lookup(fingerprint).map(<[u8]>::to_vec);
        if let Some(result) = cached {
            logging::info!(self.log, "fetched cached result";
                           "kind" => %kind, "peer" => %peer);
            self.send_payload(peer, result);
            return;
        }

        let request = match codec::decode(&payload) {
            Ok(request) => request,
            Err(_) => {
                self.on_corrupted(peer, &payload);
                return;
            }
        };

        if self.tasks.contains_key(&peer) {
            logging::error!(self.log, "task request while already running task"; "peer" => %peer);
            self.send_error(peer, ErrorCode::AlreadyRunningTask);
            return;
        }

        self.submit_task(peer, fingerprint, request);
    }

    fn submit_task(&mut self, peer: SocketAddr, fingerprint: u64, request: Request) {
        let plan = match &request {
            Request::SortArray { numbers } => TaskPlan::Slices(chunk::split_slice(
                numbers.len(),
                self.max_chunk_count,
                self.min_chunk_size,
            )),
            Request::FindPrimes { x_from, x_to, .. } => TaskPlan::Spans(chunk::split_range(
                *x_from,
                *x_to,
                self.max_chunk_count,
                self.min_chunk_size,
            )),
            Request::CalcFunction { x_from, x_to, .. } => TaskPlan::Spans(chunk::split_range(
                *x_from,
                *x_to,
                self.max_chunk_count,
                self.min_chunk_size,
            )),
            _ => return,
        };

        let total = plan.len();
        let id = self.next_task_id;
        self.next_task_id += 1;

        logging::info!(self.log, "started task";
                       "kind" => %request.kind(), "peer" => %peer, "chunks" => total);
        self.send_request(
            peer,
            &Request::ProgressRange {
                minimum: 0,
                maximum: total as i32,
            },
        );
        self.send_request(peer, &Request::ProgressValue { value: 0 });

        let mut task = Task::new(id, peer, fingerprint, request, total);

        // An empty plan is a completed no-op: the input already is the
        // result (empty array, empty range).
        if total == 0 {
            task.state = TaskState::Finished;
            self.finish_success(task);
            return;
        }

        self.dispatch_chunks(&task, plan);
        self.tasks.insert(peer, task);
    }

    fn dispatch_chunks(&self, task: &Task, plan: TaskPlan) {
        match (&task.request, plan) {
            (Request::SortArray { numbers }, TaskPlan::Slices(ranges)) => {
                for (index, range) in ranges.into_iter().enumerate() {
                    let slice = numbers[range].to_vec();
                    self.spawn_chunk(task, index, move || {
                        ChunkOutput::Numbers(ops::sort_chunk(slice))
                    });
                }
            }
            (Request::FindPrimes { .. }, TaskPlan::Spans(spans)) => {
                for (index, (lo, hi)) in spans.into_iter().enumerate() {
                    self.spawn_chunk(task, index, move || {
                        ChunkOutput::Numbers(ops::find_primes(lo, hi))
                    });
                }
            }
            (
                Request::CalcFunction {
                    equation,
                    x_from,
                    x_step,
                    a,
                    b,
                    c,
                    ..
                },
                TaskPlan::Spans(spans),
            ) => {
                let (equation, origin, step) = (*equation, *x_from, *x_step);
                let (a, b, c) = (*a, *b, *c);
                for (index, (lo, hi)) in spans.into_iter().enumerate() {
                    self.spawn_chunk(task, index, move || {
                        ChunkOutput::Points(ops::tabulate_span(
                            equation, origin, step, lo, hi, a, b, c,
                        ))
                    });
                }
            }
            _ => {}
        }
    }

    fn spawn_chunk<F>(&self, task: &Task, index: usize, compute: F)
    where
        F: FnOnce() -> ChunkOutput + Send + 'static,
    {
        let cancel: Arc<AtomicBool> = Arc::clone(&task.cancel);
        let reports = self.chunk_tx.clone();
        let task_id = task.id;
        let owner = task.owner;

        self.pool.submit(Box::new(move || {
            let outcome = if cancel.load(Ordering::SeqCst) {
                ChunkOutcome::Skipped
            } else {
                match panic::catch_unwind(AssertUnwindSafe(compute)) {
                    Ok(output) => ChunkOutcome::Done(output),
                    Err(panic) => ChunkOutcome::Failed(panic_text(panic.as_ref())),
                }
            };
            let _ = reports.send(ChunkReport {
                task: task_id,
                owner,
                index,
                outcome,
            });
        }));
    }

    fn handle_chunk_report(&mut self, report: ChunkReport) {
        let task = match self.tasks.get_mut(&report.owner) {
            // Late completions for a removed or superseded task are dropped.
            Some(task) if task.id == report.task => task,
            _ => return,
        };

        task.settled_chunks += 1;
        let mut progress = None;

        match report.outcome {
            ChunkOutcome::Done(output) => {
                if task.state == TaskState::Running {
                    task.slots[report.index] = Some(output);
                    task.completed_chunks += 1;
                    progress = Some(task.completed_chunks as i32);
                }
            }
            ChunkOutcome::Skipped => {}
            ChunkOutcome::Failed(text) => {
                if task.state == TaskState::Running {
                    logging::error!(self.log, "chunk failed, cancelling task";
                                    "kind" => %task.kind, "peer" => %report.owner, "error" => %text);
                    task.failure = Some(text);
                    task.begin_cancel(false);
                }
            }
        }

        let settled = task.is_settled();
        if let Some(value) = progress {
            self.send_request(report.owner, &Request::ProgressValue { value });
        }
        if settled {
            self.finish_task(report.owner);
        }
    }

    /// Wire-level cancel for the peer's task; the ack goes out once the
    /// last in-flight chunk returns.
    fn cancel_task(&mut self, peer: SocketAddr) {
        if let Some(task) = self.tasks.get_mut(&peer) {
            if task.state == TaskState::Running {
                logging::info!(self.log, "cancelling task"; "kind" => %task.kind, "peer" => %peer);
            }
            task.begin_cancel(false);
        }
    }

    /// All chunks settled: emit the single terminal frame and drop the
    /// task, freeing the owner's slot.
    fn finish_task(&mut self, owner: SocketAddr) {
        let mut task = match self.tasks.remove(&owner) {
            Some(task) => task,
            None => return,
        };

        match task.state {
            TaskState::Cancelling => {
                task.state = TaskState::Finished;
                if let Some(text) = task.failure.take() {
                    logging::info!(self.log, "task failed";
                                   "kind" => %task.kind, "peer" => %owner);
                    if !task.suppress_ack {
                        self.send_request(
                            owner,
                            &Request::Invalid {
                                code: ErrorCode::Unspecified,
                                text,
                            },
                        );
                    }
                } else {
                    logging::info!(self.log, "cancelled task";
                                   "kind" => %task.kind, "peer" => %owner);
                    if !task.suppress_ack {
                        self.send_request(owner, &Request::CancelTask);
                    }
                }
            }
            _ => {
                task.state = TaskState::Finished;
                self.finish_success(task);
            }
        }
    }

    /// Reduces chunk outputs in planner order, caches the encoded result
    /// and sends it to the owner.
    fn finish_success(&mut self, mut task: Task) {
        let outputs: Vec<ChunkOutput> = task
            .slots
            .drain(..)
            .map(|slot| slot.expect("settled task has all outputs"))
            .collect();

        match &mut task.request {
            Request::SortArray { numbers } => {
                let mut merged = Vec::with_capacity(numbers.len());
                for output in outputs {
                    if let ChunkOutput::Numbers(sorted) = output {
                        merged = merge_sorted(merged, sorted);
                    }
                }
                *numbers = merged;
            }
            Request::FindPrimes { primes, .. } => {
                primes.clear();
                for output in outputs {
                    if let ChunkOutput::Numbers(mut found) = output {
                        primes.append(&mut found);
                    }
                }
            }
            Request::CalcFunction { points, .. } => {
                points.clear();
                for output in outputs {
                    if let ChunkOutput::Points(mut tabulated) = output {
                        points.append(&mut tabulated);
                    }
                }
            }
            _ => {}
        }

        let payload = codec::encode(&task.request);
        self.cache
            .insert(task.fingerprint, payload.clone(), payload.len() as u64);
        logging::info!(self.log, "finished task"; "kind" => %task.kind, "peer" => %task.owner);
        self.send_payload(task.owner, payload);
    }

    fn on_corrupted(&mut self, peer: SocketAddr, payload: &[u8]) {
        logging::error!(self.log, "received message with corrupted data";
                        "peer" => %peer, "payload" => hex_prefix(payload));
        self.send_error(peer, ErrorCode::CorruptedData);
    }

    fn send_error(&self, peer: SocketAddr, code: ErrorCode) {
        self.send_request(peer, &Request::invalid(code));
    }

    fn send_request(&self, peer: SocketAddr, request: &Request) {
        self.send_payload(peer, codec::encode(request));
    }

    fn send_payload(&self, peer: SocketAddr, payload: Vec<u8>) {
        if let Err(err) = self.endpoint.send(peer, payload) {
            logging::debug!(self.log, "send failed"; "peer" => %peer, "error" => ?err);
        }
    }
}

/// Merges two ascending runs; folding the chunks in planner order this way
/// is the ordered k-way merge the sort reduction needs.
fn merge_sorted(left: Vec<i32>, right: Vec<i32>) -> Vec<i32> {
    if left.is_empty() {
        return right;
    }
    if right.is_empty() {
        return left;
    }

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left_iter = left.into_iter().peekable();
    let mut right_iter = right.into_iter().peekable();

    loop {
        match (left_iter.peek(), right_iter.peek()) {
            (Some(&l), Some(&r)) => {
                if l <= r {
                    merged.push(left_iter.next().expect("peeked"));
                } else {
                    merged.push(right_iter.next().expect("peeked"));
                }
            }
            (Some(_), None) => {
                merged.extend(left_iter);
                break;
            }
            (None, _) => {
                merged.extend(right_iter);
                break;
            }
        }
    }
    merged
}

fn hex_prefix(payload: &[u8]) -> String {
    const LIMIT: usize = 64;
    let mut rendered: String = payload
        .iter()
        .take(LIMIT)
        .map(|byte| format!("{:02x}", byte))
        .collect();
    if payload.len() > LIMIT {
        rendered.push_str("..");
    }
    rendered
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker failure".to_string()
    }
}
