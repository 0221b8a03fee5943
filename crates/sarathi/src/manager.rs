//! Worker process lifecycle and the bridge event loop.
//!
//! One task per bridge owns the child process and the [`PendingTable`].
//! Everything that touches either goes through that task:
//!
//! ```text
//! callers ──Command──▶ ┌────────────┐ ──Value──▶ writer task ──▶ stdin
//!                      │ event loop │
//!   stdout reader ───▶ │ (select!)  │ ◀── child.wait()
//!   stderr reader ───▶ └────────────┘
//! ```
//!
//! Reader tasks tag every event with the generation of the worker that
//! produced it, so output from a worker that has already been replaced is
//! discarded instead of being correlated against the new worker's requests.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::breaker::CircuitBreaker;
use crate::bridge::codec::{JsonLineCodec, LogLineCodec, MalformedLine};
use crate::bridge::protocol::{self, RequestId};
use crate::channel::{Correlation, Expiry, PendingRequest, PendingTable, Reply};
use crate::config::BridgeConfig;
use crate::health::WorkerHealth;
use crate::spawner::{SpawnError, WorkerSpawner};

/// How long to keep reading stdout after the worker exits, so replies it
/// flushed right before dying still reach their callers.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

/// Wait after SIGTERM before the worker is killed outright.
const TERM_GRACE: Duration = Duration::from_secs(1);

const COMMAND_BUFFER: usize = 1024;
const EVENT_BUFFER: usize = 256;

enum Command {
    Dispatch {
        id: RequestId,
        payload: Value,
        reply: oneshot::Sender<Reply>,
    },
    Expire(RequestId),
    Shutdown(oneshot::Sender<usize>),
}

#[derive(Debug)]
enum WorkerEvent {
    Line(Result<Value, MalformedLine>),
    Stderr(String),
    StdoutClosed,
    ReadFailed(std::io::Error),
    WriteFailed(std::io::Error),
}

#[derive(Debug, Default)]
struct ManagerStats {
    pid: AtomicU32,
    restarts: AtomicU64,
}

/// Handle to one supervised worker.
///
/// Dropping the handle stops the event loop, which closes the worker's
/// stdin and terminates it.
pub struct WorkerProcessManager {
    name: Arc<str>,
    commands: mpsc::Sender<Command>,
    next_id: AtomicU64,
    health: watch::Receiver<WorkerHealth>,
    stats: Arc<ManagerStats>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkerProcessManager {
    /// Spawn the first worker and start the event loop.
    ///
    /// Fails only if the first worker cannot be created at all. Later spawn
    /// failures are retried by the loop and reported through health.
    /// Must be called from within a tokio runtime.
    pub fn start(
        name: impl Into<Arc<str>>,
        spawner: Arc<dyn WorkerSpawner>,
        config: BridgeConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, SpawnError> {
        let name = name.into();
        let (health_tx, health_rx) = watch::channel(WorkerHealth::Starting);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let stats = Arc::new(ManagerStats::default());

        tracing::info!(bridge = %name, command = %spawner.describe(), "Spawning worker");
        let child = spawner.spawn()?;

        let mut event_loop = EventLoop {
            name: Arc::clone(&name),
            spawner,
            config,
            breaker,
            commands: command_rx,
            events_tx,
            events: events_rx,
            health: health_tx,
            stats: Arc::clone(&stats),
            pending: PendingTable::new(),
            generation: 0,
            short_lived_starts: 0,
        };
        let worker = event_loop.attach(child)?;
        event_loop.set_health(WorkerHealth::Ready);

        let task = tokio::spawn(event_loop.run(worker));

        Ok(Self {
            name,
            commands: command_tx,
            next_id: AtomicU64::new(1),
            health: health_rx,
            stats,
            task: StdMutex::new(Some(task)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue one request for the worker.
    ///
    /// The receiver resolves exactly once. It errors without a value if the
    /// request was expired or the event loop is gone.
    pub async fn dispatch(&self, payload: Value) -> (RequestId, oneshot::Receiver<Reply>) {
        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Dispatch { id, payload, reply })
            .await
            .is_err()
        {
            tracing::debug!(bridge = %self.name, request_id = %id, "Event loop gone, dropping request");
        }
        (id, rx)
    }

    /// Give up on a request (caller timed out). A request already written
    /// keeps its slot until the worker's late reply arrives, so untagged
    /// replies stay in step.
    pub async fn expire(&self, id: RequestId) {
        let _ = self.commands.send(Command::Expire(id)).await;
    }

    /// OS pid of the live worker, if any.
    pub fn pid(&self) -> Option<u32> {
        match self.stats.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn health(&self) -> WorkerHealth {
        *self.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<WorkerHealth> {
        self.health.clone()
    }

    /// Number of replacement workers started after unexpected exits.
    pub fn restarts(&self) -> u64 {
        self.stats.restarts.load(Ordering::Relaxed)
    }

    /// Stop the worker and resolve everything outstanding. Idempotent.
    ///
    /// Returns how many waiting calls were resolved by the stop; zero once
    /// the bridge is already stopped.
    pub async fn shutdown(&self) -> usize {
        let (done_tx, done_rx) = oneshot::channel();
        let mut resolved = 0;
        if self.commands.send(Command::Shutdown(done_tx)).await.is_ok() {
            resolved = done_rx.await.unwrap_or(0);
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(bridge = %self.name, error = %e, "Event loop task failed");
        }
        resolved
    }
}

/// A live worker process.
struct Worker {
    generation: u64,
    child: Child,
    pid: Option<u32>,
    writer: mpsc::UnboundedSender<Value>,
    started_at: Instant,
    stdout_closed: bool,
    /// Survived `min_healthy_uptime`.
    proven: bool,
    replies: u64,
    /// Killed to realign replies; takes no new requests.
    recycling: bool,
}

enum Detach {
    Exited(std::io::Result<std::process::ExitStatus>),
    Shutdown(Option<oneshot::Sender<usize>>),
}

enum Respawn {
    Ready(Worker),
    Shutdown(Option<oneshot::Sender<usize>>),
}

struct EventLoop {
    name: Arc<str>,
    spawner: Arc<dyn WorkerSpawner>,
    config: BridgeConfig,
    breaker: Arc<CircuitBreaker>,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<(u64, WorkerEvent)>,
    events: mpsc::Receiver<(u64, WorkerEvent)>,
    health: watch::Sender<WorkerHealth>,
    stats: Arc<ManagerStats>,
    pending: PendingTable,
    generation: u64,
    short_lived_starts: u32,
}

impl EventLoop {
    async fn run(mut self, first: Worker) {
        let mut worker = Some(first);
        loop {
            match worker.take() {
                Some(mut live) => match self.serve(&mut live).await {
                    Detach::Exited(status) => self.on_exit(live, status).await,
                    Detach::Shutdown(done) => {
                        self.stop(Some(live), done).await;
                        break;
                    }
                },
                None => match self.respawn().await {
                    Respawn::Ready(live) => worker = Some(live),
                    Respawn::Shutdown(done) => {
                        self.stop(None, done).await;
                        break;
                    }
                },
            }
        }
        tracing::debug!(bridge = %self.name, "Event loop exiting");
    }

    fn set_health(&self, health: WorkerHealth) {
        let previous = self.health.send_replace(health);
        if previous != health {
            tracing::debug!(bridge = %self.name, from = %previous, to = %health, "Worker health changed");
        }
    }

    fn degraded(&self) -> bool {
        self.config.degraded_after > 0 && self.short_lived_starts >= self.config.degraded_after
    }

    /// Take the child's pipes and start its I/O tasks.
    fn attach(&mut self, mut child: Child) -> Result<Worker, SpawnError> {
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

        self.generation += 1;
        let generation = self.generation;
        let max = self.config.max_line_bytes;

        let (writer, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(
            FramedWrite::new(stdin, JsonLineCodec::new()),
            writer_rx,
            generation,
            self.events_tx.clone(),
        ));
        tokio::spawn(read_replies(
            FramedRead::new(stdout, JsonLineCodec::with_max_length(max)),
            generation,
            self.events_tx.clone(),
        ));
        tokio::spawn(read_stderr(
            FramedRead::new(stderr, LogLineCodec::new(max)),
            generation,
            self.events_tx.clone(),
        ));

        let pid = child.id();
        self.stats.pid.store(pid.unwrap_or(0), Ordering::Relaxed);
        tracing::info!(bridge = %self.name, ?pid, generation, "Worker started");

        Ok(Worker {
            generation,
            child,
            pid,
            writer,
            started_at: Instant::now(),
            stdout_closed: false,
            proven: false,
            replies: 0,
            recycling: false,
        })
    }

    /// Drive a live worker until it exits or shutdown is requested.
    async fn serve(&mut self, worker: &mut Worker) -> Detach {
        self.flush(worker);
        let proven_at = worker.started_at + self.config.min_healthy_uptime;

        loop {
            let late_reply_due = if worker.recycling {
                None
            } else {
                self.pending.late_reply_deadline(self.config.late_reply_grace)
            };

            tokio::select! {
                biased;

                Some((generation, event)) = self.events.recv() => {
                    if generation == worker.generation {
                        self.on_event(worker, event);
                    }
                }

                status = worker.child.wait() => {
                    return Detach::Exited(status);
                }

                command = self.commands.recv() => match command {
                    Some(Command::Dispatch { id, payload, reply }) => {
                        self.pending.enqueue(id, PendingRequest::new(payload, reply));
                        self.flush(worker);
                    }
                    Some(Command::Expire(id)) => {
                        self.expire(id);
                        if self.pending.out_of_step() && !worker.recycling {
                            self.recycle(worker, "consecutive requests went unanswered");
                        }
                    }
                    Some(Command::Shutdown(done)) => return Detach::Shutdown(Some(done)),
                    None => return Detach::Shutdown(None),
                },

                _ = tokio::time::sleep_until(late_reply_due.unwrap_or(proven_at)),
                    if late_reply_due.is_some() =>
                {
                    self.recycle(worker, "late reply never arrived");
                }

                _ = tokio::time::sleep_until(proven_at), if !worker.proven => {
                    worker.proven = true;
                    if self.short_lived_starts > 0 {
                        tracing::info!(bridge = %self.name, pid = ?worker.pid, "Worker stable again");
                    }
                    self.short_lived_starts = 0;
                    self.set_health(WorkerHealth::Ready);
                }
            }
        }
    }

    /// Write every queued request to the live worker, in enqueue order.
    fn flush(&mut self, worker: &Worker) {
        if worker.recycling {
            return;
        }
        for (id, payload) in self.pending.take_unwritten() {
            let line = if self.config.tag_requests {
                protocol::tag(payload, id)
            } else {
                payload
            };
            tracing::trace!(bridge = %self.name, request_id = %id, "Writing request");
            if worker.writer.send(line).is_err() {
                // Writer already failed; the exit path resolves this request.
                tracing::debug!(bridge = %self.name, request_id = %id, "Writer closed");
            }
        }
    }

    fn expire(&mut self, id: RequestId) {
        match self.pending.expire(id) {
            Expiry::Removed => {
                tracing::debug!(bridge = %self.name, request_id = %id, "Request expired before it was written");
            }
            Expiry::AwaitingReply => {
                tracing::debug!(bridge = %self.name, request_id = %id, "Request expired, holding its slot for the late reply");
            }
            Expiry::Settled => {}
        }
    }

    fn on_event(&mut self, worker: &mut Worker, event: WorkerEvent) {
        match event {
            WorkerEvent::Line(line) => {
                worker.replies += 1;
                self.on_line(line);
            }
            WorkerEvent::Stderr(line) => {
                tracing::info!(target: "sarathi::worker", bridge = %self.name, "{}", line);
                self.breaker.record_signal(&line);
            }
            WorkerEvent::StdoutClosed => {
                worker.stdout_closed = true;
                self.abandon(worker, "stdout closed");
            }
            WorkerEvent::ReadFailed(e) => {
                tracing::warn!(bridge = %self.name, error = %e, "Failed reading worker stdout");
                worker.stdout_closed = true;
                self.abandon(worker, "stdout unreadable");
            }
            WorkerEvent::WriteFailed(e) => {
                tracing::warn!(bridge = %self.name, error = %e, "Failed writing to worker stdin");
                self.abandon(worker, "stdin unwritable");
            }
        }
    }

    fn on_line(&mut self, line: Result<Value, MalformedLine>) {
        match &line {
            // Trip before resolving so the caller's next call already bypasses.
            Ok(value) => {
                if let Some(error) = protocol::reply_error(value) {
                    self.breaker.record_signal(error);
                }
            }
            Err(malformed) => {
                tracing::warn!(bridge = %self.name, error = %malformed, "Malformed reply line");
            }
        }
        match self.pending.on_line(line) {
            Correlation::Tagged(id) | Correlation::Head(id) => {
                tracing::trace!(bridge = %self.name, request_id = %id, "Reply correlated");
            }
            Correlation::Stale(id) => {
                tracing::debug!(bridge = %self.name, request_id = %id, "Discarding late reply");
            }
            Correlation::Unsolicited => {
                tracing::warn!(bridge = %self.name, "Worker stdin closed, request will fail with the worker");
            }
        }
    }

    /// Replace a worker whose untagged replies can no longer be matched to
    /// requests. Requests not yet written wait for the replacement.
    fn recycle(&self, worker: &mut Worker, reason: &str) {
        tracing::warn!(bridge = %self.name, pid = ?worker.pid, reason, "Replies out of step, replacing worker");
        worker.recycling = true;
        self.abandon(worker, reason);
    }

    /// A worker that can no longer be talked to is killed; the exit branch
    /// then handles it like any crash.
    fn abandon(&self, worker: &mut Worker, reason: &str) {
        tracing::debug!(bridge = %self.name, pid = ?worker.pid, reason, "Abandoning worker");
        if let Err(e) = worker.child.start_kill() {
            tracing::debug!(bridge = %self.name, error = %e, "Kill after abandon failed");
        }
    }

    async fn on_exit(&mut self, mut worker: Worker, status: std::io::Result<std::process::ExitStatus>) {
        if !worker.stdout_closed {
            self.drain_exited(&mut worker).await;
        }
        self.stats.pid.store(0, Ordering::Relaxed);

        // Helpers that answer and then exit are restarted, not degraded.
        let uptime = worker.started_at.elapsed();
        if !worker.recycling && uptime < self.config.min_healthy_uptime && worker.replies == 0 {
            self.short_lived_starts = self.short_lived_starts.saturating_add(1);
        } else {
            self.short_lived_starts = 0;
        }

        // Health flips before callers see their fallback.
        self.mark_restarting();
        let failed = self.pending.fail_written(Reply::WorkerExited);
        match status {
            Ok(status) => tracing::warn!(
                bridge = %self.name,
                pid = ?worker.pid,
                %status,
                uptime_ms = uptime.as_millis() as u64,
                replies = worker.replies,
                failed,
                "Worker exited unexpectedly"
            ),
            Err(e) => tracing::warn!(
                bridge = %self.name,
                pid = ?worker.pid,
                error = %e,
                failed,
                "Lost track of worker process"
            ),
        }
        self.reject_backlog_if_degraded();
    }

    fn mark_restarting(&mut self) {
        if !self.degraded() {
            self.set_health(WorkerHealth::Restarting);
            return;
        }
        if *self.health.borrow() != WorkerHealth::Degraded {
            tracing::error!(
                bridge = %self.name,
                short_lived_starts = self.short_lived_starts,
                "Worker keeps failing on start, bridge degraded"
            );
        }
        self.set_health(WorkerHealth::Degraded);
    }

    fn reject_backlog_if_degraded(&mut self) {
        if !self.degraded() {
            return;
        }
        let dropped = self.pending.fail_all(Reply::Unavailable);
        if dropped > 0 {
            tracing::debug!(bridge = %self.name, dropped, "Resolved backlog while degraded");
        }
    }

    /// Process output the worker flushed before exiting.
    async fn drain_exited(&mut self, worker: &mut Worker) {
        let deadline = Instant::now() + EXIT_DRAIN;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some((generation, WorkerEvent::StdoutClosed)))
                    if generation == worker.generation =>
                {
                    break;
                }
                Ok(Some((generation, event))) if generation == worker.generation => {
                    self.on_event(worker, event);
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Wait out the restart delay, holding or rejecting calls meanwhile.
    async fn respawn(&mut self) -> Respawn {
        let mut deadline = Instant::now() + self.config.restart_delay;
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Dispatch { id, payload, reply }) => {
                        if self.degraded() {
                            let _ = reply.send(Reply::Unavailable);
                        } else {
                            self.pending.enqueue(id, PendingRequest::new(payload, reply));
                        }
                    }
                    Some(Command::Expire(id)) => self.expire(id),
                    Some(Command::Shutdown(done)) => return Respawn::Shutdown(Some(done)),
                    None => return Respawn::Shutdown(None),
                },

                // Leftovers from the previous generation. The breaker still
                // hears what the dead worker said.
                Some((_, event)) = self.events.recv() => {
                    if let WorkerEvent::Stderr(line) = event {
                        tracing::info!(target: "sarathi::worker", bridge = %self.name, "{}", line);
                        self.breaker.record_signal(&line);
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    match self.spawner.spawn().and_then(|child| self.attach(child)) {
                        Ok(worker) => {
                            self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                            self.set_health(if self.degraded() {
                                WorkerHealth::Degraded
                            } else {
                                WorkerHealth::Ready
                            });
                            return Respawn::Ready(worker);
                        }
                        Err(e) => {
                            tracing::error!(bridge = %self.name, error = %e, "Failed to respawn worker");
                            self.short_lived_starts = self.short_lived_starts.saturating_add(1);
                            self.mark_restarting();
                            self.reject_backlog_if_degraded();
                            deadline = Instant::now() + self.config.restart_delay;
                        }
                    }
                }
            }
        }
    }

    async fn stop(&mut self, worker: Option<Worker>, done: Option<oneshot::Sender<usize>>) {
        self.set_health(WorkerHealth::Stopped);

        if let Some(Worker {
            mut child,
            pid,
            writer,
            ..
        }) = worker
        {
            // Closing stdin is the polite stop signal.
            drop(writer);
            if tokio::time::timeout(self.config.shutdown_grace, child.wait())
                .await
                .is_err()
            {
                tracing::warn!(bridge = %self.name, ?pid, "Worker ignored stdin close, terminating");
                terminate(pid);
                if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                    tracing::warn!(bridge = %self.name, ?pid, "Worker ignored SIGTERM, killing");
                    if let Err(e) = child.kill().await {
                        tracing::error!(bridge = %self.name, error = %e, "Failed to kill worker");
                    }
                }
            }
        }
        self.stats.pid.store(0, Ordering::Relaxed);

        let failed = self.pending.fail_all(Reply::Stopped);
        tracing::info!(bridge = %self.name, failed, "Worker stopped");
        if let Some(done) = done {
            let _ = done.send(failed);
        }
    }
}

#[cfg(unix)]
fn terminate(pid: Option<u32>) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) {}

async fn write_requests(
    mut writer: FramedWrite<ChildStdin, JsonLineCodec<Value>>,
    mut lines: mpsc::UnboundedReceiver<Value>,
    generation: u64,
    events: mpsc::Sender<(u64, WorkerEvent)>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.send(line).await {
            let _ = events.send((generation, WorkerEvent::WriteFailed(e))).await;
            break;
        }
    }
    tracing::trace!(generation, "Writer task exiting");
}

async fn read_replies(
    mut reader: FramedRead<ChildStdout, JsonLineCodec<Value>>,
    generation: u64,
    events: mpsc::Sender<(u64, WorkerEvent)>,
) {
    loop {
        let event = match reader.next().await {
            Some(Ok(line)) => WorkerEvent::Line(line),
            Some(Err(e)) => WorkerEvent::ReadFailed(e),
            None => WorkerEvent::StdoutClosed,
        };
        let last = !matches!(event, WorkerEvent::Line(_));
        if events.send((generation, event)).await.is_err() || last {
            break;
        }
    }
    tracing::trace!(generation, "Reply reader task exiting");
}

async fn read_stderr(
    mut reader: FramedRead<ChildStderr, LogLineCodec>,
    generation: u64,
    events: mpsc::Sender<(u64, WorkerEvent)>,
) {
    while let Some(line) = reader.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                if events.send((generation, WorkerEvent::Stderr(line))).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(generation, error = %e, "Stderr reader failed");
                break;
            }
        }
    }
}
