//! Worker process lifecycle and job correlation.
//!
//! Exactly one external compiler process exists at a time, owned by an
//! actor task. Jobs are submitted over a command channel; completions are
//! posted to a single-consumer channel that the host drains on its
//! control tick. The actor serializes one compile at a time: jobs
//! submitted while the worker is mid-handshake or busy queue in FIFO
//! order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crucible_resolve::{CompilationJob, JobId};

use crate::error::{Result, WorkerError};
use crate::protocol::{self, CompilePayload, Envelope, MessageBody};

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path to the external compiler binary.
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Bound on one job's time from submission to completion.
    pub job_timeout: Duration,
    /// Idle window after which the worker is shut down proactively.
    pub idle_timeout: Duration,
    /// Grace period between a graceful Exit and a forced kill.
    pub kill_grace: Duration,
}

impl WorkerConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            job_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Ready,
    Busy,
    Failed,
    ShuttingDown,
}

/// Result of one job, posted on the completion channel exactly once.
#[derive(Debug)]
pub struct JobCompletion {
    pub id: JobId,
    /// Constituent unit names of the job, for diagnostic attribution.
    pub units: Vec<String>,
    pub result: JobResult,
}

#[derive(Debug)]
pub enum JobResult {
    /// Raw module image, possibly with non-fatal diagnostics.
    Module {
        bytes: Vec<u8>,
        diagnostics: Option<String>,
    },
    /// Synthetic or compiler-reported failure for the whole job.
    Failed { message: String },
}

/// Handle to the worker actor.
#[derive(Debug, Clone)]
pub struct WorkerService {
    commands: mpsc::UnboundedSender<ServiceCommand>,
}

#[derive(Debug)]
enum ServiceCommand {
    Submit(CompilationJob),
    Shutdown,
}

impl WorkerService {
    /// Starts the actor task. The process itself spawns lazily on the
    /// first submission.
    pub fn spawn(
        config: WorkerConfig,
        completions: mpsc::UnboundedSender<JobCompletion>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Actor {
                config,
                completions,
                commands: rx,
                state: WorkerState::NotStarted,
                queue: VecDeque::new(),
                pending: IndexMap::new(),
                child: None,
                stdin: None,
                inbound: None,
                idle_deadline: None,
                stopping: false,
            }
            .run(),
        );
        Self { commands: tx }
    }

    /// Submits a job; its completion is posted on the completion channel.
    pub fn submit(&self, job: CompilationJob) -> Result<()> {
        self.commands
            .send(ServiceCommand::Submit(job))
            .map_err(|_| WorkerError::ServiceStopped)
    }

    /// Requests shutdown: outstanding jobs complete with a synthetic
    /// failure, the process receives Exit and is killed after the grace
    /// period if still alive.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ServiceCommand::Shutdown);
    }
}

struct Pending {
    id: JobId,
    units: Vec<String>,
    deadline: Instant,
}

/// A job accepted but not yet sent. The timeout is stamped at submission,
/// so a job stuck behind a hung handshake still completes.
struct QueuedJob {
    job: CompilationJob,
    deadline: Instant,
}

struct Actor {
    config: WorkerConfig,
    completions: mpsc::UnboundedSender<JobCompletion>,
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
    state: WorkerState,
    /// Jobs accepted but not yet sent (worker starting or busy).
    queue: VecDeque<QueuedJob>,
    /// Sent jobs awaiting a response, keyed by correlation id.
    pending: IndexMap<u64, Pending>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    inbound: Option<mpsc::UnboundedReceiver<Envelope>>,
    idle_deadline: Option<Instant>,
    stopping: bool,
}

enum Tick {
    Command(Option<ServiceCommand>),
    Inbound(Option<Envelope>),
    Deadline,
}

impl Actor {
    async fn run(mut self) {
        loop {
            if self.stopping
                && self.queue.is_empty()
                && self.pending.is_empty()
                && self.child.is_none()
            {
                break;
            }
            let deadline = self.next_deadline();
            let tick = {
                let inbound = &mut self.inbound;
                tokio::select! {
                    command = self.commands.recv() => Tick::Command(command),
                    envelope = async {
                        match inbound.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Tick::Inbound(envelope),
                    _ = tokio::time::sleep_until(deadline) => Tick::Deadline,
                }
            };
            match tick {
                Tick::Command(Some(ServiceCommand::Submit(job))) => self.on_submit(job).await,
                Tick::Command(Some(ServiceCommand::Shutdown)) | Tick::Command(None) => {
                    self.on_shutdown().await;
                }
                Tick::Inbound(Some(envelope)) => self.on_message(envelope).await,
                Tick::Inbound(None) => self.on_disconnect("worker closed its channel").await,
                Tick::Deadline => self.on_deadline().await,
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        let far = Instant::now() + Duration::from_secs(3600);
        self.pending
            .values()
            .map(|p| p.deadline)
            .chain(self.queue.iter().map(|q| q.deadline))
            .chain(self.idle_deadline)
            .min()
            .unwrap_or(far)
    }

    async fn on_submit(&mut self, job: CompilationJob) {
        if self.stopping {
            self.complete(
                job.id,
                job.units,
                JobResult::Failed {
                    message: WorkerError::Unavailable {
                        reason: "worker is shutting down".to_string(),
                    }
                    .to_string(),
                },
            );
            return;
        }
        self.idle_deadline = None;
        if matches!(self.state, WorkerState::NotStarted | WorkerState::Failed)
            && let Err(err) = self.start()
        {
            warn!(%err, "could not start compiler worker");
            self.state = WorkerState::NotStarted;
            self.complete(
                job.id,
                job.units,
                JobResult::Failed {
                    message: err.to_string(),
                },
            );
            return;
        }
        debug!(id = %job.id, units = job.units.len(), "job queued");
        self.queue.push_back(QueuedJob {
            job,
            deadline: Instant::now() + self.config.job_timeout,
        });
        self.try_dispatch().await;
    }

    /// Spawns the worker process and its stdio pump tasks.
    fn start(&mut self) -> Result<()> {
        if !self.config.binary.is_file() {
            return Err(WorkerError::Unavailable {
                reason: format!("worker binary {} not found", self.config.binary.display()),
            });
        }
        let mut child = Command::new(&self.config.binary)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| WorkerError::Unavailable {
                reason: format!("spawn failed: {err}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Unavailable {
            reason: "worker stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Unavailable {
            reason: "worker stdout unavailable".to_string(),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match protocol::decode_line(line) {
                    Ok(envelope) => {
                        if tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%err, line, "undecodable worker message"),
                }
            }
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(worker = "stderr", "{line}");
                    }
                }
            });
        }

        info!(binary = %self.config.binary.display(), "compiler worker starting");
        self.child = Some(child);
        self.stdin = Some(stdin);
        self.inbound = Some(rx);
        self.state = WorkerState::Starting;
        Ok(())
    }

    async fn on_message(&mut self, envelope: Envelope) {
        match envelope.body {
            MessageBody::Ready => {
                if self.state == WorkerState::Starting {
                    info!("compiler worker ready");
                    // Echo the handshake back as an acknowledgement, then
                    // flush everything queued during startup in FIFO order.
                    if let Err(err) = self.send(&envelope).await {
                        warn!(%err, "handshake ack failed");
                        self.on_disconnect("handshake ack failed").await;
                        return;
                    }
                    self.state = WorkerState::Ready;
                    self.try_dispatch().await;
                } else {
                    debug!("spurious Ready ignored");
                }
            }
            MessageBody::Assembly(payload) => {
                self.on_response(
                    envelope.id,
                    JobResult::Module {
                        bytes: payload.bytes,
                        diagnostics: payload.diagnostics,
                    },
                )
                .await;
            }
            MessageBody::Error { message } => {
                self.on_response(envelope.id, JobResult::Failed { message })
                    .await;
            }
            MessageBody::Compile(_) | MessageBody::Exit => {
                warn!(id = envelope.id, "unexpected message type from worker");
            }
        }
    }

    async fn on_response(&mut self, id: u64, result: JobResult) {
        let Some(pending) = self.pending.shift_remove(&id) else {
            // Stale response, e.g. from before a respawn.
            warn!(id, "response for unknown job discarded");
            return;
        };
        self.complete(pending.id, pending.units, result);
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Ready;
        }
        self.try_dispatch().await;
    }

    /// Sends the next queued job when the worker is ready and nothing is
    /// in flight; otherwise (re-)arms the idle shutdown timer.
    async fn try_dispatch(&mut self) {
        if self.state != WorkerState::Ready || !self.pending.is_empty() {
            return;
        }
        let Some(queued) = self.queue.pop_front() else {
            if self.idle_deadline.is_none() {
                self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
            }
            return;
        };
        self.idle_deadline = None;
        let QueuedJob { job, deadline } = queued;
        let envelope = Envelope {
            id: job.id.0,
            body: MessageBody::Compile(CompilePayload::for_job(&job)),
        };
        match self.send(&envelope).await {
            Ok(()) => {
                debug!(id = %job.id, "job sent to worker");
                self.pending.insert(
                    job.id.0,
                    Pending {
                        id: job.id,
                        units: job.units.clone(),
                        deadline,
                    },
                );
                self.state = WorkerState::Busy;
            }
            Err(err) => {
                self.complete(
                    job.id,
                    job.units,
                    JobResult::Failed {
                        message: err.to_string(),
                    },
                );
                self.on_disconnect("failed to write to worker").await;
            }
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let line = protocol::encode_line(envelope)?;
        let stdin = self.stdin.as_mut().ok_or_else(|| WorkerError::Unavailable {
            reason: "worker channel detached".to_string(),
        })?;
        stdin
            .write_all(&line)
            .await
            .map_err(|err| WorkerError::Unavailable {
                reason: format!("worker write failed: {err}"),
            })?;
        stdin
            .flush()
            .await
            .map_err(|err| WorkerError::Unavailable {
                reason: format!("worker write failed: {err}"),
            })?;
        Ok(())
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();

        // Jobs never sent (hung handshake, stuck predecessor) time out on
        // the deadline stamped at submission.
        let mut index = 0;
        while index < self.queue.len() {
            if self.queue[index].deadline <= now {
                if let Some(expired) = self.queue.remove(index) {
                    warn!(id = %expired.job.id, "job timed out before dispatch");
                    self.complete(
                        expired.job.id,
                        expired.job.units,
                        JobResult::Failed {
                            message: WorkerError::Timeout.to_string(),
                        },
                    );
                }
            } else {
                index += 1;
            }
        }

        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            if let Some(pending) = self.pending.shift_remove(&id) {
                warn!(id = %pending.id, "job timed out");
                self.complete(
                    pending.id,
                    pending.units,
                    JobResult::Failed {
                        message: WorkerError::Timeout.to_string(),
                    },
                );
            }
        }
        if self.state == WorkerState::Busy && self.pending.is_empty() {
            self.state = WorkerState::Ready;
            self.try_dispatch().await;
        }

        if let Some(idle) = self.idle_deadline
            && idle <= now
            && self.pending.is_empty()
            && self.queue.is_empty()
        {
            info!("compiler worker idle; shutting down");
            self.idle_deadline = None;
            self.stop_worker().await;
            self.state = WorkerState::NotStarted;
        }
    }

    async fn on_shutdown(&mut self) {
        self.stopping = true;
        self.state = WorkerState::ShuttingDown;
        self.fail_outstanding("worker is shutting down");
        self.stop_worker().await;
        self.state = WorkerState::NotStarted;
    }

    async fn on_disconnect(&mut self, reason: &str) {
        if self.inbound.is_none() && self.child.is_none() {
            return;
        }
        warn!(reason, "compiler worker lost");
        self.inbound = None;
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                debug!(%err, "worker already gone");
            }
        }
        self.state = WorkerState::Failed;
        self.fail_outstanding(reason);
    }

    /// Completes every pending and queued job with a synthetic
    /// worker-unavailable diagnostic.
    fn fail_outstanding(&mut self, reason: &str) {
        let message = WorkerError::Unavailable {
            reason: reason.to_string(),
        }
        .to_string();
        let pending: Vec<Pending> = self.pending.drain(..).map(|(_, p)| p).collect();
        for job in pending {
            self.complete(
                job.id,
                job.units,
                JobResult::Failed {
                    message: message.clone(),
                },
            );
        }
        while let Some(queued) = self.queue.pop_front() {
            self.complete(
                queued.job.id,
                queued.job.units,
                JobResult::Failed {
                    message: message.clone(),
                },
            );
        }
    }

    /// Graceful process stop: Exit message, detach, force-kill after the
    /// grace period.
    async fn stop_worker(&mut self) {
        if self.stdin.is_some() {
            let exit = Envelope {
                id: 0,
                body: MessageBody::Exit,
            };
            if let Err(err) = self.send(&exit).await {
                debug!(%err, "could not send Exit");
            }
        }
        self.stdin = None;
        self.inbound = None;
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "worker exited"),
                Ok(Err(err)) => warn!(%err, "waiting on worker failed"),
                Err(_) => {
                    warn!("worker did not exit within grace period; killing");
                    if let Err(err) = child.kill().await {
                        warn!(%err, "failed to kill worker");
                    }
                }
            }
        }
    }

    fn complete(&self, id: JobId, units: Vec<String>, result: JobResult) {
        if self.completions.send(JobCompletion { id, units, result }).is_err() {
            warn!(%id, "completion receiver dropped");
        }
    }
}
