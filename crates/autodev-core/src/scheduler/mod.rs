//! Scheduler core: the single-writer loop that owns all task state.
//!
//! The scheduler runs as an actor. Commands from the public [`Scheduler`]
//! handle and messages from workers land on one loop; every task-state
//! mutation happens there, serialized. The tick fires on a timer and
//! after any worker state change: it promotes due retries and satisfied
//! dependencies, enforces the wave gate, detects termination and
//! deadlock, and dispatches workers up to the parallelism bound.

pub mod retry;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::events::{
    EventBus, Notice, PauseReason, ProgressSummary, WorkerLogEntry, WorkerPhase, WorkerStateView,
};
use crate::issue::{Issue, IssueSeverity, IssueStatus, IssueTracker};
use crate::logs::LogArchiver;
use crate::plan::{WritebackQueue, parse_plan_file};
use crate::resilience::ResilienceState;
use crate::session::{SessionSnapshot, SessionStore, TaskRuntimeState, merge_task_state};
use crate::task::{Task, TaskStatus};
use crate::watchdog::{SlowToolProbe, Watchdog, WorkerProbe};
use crate::worker::prompt::{PromptInputs, build_startup_prompt, delegation_provider};
use crate::worker::{WorkerConfig, WorkerHandle, WorkerMessage, spawn_worker};

/// Bound on the per-worker in-memory log ring buffer.
const WORKER_LOG_BUFFER: usize = 1000;

/// Summary returned by `load_file`.
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub path: PathBuf,
    pub task_count: usize,
    pub waves: Vec<u32>,
}

/// A finished worker's archived state, kept for export.
#[derive(Debug, Clone)]
pub struct CompletedWorker {
    pub worker_id: u32,
    pub task_id: String,
    pub success: bool,
    pub log_buffer: Vec<WorkerLogEntry>,
}

/// Read-only snapshot of scheduler state for status displays and tests.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub running: bool,
    pub paused: bool,
    pub pause_reason: Option<PauseReason>,
    pub tasks: Vec<Task>,
    pub issues: Vec<Issue>,
    pub active_workers: Vec<(u32, String)>,
    pub completed_workers: Vec<CompletedWorker>,
    pub progress: ProgressSummary,
}

/// Pluggable one-shot wave-completion hook.
pub type WaveHook = Arc<dyn Fn(u32) + Send + Sync>;

enum Command {
    LoadFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<LoadSummary>>,
    },
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Pause {
        reason: PauseReason,
    },
    Resume {
        reply: oneshot::Sender<bool>,
    },
    RetryTask {
        task_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateIssueStatus {
        issue_id: String,
        status: IssueStatus,
        reply: oneshot::Sender<Result<Issue>>,
    },
    WriteIssueReport {
        path: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    KillWorker {
        worker_id: u32,
        reason: String,
    },
    ApiErrorResume {
        generation: u64,
    },
    Snapshot {
        reply: oneshot::Sender<StateSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Public handle to the scheduler actor. Cloneable; all methods dispatch
/// onto the single-writer loop.
#[derive(Clone)]
pub struct Scheduler {
    cmd_tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    running_rx: watch::Receiver<bool>,
}

impl Scheduler {
    /// Build a scheduler from configuration and spawn its actor loop.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_wave_hook(config, None)
    }

    /// Build a scheduler with a wave-completion hook installed.
    pub fn with_wave_hook(config: SchedulerConfig, wave_hook: Option<WaveHook>) -> Self {
        let config = config.clamped();
        let bus = EventBus::default();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (running_tx, running_rx) = watch::channel(false);

        let user_data = config.user_data_dir();
        let archiver = LogArchiver::new(&user_data);
        let watchdog = Arc::new(Watchdog::new(
            config.watchdog.clone(),
            archiver.clone(),
            &user_data,
            config.agent_binary.clone(),
        ));

        let watchdog_cancel = CancellationToken::new();
        {
            let restart_tx = cmd_tx.clone();
            let handler: crate::watchdog::RestartHandler =
                Arc::new(move |worker_id, reason| {
                    let _ = restart_tx.send(Command::KillWorker { worker_id, reason });
                });
            Arc::clone(&watchdog).start(handler, watchdog_cancel.clone());
        }

        let core = Core {
            config: config.clone(),
            tasks: BTreeMap::new(),
            waves: BTreeMap::new(),
            locks: HashMap::new(),
            workers: HashMap::new(),
            completed_workers: Vec::new(),
            issues: IssueTracker::new(),
            plan_path: None,
            project_root: config
                .project_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
            running: false,
            paused: false,
            pause_reason: None,
            bus: bus.clone(),
            session: SessionStore::new(&user_data),
            archiver,
            writeback: Arc::new(WritebackQueue::new()),
            resilience: ResilienceState::new(config.api_error.clone()),
            watchdog,
            watchdog_cancel,
            worker_tx,
            cmd_tx: cmd_tx.clone(),
            running_tx,
            wave_hook,
            fired_waves: HashSet::new(),
        };

        tokio::spawn(run_loop(core, cmd_rx, worker_rx));

        Self {
            cmd_tx,
            bus,
            running_rx,
        }
    }

    /// Subscribe to consumer-visible notices.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notice> {
        self.bus.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| anyhow!("scheduler loop has shut down"))?;
        rx.await.map_err(|_| anyhow!("scheduler dropped the reply"))
    }

    /// Load (or reload) a plan file and hydrate session state.
    pub async fn load_file(&self, path: impl Into<PathBuf>) -> Result<LoadSummary> {
        let path = path.into();
        self.request(|reply| Command::LoadFile { path, reply })
            .await?
    }

    /// Start dispatching workers.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Stop the run: release locks, reset running tasks, kill workers.
    pub async fn stop(&self) {
        let _ = self.request(|reply| Command::Stop { reply }).await;
    }

    pub async fn pause(&self, reason: PauseReason) {
        let _ = self.cmd_tx.send(Command::Pause { reason });
    }

    /// Resume a paused scheduler. Returns `false` when refused because
    /// open blockers remain.
    pub async fn resume(&self) -> Result<bool> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Manually retry a failed task (resets its retry budget and
    /// re-opens failed dependents).
    pub async fn retry_task(&self, task_id: impl Into<String>) -> Result<()> {
        let task_id = task_id.into();
        self.request(|reply| Command::RetryTask { task_id, reply })
            .await?
    }

    pub async fn update_issue_status(
        &self,
        issue_id: impl Into<String>,
        status: IssueStatus,
    ) -> Result<Issue> {
        let issue_id = issue_id.into();
        self.request(|reply| Command::UpdateIssueStatus {
            issue_id,
            status,
            reply,
        })
        .await?
    }

    pub async fn write_issue_report(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.request(|reply| Command::WriteIssueReport { path, reply })
            .await?
    }

    /// Kill one worker (watchdog restarts route through here too).
    pub async fn kill_worker(&self, worker_id: u32, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::KillWorker {
            worker_id,
            reason: reason.into(),
        });
    }

    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Wait until the scheduler leaves the running state.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.running_rx.clone();
        // If we never started, return immediately once running is false.
        loop {
            if !*rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait until the scheduler enters the running state.
    pub async fn wait_until_running(&self) {
        let mut rx = self.running_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the run and terminate the actor loop.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}

// ---------------------------------------------------------------------------
// Actor internals
// ---------------------------------------------------------------------------

struct WorkerRuntime {
    handle: WorkerHandle,
    task_id: String,
    phase: WorkerPhase,
    current_tool: Option<String>,
    kilotokens: u64,
    log_buffer: VecDeque<WorkerLogEntry>,
}

struct Core {
    config: SchedulerConfig,
    tasks: BTreeMap<String, Task>,
    waves: BTreeMap<u32, Vec<String>>,
    /// task id -> worker id holding the lock.
    locks: HashMap<String, u32>,
    workers: HashMap<u32, WorkerRuntime>,
    completed_workers: Vec<CompletedWorker>,
    issues: IssueTracker,
    plan_path: Option<PathBuf>,
    project_root: PathBuf,
    running: bool,
    paused: bool,
    pause_reason: Option<PauseReason>,
    bus: EventBus,
    session: SessionStore,
    archiver: LogArchiver,
    writeback: Arc<WritebackQueue>,
    resilience: ResilienceState,
    watchdog: Arc<Watchdog>,
    watchdog_cancel: CancellationToken,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    running_tx: watch::Sender<bool>,
    wave_hook: Option<WaveHook>,
    fired_waves: HashSet<u32>,
}

async fn run_loop(
    mut core: Core,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let mut ticker = tokio::time::interval(core.config.tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                core.tick().await;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Shutdown { reply }) => {
                        core.stop_run("shutdown").await;
                        core.watchdog_cancel.cancel();
                        core.session.flush();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => core.handle_command(cmd).await,
                    None => {
                        core.stop_run("handle dropped").await;
                        core.watchdog_cancel.cancel();
                        core.session.flush();
                        break;
                    }
                }
            }
            Some(msg) = worker_rx.recv() => {
                core.handle_worker_message(msg).await;
            }
        }
    }
}

impl Core {
    // -- command handling --------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::LoadFile { path, reply } => {
                let _ = reply.send(self.load_file(&path).await);
            }
            Command::Start { reply } => {
                let result = self.start_run().await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop_run("stopped by user").await;
                let _ = reply.send(());
            }
            Command::Pause { reason } => {
                self.pause(reason);
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            Command::RetryTask { task_id, reply } => {
                let result = self.manual_retry(&task_id).await;
                let _ = reply.send(result);
            }
            Command::UpdateIssueStatus {
                issue_id,
                status,
                reply,
            } => {
                let result = self
                    .issues
                    .update_status(&issue_id, status)
                    .map_err(Into::into);
                if let Ok(ref issue) = result {
                    self.bus.emit(Notice::IssueUpdate {
                        issue: issue.clone(),
                    });
                    self.persist();
                }
                let _ = reply.send(result);
            }
            Command::WriteIssueReport { path, reply } => {
                let result = self
                    .issues
                    .write_to_file(&path)
                    .context("failed to write issue report");
                let _ = reply.send(result);
            }
            Command::KillWorker { worker_id, reason } => {
                self.kill_worker(worker_id, &reason);
            }
            Command::ApiErrorResume { generation } => {
                self.api_error_resume(generation).await;
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { .. } => unreachable!("handled in run_loop"),
        }
    }

    // -- plan loading ------------------------------------------------------

    async fn load_file(&mut self, path: &Path) -> Result<LoadSummary> {
        if self.running || !self.workers.is_empty() {
            self.stop_run("reload").await;
        }
        self.session.bump_nonce();

        let parsed = parse_plan_file(path)?;

        let mut tasks: BTreeMap<String, Task> = BTreeMap::new();
        for mut task in parsed.tasks {
            // Only terminal statuses read from the file are
            // authoritative; everything else is recomputed from
            // dependency satisfaction.
            task.status = match task.status {
                TaskStatus::Success => TaskStatus::Success,
                TaskStatus::Failed => TaskStatus::Failed,
                _ => TaskStatus::Pending,
            };
            tasks.insert(task.id.clone(), task);
        }

        self.project_root = self
            .config
            .project_root
            .clone()
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        // Hydrate cautiously from the session snapshot.
        if let Some(snapshot) = self.session.load(path) {
            for (id, saved) in &snapshot.tasks {
                if let Some(task) = tasks.get_mut(id) {
                    merge_task_state(task, saved);
                }
            }
            self.issues.hydrate(snapshot.issues);
            self.paused = snapshot.paused;
            self.pause_reason = snapshot.pause_reason;
        } else {
            self.issues.clear();
            self.paused = false;
            self.pause_reason = None;
        }

        self.tasks = tasks;
        self.waves = parsed.waves;
        self.plan_path = Some(path.to_path_buf());
        self.locks.clear();
        self.completed_workers.clear();
        self.fired_waves.clear();
        // Waves already fully terminal on load never re-fire the hook.
        for (&wave, _) in &self.waves {
            if self.wave_tasks_terminal(wave) {
                self.fired_waves.insert(wave);
            }
        }

        self.promote_due_retries();
        self.promote_pending_to_ready();

        let summary = LoadSummary {
            path: path.to_path_buf(),
            task_count: self.tasks.len(),
            waves: self.waves.keys().copied().collect(),
        };

        self.bus.emit(Notice::FileLoaded {
            path: summary.path.clone(),
            task_count: summary.task_count,
            waves: summary.waves.clone(),
        });
        for task in self.tasks.values() {
            self.bus.emit(Notice::TaskUpdate { task: task.clone() });
        }
        self.persist();

        info!(
            path = %path.display(),
            tasks = summary.task_count,
            waves = summary.waves.len(),
            "plan loaded"
        );
        Ok(summary)
    }

    async fn start_run(&mut self) -> Result<()> {
        if self.plan_path.is_none() {
            bail!("no plan loaded; call load_file first");
        }
        if self.running {
            return Ok(());
        }
        self.running = true;
        let _ = self.running_tx.send(true);
        self.emit_scheduler_state(None);
        self.tick().await;
        Ok(())
    }

    // -- tick --------------------------------------------------------------

    async fn tick(&mut self) {
        if !self.running {
            return;
        }

        self.promote_due_retries();
        self.promote_pending_to_ready();

        if !self.tasks.is_empty()
            && self
                .tasks
                .values()
                .all(|t| t.status == TaskStatus::Success)
        {
            self.finish_run("all tasks succeeded").await;
            return;
        }

        let executable = self.find_executable_tasks();

        // Deadlock / exhaustion: nothing running, nothing dispatchable,
        // no retry pending.
        let retries_pending = self
            .tasks
            .values()
            .any(|t| t.status == TaskStatus::Failed && t.next_retry_at.is_some());
        if self.workers.is_empty() && executable.is_empty() && !retries_pending {
            let detail = if self.tasks.values().all(|t| t.is_terminal()) {
                "completed with failures"
            } else {
                "deadlock: no executable tasks remain"
            };
            self.finish_run(detail).await;
            return;
        }

        if !self.paused {
            let slots = self.config.max_parallel.saturating_sub(self.workers.len());
            for task_id in executable.into_iter().take(slots) {
                self.dispatch_task(&task_id).await;
            }
        }

        self.bus.emit(Notice::Progress {
            summary: self.progress(),
        });
        self.persist();
    }

    fn promote_due_retries(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = self
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Failed
                    && t.next_retry_at.is_some_and(|at| at <= now_ms)
                    && !self.locks.contains_key(&t.id)
            })
            .map(|t| t.id.clone())
            .collect();

        for id in due {
            let satisfied = {
                let task = &self.tasks[&id];
                retry::deps_satisfied(&self.tasks, task)
            };
            let task = self.tasks.get_mut(&id).expect("id from map");
            task.next_retry_at = None;
            task.status = if satisfied {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };
            debug!(task_id = %id, status = %task.status, "retry due, task promoted");
            self.bus.emit(Notice::TaskUpdate {
                task: self.tasks[&id].clone(),
            });
        }
    }

    fn promote_pending_to_ready(&mut self) {
        let promotable: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && retry::deps_satisfied(&self.tasks, t))
            .map(|t| t.id.clone())
            .collect();
        for id in promotable {
            self.tasks.get_mut(&id).expect("id from map").status = TaskStatus::Ready;
            self.bus.emit(Notice::TaskUpdate {
                task: self.tasks[&id].clone(),
            });
        }
    }

    /// The active wave is the minimum wave among non-terminal tasks; only
    /// its `ready`, unlocked, unassigned tasks are dispatchable, sorted
    /// by id.
    fn find_executable_tasks(&self) -> Vec<String> {
        let active_wave = self
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .map(|t| t.wave)
            .min();
        let Some(active_wave) = active_wave else {
            return Vec::new();
        };

        let assigned: HashSet<&str> = self
            .workers
            .values()
            .map(|w| w.task_id.as_str())
            .collect();

        let mut out: Vec<String> = self
            .tasks
            .values()
            .filter(|t| {
                t.wave == active_wave
                    && t.status == TaskStatus::Ready
                    && !self.locks.contains_key(&t.id)
                    && !assigned.contains(t.id.as_str())
            })
            .map(|t| t.id.clone())
            .collect();
        out.sort();
        out
    }

    // -- dispatch ----------------------------------------------------------

    async fn dispatch_task(&mut self, task_id: &str) {
        let Some(plan_path) = self.plan_path.clone() else {
            return;
        };
        let Some(worker_id) = self.free_worker_slot() else {
            return;
        };

        let (prompt, pid_task) = {
            let Some(task) = self.tasks.get(task_id) else {
                return;
            };
            if let Some(provider) = delegation_provider(task) {
                info!(task_id, provider = %provider, "task declares a delegation target");
            }
            let issue_digest = if task.is_integration_task() {
                self.issues.render_digest()
            } else {
                None
            };
            let prompt = build_startup_prompt(&PromptInputs {
                task,
                plan_path: &plan_path,
                project_root: &self.project_root,
                issue_digest,
            });
            (prompt, task.id.clone())
        };

        // Lock, then transition to running.
        if self.locks.contains_key(task_id) {
            warn!(task_id, "refusing dispatch: task already locked");
            return;
        }
        self.locks.insert(task_id.to_string(), worker_id);
        {
            let task = self.tasks.get_mut(task_id).expect("checked above");
            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id);
            task.start_time = Some(Utc::now());
            task.end_time = None;
        }
        self.bus.emit(Notice::TaskUpdate {
            task: self.tasks[task_id].clone(),
        });

        let worker_config = WorkerConfig {
            binary: self.config.agent_binary.clone(),
            args: self.config.agent_args.clone(),
            cwd: self.project_root.clone(),
            env: HashMap::new(),
            tick: Duration::from_millis(self.config.watchdog.worker_tick_ms.max(10)),
            activity_timeout: Duration::from_millis(self.config.watchdog.activity_timeout_ms),
            hard_timeout: self
                .config
                .watchdog
                .hard_timeout_ms
                .map(Duration::from_millis),
            slow_tool_timeouts: self.config.watchdog.slow_tool_timeouts,
        };

        match spawn_worker(
            worker_id,
            pid_task.clone(),
            prompt,
            worker_config,
            self.worker_tx.clone(),
        )
        .await
        {
            Ok(handle) => {
                info!(task_id, worker_id, pid = handle.pid, "worker started");
                let _ = self.archiver.start_task_log(task_id).await;
                self.archiver
                    .append(task_id, "info", &format!("worker {worker_id} started"))
                    .await;
                self.watchdog.register(WorkerProbe {
                    worker_id,
                    pid: handle.pid,
                    task_id: pid_task.clone(),
                    last_activity_ms: Utc::now().timestamp_millis(),
                    slow_tool: None,
                });
                self.workers.insert(
                    worker_id,
                    WorkerRuntime {
                        handle,
                        task_id: pid_task,
                        phase: WorkerPhase::Running,
                        current_tool: None,
                        kilotokens: 0,
                        log_buffer: VecDeque::new(),
                    },
                );
                self.emit_worker_state(worker_id);
            }
            Err(e) => {
                warn!(task_id, worker_id, error = %e, "worker spawn failed");
                self.locks.remove(task_id);
                if let Some(task) = self.tasks.get_mut(task_id) {
                    task.worker_id = None;
                }
                self.fail_task_with_retry_policy(task_id, &format!("spawn failed: {e}"))
                    .await;
            }
        }
    }

    fn free_worker_slot(&self) -> Option<u32> {
        (1..=self.config.max_parallel as u32).find(|id| !self.workers.contains_key(id))
    }

    // -- worker messages ---------------------------------------------------

    async fn handle_worker_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Log { worker_id, entry } => {
                self.watchdog.touch(worker_id);
                let task_id = if let Some(runtime) = self.workers.get_mut(&worker_id) {
                    runtime.log_buffer.push_back(entry.clone());
                    while runtime.log_buffer.len() > WORKER_LOG_BUFFER {
                        runtime.log_buffer.pop_front();
                    }
                    Some(runtime.task_id.clone())
                } else {
                    None
                };
                if let Some(ref task_id) = task_id {
                    self.archiver
                        .append(task_id, entry.kind.as_str(), &entry.content)
                        .await;
                }
                self.bus.emit(Notice::WorkerLog {
                    worker_id,
                    task_id,
                    entry,
                });
            }

            WorkerMessage::TokenUsage {
                worker_id,
                kilotokens,
            } => {
                self.watchdog.touch(worker_id);
                if let Some(runtime) = self.workers.get_mut(&worker_id) {
                    runtime.kilotokens = kilotokens;
                }
                self.emit_worker_state(worker_id);
            }

            WorkerMessage::ToolState { worker_id, current } => {
                self.watchdog.touch(worker_id);
                self.watchdog.set_slow_tool(
                    worker_id,
                    current.as_ref().map(|c| SlowToolProbe {
                        name: c.name.clone(),
                        category: c.category.to_string(),
                        started_at_ms: c.started_at_ms,
                    }),
                );
                if let Some(runtime) = self.workers.get_mut(&worker_id) {
                    runtime.current_tool = current.map(|c| c.name);
                }
                self.emit_worker_state(worker_id);
            }

            WorkerMessage::IssueReported { worker_id, raw } => {
                let reporter_task = self
                    .workers
                    .get(&worker_id)
                    .map(|w| w.task_id.clone());
                self.report_issue(raw, reporter_task.as_deref(), Some(worker_id));
            }

            WorkerMessage::TaskDetected { worker_id, task_id } => {
                debug!(worker_id, task_id = %task_id, "worker confirmed its task id");
            }

            WorkerMessage::TaskMismatch {
                worker_id,
                expected,
                observed,
            } => {
                warn!(
                    worker_id,
                    expected = %expected,
                    observed = %observed,
                    "task mismatch reported; worker will be killed"
                );
                self.kill_worker(worker_id, "task mismatch");
            }

            WorkerMessage::ApiErrorSymptom {
                worker_id,
                sample,
                has_modified_code,
            } => {
                self.handle_api_error(worker_id, &sample, has_modified_code)
                    .await;
            }

            WorkerMessage::Complete {
                worker_id,
                success,
                duration_ms,
                reason,
                has_modified_code,
            } => {
                self.handle_worker_complete(
                    worker_id,
                    success,
                    duration_ms,
                    reason,
                    has_modified_code,
                )
                .await;
            }
        }
    }

    fn report_issue(
        &mut self,
        raw: crate::issue::RawIssue,
        reporter_task: Option<&str>,
        reporter_worker: Option<u32>,
    ) {
        let severity = raw.severity;
        match self.issues.add(raw, reporter_task, reporter_worker) {
            Ok((issue, _is_new)) => {
                self.bus.emit(Notice::IssueReported {
                    issue: issue.clone(),
                });
                if severity == IssueSeverity::Blocker
                    && issue.status == IssueStatus::Open
                    && self.config.blocker_auto_pause_enabled
                    && self.running
                    && !self.paused
                {
                    self.pause(PauseReason::Blocker);
                    let open_blockers = self.issues.open_blockers().len();
                    self.bus.emit(Notice::BlockerAutoPause {
                        issue,
                        open_blockers,
                    });
                }
                self.persist();
            }
            Err(e) => {
                debug!(error = %e, "discarded invalid issue report");
            }
        }
    }

    async fn handle_worker_complete(
        &mut self,
        worker_id: u32,
        success: bool,
        duration_ms: u64,
        reason: Option<String>,
        has_modified_code: bool,
    ) {
        self.watchdog.unregister(worker_id);
        let Some(mut runtime) = self.workers.remove(&worker_id) else {
            debug!(worker_id, "completion from unknown worker ignored");
            return;
        };
        runtime.phase = if success {
            WorkerPhase::Completed
        } else {
            WorkerPhase::Failed
        };

        let task_id = runtime.task_id.clone();
        if let Some(ref reason) = reason {
            self.archiver
                .append(&task_id, "info", &format!("worker finished: {reason}"))
                .await;
        }
        self.archiver.finish_task_log(&task_id).await;
        self.completed_workers.push(CompletedWorker {
            worker_id,
            task_id: task_id.clone(),
            success,
            log_buffer: runtime.log_buffer.iter().cloned().collect(),
        });
        self.bus.emit(Notice::WorkerState {
            view: WorkerStateView {
                worker_id,
                task_id: Some(task_id.clone()),
                phase: runtime.phase,
                current_tool: None,
                kilotokens: runtime.kilotokens,
            },
        });

        // Race guard: a stop or kill may have released the lock already.
        if self.locks.get(&task_id) != Some(&worker_id) {
            debug!(
                worker_id,
                task_id = %task_id,
                "lock no longer held; archiving only"
            );
            return;
        }
        self.locks.remove(&task_id);

        {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            task.worker_id = None;
            task.end_time = Some(Utc::now());
            task.duration_secs = Some(duration_ms / 1000);
            if has_modified_code {
                task.has_modified_code = true;
            }
        }

        if success {
            let was_recovery = {
                let task = self.tasks.get_mut(&task_id).expect("present above");
                let was_recovery = task.is_api_error_recovery;
                task.status = TaskStatus::Success;
                task.clear_retry_state();
                task.is_api_error_recovery = false;
                task.has_modified_code = false;
                was_recovery
            };
            if was_recovery {
                self.resilience.reset();
            }
            info!(task_id = %task_id, worker_id, "task succeeded");
            self.bus.emit(Notice::TaskUpdate {
                task: self.tasks[&task_id].clone(),
            });
            if let Some(plan_path) = self.plan_path.clone() {
                self.writeback
                    .update_task_checkbox(&plan_path, &task_id, true)
                    .await;
            }
            self.check_wave_completion(&task_id);
        } else {
            let reason = reason.unwrap_or_else(|| "worker failed".to_string());
            self.fail_task_with_retry_policy(&task_id, &reason).await;
        }

        self.persist();
        self.tick().await;
    }

    /// Apply the auto-retry decision to a failed task: schedule a
    /// backoff retry while budget remains, otherwise finalize the
    /// failure and cascade it to dependents.
    async fn fail_task_with_retry_policy(&mut self, task_id: &str, reason: &str) {
        let retry_cfg = self.config.auto_retry.clone();
        let scheduled = {
            let Some(task) = self.tasks.get_mut(task_id) else {
                return;
            };
            if retry_cfg.enabled && task.retry_count < retry_cfg.max_retries {
                task.retry_count += 1;
                let delay_ms = retry::compute_backoff_ms(
                    task.retry_count,
                    retry_cfg.base_delay_ms,
                    retry_cfg.max_delay_ms,
                );
                task.next_retry_at = Some(Utc::now().timestamp_millis() + delay_ms as i64);
                task.status = TaskStatus::Failed;
                Some(delay_ms)
            } else {
                task.status = TaskStatus::Failed;
                task.next_retry_at = None;
                None
            }
        };

        match scheduled {
            Some(delay_ms) => {
                info!(
                    task_id,
                    reason,
                    delay_ms,
                    attempt = self.tasks[task_id].retry_count,
                    "task failed, retry scheduled"
                );
                self.archiver
                    .append(
                        task_id,
                        "info",
                        &format!("failure ({reason}); retry in {}s", delay_ms / 1000),
                    )
                    .await;
                self.bus.emit(Notice::TaskUpdate {
                    task: self.tasks[task_id].clone(),
                });
            }
            None => {
                warn!(task_id, reason, "task failed, no retries left; cascading");
                self.bus.emit(Notice::TaskUpdate {
                    task: self.tasks[task_id].clone(),
                });
                let cascaded = retry::cascade_failure(&mut self.tasks, task_id);
                for id in &cascaded {
                    self.bus.emit(Notice::TaskUpdate {
                        task: self.tasks[id].clone(),
                    });
                    self.check_wave_completion(id);
                }
                self.check_wave_completion(task_id);
            }
        }
    }

    // -- pause / resume / stop ---------------------------------------------

    fn pause(&mut self, reason: PauseReason) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.pause_reason = Some(reason);
        info!(?reason, "scheduler paused");
        self.emit_scheduler_state(None);
        self.persist();
    }

    async fn resume(&mut self) -> bool {
        if !self.paused {
            return true;
        }
        if self.config.blocker_auto_pause_enabled && !self.issues.open_blockers().is_empty() {
            warn!("resume refused: open blocker issues remain");
            return false;
        }
        self.paused = false;
        self.pause_reason = None;
        info!("scheduler resumed");
        self.emit_scheduler_state(None);
        self.persist();
        self.tick().await;
        true
    }

    async fn stop_run(&mut self, detail: &str) {
        if !self.running && self.workers.is_empty() {
            return;
        }
        info!(detail, "stopping scheduler");
        self.running = false;

        // Release all locks and reset running tasks before the kills, so
        // late completions fail the lock-ownership check.
        let locked: Vec<String> = self.locks.keys().cloned().collect();
        self.locks.clear();
        for task_id in locked {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Ready;
                    task.worker_id = None;
                }
            }
            self.bus.emit(Notice::TaskUpdate {
                task: self.tasks[&task_id].clone(),
            });
        }

        let workers: Vec<WorkerRuntime> = self.workers.drain().map(|(_, w)| w).collect();
        let mut joins = Vec::new();
        for runtime in workers {
            self.watchdog.unregister(runtime.handle.worker_id);
            runtime.handle.kill();
            joins.push(runtime.handle.join);
            self.completed_workers.push(CompletedWorker {
                worker_id: runtime.handle.worker_id,
                task_id: runtime.task_id,
                success: false,
                log_buffer: runtime.log_buffer.into_iter().collect(),
            });
        }
        let _ = tokio::time::timeout(
            Duration::from_secs(10),
            futures::future::join_all(joins),
        )
        .await;

        self.emit_scheduler_state(Some(detail.to_string()));
        self.persist();
        self.session.flush();
        let _ = self.running_tx.send(false);
    }

    async fn finish_run(&mut self, detail: &str) {
        info!(detail, "run finished");
        self.running = false;
        // Drain queued checkbox writes and the session before the
        // running flag flips, so observers of the stop see final files.
        self.writeback.flush().await;
        self.bus.emit(Notice::Progress {
            summary: self.progress(),
        });
        self.emit_scheduler_state(Some(detail.to_string()));
        self.persist();
        self.session.flush();
        let _ = self.running_tx.send(false);
    }

    fn kill_worker(&mut self, worker_id: u32, reason: &str) {
        if let Some(runtime) = self.workers.get(&worker_id) {
            info!(worker_id, task_id = %runtime.task_id, reason, "killing worker");
            runtime.handle.kill();
        } else {
            debug!(worker_id, "kill requested for unknown worker");
        }
    }

    // -- API-error flow ----------------------------------------------------

    async fn handle_api_error(
        &mut self,
        worker_id: u32,
        sample: &str,
        has_modified_code: bool,
    ) {
        if !self.running || self.pause_reason == Some(PauseReason::ApiError) {
            return;
        }
        let Some(task_id) = self.workers.get(&worker_id).map(|w| w.task_id.clone()) else {
            return;
        };

        let over_task_cap = {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if has_modified_code {
                task.has_modified_code = true;
            }
            if task.api_error_retry_count >= self.config.api_error.max_task_retries {
                true
            } else {
                task.api_error_retry_count += 1;
                task.is_api_error_recovery = true;
                false
            }
        };

        if over_task_cap {
            // The task exhausted its own API-error budget; treat this
            // occurrence as a plain worker failure.
            warn!(task_id = %task_id, "per-task API-error cap reached, failing normally");
            self.kill_worker(worker_id, "api error budget exhausted");
            return;
        }

        warn!(task_id = %task_id, sample, "API error detected; pausing and killing workers");
        self.pause(PauseReason::ApiError);

        // Kill every active worker, releasing locks so the tasks can be
        // redispatched after the backoff.
        let active: Vec<(u32, String)> = self
            .workers
            .iter()
            .map(|(id, w)| (*id, w.task_id.clone()))
            .collect();
        for (id, tid) in &active {
            self.locks.remove(tid);
            if let Some(task) = self.tasks.get_mut(tid) {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Ready;
                    task.worker_id = None;
                }
            }
            self.bus.emit(Notice::TaskUpdate {
                task: self.tasks[tid].clone(),
            });
            self.kill_worker(*id, "API error");
        }

        match self.resilience.next_resume_delay() {
            Some(delay_ms) => {
                let attempt = self.resilience.attempts();
                let generation = self.resilience.generation();
                self.bus.emit(Notice::ApiError {
                    message: sample.to_string(),
                    attempt,
                    next_retry_in_ms: Some(delay_ms),
                });
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = cmd_tx.send(Command::ApiErrorResume { generation });
                });
            }
            None => {
                warn!("API-error retry budget exhausted; awaiting user action");
                self.bus.emit(Notice::ApiError {
                    message: sample.to_string(),
                    attempt: self.resilience.attempts(),
                    next_retry_in_ms: None,
                });
            }
        }
        self.persist();
    }

    async fn api_error_resume(&mut self, generation: u64) {
        if generation != self.resilience.generation() {
            debug!("stale API-error resume timer ignored");
            return;
        }
        if self.pause_reason != Some(PauseReason::ApiError) {
            return;
        }
        info!("resuming after API-error backoff");
        self.paused = false;
        self.pause_reason = None;
        self.emit_scheduler_state(None);
        self.tick().await;
    }

    // -- manual retry ------------------------------------------------------

    async fn manual_retry(&mut self, task_id: &str) -> Result<()> {
        let task_id = crate::task::canonical_task_id(task_id);
        if task_id.is_empty() {
            bail!("empty task id");
        }
        {
            let Some(task) = self.tasks.get_mut(&task_id) else {
                bail!("unknown task: {task_id}");
            };
            if task.status != TaskStatus::Failed {
                bail!(
                    "cannot retry task {task_id}: status is {}, expected failed",
                    task.status
                );
            }
            task.clear_retry_state();
            task.api_error_retry_count = 0;
            task.is_api_error_recovery = false;
        }

        let satisfied = retry::deps_satisfied(&self.tasks, &self.tasks[&task_id]);
        {
            let task = self.tasks.get_mut(&task_id).expect("present above");
            task.status = if satisfied {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };
        }
        self.bus.emit(Notice::TaskUpdate {
            task: self.tasks[&task_id].clone(),
        });

        for id in retry::cascade_reset(&mut self.tasks, &task_id) {
            self.bus.emit(Notice::TaskUpdate {
                task: self.tasks[&id].clone(),
            });
        }

        self.persist();
        self.tick().await;
        Ok(())
    }

    // -- bookkeeping -------------------------------------------------------

    fn wave_tasks_terminal(&self, wave: u32) -> bool {
        self.tasks
            .values()
            .filter(|t| t.wave == wave)
            .all(|t| t.is_terminal())
    }

    /// Fire the one-shot wave hook when the last task of a wave turns
    /// terminal.
    fn check_wave_completion(&mut self, task_id: &str) {
        let Some(wave) = self.tasks.get(task_id).map(|t| t.wave) else {
            return;
        };
        if self.fired_waves.contains(&wave) || !self.wave_tasks_terminal(wave) {
            return;
        }
        self.fired_waves.insert(wave);
        info!(wave, "wave complete");
        if let Some(hook) = &self.wave_hook {
            hook(wave);
        }
    }

    fn progress(&self) -> ProgressSummary {
        let mut summary = ProgressSummary {
            total: self.tasks.len(),
            active_workers: self.workers.len(),
            active_wave: self
                .tasks
                .values()
                .filter(|t| !t.is_terminal())
                .map(|t| t.wave)
                .min(),
            ..Default::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Ready => summary.ready += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Success => summary.success += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Canceled => summary.canceled += 1,
            }
        }
        summary
    }

    fn emit_scheduler_state(&self, detail: Option<String>) {
        self.bus.emit(Notice::SchedulerState {
            running: self.running,
            paused: self.paused,
            pause_reason: self.pause_reason,
            detail,
        });
    }

    fn emit_worker_state(&self, worker_id: u32) {
        if let Some(runtime) = self.workers.get(&worker_id) {
            self.bus.emit(Notice::WorkerState {
                view: WorkerStateView {
                    worker_id,
                    task_id: Some(runtime.task_id.clone()),
                    phase: runtime.phase,
                    current_tool: runtime.current_tool.clone(),
                    kilotokens: runtime.kilotokens,
                },
            });
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            running: self.running,
            paused: self.paused,
            pause_reason: self.pause_reason,
            tasks: self.tasks.values().cloned().collect(),
            issues: self.issues.get_all(),
            active_workers: self
                .workers
                .iter()
                .map(|(id, w)| (*id, w.task_id.clone()))
                .collect(),
            completed_workers: self.completed_workers.clone(),
            progress: self.progress(),
        }
    }

    fn persist(&self) {
        let Some(ref plan_path) = self.plan_path else {
            return;
        };
        let snapshot = SessionSnapshot {
            version: crate::session::SESSION_VERSION,
            saved_at: Utc::now(),
            plan_path: plan_path.clone(),
            project_root: self.project_root.clone(),
            paused: self.paused,
            pause_reason: self.pause_reason,
            auto_retry: self.config.auto_retry.clone(),
            blocker_auto_pause_enabled: self.config.blocker_auto_pause_enabled,
            tasks: self
                .tasks
                .iter()
                .map(|(id, task)| (id.clone(), TaskRuntimeState::of(task)))
                .collect(),
            issues: self.issues.get_all(),
        };
        self.session.persist_later(snapshot);
    }
}
